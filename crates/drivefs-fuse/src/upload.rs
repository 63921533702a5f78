//! Upload engine: rapid-upload negotiation, chunked part upload with URL
//! renewal, and completion bookkeeping.

use std::io::{Read, Seek, SeekFrom};

use chrono::Utc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, warn};

use drivefs_core::hashing::{pre_hash, proof_code, proof_range, ContentHasher, EMPTY_SHA1, PRE_HASH_LEN};
use drivefs_core::{
    part_count, DriveError, DriveResult, FileKind, RemoteFile, UploadCreateRequest,
    UploadCreated, UploadProbe, UploadSession,
};

use crate::context::DriveContext;

const HASH_BUF: usize = 1024 * 1024;

/// What an upload did.
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub file: RemoteFile,
    /// Completed by server-side dedup; no content was sent.
    pub rapid: bool,
    pub parts_uploaded: u32,
}

fn exact(buf: Vec<u8>, offset: u64, len: u64) -> DriveResult<Vec<u8>> {
    if (buf.len() as u64) < len {
        return Err(DriveError::Other(format!(
            "staging file ended at {} while reading {} bytes at {}",
            offset + buf.len() as u64,
            len,
            offset
        )));
    }
    Ok(buf)
}

async fn read_at(source: &mut File, offset: u64, len: u64) -> DriveResult<Vec<u8>> {
    source.seek(SeekFrom::Start(offset)).await?;
    let mut buf = Vec::with_capacity(len as usize);
    (&mut *source).take(len).read_to_end(&mut buf).await?;
    exact(buf, offset, len)
}

fn read_at_blocking(source: &mut std::fs::File, offset: u64, len: u64) -> DriveResult<Vec<u8>> {
    source.seek(SeekFrom::Start(offset))?;
    let mut buf = Vec::with_capacity(len as usize);
    (&mut *source).take(len).read_to_end(&mut buf)?;
    exact(buf, offset, len)
}

fn full_sha1(source: &mut std::fs::File, size: u64) -> DriveResult<String> {
    source.seek(SeekFrom::Start(0))?;
    let mut hasher = ContentHasher::new();
    let mut buf = vec![0u8; HASH_BUF];
    let mut reader = (&mut *source).take(size);
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finish())
}

/// Proof code over `proof` and the full SHA-1 of the staged content, read
/// on the blocking pool.
async fn content_probe(source: &File, proof: (u64, u64), size: u64) -> DriveResult<UploadProbe> {
    let mut file = source.try_clone().await?.into_std().await;
    tokio::task::spawn_blocking(move || {
        let (offset, len) = proof;
        let proof = proof_code(&read_at_blocking(&mut file, offset, len)?);
        let sha1 = full_sha1(&mut file, size)?;
        Ok::<_, DriveError>(UploadProbe::Content { sha1, proof })
    })
    .await
    .map_err(|e| DriveError::Other(format!("content hashing task failed: {}", e)))?
}

/// Upload `size` bytes of `source` as `name` in the remote folder
/// `target_dir`, replacing any file of that name. `replaces` is the id of
/// the file being overwritten, if known.
pub async fn upload(
    ctx: &DriveContext,
    source: &mut File,
    target_dir: &str,
    name: &str,
    size: u64,
    replaces: Option<&str>,
) -> DriveResult<UploadOutcome> {
    let settings = &ctx.settings;
    let request = |probe: UploadProbe| UploadCreateRequest {
        parent_file_id: target_dir.to_string(),
        name: name.to_string(),
        size,
        part_count: part_count(size, settings.part_size),
        probe,
    };

    if size == 0 {
        let created = ctx
            .client
            .upload_create(&request(UploadProbe::Content {
                sha1: EMPTY_SHA1.to_string(),
                proof: String::new(),
            }))
            .await?;
        if let (false, Some(upload_id)) = (created.rapid_upload, created.upload_id.as_deref()) {
            ctx.client.upload_complete(&created.file_id, upload_id).await?;
        }
        let file = completed(ctx, &created.file_id, target_dir, name, 0, replaces);
        debug!(name, file = %file.file_id, "empty file created");
        return Ok(UploadOutcome {
            file,
            rapid: created.rapid_upload,
            parts_uploaded: 0,
        });
    }

    let created = if settings.rapid_candidate(size) {
        let head = read_at(source, 0, size.min(PRE_HASH_LEN as u64)).await?;
        match ctx
            .client
            .upload_create(&request(UploadProbe::PreHash(pre_hash(&head))))
            .await
        {
            Ok(created) => created,
            Err(DriveError::RemoteConflict(_)) => {
                debug!(name, size, "pre-hash matched, sending content proof");
                let token = ctx.client.access_token();
                let probe = content_probe(source, proof_range(&token, size), size).await?;
                ctx.client.upload_create(&request(probe)).await?
            }
            Err(e) => return Err(e),
        }
    } else {
        ctx.client.upload_create(&request(UploadProbe::None)).await?
    };

    if created.rapid_upload {
        let file = completed(ctx, &created.file_id, target_dir, name, size, replaces);
        info!(name, size, file = %file.file_id, "rapid upload");
        return Ok(UploadOutcome {
            file,
            rapid: true,
            parts_uploaded: 0,
        });
    }

    let mut session = session_from(created, settings.part_size, size)?;
    let parts = upload_parts(ctx, source, &mut session).await?;
    let done = ctx
        .client
        .upload_complete(&session.file_id, &session.upload_id)
        .await?;
    if done.size != size {
        warn!(name, expected = size, reported = done.size, "remote size differs after upload");
    }
    let file = completed(ctx, &done.file_id, target_dir, name, size, replaces);
    info!(name, size, parts, file = %file.file_id, "upload complete");
    Ok(UploadOutcome {
        file,
        rapid: false,
        parts_uploaded: parts,
    })
}

fn session_from(created: UploadCreated, part_size: u64, size: u64) -> DriveResult<UploadSession> {
    let upload_id = created.upload_id.ok_or_else(|| {
        DriveError::Other(format!("upload of {} returned no upload id", created.file_id))
    })?;
    Ok(UploadSession::new(
        upload_id,
        created.file_id,
        created.part_urls,
        part_size,
        size,
    ))
}

/// Send every part in order, renewing URLs for the remaining parts whenever
/// the next URL has expired.
async fn upload_parts(
    ctx: &DriveContext,
    source: &mut File,
    session: &mut UploadSession,
) -> DriveResult<u32> {
    let client = ctx.client.as_ref();
    let file_id = session.file_id.clone();
    let upload_id = session.upload_id.clone();
    let (file_id, upload_id) = (file_id.as_str(), upload_id.as_str());

    for index in 0..session.total_parts {
        let now = Utc::now().timestamp();
        let stale = session
            .part_urls
            .get(index as usize)
            .map_or(true, |url| url.is_expired(now));
        if stale {
            let numbers = session.remaining_part_numbers(index);
            debug!(part = index + 1, remaining = numbers.len(), "renewing part urls");
            let numbers = numbers.as_slice();
            let urls = ctx
                .settings
                .retry
                .renew
                .run("upload_urls", |_| async move {
                    let urls = client.upload_urls(file_id, upload_id, numbers).await?;
                    if urls.len() < numbers.len() {
                        return Err(DriveError::transient(
                            "upload_urls",
                            std::io::Error::other(format!(
                                "{} urls for {} parts",
                                urls.len(),
                                numbers.len()
                            )),
                        ));
                    }
                    Ok(urls)
                })
                .await?;
            session.renew_from(index, urls);
        }

        let (offset, len) = session.part_range(index);
        let data = read_at(source, offset, len).await?;
        let url = session
            .part_urls
            .get(index as usize)
            .map(|u| u.url.clone())
            .ok_or_else(|| DriveError::invariant(format!("no url for part {}", index + 1)))?;
        client.upload_part(&url, data).await?;
        debug!(part = index + 1, total = session.total_parts, bytes = len, "part uploaded");
    }
    Ok(session.total_parts)
}

/// Record a finished upload: the parent's listing and search entries are
/// dropped, as is the detail of a replaced file, and the new detail is cached.
fn completed(
    ctx: &DriveContext,
    file_id: &str,
    target_dir: &str,
    name: &str,
    size: u64,
    replaces: Option<&str>,
) -> RemoteFile {
    let now = Utc::now();
    let file = RemoteFile {
        file_id: file_id.to_string(),
        parent_file_id: target_dir.to_string(),
        name: name.to_string(),
        kind: FileKind::File,
        size,
        created_at: Some(now),
        updated_at: Some(now),
        content_hash: None,
        download_url: None,
    };
    ctx.cache.invalidate_listing(target_dir);
    ctx.cache.invalidate_search(target_dir, name);
    if let Some(old) = replaces.filter(|old| *old != file_id) {
        ctx.cache.invalidate_file(old);
    }
    ctx.cache.set_file(&file);
    file
}
