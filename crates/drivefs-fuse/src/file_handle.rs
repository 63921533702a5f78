//! Per-open-file state: staging file for writes, ranged read stream for
//! clean reads.

use std::io::SeekFrom;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use drivefs_core::{ByteStream, DriveError, DriveResult};

use crate::context::DriveContext;
use crate::inode::AttrExpiry;
use crate::upload;

struct ReadStream {
    stream: Box<dyn ByteStream>,
    /// Offset of the next byte `pending` or the stream yields.
    pos: u64,
    pending: Vec<u8>,
}

#[derive(Default)]
struct HandleState {
    staging: Option<File>,
    dirty: bool,
    download_url: Option<String>,
    stream: Option<ReadStream>,
}

/// One open file. Operations on a handle are serialized.
pub struct FileHandle {
    pub ino: u64,
    state: Mutex<HandleState>,
}

impl FileHandle {
    pub fn new(ino: u64) -> Self {
        FileHandle {
            ino,
            state: Mutex::new(HandleState::default()),
        }
    }

    /// Handle for a freshly created file; releasing it creates the file
    /// remotely even if nothing is written.
    pub fn created(ino: u64) -> Self {
        FileHandle {
            ino,
            state: Mutex::new(HandleState {
                dirty: true,
                ..HandleState::default()
            }),
        }
    }

    pub async fn is_dirty(&self) -> bool {
        self.state.lock().await.dirty
    }

    pub async fn read(&self, ctx: &DriveContext, offset: u64, size: u32) -> DriveResult<Vec<u8>> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if let Some(file) = state.staging.as_mut() {
            file.seek(SeekFrom::Start(offset)).await?;
            let mut buf = Vec::with_capacity(size as usize);
            file.take(size as u64).read_to_end(&mut buf).await?;
            return Ok(buf);
        }

        let inode = ctx.tree.snapshot(self.ino)?;
        let Some(remote_id) = inode.remote_id else {
            return Ok(Vec::new());
        };
        let file_size = inode.attrs.size;
        if size == 0 || offset >= file_size {
            return Ok(Vec::new());
        }
        let want = (size as u64).min(file_size - offset) as usize;
        read_remote(ctx, state, &remote_id, offset, want).await
    }

    pub async fn write(&self, ctx: &DriveContext, offset: u64, data: &[u8]) -> DriveResult<u32> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let inode = ctx.tree.snapshot(self.ino)?;
        let replaces_all = offset == 0 && data.len() as u64 >= inode.attrs.size;
        let file = staging(ctx, state, self.ino, !replaces_all).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        let len = file.metadata().await?.len();
        state.dirty = true;
        state.stream = None;
        self.mark_local(ctx, len)?;
        Ok(data.len() as u32)
    }

    pub async fn truncate(&self, ctx: &DriveContext, size: u64) -> DriveResult<()> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let file = staging(ctx, state, self.ino, size > 0).await?;
        file.set_len(size).await?;
        state.dirty = true;
        state.stream = None;
        self.mark_local(ctx, size)
    }

    /// Upload staged content if the handle is dirty.
    pub async fn flush(&self, ctx: &DriveContext) -> DriveResult<()> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if !state.dirty {
            return Ok(());
        }

        let inode = ctx.tree.snapshot(self.ino)?;
        if inode.parent.is_none() {
            debug!(ino = self.ino, "dropping writes to unlinked file");
            state.dirty = false;
            return Ok(());
        }
        let parent = inode
            .remote_parent_id
            .ok_or_else(|| DriveError::invariant(format!("inode {} has no remote parent", self.ino)))?;

        let file = staging(ctx, state, self.ino, false).await?;
        file.flush().await?;
        let size = file.metadata().await?.len();
        let outcome = upload::upload(
            ctx,
            file,
            &parent,
            &inode.name,
            size,
            inode.remote_id.as_deref(),
        )
        .await?;

        state.dirty = false;
        state.download_url = None;
        state.stream = None;
        let node = ctx.tree.lookup(self.ino)?;
        let mut node_state = node.lock();
        node_state.local_dirty = false;
        node_state.apply_remote(&outcome.file, AttrExpiry::after(ctx.settings.attr_ttl));
        Ok(())
    }

    fn mark_local(&self, ctx: &DriveContext, size: u64) -> DriveResult<()> {
        let node = ctx.tree.lookup(self.ino)?;
        let mut node_state = node.lock();
        node_state.local_dirty = true;
        node_state.attrs.set_size(size);
        Ok(())
    }
}

/// The handle's staging file, created on first use. With `hydrate`, an
/// existing remote body is copied in first.
async fn staging<'s>(
    ctx: &DriveContext,
    state: &'s mut HandleState,
    ino: u64,
    hydrate: bool,
) -> DriveResult<&'s mut File> {
    if state.staging.is_none() {
        tokio::fs::create_dir_all(&ctx.settings.staging_dir).await?;
        let mut file = File::from_std(tempfile::tempfile_in(&ctx.settings.staging_dir)?);
        if hydrate {
            let inode = ctx.tree.snapshot(ino)?;
            if let (Some(remote_id), true) = (inode.remote_id.as_deref(), inode.attrs.size > 0) {
                let copied = copy_remote(ctx, remote_id, &mut file).await?;
                debug!(ino, bytes = copied, "staging file hydrated");
            }
        }
        state.staging = Some(file);
    }
    state
        .staging
        .as_mut()
        .ok_or_else(|| DriveError::invariant("staging file missing"))
}

async fn copy_remote(ctx: &DriveContext, remote_id: &str, file: &mut File) -> DriveResult<u64> {
    let url = ctx.client.download_url(remote_id).await?;
    let mut stream = ctx.client.open_range(&url, 0).await?;
    let mut copied = 0u64;
    while let Some(chunk) = stream.next_chunk().await? {
        file.write_all(&chunk).await?;
        copied += chunk.len() as u64;
    }
    file.flush().await?;
    Ok(copied)
}

async fn read_remote(
    ctx: &DriveContext,
    state: &mut HandleState,
    remote_id: &str,
    offset: u64,
    want: usize,
) -> DriveResult<Vec<u8>> {
    let attempts = ctx.settings.retry.read.attempts.max(1);
    let mut failures = 0u32;
    let mut out = Vec::with_capacity(want);

    while out.len() < want {
        let pos = offset + out.len() as u64;
        if state.stream.as_ref().map_or(true, |s| s.pos != pos) {
            let url = match &state.download_url {
                Some(url) => url.clone(),
                None => {
                    let url = ctx.client.download_url(remote_id).await?;
                    state.download_url = Some(url.clone());
                    url
                }
            };
            match ctx.client.open_range(&url, pos).await {
                Ok(stream) => {
                    state.stream = Some(ReadStream {
                        stream,
                        pos,
                        pending: Vec::new(),
                    });
                }
                Err(e) if !e.is_not_found() && failures + 1 < attempts => {
                    failures += 1;
                    warn!(file = %remote_id, pos, error = %e, "reopening read stream");
                    // The signed URL may have expired.
                    state.download_url = None;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        let Some(reader) = state.stream.as_mut() else {
            continue;
        };
        if reader.pending.is_empty() {
            match reader.stream.next_chunk().await {
                Ok(Some(chunk)) => reader.pending = chunk,
                Ok(None) => break,
                Err(e) if e.is_transient() && failures + 1 < attempts => {
                    failures += 1;
                    warn!(file = %remote_id, pos, error = %e, "read stream interrupted");
                    state.stream = None;
                    continue;
                }
                Err(e) => {
                    state.stream = None;
                    return Err(e);
                }
            }
        }
        let take = reader.pending.len().min(want - out.len());
        out.extend(reader.pending.drain(..take));
        reader.pos += take as u64;
    }
    Ok(out)
}
