//! In-memory drive for tests and offline runs.
//!
//! Implements the full [`CloudClient`] contract including rapid-upload
//! negotiation and signed part URLs (`mem://<upload>/<part>?x-oss-expires=`),
//! and records every call so tests can assert on remote traffic.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;

use drivefs_core::hashing::{content_sha1, pre_hash, proof_code, proof_range};
use drivefs_core::{
    ByteStream, CloudClient, DriveError, DriveResult, FileKind, ListPage, PartUrl,
    Quota, RemoteFile, TokenGrant, UploadCompleted, UploadCreateRequest, UploadCreated,
    UploadProbe, ROOT_FILE_ID,
};

const DEFAULT_PAGE_SIZE: usize = 200;
const DEFAULT_QUOTA: u64 = 100 * 1024 * 1024 * 1024;
const STREAM_CHUNK: usize = 64 * 1024;
const URL_LIFETIME_SECS: i64 = 3600;
const EPOCH_BASE: i64 = 1_600_000_000;

/// Calls observed by the drive.
#[derive(Debug, Clone, Default)]
pub struct MemoryStats {
    pub list_calls: u64,
    /// `(parent, marker)` of every list call, in order.
    pub list_requests: Vec<(String, Option<String>)>,
    pub detail_calls: u64,
    pub search_calls: u64,
    pub create_calls: u64,
    /// `(upload_id, part_number, bytes)` of every accepted part PUT.
    pub part_puts: Vec<(String, u32, usize)>,
    /// Part numbers of every renewal request, including failed ones.
    pub renewals: Vec<Vec<u32>>,
    pub completes: u64,
    pub renames: u64,
    pub moves: u64,
    pub trashes: u64,
    pub stream_opens: u64,
    pub refreshes: u64,
}

/// Failure injection knobs.
#[derive(Debug, Clone, Default)]
pub struct Faults {
    /// URLs handed out by upload-create for parts `>= k` are already expired.
    pub expire_from_part: Option<u32>,
    /// The next `n` renewal requests fail transiently.
    pub failing_renewals: u32,
    /// Token refresh fails transiently.
    pub fail_refresh: bool,
    /// Batch move reports this per-item status.
    pub move_status: Option<u16>,
    /// Content probes never match, so every upload sends parts.
    pub refuse_rapid: bool,
}

struct Node {
    file: RemoteFile,
    content: Vec<u8>,
    trashed: bool,
}

struct PendingUpload {
    file_id: String,
    parent_id: String,
    name: String,
    size: u64,
    part_count: u32,
    parts: BTreeMap<u32, Vec<u8>>,
}

struct State {
    nodes: HashMap<String, Node>,
    uploads: HashMap<String, PendingUpload>,
    next_id: u64,
    clock: i64,
    page_size: usize,
    quota_total: u64,
    access_token: String,
    grants: u64,
    faults: Faults,
    stats: MemoryStats,
}

impl State {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }

    fn tick(&mut self) -> DateTime<Utc> {
        self.clock += 1;
        DateTime::from_timestamp(EPOCH_BASE + self.clock, 0).unwrap_or_default()
    }

    fn live(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id).filter(|n| !n.trashed)
    }

    fn require_folder(&self, id: &str) -> DriveResult<()> {
        if id == ROOT_FILE_ID {
            return Ok(());
        }
        match self.live(id) {
            Some(node) if node.file.is_folder() => Ok(()),
            Some(node) => Err(DriveError::WrongKind {
                name: node.file.name.clone(),
                expected: FileKind::Folder,
            }),
            None => Err(DriveError::NotFound(id.to_string())),
        }
    }

    fn children(&self, parent_id: &str) -> Vec<&Node> {
        let mut children: Vec<&Node> = self
            .nodes
            .values()
            .filter(|n| !n.trashed && n.file.parent_file_id == parent_id)
            .collect();
        // updated_at DESC, newest id first on ties
        children.sort_by(|a, b| {
            b.file
                .updated_at
                .cmp(&a.file.updated_at)
                .then_with(|| id_order(&b.file.file_id).cmp(&id_order(&a.file.file_id)))
        });
        children
    }

    fn sibling(&self, parent_id: &str, name: &str, kind: FileKind) -> Option<String> {
        self.nodes
            .values()
            .find(|n| {
                !n.trashed
                    && n.file.parent_file_id == parent_id
                    && n.file.name == name
                    && n.file.kind == kind
            })
            .map(|n| n.file.file_id.clone())
    }

    fn insert_file(&mut self, file_id: String, parent_id: &str, name: &str, content: Vec<u8>) -> RemoteFile {
        // check_name_mode=overwrite replaces any live file of the same name.
        if let Some(old) = self.sibling(parent_id, name, FileKind::File) {
            if let Some(node) = self.nodes.get_mut(&old) {
                node.trashed = true;
            }
        }
        let now = self.tick();
        let file = RemoteFile {
            file_id: file_id.clone(),
            parent_file_id: parent_id.to_string(),
            name: name.to_string(),
            kind: FileKind::File,
            size: content.len() as u64,
            created_at: Some(now),
            updated_at: Some(now),
            content_hash: Some(content_sha1(&content)),
            download_url: None,
        };
        self.nodes.insert(
            file_id,
            Node {
                file: file.clone(),
                content,
                trashed: false,
            },
        );
        file
    }

    fn issue_urls(&self, upload_id: &str, parts: impl IntoIterator<Item = u32>, fresh: bool) -> Vec<String> {
        let now = Utc::now().timestamp();
        parts
            .into_iter()
            .map(|part| {
                let expired = !fresh
                    && self
                        .faults
                        .expire_from_part
                        .is_some_and(|k| part >= k);
                let expires = if expired { now - 60 } else { now + URL_LIFETIME_SECS };
                format!("mem://{}/{}?x-oss-expires={}", upload_id, part, expires)
            })
            .collect()
    }
}

fn id_order(id: &str) -> u64 {
    id.rsplit('-').next().and_then(|n| n.parse().ok()).unwrap_or(0)
}

/// In-memory [`CloudClient`].
pub struct MemoryDrive {
    state: Mutex<State>,
}

impl Default for MemoryDrive {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDrive {
    pub fn new() -> Self {
        MemoryDrive {
            state: Mutex::new(State {
                nodes: HashMap::new(),
                uploads: HashMap::new(),
                next_id: 0,
                clock: 0,
                page_size: DEFAULT_PAGE_SIZE,
                quota_total: DEFAULT_QUOTA,
                access_token: "memory-access-token".to_string(),
                grants: 0,
                faults: Faults::default(),
                stats: MemoryStats::default(),
            }),
        }
    }

    pub fn with_page_size(page_size: usize) -> Self {
        let drive = Self::new();
        drive.set_page_size(page_size);
        drive
    }

    pub fn set_page_size(&self, page_size: usize) {
        self.state.lock().page_size = page_size.max(1);
    }

    pub fn set_quota_total(&self, total: u64) {
        self.state.lock().quota_total = total;
    }

    pub fn set_faults(&self, faults: Faults) {
        self.state.lock().faults = faults;
    }

    pub fn stats(&self) -> MemoryStats {
        self.state.lock().stats.clone()
    }

    pub fn reset_stats(&self) {
        self.state.lock().stats = MemoryStats::default();
    }

    // ====== Seeding and inspection ======

    pub fn add_folder(&self, parent_id: &str, name: &str) -> RemoteFile {
        let mut state = self.state.lock();
        let file_id = state.next_id("folder");
        let now = state.tick();
        let file = RemoteFile {
            file_id: file_id.clone(),
            parent_file_id: parent_id.to_string(),
            name: name.to_string(),
            kind: FileKind::Folder,
            size: 0,
            created_at: Some(now),
            updated_at: Some(now),
            content_hash: None,
            download_url: None,
        };
        state.nodes.insert(
            file_id,
            Node {
                file: file.clone(),
                content: Vec::new(),
                trashed: false,
            },
        );
        file
    }

    pub fn add_file(&self, parent_id: &str, name: &str, content: impl Into<Vec<u8>>) -> RemoteFile {
        let mut state = self.state.lock();
        let file_id = state.next_id("file");
        state.insert_file(file_id, parent_id, name, content.into())
    }

    /// Live children of `parent_id` in listing order.
    pub fn children_of(&self, parent_id: &str) -> Vec<RemoteFile> {
        let state = self.state.lock();
        state
            .children(parent_id)
            .into_iter()
            .map(|n| n.file.clone())
            .collect()
    }

    pub fn find(&self, parent_id: &str, name: &str) -> Option<RemoteFile> {
        self.children_of(parent_id)
            .into_iter()
            .find(|f| f.name == name)
    }

    pub fn content(&self, file_id: &str) -> Option<Vec<u8>> {
        self.state.lock().live(file_id).map(|n| n.content.clone())
    }

    pub fn is_trashed(&self, file_id: &str) -> bool {
        self.state
            .lock()
            .nodes
            .get(file_id)
            .is_some_and(|n| n.trashed)
    }
}

struct MemoryStream {
    data: Vec<u8>,
    pos: usize,
}

#[async_trait]
impl ByteStream for MemoryStream {
    async fn next_chunk(&mut self) -> DriveResult<Option<Vec<u8>>> {
        if self.pos >= self.data.len() {
            return Ok(None);
        }
        let end = (self.pos + STREAM_CHUNK).min(self.data.len());
        let chunk = self.data[self.pos..end].to_vec();
        self.pos = end;
        Ok(Some(chunk))
    }
}

fn parse_part_url(url: &str) -> DriveResult<(String, u32)> {
    let rest = url
        .strip_prefix("mem://")
        .ok_or_else(|| DriveError::Other(format!("not a memory part url: {}", url)))?;
    let path = rest.split('?').next().unwrap_or(rest);
    let (upload_id, part) = path
        .split_once('/')
        .ok_or_else(|| DriveError::Other(format!("malformed part url: {}", url)))?;
    let part = part
        .parse()
        .map_err(|_| DriveError::Other(format!("malformed part number: {}", url)))?;
    Ok((upload_id.to_string(), part))
}

#[async_trait]
impl CloudClient for MemoryDrive {
    fn access_token(&self) -> String {
        self.state.lock().access_token.clone()
    }

    async fn list(
        &self,
        parent_id: &str,
        marker: Option<&str>,
        kind: Option<FileKind>,
    ) -> DriveResult<ListPage> {
        let mut state = self.state.lock();
        state.stats.list_calls += 1;
        state
            .stats
            .list_requests
            .push((parent_id.to_string(), marker.map(str::to_string)));
        state.require_folder(parent_id)?;

        let offset: usize = match marker {
            Some(m) if !m.is_empty() => m
                .parse()
                .map_err(|_| DriveError::Other(format!("bad marker {}", m)))?,
            _ => 0,
        };
        let children: Vec<RemoteFile> = state
            .children(parent_id)
            .into_iter()
            .filter(|n| kind.map_or(true, |k| n.file.kind == k))
            .map(|n| n.file.clone())
            .collect();

        let end = (offset + state.page_size).min(children.len());
        let items = children.get(offset..end).map(<[_]>::to_vec).unwrap_or_default();
        let next_marker = if end < children.len() {
            end.to_string()
        } else {
            String::new()
        };
        debug!(parent = %parent_id, offset, returned = items.len(), "memory list");
        Ok(ListPage {
            items,
            next_marker: Some(next_marker),
        })
    }

    async fn detail(&self, file_id: &str) -> DriveResult<RemoteFile> {
        let mut state = self.state.lock();
        state.stats.detail_calls += 1;
        if file_id == ROOT_FILE_ID {
            return Ok(RemoteFile::root());
        }
        state
            .live(file_id)
            .map(|n| n.file.clone())
            .ok_or_else(|| DriveError::NotFound(file_id.to_string()))
    }

    async fn path(&self, file_id: &str) -> DriveResult<Vec<RemoteFile>> {
        let state = self.state.lock();
        let mut chain = Vec::new();
        let mut current = file_id.to_string();
        while current != ROOT_FILE_ID {
            let node = state
                .live(&current)
                .ok_or_else(|| DriveError::NotFound(current.clone()))?;
            chain.push(node.file.clone());
            current = node.file.parent_file_id.clone();
        }
        Ok(chain)
    }

    async fn mkdir(&self, parent_id: &str, name: &str) -> DriveResult<RemoteFile> {
        {
            let state = self.state.lock();
            state.require_folder(parent_id)?;
            if state.sibling(parent_id, name, FileKind::Folder).is_some() {
                return Err(DriveError::AlreadyExists(name.to_string()));
            }
        }
        Ok(self.add_folder(parent_id, name))
    }

    async fn rename(&self, file_id: &str, new_name: &str) -> DriveResult<RemoteFile> {
        let mut state = self.state.lock();
        state.stats.renames += 1;
        let (parent, kind) = match state.live(file_id) {
            Some(n) => (n.file.parent_file_id.clone(), n.file.kind),
            None => return Err(DriveError::NotFound(file_id.to_string())),
        };
        if state.sibling(&parent, new_name, kind).is_some() {
            return Err(DriveError::AlreadyExists(new_name.to_string()));
        }
        let now = state.tick();
        let node = state
            .nodes
            .get_mut(file_id)
            .ok_or_else(|| DriveError::NotFound(file_id.to_string()))?;
        node.file.name = new_name.to_string();
        node.file.updated_at = Some(now);
        Ok(node.file.clone())
    }

    async fn trash(&self, file_id: &str) -> DriveResult<()> {
        let mut state = self.state.lock();
        state.stats.trashes += 1;
        match state.nodes.get_mut(file_id) {
            Some(node) if !node.trashed => {
                node.trashed = true;
                Ok(())
            }
            _ => Err(DriveError::NotFound(file_id.to_string())),
        }
    }

    async fn search(
        &self,
        parent_id: &str,
        name: &str,
        kind: FileKind,
    ) -> DriveResult<Vec<RemoteFile>> {
        let mut state = self.state.lock();
        state.stats.search_calls += 1;
        let mut items: Vec<RemoteFile> = state
            .children(parent_id)
            .into_iter()
            .filter(|n| n.file.name == name && n.file.kind == kind)
            .map(|n| n.file.clone())
            .collect();
        items.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(items)
    }

    async fn move_file(&self, file_id: &str, dest_parent_id: &str) -> DriveResult<()> {
        let mut state = self.state.lock();
        state.stats.moves += 1;
        if let Some(status) = state.faults.move_status {
            if !(200..300).contains(&status) {
                return Err(DriveError::Remote {
                    operation: "move".to_string(),
                    status,
                    message: "injected batch failure".to_string(),
                });
            }
        }
        state.require_folder(dest_parent_id)?;
        let (name, kind) = match state.live(file_id) {
            Some(n) => (n.file.name.clone(), n.file.kind),
            None => return Err(DriveError::NotFound(file_id.to_string())),
        };
        if state.sibling(dest_parent_id, &name, kind).is_some() {
            return Err(DriveError::AlreadyExists(name));
        }
        let now = state.tick();
        if let Some(node) = state.nodes.get_mut(file_id) {
            node.file.parent_file_id = dest_parent_id.to_string();
            node.file.updated_at = Some(now);
        }
        Ok(())
    }

    async fn upload_create(&self, request: &UploadCreateRequest) -> DriveResult<UploadCreated> {
        let token = self.access_token();
        let mut state = self.state.lock();
        state.stats.create_calls += 1;
        state.require_folder(&request.parent_file_id)?;

        match &request.probe {
            UploadProbe::PreHash(hash) => {
                let matched = state.nodes.values().any(|n| {
                    !n.trashed
                        && n.file.kind == FileKind::File
                        && n.file.size == request.size
                        && pre_hash(&n.content) == *hash
                });
                if matched {
                    return Err(DriveError::RemoteConflict(request.name.clone()));
                }
            }
            UploadProbe::Content { sha1, proof } => {
                let source = if state.faults.refuse_rapid {
                    None
                } else if request.size == 0 {
                    Some(Vec::new())
                } else {
                    state
                        .nodes
                        .values()
                        .find(|n| {
                            !n.trashed
                                && n.file.size == request.size
                                && n.file.content_hash.as_deref() == Some(sha1.as_str())
                        })
                        .map(|n| n.content.clone())
                };
                if let Some(content) = source {
                    let (offset, len) = proof_range(&token, request.size);
                    let expected = proof_code(&content[offset as usize..(offset + len) as usize]);
                    if expected != *proof {
                        return Err(DriveError::Remote {
                            operation: "upload_create".to_string(),
                            status: 400,
                            message: "ProofCodeNotMatch".to_string(),
                        });
                    }
                    let file_id = state.next_id("file");
                    let file = state.insert_file(
                        file_id,
                        &request.parent_file_id,
                        &request.name,
                        content,
                    );
                    debug!(name = %request.name, file = %file.file_id, "memory rapid upload");
                    return Ok(UploadCreated {
                        file_id: file.file_id,
                        upload_id: None,
                        rapid_upload: true,
                        part_urls: Vec::new(),
                    });
                }
            }
            UploadProbe::None => {}
        }

        let file_id = state.next_id("file");
        let upload_id = state.next_id("upload");
        let count = request.part_count.max(1);
        let part_urls = state.issue_urls(&upload_id, 1..=count, false);
        state.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                file_id: file_id.clone(),
                parent_id: request.parent_file_id.clone(),
                name: request.name.clone(),
                size: request.size,
                part_count: count,
                parts: BTreeMap::new(),
            },
        );
        Ok(UploadCreated {
            file_id,
            upload_id: Some(upload_id),
            rapid_upload: false,
            part_urls,
        })
    }

    async fn upload_urls(
        &self,
        file_id: &str,
        upload_id: &str,
        part_numbers: &[u32],
    ) -> DriveResult<Vec<String>> {
        let mut state = self.state.lock();
        state.stats.renewals.push(part_numbers.to_vec());
        if state.faults.failing_renewals > 0 {
            state.faults.failing_renewals -= 1;
            return Err(DriveError::transient(
                "upload_urls",
                std::io::Error::other("injected renewal failure"),
            ));
        }
        match state.uploads.get(upload_id) {
            Some(upload) if upload.file_id == file_id => {}
            _ => return Err(DriveError::NotFound(upload_id.to_string())),
        }
        Ok(state.issue_urls(upload_id, part_numbers.iter().copied(), true))
    }

    async fn upload_part(&self, url: &str, data: Vec<u8>) -> DriveResult<()> {
        let (upload_id, part) = parse_part_url(url)?;
        if PartUrl::parse(url).is_expired(Utc::now().timestamp()) {
            return Err(DriveError::Remote {
                operation: "upload_part".to_string(),
                status: 403,
                message: "Request has expired".to_string(),
            });
        }
        let mut state = self.state.lock();
        let len = data.len();
        let upload = state
            .uploads
            .get_mut(&upload_id)
            .ok_or_else(|| DriveError::NotFound(upload_id.clone()))?;
        if part == 0 || part > upload.part_count {
            return Err(DriveError::Remote {
                operation: "upload_part".to_string(),
                status: 400,
                message: format!("part {} out of range", part),
            });
        }
        upload.parts.insert(part, data);
        state.stats.part_puts.push((upload_id, part, len));
        Ok(())
    }

    async fn upload_complete(
        &self,
        file_id: &str,
        upload_id: &str,
    ) -> DriveResult<UploadCompleted> {
        let mut state = self.state.lock();
        state.stats.completes += 1;
        let upload = match state.uploads.remove(upload_id) {
            Some(u) if u.file_id == file_id => u,
            Some(u) => {
                state.uploads.insert(upload_id.to_string(), u);
                return Err(DriveError::NotFound(file_id.to_string()));
            }
            None => return Err(DriveError::NotFound(upload_id.to_string())),
        };

        let content: Vec<u8> = upload.parts.into_values().flatten().collect();
        if content.len() as u64 != upload.size {
            return Err(DriveError::Remote {
                operation: "upload_complete".to_string(),
                status: 400,
                message: format!("expected {} bytes, got {}", upload.size, content.len()),
            });
        }
        let file = state.insert_file(upload.file_id, &upload.parent_id, &upload.name, content);
        Ok(UploadCompleted {
            file_id: file.file_id,
            name: file.name,
            size: file.size,
        })
    }

    async fn download_url(&self, file_id: &str) -> DriveResult<String> {
        let state = self.state.lock();
        match state.live(file_id) {
            Some(node) if !node.file.is_folder() => Ok(format!("mem://download/{}", file_id)),
            Some(node) => Err(DriveError::WrongKind {
                name: node.file.name.clone(),
                expected: FileKind::File,
            }),
            None => Err(DriveError::NotFound(file_id.to_string())),
        }
    }

    async fn open_range(&self, url: &str, offset: u64) -> DriveResult<Box<dyn ByteStream>> {
        let file_id = url
            .strip_prefix("mem://download/")
            .ok_or_else(|| DriveError::Other(format!("not a memory download url: {}", url)))?;
        let mut state = self.state.lock();
        state.stats.stream_opens += 1;
        let content = state
            .live(file_id)
            .map(|n| n.content.clone())
            .ok_or_else(|| DriveError::NotFound(file_id.to_string()))?;
        let pos = (offset as usize).min(content.len());
        Ok(Box::new(MemoryStream { data: content, pos }))
    }

    async fn quota(&self) -> DriveResult<Quota> {
        let state = self.state.lock();
        let used = state
            .nodes
            .values()
            .filter(|n| !n.trashed)
            .map(|n| n.file.size)
            .sum();
        Ok(Quota {
            total: state.quota_total,
            used,
        })
    }

    async fn refresh_token(&self, refresh_token: &str) -> DriveResult<TokenGrant> {
        let mut state = self.state.lock();
        state.stats.refreshes += 1;
        if state.faults.fail_refresh {
            return Err(DriveError::transient(
                "refresh_token",
                std::io::Error::other("injected refresh failure"),
            ));
        }
        if refresh_token.is_empty() {
            return Err(DriveError::Remote {
                operation: "refresh_token".to_string(),
                status: 400,
                message: "InvalidParameter.RefreshToken".to_string(),
            });
        }
        state.grants += 1;
        state.access_token = format!("memory-access-{}", state.grants);
        Ok(TokenGrant {
            access_token: state.access_token.clone(),
            refresh_token: format!("memory-refresh-{}", state.grants),
            drive_id: "memory-drive".to_string(),
            expires_in: 7200,
        })
    }
}
