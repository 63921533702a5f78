//! Remote data model.
//!
//! Field names follow the drive API's JSON so these types deserialize
//! straight from responses.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Remote id of the drive root.
pub const ROOT_FILE_ID: &str = "root";

/// Kind of remote node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    File,
    Folder,
}

impl FileKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileKind::File => "file",
            FileKind::Folder => "folder",
        }
    }

    pub fn is_folder(&self) -> bool {
        matches!(self, FileKind::Folder)
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FileKind::File => "file",
            FileKind::Folder => "directory",
        })
    }
}

/// A file or folder as reported by the remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteFile {
    pub file_id: String,
    #[serde(default)]
    pub parent_file_id: String,
    #[serde(alias = "file_name")]
    pub name: String,
    #[serde(rename = "type")]
    pub kind: FileKind,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
}

impl RemoteFile {
    /// Synthetic record for the drive root.
    pub fn root() -> Self {
        RemoteFile {
            file_id: ROOT_FILE_ID.to_string(),
            parent_file_id: String::new(),
            name: String::new(),
            kind: FileKind::Folder,
            size: 0,
            created_at: None,
            updated_at: None,
            content_hash: None,
            download_url: None,
        }
    }

    pub fn is_folder(&self) -> bool {
        self.kind.is_folder()
    }
}

/// One page of a directory listing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListPage {
    #[serde(default)]
    pub items: Vec<RemoteFile>,
    #[serde(default)]
    pub next_marker: Option<String>,
}

impl ListPage {
    /// Continuation marker, if another page follows.
    pub fn continuation(&self) -> Option<&str> {
        self.next_marker.as_deref().filter(|m| !m.is_empty())
    }
}

/// What an upload-create call carries to negotiate rapid upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadProbe {
    /// Plain create, no hashes.
    None,
    /// SHA-1 of the first KiB, lowercase hex.
    PreHash(String),
    /// Full-content SHA-1 (uppercase hex) and base64 possession proof.
    Content { sha1: String, proof: String },
}

/// Parameters for creating a file upload.
#[derive(Debug, Clone)]
pub struct UploadCreateRequest {
    pub parent_file_id: String,
    pub name: String,
    pub size: u64,
    pub part_count: u32,
    pub probe: UploadProbe,
}

/// Result of an upload-create call.
#[derive(Debug, Clone, Default)]
pub struct UploadCreated {
    pub file_id: String,
    pub upload_id: Option<String>,
    pub rapid_upload: bool,
    pub part_urls: Vec<String>,
}

/// Result of finalizing an upload.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadCompleted {
    pub file_id: String,
    #[serde(alias = "file_name")]
    pub name: String,
    #[serde(default)]
    pub size: u64,
}

/// Signed part upload URL with the expiry embedded in its query string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartUrl {
    pub url: String,
    /// Unix seconds from `x-oss-expires`, when present.
    pub expires_at: Option<i64>,
}

impl PartUrl {
    pub fn parse(url: impl Into<String>) -> Self {
        let url = url.into();
        let expires_at = url
            .split(['?', '&'])
            .find_map(|pair| pair.strip_prefix("x-oss-expires="))
            .and_then(|v| v.parse::<i64>().ok());
        PartUrl { url, expires_at }
    }

    /// URLs without an embedded expiry never expire.
    pub fn is_expired(&self, now_epoch: i64) -> bool {
        self.expires_at.is_some_and(|exp| now_epoch > exp)
    }
}

/// Number of parts for a file of `size` bytes. Empty files still use one part.
pub fn part_count(size: u64, part_size: u64) -> u32 {
    if size == 0 || part_size == 0 {
        return 1;
    }
    size.div_ceil(part_size) as u32
}

/// Multipart upload state, consumed strictly in part order.
#[derive(Debug, Clone)]
pub struct UploadSession {
    pub upload_id: String,
    pub file_id: String,
    pub part_urls: Vec<PartUrl>,
    pub part_size: u64,
    pub total_parts: u32,
    pub size: u64,
}

impl UploadSession {
    pub fn new(
        upload_id: String,
        file_id: String,
        urls: Vec<String>,
        part_size: u64,
        size: u64,
    ) -> Self {
        UploadSession {
            upload_id,
            file_id,
            part_urls: urls.into_iter().map(PartUrl::parse).collect(),
            part_size,
            total_parts: part_count(size, part_size),
            size,
        }
    }

    /// Byte offset and length of the zero-based part `index`.
    pub fn part_range(&self, index: u32) -> (u64, u64) {
        let offset = index as u64 * self.part_size;
        let len = self.part_size.min(self.size.saturating_sub(offset));
        (offset, len)
    }

    /// One-based part numbers from `index` to the end.
    pub fn remaining_part_numbers(&self, index: u32) -> Vec<u32> {
        (index + 1..=self.total_parts).collect()
    }

    /// Replace URLs for parts `index..` with a renewed batch.
    pub fn renew_from(&mut self, index: u32, urls: Vec<String>) {
        self.part_urls.truncate(index as usize);
        self.part_urls.extend(urls.into_iter().map(PartUrl::parse));
    }
}

/// Drive capacity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Quota {
    pub total: u64,
    pub used: u64,
}

impl Quota {
    pub fn free(&self) -> u64 {
        self.total.saturating_sub(self.used)
    }
}

/// Result of exchanging a refresh token.
#[derive(Clone, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(alias = "default_drive_id")]
    pub drive_id: String,
    #[serde(default)]
    pub expires_in: i64,
}

impl fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenGrant")
            .field("drive_id", &self.drive_id)
            .field("expires_in", &self.expires_in)
            .finish_non_exhaustive()
    }
}
