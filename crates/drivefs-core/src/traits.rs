use async_trait::async_trait;

use crate::error::DriveResult;
use crate::model::{
    FileKind, ListPage, Quota, RemoteFile, TokenGrant, UploadCompleted, UploadCreateRequest,
    UploadCreated,
};

/// Sequential byte stream from a ranged download.
#[async_trait]
pub trait ByteStream: Send {
    /// Next chunk, or `None` at end of stream.
    async fn next_chunk(&mut self) -> DriveResult<Option<Vec<u8>>>;
}

/// Contract every drive backend implements.
///
/// Implementations retry transient failures internally; errors that reach the
/// caller are final.
#[async_trait]
pub trait CloudClient: Send + Sync + 'static {
    /// Access token of the current credential snapshot.
    fn access_token(&self) -> String;

    /// One page of `parent_id`'s children.
    async fn list(
        &self,
        parent_id: &str,
        marker: Option<&str>,
        kind: Option<FileKind>,
    ) -> DriveResult<ListPage>;

    async fn detail(&self, file_id: &str) -> DriveResult<RemoteFile>;

    /// Ancestor chain of `file_id`, in the order the remote returns it.
    async fn path(&self, file_id: &str) -> DriveResult<Vec<RemoteFile>>;

    async fn mkdir(&self, parent_id: &str, name: &str) -> DriveResult<RemoteFile>;

    async fn rename(&self, file_id: &str, new_name: &str) -> DriveResult<RemoteFile>;

    async fn trash(&self, file_id: &str) -> DriveResult<()>;

    async fn search(
        &self,
        parent_id: &str,
        name: &str,
        kind: FileKind,
    ) -> DriveResult<Vec<RemoteFile>>;

    async fn move_file(&self, file_id: &str, dest_parent_id: &str) -> DriveResult<()>;

    /// Create an upload. A pre-hash probe that matches remote content fails
    /// with `RemoteConflict`.
    async fn upload_create(&self, request: &UploadCreateRequest) -> DriveResult<UploadCreated>;

    /// Fresh signed URLs for the given one-based part numbers.
    async fn upload_urls(
        &self,
        file_id: &str,
        upload_id: &str,
        part_numbers: &[u32],
    ) -> DriveResult<Vec<String>>;

    async fn upload_part(&self, url: &str, data: Vec<u8>) -> DriveResult<()>;

    async fn upload_complete(&self, file_id: &str, upload_id: &str)
        -> DriveResult<UploadCompleted>;

    async fn download_url(&self, file_id: &str) -> DriveResult<String>;

    /// Stream `url` from `offset` to the end.
    async fn open_range(&self, url: &str, offset: u64) -> DriveResult<Box<dyn ByteStream>>;

    async fn quota(&self) -> DriveResult<Quota>;

    /// Exchange a refresh token for a new grant.
    async fn refresh_token(&self, refresh_token: &str) -> DriveResult<TokenGrant>;
}
