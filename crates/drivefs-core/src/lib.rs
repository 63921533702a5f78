pub mod cache;
pub mod credentials;
pub mod error;
pub mod hashing;
pub mod model;
pub mod retry;
pub mod traits;

pub use cache::{create_cache, CacheKey, CacheStats, CachedValue, MetadataCache, SharedCache};
pub use credentials::{CredentialCell, Credentials};
pub use error::{DriveError, DriveResult};
pub use model::{
    part_count, FileKind, ListPage, PartUrl, Quota, RemoteFile, TokenGrant, UploadCompleted,
    UploadCreateRequest, UploadCreated, UploadProbe, UploadSession, ROOT_FILE_ID,
};
pub use retry::{RetryPolicy, RetrySettings};
pub use traits::{ByteStream, CloudClient};
