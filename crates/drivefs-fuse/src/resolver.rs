//! Slash-separated path resolution against the remote listing.

use tracing::{debug, trace};

use drivefs_core::{CloudClient, DriveError, DriveResult, FileKind, MetadataCache, RemoteFile};

use crate::dir_handle::fetch_listing;

/// Resolves paths by walking listings from the root, warming the cache as
/// it goes.
pub struct PathResolver<'a> {
    client: &'a dyn CloudClient,
    cache: &'a MetadataCache,
}

/// Split a path into its non-empty segments.
pub fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

impl<'a> PathResolver<'a> {
    pub fn new(client: &'a dyn CloudClient, cache: &'a MetadataCache) -> Self {
        PathResolver { client, cache }
    }

    pub async fn resolve(&self, path: &str) -> DriveResult<RemoteFile> {
        self.resolve_segments(&split_path(path)).await
    }

    /// Resolve `segments` from the root. The first sibling whose name matches
    /// wins at every level.
    pub async fn resolve_segments(&self, segments: &[&str]) -> DriveResult<RemoteFile> {
        let root = RemoteFile::root();
        if segments.is_empty() {
            // The root itself always resolves; listing it only warms the cache.
            if let Err(e) = fetch_listing(self.client, self.cache, &root.file_id).await {
                debug!(error = %e, "root listing failed");
            }
            return Ok(root);
        }

        let mut current = root;
        let mut prefix = String::new();
        for (depth, segment) in segments.iter().enumerate() {
            if !current.is_folder() {
                return Err(DriveError::NotFound(segments[..=depth].join("/")));
            }
            let items = fetch_listing(self.client, self.cache, &current.file_id)
                .await
                .map_err(|e| {
                    debug!(parent = %current.file_id, error = %e, "listing failed during resolve");
                    DriveError::NotFound(segments[..=depth].join("/"))
                })?;

            let mut found = None;
            for item in items.iter() {
                self.cache.set_file(item);
                let rel = if depth == 0 {
                    item.name.clone()
                } else {
                    format!("{}/{}", prefix, item.name)
                };
                self.cache.set_path_index(&rel, &item.file_id);
                if item.name == *segment {
                    found = Some(item.clone());
                    break;
                }
            }

            let Some(next) = found else {
                return Err(DriveError::NotFound(segments[..=depth].join("/")));
            };
            trace!(segment, file = %next.file_id, "segment resolved");
            if depth > 0 {
                prefix.push('/');
            }
            prefix.push_str(segment);
            current = next;
        }
        Ok(current)
    }

    /// Absolute path of the folders above `file_id`, as `/a/b/`. A folder
    /// target is not part of its own path.
    pub async fn absolute_path(&self, file_id: &str, kind: FileKind) -> DriveResult<String> {
        if let Some(path) = self.cache.path(file_id) {
            return Ok(path);
        }
        let chain = self.client.path(file_id).await?;
        let skip_target = usize::from(kind.is_folder() && !chain.is_empty());

        let mut path = String::from("/");
        for item in chain.iter().skip(skip_target).rev() {
            if item.is_folder() {
                path.push_str(&item.name);
                path.push('/');
            }
        }
        self.cache.set_path(file_id, path.clone());
        Ok(path)
    }
}
