//! Refresh-token persistence and the periodic refresher.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use drivefs_core::{CloudClient, CredentialCell, Credentials, DriveError, DriveResult};

/// Refresh tokens are 32 characters; anything past that is ignored.
pub const TOKEN_LEN: usize = 32;

/// Trim whitespace and cap the token at [`TOKEN_LEN`] characters.
pub fn normalize_token(raw: &str) -> String {
    raw.trim().chars().take(TOKEN_LEN).collect()
}

/// File holding the refresh token between runs.
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        TokenStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the stored token. A missing or blank file yields `None`.
    pub fn read(&self) -> DriveResult<Option<String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => {
                let token = normalize_token(&content);
                Ok((!token.is_empty()).then_some(token))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(DriveError::Io(e)),
        }
    }

    /// Write `token` if it differs from what is stored. Returns true if written.
    pub fn persist(&self, token: &str) -> DriveResult<bool> {
        if self.read()?.as_deref() == Some(token) {
            return Ok(false);
        }

        let mut options = std::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&self.path)?;
        file.write_all(token.as_bytes())?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))?;
        }
        debug!(path = %self.path.display(), "refresh token persisted");
        Ok(true)
    }
}

/// Exchange the cell's refresh token, swap in the new credentials, and
/// persist a rotated refresh token. Returns the new credential version.
pub async fn refresh_once(
    client: &dyn CloudClient,
    cell: &CredentialCell,
    store: Option<&TokenStore>,
) -> DriveResult<u64> {
    let current = cell.load();
    let grant = client.refresh_token(&current.refresh_token).await?;
    let version = cell.store(Credentials::from_grant(&grant));

    if let Some(store) = store {
        if grant.refresh_token != current.refresh_token {
            store.persist(&grant.refresh_token)?;
        }
    }
    info!(version, drive = %grant.drive_id, "credentials refreshed");
    Ok(version)
}

/// Periodically refresh credentials until the task is aborted. Failures keep
/// the previous credentials.
pub fn spawn_refresh_loop(
    client: Arc<dyn CloudClient>,
    cell: Arc<CredentialCell>,
    store: Option<TokenStore>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; the caller has just exchanged.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = refresh_once(client.as_ref(), &cell, store.as_ref()).await {
                warn!(error = %e, "token refresh failed, keeping previous credentials");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_token() {
        assert_eq!(normalize_token("  abc \n"), "abc");
        let long = "x".repeat(40);
        assert_eq!(normalize_token(&long).len(), 32);
    }

    #[test]
    fn test_read_missing_and_blank() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path().join("token"));
        assert_eq!(store.read().unwrap(), None);

        std::fs::write(store.path(), "  \n").unwrap();
        assert_eq!(store.read().unwrap(), None);
    }

    #[test]
    fn test_read_truncates_long_token() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path().join("token"));
        let token = format!("{}{}", "a".repeat(32), "garbage");
        std::fs::write(store.path(), format!("{}\n", token)).unwrap();
        assert_eq!(store.read().unwrap().unwrap(), "a".repeat(32));
    }

    #[test]
    fn test_persist_only_when_changed() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path().join("token"));
        assert!(store.persist("tok1").unwrap());
        assert!(!store.persist("tok1").unwrap());
        assert!(store.persist("tok2").unwrap());
        assert_eq!(store.read().unwrap().as_deref(), Some("tok2"));
    }

    #[cfg(unix)]
    #[test]
    fn test_persist_sets_owner_only_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        std::fs::write(&path, "old").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        let store = TokenStore::new(&path);
        store.persist("new").unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
