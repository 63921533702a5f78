//! Swap-on-refresh credential cell.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;

use crate::model::TokenGrant;

/// One consistent set of credentials for the drive.
#[derive(Clone)]
pub struct Credentials {
    pub access_token: String,
    pub refresh_token: String,
    pub drive_id: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credentials {
    /// Credentials carrying only a refresh token, before the first exchange.
    pub fn unauthenticated(refresh_token: impl Into<String>) -> Self {
        Credentials {
            access_token: String::new(),
            refresh_token: refresh_token.into(),
            drive_id: String::new(),
            expires_at: None,
        }
    }

    pub fn from_grant(grant: &TokenGrant) -> Self {
        let expires_at = (grant.expires_in > 0)
            .then(|| Utc::now() + Duration::seconds(grant.expires_in));
        Credentials {
            access_token: grant.access_token.clone(),
            refresh_token: grant.refresh_token.clone(),
            drive_id: grant.drive_id.clone(),
            expires_at,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        !self.access_token.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("drive_id", &self.drive_id)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Versioned cell. Readers take an `Arc` snapshot; the refresher swaps it whole.
pub struct CredentialCell {
    current: RwLock<Arc<Credentials>>,
    version: AtomicU64,
}

impl CredentialCell {
    pub fn new(credentials: Credentials) -> Self {
        CredentialCell {
            current: RwLock::new(Arc::new(credentials)),
            version: AtomicU64::new(1),
        }
    }

    /// Snapshot of the current credentials.
    pub fn load(&self) -> Arc<Credentials> {
        self.current.read().clone()
    }

    /// Replace the credentials and return the new version.
    pub fn store(&self, credentials: Credentials) -> u64 {
        let mut guard = self.current.write();
        *guard = Arc::new(credentials);
        self.version.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }
}

impl fmt::Debug for CredentialCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialCell")
            .field("version", &self.version())
            .field("current", &*self.load())
            .finish()
    }
}
