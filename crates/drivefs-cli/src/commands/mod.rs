pub mod config;
pub mod ls;
pub mod mount;
pub mod quota;
pub mod refresh;
pub mod stat;

use std::sync::Arc;

use drivefs_config::DriveConfig;
use drivefs_core::{create_cache, CloudClient, CredentialCell, Credentials, SharedCache};
use drivefs_remote::{refresh_once, spawn_refresh_loop, DriveClient, TokenStore};
use tokio::task::JoinHandle;

/// An authenticated connection to the drive.
pub struct Session {
    pub client: Arc<DriveClient>,
    pub cell: Arc<CredentialCell>,
    pub store: TokenStore,
    pub cache: SharedCache,
    pub config: DriveConfig,
}

impl Session {
    /// Resolve the refresh token, exchange it once, and persist the result.
    pub async fn connect(
        config: &DriveConfig,
        cli_token: Option<String>,
    ) -> Result<Session, Box<dyn std::error::Error>> {
        let store = TokenStore::new(&config.auth.token_file);
        let token = resolve_token(cli_token, config, &store)?;

        let cell = Arc::new(CredentialCell::new(Credentials::unauthenticated(token)));
        let client = Arc::new(DriveClient::new(config, cell.clone())?);
        refresh_once(client.as_ref(), &cell, None)
            .await
            .map_err(|e| format!("invalid refresh token: {}", e))?;
        store.persist(&cell.load().refresh_token)?;

        Ok(Session {
            client,
            cell,
            store,
            cache: create_cache(&config.cache),
            config: config.clone(),
        })
    }

    pub fn cloud(&self) -> Arc<dyn CloudClient> {
        self.client.clone()
    }

    /// Keep the access token fresh for as long as the handle lives.
    pub fn spawn_refresher(&self) -> JoinHandle<()> {
        spawn_refresh_loop(
            self.cloud(),
            self.cell.clone(),
            Some(self.store.clone()),
            self.config.auth.refresh_interval.as_duration(),
        )
    }
}

/// `--refresh-token`, then `auth.refresh_token`, then the token file.
fn resolve_token(
    cli_token: Option<String>,
    config: &DriveConfig,
    store: &TokenStore,
) -> Result<String, Box<dyn std::error::Error>> {
    let explicit = cli_token
        .or_else(|| config.auth.refresh_token.clone())
        .map(|t| drivefs_remote::normalize_token(&t))
        .filter(|t| !t.is_empty());
    if let Some(token) = explicit {
        return Ok(token);
    }
    store.read()?.ok_or_else(|| {
        format!(
            "no refresh token: pass --refresh-token, set auth.refresh_token, or write it to {}",
            store.path().display()
        )
        .into()
    })
}

/// Human-readable byte count.
pub fn format_size(bytes: u64) -> String {
    if bytes >= 1024 * 1024 * 1024 {
        format!("{:.1}G", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    } else if bytes >= 1024 * 1024 {
        format!("{:.1}M", bytes as f64 / (1024.0 * 1024.0))
    } else if bytes >= 1024 {
        format!("{:.1}K", bytes as f64 / 1024.0)
    } else {
        format!("{}B", bytes)
    }
}
