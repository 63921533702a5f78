use crate::model::FileKind;

/// Result alias used across drivefs.
pub type DriveResult<T> = Result<T, DriveError>;

/// Errors that can occur in drive and filesystem operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DriveError {
    /// Name, path, or child does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A child with the same name and kind already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Directory still has children.
    #[error("Directory not empty: {0}")]
    NotEmpty(String),

    /// Operation expected the other kind of node.
    #[error("'{name}' is not a {expected}")]
    WrongKind { name: String, expected: FileKind },

    /// Network or transport failure; retried by the caller's policy.
    #[error("Transient failure during '{operation}'")]
    Transient {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The remote already holds content matching a pre-hash probe.
    #[error("Remote holds matching content for '{0}'")]
    RemoteConflict(String),

    /// Remote rejected the request.
    #[error("Remote returned {status} for '{operation}': {message}")]
    Remote {
        operation: String,
        status: u16,
        message: String,
    },

    /// The inode graph or cache is out of step with itself.
    #[error("Invariant violated: {0}")]
    Invariant(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("Config error: {0}")]
    Config(String),

    /// Anything else.
    #[error("{0}")]
    Other(String),
}

impl DriveError {
    /// Returns true if this error is transient and the operation may succeed on retry.
    pub fn is_transient(&self) -> bool {
        match self {
            DriveError::Transient { .. } => true,
            DriveError::Remote { status, .. } => *status == 429 || *status >= 500,
            DriveError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DriveError::NotFound(_))
    }

    /// Shorthand for a transient failure wrapping any error.
    pub fn transient<E>(operation: &str, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        DriveError::Transient {
            operation: operation.to_string(),
            source: Box::new(source),
        }
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        DriveError::Invariant(message.into())
    }
}

impl From<drivefs_config::ConfigError> for DriveError {
    fn from(e: drivefs_config::ConfigError) -> Self {
        DriveError::Config(e.to_string())
    }
}

impl From<serde_json::Error> for DriveError {
    fn from(e: serde_json::Error) -> Self {
        DriveError::Other(format!("Malformed response: {}", e))
    }
}
