use std::path::PathBuf;

use thiserror::Error;

/// Failures of the credential lifecycle.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// A required environment variable is absent. Fatal at startup.
    #[error("missing required environment variable {0}")]
    MissingConfig(&'static str),

    /// The token endpoint could not be reached or returned something unusable.
    #[error("IAM token refresh failed: {reason}")]
    RefreshFailed { reason: String },

    /// The persisted credential exists but cannot be read back. Fatal at startup.
    #[error("persisted credential at {} is corrupt: {reason}", .path.display())]
    PersistedStateCorrupt { path: PathBuf, reason: String },
}

impl CredentialError {
    pub fn refresh_failed(reason: impl std::fmt::Display) -> Self {
        Self::RefreshFailed {
            reason: reason.to_string(),
        }
    }
}
