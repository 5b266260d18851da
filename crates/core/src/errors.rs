use rehost_storage::StoreError;
use rehost_types::{Identifier, IdentifierError};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RehostError {
    #[error("Invalid key: {0}")]
    InvalidIdentifier(#[from] IdentifierError),

    #[error("could not read {}: {source}", path.display())]
    ConfigUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid declared state in {}: {reason}", path.display())]
    ConfigMalformed { path: PathBuf, reason: String },

    #[error("failed to add {key}: {source}")]
    AddFailed {
        key: Identifier,
        #[source]
        source: StoreError,
    },

    #[error("failed to remove {key}: {source}")]
    RemoveFailed {
        key: Identifier,
        #[source]
        source: StoreError,
    },

    #[error("no first block for {key} after {attempts} attempts")]
    LinkTimeout { key: Identifier, attempts: u32 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RehostError {
    /// Errors caused by the caller's input rather than the store.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            RehostError::InvalidIdentifier(_)
                | RehostError::ConfigUnreadable { .. }
                | RehostError::ConfigMalformed { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, RehostError>;
