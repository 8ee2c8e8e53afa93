use thiserror::Error;

use crate::core::message::LogError;
use crate::core::store::StoreError;

/// Failure classes surfaced by the broker core.
///
/// Most core operations report these as `false` / `None` to callers; the enum
/// exists for the paths that propagate (startup, storage) and for logging.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("message log failure: {0}")]
    Storage(#[from] LogError),

    #[error("metadata table failure: {0}")]
    Schema(#[from] StoreError),

    #[error("malformed {kind}: '{value}'")]
    Malformed { kind: &'static str, value: String },
}

impl BrokerError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        BrokerError::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn malformed(kind: &'static str, value: impl Into<String>) -> Self {
        BrokerError::Malformed {
            kind,
            value: value.into(),
        }
    }
}
