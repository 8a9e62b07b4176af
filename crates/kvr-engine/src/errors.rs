//! ---
//! kvr_section: "08-reconciliation-engine"
//! kvr_subsection: "module"
//! kvr_type: "source"
//! kvr_scope: "code"
//! kvr_description: "Live-state collection, diffing and application of vault access policies."
//! kvr_version: "v0.0.0-prealpha"
//! kvr_owner: "tbd"
//! ---
use kvr_security::{AuthorizationError, PermissionError, ProviderError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Fatal errors. Per-operation apply failures are recorded, not raised.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error(transparent)]
    Authorization(#[from] AuthorizationError),
    #[error("vault {vault}, principal '{principal}': {source}")]
    UnknownPermissionToken {
        vault: String,
        principal: String,
        source: PermissionError,
    },
    #[error("plan contains {count} changes, above the configured maximum of {max}; nothing was applied")]
    ChangeVolumeExceeded { count: usize, max: usize },
    #[error("vault {vault} would be left with {remaining} principal(s), below the minimum of {minimum}; nothing was applied")]
    MinimumPrincipalFloor {
        vault: String,
        remaining: usize,
        minimum: usize,
    },
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("audit log error: {0:#}")]
    Audit(anyhow::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    SerializationFailed(#[from] serde_json::Error),
    #[error("yaml serialization error: {0}")]
    YamlSerializationFailed(#[from] serde_yaml::Error),
}
