//! pgkeeper Error Types

use thiserror::Error;

/// Result type alias for pgkeeper operations
pub type Result<T> = std::result::Result<T, Error>;

/// Message carried by [`Error::MalformedSyncStandbyList`] for an unclosed quorum list
pub const MISSING_BRACKET_MSG: &str = "synchronous standby string has number but lacks brackets";

/// pgkeeper error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Cluster data errors
    #[error("Invalid cluster data: {0}")]
    ClusterData(#[from] serde_json::Error),

    #[error("db {db} follows unknown db {target}")]
    DanglingFollow { db: String, target: String },

    #[error("db stored under key {key} has uid {uid}")]
    InconsistentUid { key: String, uid: String },

    #[error("No db assigned to keeper {0}")]
    DbNotFound(String),

    #[error("Db {0} not found in cluster data")]
    UnknownDb(String),

    // Synchronous replication errors
    #[error("{0}")]
    MalformedSyncStandbyList(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Unclosed `N (` synchronous standby list
    pub fn missing_bracket() -> Self {
        Error::MalformedSyncStandbyList(MISSING_BRACKET_MSG.to_string())
    }

    /// Check if this error was caused by malformed input data rather than the environment
    pub fn is_malformed_input(&self) -> bool {
        matches!(
            self,
            Error::MalformedSyncStandbyList(_)
                | Error::ClusterData(_)
                | Error::DanglingFollow { .. }
                | Error::InconsistentUid { .. }
        )
    }
}
