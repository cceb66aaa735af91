//! Error kinds shared across the messaging daemon core.
//!
//! Each variant corresponds to one of the error kinds in the propagation
//! policy: transient network faults retry locally, storage/normalization
//! faults hold back the watermark, auth faults require a human.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting: {0}")]
    Missing(String),
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: String, reason: String },
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database connection failed: {0}")]
    Connection(#[from] rusqlite::Error),
    #[error("write could not be durably committed: {0}")]
    WriteFailed(String),
    #[error("record not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Error)]
pub enum NormalizationError {
    #[error("could not materialize account for ({platform}, {handle})")]
    AccountUnresolved { platform: String, handle: String },
    #[error("could not materialize thread: {0}")]
    ThreadUnresolved(String),
    #[error("storage failure during normalization: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("malformed request line: {0}")]
    MalformedFrame(String),
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("unknown platform: {0}")]
    UnknownPlatform(String),
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("platform {platform} rejected credentials: {reason}")]
    Rejected { platform: String, reason: String },
}

#[derive(Debug, Error)]
pub enum TransientNetworkError {
    #[error("timeout talking to {platform}")]
    Timeout { platform: String },
    #[error("connection to {platform} dropped: {reason}")]
    Disconnected { platform: String, reason: String },
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unparsable payload from {platform}: {reason}")]
    Unparsable { platform: String, reason: String },
}

#[derive(Debug, Error)]
#[error("fatal invariant violation: {0}")]
pub struct FatalError(pub String);
