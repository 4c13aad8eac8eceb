use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum SupError {
    /// A spec or config file is not valid TOML (or the wrong shape).
    #[error("failed to parse {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    /// A spec file parsed but a required field is missing or invalid.
    #[error("invalid service spec {path}: {reason}")]
    Validation { path: PathBuf, reason: String },

    /// Missing or mismatched bearer token.
    #[error("authentication required")]
    Auth,

    /// A peer did not answer before the probe deadline.
    #[error("peer {addr} did not respond within {timeout:?}")]
    NetworkTimeout { addr: String, timeout: Duration },

    /// A rumor was not newer than what is already stored.
    #[error("stale rumor for {id}: stored incarnation {stored}, offered {offered}")]
    IncarnationConflict { id: String, stored: u64, offered: u64 },

    /// The peer could not be reached or hung up.
    #[error("network error talking to {addr}: {reason}")]
    Network { addr: String, reason: String },

    /// A gossip frame could not be decoded or was rejected.
    #[error("bad gossip frame: {0}")]
    Codec(String),

    /// The supervisor configuration is unusable.
    #[error("configuration error: {0}")]
    Config(String),

    /// An external command (e.g. `systemctl`) failed.
    #[error("{command} failed: {reason}")]
    Command { command: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SupError {
    /// Short stable label for logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            SupError::Parse { .. } => "parse_error",
            SupError::Validation { .. } => "validation_error",
            SupError::Auth => "auth_error",
            SupError::NetworkTimeout { .. } => "network_timeout",
            SupError::IncarnationConflict { .. } => "incarnation_conflict",
            SupError::Network { .. } => "network_error",
            SupError::Codec(_) => "codec_error",
            SupError::Config(_) => "config_error",
            SupError::Command { .. } => "command_error",
            SupError::Io(_) => "io_error",
        }
    }

    pub(crate) fn validation(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        SupError::Validation {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn parse(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        SupError::Parse {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}
