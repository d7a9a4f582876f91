//! Error types for the client registry.

use std::time::Duration;

use thiserror::Error;

use crate::setting::ConnectionMode;

/// Result type alias for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors returned to callers of [`Registry`](crate::Registry).
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The settings source could not be opened; retried on the next call.
    #[error("settings source unavailable: {0}")]
    ConfigUnavailable(#[source] SourceError),

    /// The settings document is corrupt. Not retried: every later call
    /// fails the same way without reopening the source.
    #[error("invalid settings: {0}")]
    InvalidConfig(#[source] SourceError),

    #[error("invalid setting for '{key}': {source}")]
    UnknownKey {
        key: String,
        #[source]
        source: SourceError,
    },

    /// `get` was called for a cluster router.
    #[error("'{key}' is a {mode} router; use get_cluster")]
    UnsupportedMode { key: String, mode: ConnectionMode },

    /// `get_cluster` was called for a non-cluster router.
    #[error("'{key}' is a {mode} router, not cluster")]
    WrongMode { key: String, mode: ConnectionMode },

    #[error("client for '{key}' can't be created, url: {addr}: {reason}")]
    ClientCreationFailed {
        key: String,
        addr: String,
        #[source]
        reason: FactoryError,
    },

    #[error("registry is shutting down")]
    ShuttingDown,
}

/// Errors from a [`SettingSource`](crate::source::SettingSource).
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to read settings: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse settings: {0}")]
    Parse(String),

    #[error("no setting named '{0}'")]
    NotFound(String),

    #[error("setting '{key}' does not decode: {reason}")]
    Decode { key: String, reason: String },

    /// A `Type` outside master/slaver/cluster. Fatal at load time.
    #[error("setting '{key}' has unsupported type '{mode}'")]
    UnsupportedMode { key: String, mode: String },
}

/// Errors from a [`ClientFactory`](crate::factory::ClientFactory).
#[derive(Debug, Error)]
pub enum FactoryError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("connectivity probe failed: {0}")]
    Probe(String),

    #[error("client creation timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0} is not implemented")]
    Unimplemented(&'static str),
}

/// Errors from a live client handle.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("client is closed")]
    Closed,

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("command failed: {0}")]
    Command(String),
}
