//! Core error types for apneaflow-core.
//!
//! Nothing in the session controller returns these across its boundary:
//! audio, reporting and persistence failures are absorbed and logged. The
//! types exist for the collaborators (config loading, storage, HTTP) whose
//! callers decide how loudly to fail.

use std::path::PathBuf;
use thiserror::Error;

/// Core error type for apneaflow-core.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Session configuration rejected at construction
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Audio collaborator errors
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    /// Metrics delivery errors
    #[error("Reporter error: {0}")]
    Reporter(#[from] ReporterError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Database-specific errors.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// Failed to open database connection
    #[error("Failed to open database at {path}: {source}")]
    OpenFailed {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    /// Query execution failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Stored value could not be decoded
    #[error("Corrupt value under '{key}': {message}")]
    Corrupt { key: String, message: String },

    /// Database is locked
    #[error("Database is locked")]
    Locked,
}

/// Configuration-specific errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to load configuration
    #[error("Failed to load configuration from {path}: {message}")]
    LoadFailed { path: PathBuf, message: String },

    /// Failed to save configuration
    #[error("Failed to save configuration to {path}: {message}")]
    SaveFailed { path: PathBuf, message: String },

    /// Unknown dot-path key
    #[error("unknown config key: {0}")]
    UnknownKey(String),

    /// Invalid configuration value
    #[error("Invalid configuration value for '{key}': {message}")]
    InvalidValue { key: String, message: String },

    /// Data directory could not be resolved or created
    #[error("Data directory unavailable: {0}")]
    DataDir(String),
}

/// Session configuration invariant violations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// A duration is zero, negative or not a number
    #[error("'{field}' must be a finite number of seconds greater than zero (got {value})")]
    InvalidDuration { field: &'static str, value: f64 },

    /// A count is below its minimum
    #[error("'{field}' must be at least 1")]
    ZeroCount { field: &'static str },

    /// A volume is outside 0..=1
    #[error("'{field}' must be within 0.0..=1.0 (got {value})")]
    VolumeOutOfRange { field: &'static str, value: f32 },
}

/// Audio collaborator errors. Always non-fatal for the session.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AudioError {
    /// Playback rejected by the backend (e.g. no user gesture yet)
    #[error("Playback rejected for {track}: {reason}")]
    PlaybackRejected { track: String, reason: String },

    /// Track has no loaded source
    #[error("No source loaded for {0}")]
    NoSource(String),

    /// Source could not be resolved to a playable URL
    #[error("Source '{slug}' unavailable: {message}")]
    Unavailable { slug: String, message: String },
}

/// Metrics reporter errors. Logged by the runner, never surfaced.
#[derive(Error, Debug)]
pub enum ReporterError {
    /// Transport failure
    #[error("Request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// Remote rejected the payload
    #[error("Remote responded with status {status}")]
    Rejected { status: u16 },

    /// Endpoint URL could not be built
    #[error("Invalid endpoint: {0}")]
    Endpoint(#[from] url::ParseError),
}

impl From<rusqlite::Error> for DatabaseError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(inner, _msg) => {
                if inner.code == rusqlite::ErrorCode::DatabaseLocked {
                    DatabaseError::Locked
                } else {
                    DatabaseError::QueryFailed(err.to_string())
                }
            }
            _ => DatabaseError::QueryFailed(err.to_string()),
        }
    }
}

/// Result type alias for CoreError
pub type Result<T, E = CoreError> = std::result::Result<T, E>;
