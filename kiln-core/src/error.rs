//! Error types for kiln.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error chains.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for kiln operations.
pub type Result<T> = std::result::Result<T, KilnError>;

/// Main error type for kiln.
#[derive(Error, Debug)]
pub enum KilnError {
    // Daemon connection errors
    #[error("missing {runtime} connection info")]
    NoDaemonConnectInfo { runtime: String },

    #[error("{runtime} connection failed: {reason}")]
    DaemonConnectFailed { runtime: String, reason: String },

    // Selection errors
    #[error("unsupported build engine: {engine}")]
    UnsupportedEngine { engine: String },

    #[error("unsupported output format: {value} (expected 'text', 'json' or 'subscription')")]
    UnsupportedOutputFormat { value: String },

    #[error("unsupported runtime load target: {runtime}")]
    UnsupportedRuntime { runtime: String },

    #[error("unsupported build architecture: {arch}")]
    UnsupportedArchitecture { arch: String },

    // Engine configuration errors
    #[error("engine {engine} requires {requirement}")]
    MissingEngineRequirement { engine: String, requirement: String },

    // Delegated operation errors
    #[error("build failed ({engine}): {reason}")]
    BuildFailed { engine: String, reason: String },

    #[error("image load failed ({runtime}): {reason}")]
    LoadFailed { runtime: String, reason: String },

    #[error("registry auth configuration failed: {reason}")]
    RegistryAuth { reason: String },

    #[error("registry push failed for {image}: {reason}")]
    RegistryPush { image: String, reason: String },

    #[error("registry save failed for {image}: {reason}")]
    RegistrySave { image: String, reason: String },

    #[error("invalid image reference {reference}: {reason}")]
    InvalidReference { reference: String, reason: String },

    #[error("invalid image archive {path:?}: {reason}")]
    InvalidArchive { path: PathBuf, reason: String },

    // Subprocess errors
    #[error("failed to run {program}: {reason}")]
    Subprocess { program: String, reason: String },

    // IO errors with path context
    #[error("failed to read {path:?}: {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {path:?}: {source}")]
    FileWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl KilnError {
    /// True for the distinguished "no daemon connection info" condition,
    /// which gets its own exit code and remediation message instead of the
    /// generic failure path.
    pub fn is_no_connect_info(&self) -> bool {
        matches!(self, KilnError::NoDaemonConnectInfo { .. })
    }
}
