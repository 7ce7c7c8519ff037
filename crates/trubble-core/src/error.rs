//! Error types for the Trubble agent

use thiserror::Error;

/// Result type alias using the Trubble Error
pub type Result<T> = std::result::Result<T, Error>;

/// Trubble error types
#[derive(Error, Debug)]
pub enum Error {
    // === Configuration Errors ===
    /// Malformed topfile, control document or agent configuration
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Missing required configuration: {key}")]
    MissingConfig { key: String },

    // === Profile Errors ===
    #[error("Invalid profile {profile}: {message}")]
    ProfileFormat { profile: String, message: String },

    #[error("Profile not found: {path}")]
    ProfileNotFound { path: String },

    // === Check Errors ===
    #[error("Check {check} failed to execute: {message}")]
    Execution { check: String, message: String },

    #[error("No probe registered for trigger type: {kind}")]
    UnknownProbe { kind: String },

    #[error("Probe {kind} failed: {message}")]
    Probe { kind: String, message: String },

    // === Delivery Errors ===
    #[error("Transport error: {0}")]
    Transport(String),

    // === Scheduling Errors ===
    #[error("Job {job} failed: {message}")]
    Job { job: String, message: String },

    // === IO Errors ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // === Serialization Errors ===
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(message.into())
    }

    /// Shorthand for a profile format error
    pub fn profile_format(profile: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ProfileFormat {
            profile: profile.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a probe error
    pub fn probe(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Probe {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Check if this error is fatal (should abort the audit run)
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Config(_) | Error::MissingConfig { .. })
    }

    /// Get an error code for logging and report entries
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "CONFIG_ERROR",
            Error::MissingConfig { .. } => "MISSING_CONFIG",
            Error::ProfileFormat { .. } => "PROFILE_FORMAT",
            Error::ProfileNotFound { .. } => "PROFILE_NOT_FOUND",
            Error::Execution { .. } => "EXECUTION_ERROR",
            Error::UnknownProbe { .. } => "UNKNOWN_PROBE",
            Error::Probe { .. } => "PROBE_FAILED",
            Error::Transport(_) => "TRANSPORT_ERROR",
            Error::Job { .. } => "JOB_FAILED",
            Error::Io(_) => "IO_ERROR",
            Error::Json(_) => "JSON_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
        }
    }
}
