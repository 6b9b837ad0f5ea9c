//! # Error Handling
//!
//! Process-level error types for the gateplane control plane, built with `thiserror`.
//!
//! Object-level problems found while building the routing graph are not errors in
//! this sense: they become status outcomes (see [`crate::dag::status`]) and never
//! abort a build. [`Error`] is reserved for configuration, transport and
//! invariant failures that the caller has to act on.

/// Custom result type for gateplane operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the gateplane control plane
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Validation errors with an optional field path
    #[error("Validation error: {message}")]
    Validation { message: String, field: Option<String> },

    /// xDS protocol errors
    #[error("xDS protocol error: {0}")]
    Xds(String),

    /// Network transport errors (gRPC)
    #[error("Transport error: {0}")]
    Transport(String),

    /// A built graph broke one of its own invariants during translation
    #[error("Invariant violation: {0}")]
    Invariant(String),

    /// Manifest or parameter file could not be decoded
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON decoding errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config(message.into())
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation { message: message.into(), field: None }
    }

    /// Create a new validation error attributed to a field
    pub fn validation_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Validation { message: message.into(), field: Some(field.into()) }
    }

    /// Create a new xDS protocol error
    pub fn xds<S: Into<String>>(message: S) -> Self {
        Self::Xds(message.into())
    }

    /// Create a new transport error
    pub fn transport<S: Into<String>>(message: S) -> Self {
        Self::Transport(message.into())
    }

    /// Create a new invariant violation
    pub fn invariant<S: Into<String>>(message: S) -> Self {
        Self::Invariant(message.into())
    }

    /// Create a new internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal(message.into())
    }

    /// Whether the error means the published state can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Invariant(_) | Self::Internal(_))
    }
}

impl From<validator::ValidationErrors> for Error {
    fn from(errors: validator::ValidationErrors) -> Self {
        let field = errors.field_errors().keys().next().map(|k| k.to_string());
        Self::Validation { message: errors.to_string(), field }
    }
}

impl From<Error> for tonic::Status {
    fn from(error: Error) -> Self {
        match error {
            Error::Validation { .. } | Error::Xds(_) => tonic::Status::invalid_argument(error.to_string()),
            _ => tonic::Status::internal(error.to_string()),
        }
    }
}
