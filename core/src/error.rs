use std::path::PathBuf;

use thiserror::Error;

/// Cont daemon error types
#[derive(Error, Debug)]
pub enum ContError {
    /// Image reference could not be resolved to a descriptor
    #[error("Resolution error: {reference} - {message}")]
    ResolutionError { reference: String, message: String },

    /// Credential lookup or registry authentication failed
    #[error("Authentication error: {registry} - {message}")]
    AuthError { registry: String, message: String },

    /// Blob or manifest transfer failed after retries
    #[error("Fetch error: {target} - {message}")]
    FetchError { target: String, message: String },

    /// Content did not hash to the expected digest
    #[error("Integrity error: expected {expected}, got {actual}")]
    IntegrityError { expected: String, actual: String },

    /// Manifest bytes are structurally invalid
    #[error("Manifest parse error: {0}")]
    ManifestParseError(String),

    /// Content store miss
    #[error("Not found: {0}")]
    NotFoundError(String),

    /// Control-plane line that does not match the command grammar
    #[error("Malformed command: {0}")]
    MalformedCommand(String),

    /// Control endpoint could not be bound or prepared
    #[error("Listen error: {} - {message}", path.display())]
    ListenError { path: PathBuf, message: String },

    /// Image reference string is syntactically invalid
    #[error("Invalid reference: {0}")]
    InvalidReference(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl ContError {
    /// Short, stable name of the error kind.
    ///
    /// Used as the prefix of protocol error lines and as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            ContError::ResolutionError { .. } => "resolution",
            ContError::AuthError { .. } => "auth",
            ContError::FetchError { .. } => "fetch",
            ContError::IntegrityError { .. } => "integrity",
            ContError::ManifestParseError(_) => "manifest",
            ContError::NotFoundError(_) => "not-found",
            ContError::MalformedCommand(_) => "malformed",
            ContError::ListenError { .. } => "listen",
            ContError::InvalidReference(_) => "reference",
            ContError::ConfigError(_) => "config",
            ContError::IoError(_) => "io",
            ContError::SerializationError(_) => "serialization",
            ContError::Other(_) => "other",
        }
    }
}

impl From<serde_json::Error> for ContError {
    fn from(err: serde_json::Error) -> Self {
        ContError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for ContError {
    fn from(err: serde_yaml::Error) -> Self {
        ContError::SerializationError(err.to_string())
    }
}

/// Result type alias for Cont operations
pub type Result<T> = std::result::Result<T, ContError>;
