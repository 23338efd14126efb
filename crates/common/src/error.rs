use thiserror::Error;

/// Unified error type for Cellar crates.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Authentication failed: {0}")]
    Auth(String),
    #[error("Session expired")]
    SessionExpired,
    #[error("Network error: {0}")]
    Network(String),
    #[error("Request timed out: {0}")]
    Timeout(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Remote error: {0}")]
    Remote(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Configuration problems, detected before any request is sent.
///
/// `InvalidType` is a value of the wrong kind (a string where a number was
/// expected, a list where an object was expected); `InvalidValue` is a value of
/// the right kind with the wrong shape or range.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid type for {param}: expected {expected}")]
    InvalidType { param: String, expected: String },
    #[error("invalid value for {param}: {reason}")]
    InvalidValue { param: String, reason: String },
    #[error("missing configuration: {0}")]
    Missing(String),
    #[error("The parameters are mutually exclusive: {}", .0.join(", "))]
    Conflict(Vec<String>),
}

impl ConfigError {
    pub fn invalid_type(param: &str, expected: &str) -> Self {
        ConfigError::InvalidType { param: param.to_string(), expected: expected.to_string() }
    }

    pub fn invalid_value(param: &str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue { param: param.to_string(), reason: reason.into() }
    }
}

impl Error {
    /// Network and timeout failures are worth retrying; nothing else is.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Timeout(_))
    }

    /// Errors that must stop the connector instance rather than being folded
    /// into a per-record failure.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Config(_) | Error::Auth(_) | Error::SessionExpired | Error::Remote(_) | Error::Io(_)
        )
    }

    /// Failures confined to the row a request touched. Inside a batch they
    /// become `success=false` results and the remaining rows still run.
    pub fn is_row_level(&self) -> bool {
        matches!(self, Error::NotFound(_) | Error::Network(_) | Error::Timeout(_) | Error::Remote(_))
    }

    pub fn config(err: ConfigError) -> Self {
        Error::Config(err)
    }
}
