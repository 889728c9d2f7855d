//! Error types for the bridge daemon

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Bridge error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Config error: {0}")]
    Config(String),

    /// Malformed or truncated frame
    #[error("Invalid frame: {0}")]
    InvalidFrame(&'static str),

    /// Request is missing a token or carries a bad one
    #[error("Unauthorized")]
    Unauthorized,

    /// Auth was requested but no bridge token is configured
    #[error("Bridge token not configured")]
    TokenNotConfigured,

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}
