//! Error taxonomy.
//!
//! Configuration and validation errors abort startup; resource and wire
//! errors are counted and survived at runtime. Lifecycle violations are not
//! errors but bugs and panic at the call site.

use thiserror::Error;

/// Failure while encoding or decoding samples on the wire.
#[derive(Debug, Error)]
pub enum WireError {
    /// A decoded token does not match the declared signal type.
    #[error("value type mismatch for signal '{signal}': expected {expected}, got '{token}'")]
    InvalidValueType {
        signal: String,
        expected: &'static str,
        token: String,
    },

    /// Header carried an unknown protocol version.
    #[error("unsupported message version {0}")]
    BadVersion(u8),

    /// The byte stream violates the format's framing rules.
    #[error("malformed payload: {0}")]
    Malformed(String),

    /// The format cannot represent this signal type at the configured width.
    #[error("unsupported encoding: {0}")]
    Unsupported(String),
}

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed configuration document.
    #[error("config error: {0}")]
    Config(String),

    /// Logically inconsistent configuration (unknown node, signal mismatch).
    #[error("validation error: {0}")]
    Validation(String),

    /// Exhausted pool, full queue or failed syscall.
    #[error("resource error: {0}")]
    Resource(String),

    #[error("wire error: {0}")]
    Wire(#[from] WireError),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn resource(msg: impl Into<String>) -> Self {
        Error::Resource(msg.into())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Resource(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
