//! Network error types

use std::io;

/// Network result type
pub type Result<T> = std::result::Result<T, Error>;

/// Network errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("connect to {host}:{port} failed: {source}")]
    Connect {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("TLS handshake failed: {0}")]
    Tls(io::Error),

    #[error("not connected")]
    NotConnected,

    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("already listening")]
    AlreadyListening,
}
