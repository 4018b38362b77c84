//! Error types for sift-proxy
//!
//! Every session failure collapses into one of these kinds; the listener
//! logs the error and keeps serving other sessions. `CryptoLoad` is the
//! exception: it happens at startup and is fatal to the listener.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("unresolved request: first request carried neither method nor path")]
    UnresolvedRequest,

    #[error("http parsing failed: {0}")]
    Parse(String),

    #[error("tls handshake failed: {0}")]
    TlsHandshake(String),

    #[error("illegal certificate: {0}")]
    IllegalCertificate(String),

    #[error("server context creation failed: {0}")]
    Context(String),

    #[error("ca material could not be loaded: {0}")]
    CryptoLoad(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProxyError>;
