//! Error types for direct-path connections.
//!
//! - Dial errors never reach the caller of [`dial_direct`](crate::conn::direct::dial_direct);
//!   they are logged and the absence of a delivered connection is the signal.
//! - Connection errors travel inside [`IoResult`](crate::conn::IoResult).

use std::io;

use thiserror::Error;

/// Failure of a single read or write on an established connection.
#[derive(Debug, Error)]
pub enum ConnError {
    /// First read returned a forged payload.
    #[error("response is hijacked")]
    ResponseHijacked,

    /// Follow-up read returned a forged payload.
    #[error("content hijacked")]
    ContentHijacked,

    /// Peer closed the stream cleanly.
    #[error("EOF")]
    Eof,

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ConnError {
    pub fn is_eof(&self) -> bool {
        matches!(self, ConnError::Eof)
    }

    /// True for payload-level forgery detected by a read classifier.
    pub fn is_hijack(&self) -> bool {
        matches!(self, ConnError::ResponseHijacked | ConnError::ContentHijacked)
    }
}

/// Failure to produce a usable direct connection.
#[derive(Debug, Error)]
pub enum DialError {
    #[error("unsupported network '{0}'")]
    UnsupportedNetwork(String),

    #[error("no {network} address found for '{addr}'")]
    NoAddress { network: String, addr: String },

    #[error("dial timed out")]
    Timeout,

    /// Connected, but the peer is a known forged resolution target.
    #[error("dns hijacked")]
    DnsPoisoned,

    #[error("tampering suspected: {0}")]
    TamperingSuspected(io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
