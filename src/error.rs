//! Error taxonomy shared by every layer of the crate.
//!
//! Errors fall into four families:
//!
//! - **Configuration** (`Config`, `Unsupported`): rejected before any socket I/O.
//! - **Weak network** (`WeakNetwork`): a bounded transfer could not complete.
//!   The connection is degraded; the caller decides whether to reconnect.
//! - **I/O failure** (`Io`, `Ended`): fatal to the endpoint that raised it.
//! - **Negotiation** (`Negotiation`, `Tls`): fatal to the TLS handshake.

use std::io;

/// Result alias used throughout the crate.
pub type Result<T, E = NioError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum NioError {
    /// Missing context, unresolvable address or an invalid setting.
    #[error("configuration error: {0}")]
    Config(String),

    /// A bounded read or a stalled write could not move the requested bytes.
    #[error("network is too weak: {op} moved {transferred} of {expected} bytes")]
    WeakNetwork {
        op: &'static str,
        transferred: usize,
        expected: usize,
    },

    /// The endpoint failed or was closed earlier; no further I/O is attempted.
    #[error("endpoint has ended")]
    Ended,

    #[error(transparent)]
    Io(#[from] io::Error),

    /// No acceptable application protocol for a side that requires one.
    #[error("application protocol negotiation failed: {0}")]
    Negotiation(String),

    /// A capability required at configuration time is missing from the runtime.
    #[error("{0} is not supported by this runtime")]
    Unsupported(String),

    /// The context or selector loop is not running.
    #[error("{0} is not running")]
    NotRunning(&'static str),

    #[cfg(feature = "tls")]
    #[error(transparent)]
    Tls(#[from] rustls::Error),
}

impl NioError {
    pub fn config(msg: impl Into<String>) -> Self {
        NioError::Config(msg.into())
    }

    /// `true` when the error is a non-blocking "try again" rather than a failure.
    pub fn is_would_block(&self) -> bool {
        matches!(self, NioError::Io(e) if e.kind() == io::ErrorKind::WouldBlock)
    }
}
