use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Engine error taxonomy. Only `Config` ever escapes startup; everything
/// else is absorbed by the connector loop as a 502 or a logged continuation.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed HTTP from either side of the proxy.
    #[error("malformed http message: {0}")]
    Parse(String),

    /// Connect/read/write failure on a socket.
    #[error(transparent)]
    Network(#[from] io::Error),

    /// TLS handshake or certificate failure.
    #[error("tls: {0}")]
    Tls(String),

    /// The upstream HTTP proxy refused or botched the CONNECT tunnel.
    #[error("upstream proxy: {0}")]
    UpstreamProxy(String),

    /// Startup-time misconfiguration (CA material, listen address, interfaces).
    #[error("{0}")]
    Config(String),
}

impl Error {
    /// Whether a second attempt against a freshly dialed upstream makes sense.
    /// Handshake and tunnel refusals are deterministic and not worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Parse(_))
    }
}
