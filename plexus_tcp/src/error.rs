//! Error type for the TCP multiplexor and the framed session layer.

use plexus::endpoint::EndpointError;
use thiserror::Error;

/// Errors that abort service setup or the event loop.
///
/// Peer-originated conditions (EOF, reset) are not errors; they turn
/// into link state and a regular close callback.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Endpoint resolution or binding failed.
    #[error(transparent)]
    Endpoint(#[from] EndpointError),

    /// The request pattern did not compile.
    #[error("invalid request pattern: {source}")]
    Pattern {
        /// Compiler diagnostics.
        source: regex::Error,
    },

    /// The central poll call failed.
    #[error("poll failed: {source}")]
    Poll {
        /// Underlying errno.
        source: nix::errno::Errno,
    },

    /// The SIGPIPE disposition could not be adjusted.
    #[error("cannot adjust SIGPIPE disposition: {source}")]
    Signal {
        /// Underlying errno.
        source: nix::errno::Errno,
    },
}
