//! Error type for the UDP session server.

use plexus::endpoint::EndpointError;
use thiserror::Error;

/// Errors that abort service setup or the event loop.
///
/// Per-link failures (send errors, retry exhaustion) are link state
/// and end in a regular close callback instead.
#[derive(Debug, Error)]
pub enum UdpError {
    /// Endpoint resolution or binding failed.
    #[error(transparent)]
    Endpoint(#[from] EndpointError),

    /// The retransmission timeout is zero or out of range.
    #[error("retransmission timeout must be positive and fit poll(2)")]
    InvalidTimeout,

    /// The central poll call failed.
    #[error("poll failed: {source}")]
    Poll {
        /// Underlying errno.
        source: nix::errno::Errno,
    },
}
