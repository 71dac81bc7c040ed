//! Plexus UDP Session Server
//!
//! Emulates session-ful communication over UDP: a session begins with
//! the first datagram arriving at the listening socket; from then on
//! the server talks to that peer through a freshly created socket
//! connected to the peer, so the kernel-assigned local port identifies
//! the session, exactly as the TFTP protocol does (RFC 1350).
//!
//! Every outbound datagram carries a retry budget: if no inbound
//! traffic acknowledges it within the configured timeout it is
//! retransmitted, up to `max_retries` transmissions, after which the
//! link is closed. When several datagrams are queued back to back,
//! only the most recently enqueued one is retained for retransmission.
//!
//! The event loop is single-threaded cooperative with the same
//! discipline as the TCP multiplexor; elapsed poll cycles, not wall
//! clock deadlines, drive retransmission.

pub mod error;
pub mod mpx;

pub use error::UdpError;
pub use mpx::{run, run_on, UdpLink, UdpService};
