//! Plexus TCP Session Multiplexor
//!
//! This crate hosts many concurrent stream sessions in one process
//! without threads. It has two layers:
//!
//! - [`mpx`] - the raw event loop: one `poll(2)` call per iteration
//!   drives accepting, reading and non-blocking buffered writing over
//!   any number of connections, dispatching to a [`mpx::LinkHandler`].
//! - [`service`] - a request-framing layer on top: a regular expression
//!   is matched, anchored and multi-line, against each session's
//!   accumulated input, and the [`service::Service`] request callback
//!   runs exactly once per complete match.
//!
//! Both layers are strictly single-threaded cooperative: every callback
//! observes the multiplexor in a stable state and may synchronously
//! read, enqueue output, or close its own link.

pub mod error;
pub mod mpx;
pub mod service;

pub use error::ServiceError;
pub use mpx::{Link, LinkHandler};
pub use service::{run_on, run_service, Service, Session};
