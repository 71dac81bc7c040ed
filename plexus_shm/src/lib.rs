//! Plexus Shared-Memory Communication Domain
//!
//! Gives N cooperating processes, named by rank `0..N-1`, ordered
//! byte-pipe communication with one ring-buffered mailbox per
//! recipient, an all-participant barrier, and a creator-initiated
//! terminating shutdown that wakes every blocked participant.
//!
//! Everything lives in one file-backed shared mapping: a header with
//! the barrier state, N stride-aligned mailboxes, and optional extra
//! space. Synchronization is built on process-shared, robust POSIX
//! mutexes ([`SharedMutex`]) and process-shared condition variables
//! ([`SharedCond`]); nothing inside the shared region stores raw
//! addresses, so every participant may map it wherever the kernel
//! chooses.
//!
//! ## Guarantees
//!
//! - A single [`SharedDomain::write`] is atomic: its bytes reach the
//!   recipient as one contiguous range, never interleaved with other
//!   senders, even across multiple ring wraps.
//! - Writes from one sender to one recipient arrive in order. No
//!   ordering holds between distinct senders.
//! - After [`SharedDomain::shutdown`], every blocked or subsequent
//!   `write`/`read`/`barrier` fails within bounded time.
//!
//! ## Launching worker fleets
//!
//! The [`rts`] module sets up a domain, forks and execs N workers with
//! their rank and the backing file passed through the environment
//! ([`env`]), and propagates their exit status; the `smrun` binary is
//! a thin CLI over it.

pub mod cond;
pub mod domain;
pub mod env;
pub mod error;
pub mod mutex;
pub mod rts;

pub use cond::SharedCond;
pub use domain::SharedDomain;
pub use error::{DomainError, LaunchError};
pub use mutex::{SharedMutex, SharedMutexGuard};
