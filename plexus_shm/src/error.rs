//! Error types for the shared-memory communication domain.

use thiserror::Error;

/// Errors from domain setup, connection and communication.
///
/// A failed operation leaves the shared state valid for the other
/// participants.
#[derive(Debug, Error)]
pub enum DomainError {
    /// A size or count parameter was unusable.
    #[error("invalid domain configuration: {reason}")]
    InvalidConfig {
        /// What was wrong.
        reason: &'static str,
    },

    /// The rank does not exist in this domain.
    #[error("rank {rank} out of range (domain has {nofprocesses} participants)")]
    RankOutOfRange {
        /// Offending rank.
        rank: u32,
        /// Participant count of the domain.
        nofprocesses: u32,
    },

    /// The backing file does not carry an initialized domain.
    #[error("backing file is not an initialized domain")]
    Uninitialized,

    /// The domain is shutting down; blocked and subsequent calls fail.
    #[error("domain is terminating")]
    Terminating,

    /// The operation is reserved for the domain's creator.
    #[error("operation reserved for the domain creator")]
    NotCreator,

    /// A pthread synchronization call failed.
    #[error("{op} failed: {source}")]
    Sync {
        /// The failing primitive operation.
        op: &'static str,
        /// Error code as errno.
        source: nix::errno::Errno,
    },

    /// A file or mapping system call failed.
    #[error("I/O error: {source}")]
    Io {
        /// Underlying error.
        #[from]
        source: std::io::Error,
    },

    /// A nix-level system call failed.
    #[error("{op} failed: {source}")]
    Os {
        /// The failing operation.
        op: &'static str,
        /// Underlying errno.
        source: nix::errno::Errno,
    },
}

/// Errors from the launcher runtime and environment bootstrap.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// A required environment variable is absent.
    #[error("environment variable {var} is not set")]
    MissingEnv {
        /// Variable name.
        var: String,
    },

    /// An environment variable carries an unusable value.
    #[error("environment variable {var} is malformed")]
    InvalidEnv {
        /// Variable name.
        var: String,
    },

    /// The worker command contains an interior NUL byte.
    #[error("worker command is not a valid program path")]
    InvalidCommand,

    /// Domain setup or connection failed.
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// A process-control system call failed.
    #[error("{op} failed: {source}")]
    Os {
        /// The failing operation.
        op: &'static str,
        /// Underlying errno.
        source: nix::errno::Errno,
    },

    /// At least one worker exited abnormally; the process group was
    /// terminated.
    #[error("a worker aborted or exited with a non-zero status")]
    WorkerFailure,
}
