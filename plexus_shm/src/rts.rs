//! Launcher runtime for shared-domain worker fleets.
//!
//! One master process creates the communication domain, starts the N
//! worker processes, and tears everything down once they are gone:
//!
//! - [`run_workers`] forks and execs N copies of a worker command, one
//!   per rank, all in one process group, each with the domain
//!   parameters stamped into its environment. It blocks until every
//!   worker has been reaped. If any worker exits non-zero or dies on a
//!   signal, the whole group receives SIGTERM and the launch reports
//!   failure.
//! - Workers call [`init`] at startup to join the domain under their
//!   assigned rank, and simply drop the handle when done.
//!
//! The launcher must be called from a single-threaded process: fork
//! is performed with the usual POSIX caveats.

use std::ffi::CString;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{execvp, fork, setpgid, ForkResult, Pid};
use tracing::{debug, warn};

use crate::domain::SharedDomain;
use crate::env::{self, DomainParams};
use crate::error::LaunchError;

/// Environment prefix under which the launcher publishes the domain
/// parameters.
pub const ENV_PREFIX: &str = "PLEXUS_DOMAIN";

fn os(op: &'static str) -> impl FnOnce(Errno) -> LaunchError {
    move |source| LaunchError::Os { op, source }
}

/// Create a domain and run `nofprocesses` workers against it.
///
/// `program` is resolved through `PATH`; `args` are its arguments
/// (without the leading program name). Returns once every worker has
/// exited; any abnormal exit turns into [`LaunchError::WorkerFailure`]
/// after the remaining workers were sent SIGTERM.
pub fn run_workers(
    nofprocesses: u32,
    bufsize: usize,
    extra_size: usize,
    program: &str,
    args: &[String],
) -> Result<(), LaunchError> {
    if nofprocesses == 0 {
        return Ok(());
    }
    let domain = SharedDomain::setup(bufsize, nofprocesses, extra_size, None)?;
    let name = domain.path().to_path_buf();

    let prog = CString::new(program).map_err(|_| LaunchError::InvalidCommand)?;
    let mut argv: Vec<CString> = Vec::with_capacity(args.len() + 1);
    argv.push(prog.clone());
    for arg in args {
        argv.push(CString::new(arg.as_str()).map_err(|_| LaunchError::InvalidCommand)?);
    }

    let mut group: Option<Pid> = None;
    let mut spawned = 0u32;
    for rank in 0..nofprocesses {
        // SAFETY: single-threaded caller per module contract; the
        // child only stamps its environment and execs.
        match unsafe { fork() } {
            Err(source) => {
                if let Some(group) = group {
                    let _ = kill(Pid::from_raw(-group.as_raw()), Signal::SIGTERM);
                }
                return Err(os("fork")(source));
            }
            Ok(ForkResult::Child) => {
                env::store(
                    ENV_PREFIX,
                    &DomainParams {
                        name: name.clone(),
                        rank,
                    },
                );
                let _ = execvp(&prog, &argv);
                unsafe { libc::_exit(255) }
            }
            Ok(ForkResult::Parent { child }) => {
                // all workers share one process group led by the first
                let leader = group.unwrap_or(child);
                let _ = setpgid(child, leader);
                group = Some(leader);
                spawned += 1;
                debug!(rank, pid = child.as_raw(), "worker started");
            }
        }
    }

    let group = group.expect("at least one worker spawned");
    let group_target = Pid::from_raw(-group.as_raw());
    let mut left = spawned;
    let mut aborted = false;
    while left > 0 {
        match waitpid(group_target, None) {
            Ok(WaitStatus::Exited(pid, code)) => {
                left -= 1;
                if code != 0 {
                    warn!(pid = pid.as_raw(), code, "worker failed");
                    aborted = true;
                    if left > 0 {
                        let _ = kill(group_target, Signal::SIGTERM);
                    }
                }
            }
            Ok(WaitStatus::Signaled(pid, signal, _)) => {
                left -= 1;
                warn!(pid = pid.as_raw(), %signal, "worker killed");
                aborted = true;
                if left > 0 {
                    let _ = kill(group_target, Signal::SIGTERM);
                }
            }
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => break,
            Err(source) => return Err(os("waitpid")(source)),
        }
    }

    drop(domain);
    if aborted {
        Err(LaunchError::WorkerFailure)
    } else {
        Ok(())
    }
}

/// Join the domain a launcher prepared for this worker process.
pub fn init() -> Result<SharedDomain, LaunchError> {
    let params = env::load(ENV_PREFIX)?;
    Ok(SharedDomain::connect(params.name, params.rank)?)
}
