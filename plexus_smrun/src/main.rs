//! # smrun: shared-domain worker launcher
//!
//! Creates a shared communication domain, starts N copies of a worker
//! command against it, and propagates their exit status:
//!
//! ```text
//! smrun [-np N] [-bufsize BYTES] [-extra BYTES] [-config FILE] cmd [args…]
//! ```
//!
//! Each worker finds the domain through its environment (see
//! `plexus_shm::rts`). Any worker exiting non-zero or dying on a
//! signal terminates the whole fleet and makes smrun exit non-zero.

use std::path::Path;
use std::process::ExitCode;

use plexus::config::{ConfigLoader, LogLevel};
use serde::Deserialize;
use tracing::error;
use tracing_subscriber::EnvFilter;

/// Launcher defaults, optionally loaded from a TOML file.
#[derive(Debug, Clone, Deserialize)]
struct LauncherConfig {
    /// Logging verbosity.
    #[serde(default)]
    log_level: LogLevel,
    /// Number of worker processes.
    #[serde(default = "default_workers")]
    workers: u32,
    /// Mailbox ring capacity in bytes.
    #[serde(default = "default_bufsize")]
    bufsize: usize,
    /// Unstructured extra space in the shared mapping.
    #[serde(default)]
    extra_space: usize,
}

fn default_workers() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(2)
}

fn default_bufsize() -> usize {
    1024
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::default(),
            workers: default_workers(),
            bufsize: default_bufsize(),
            extra_space: 0,
        }
    }
}

fn usage(cmdname: &str) -> ExitCode {
    eprintln!(
        "Usage: {cmdname} [-np N] [-bufsize BYTES] [-extra BYTES] [-config FILE] cmd [args...]"
    );
    ExitCode::FAILURE
}

fn main() -> ExitCode {
    let mut args = std::env::args();
    let cmdname = args.next().unwrap_or_else(|| "smrun".to_string());
    let mut args: Vec<String> = args.collect();

    let mut config = LauncherConfig::default();

    // options first, then the worker command and its arguments
    let mut index = 0;
    while index < args.len() && args[index].starts_with('-') {
        let option = args[index].clone();
        let Some(value) = args.get(index + 1).cloned() else {
            return usage(&cmdname);
        };
        match option.as_str() {
            "-np" | "--workers" => match value.parse() {
                Ok(n) => config.workers = n,
                Err(_) => return usage(&cmdname),
            },
            "-bufsize" | "--bufsize" => match value.parse() {
                Ok(n) => config.bufsize = n,
                Err(_) => return usage(&cmdname),
            },
            "-extra" | "--extra" => match value.parse() {
                Ok(n) => config.extra_space = n,
                Err(_) => return usage(&cmdname),
            },
            "-config" | "--config" => match LauncherConfig::load(Path::new(&value)) {
                Ok(loaded) => config = loaded,
                Err(e) => {
                    eprintln!("{cmdname}: cannot load {value}: {e}");
                    return ExitCode::FAILURE;
                }
            },
            _ => return usage(&cmdname),
        }
        index += 2;
    }
    let rest = args.split_off(index);
    let Some((program, worker_args)) = rest.split_first() else {
        return usage(&cmdname);
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str())),
        )
        .with_target(false)
        .init();

    match plexus_shm::rts::run_workers(
        config.workers,
        config.bufsize,
        config.extra_space,
        program,
        worker_args,
    ) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("launch failed: {e}");
            ExitCode::FAILURE
        }
    }
}
