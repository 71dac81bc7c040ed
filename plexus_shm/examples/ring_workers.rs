//! Worker for the `smrun` launcher: every rank above zero reports to
//! rank 0, with barriers framing the exchange.
//!
//! Run it through the launcher, e.g.:
//!
//! ```text
//! smrun -np 4 target/debug/examples/ring_workers
//! ```

use plexus_shm::rts;

fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let domain = match rts::init() {
        Ok(domain) => domain,
        Err(e) => {
            eprintln!("not launched through smrun: {e}");
            return std::process::ExitCode::FAILURE;
        }
    };
    let rank = domain.rank();
    let nofprocesses = domain.nofprocesses();

    if domain.barrier().is_err() {
        return std::process::ExitCode::FAILURE;
    }
    println!("worker {rank}/{nofprocesses} past first barrier");

    let ok = if rank == 0 {
        let mut all = true;
        for _ in 1..nofprocesses {
            let mut buf = [0u8; 4];
            match domain.read(&mut buf) {
                Ok(()) => println!("rank 0 received greeting from {}", u32::from_le_bytes(buf)),
                Err(_) => all = false,
            }
        }
        all
    } else {
        domain.write(0, &rank.to_le_bytes()).is_ok()
    };

    if domain.barrier().is_err() || !ok {
        return std::process::ExitCode::FAILURE;
    }
    println!("worker {rank}/{nofprocesses} past second barrier");
    std::process::ExitCode::SUCCESS
}
