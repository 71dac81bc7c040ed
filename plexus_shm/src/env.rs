//! Domain bootstrap parameters passed through the environment.
//!
//! The launcher stores the backing file path and the worker's rank
//! under `<prefix>_NAME` and `<prefix>_RANK`; a worker loads the same
//! pair to connect to the domain. The rank is plain decimal with no
//! sign.

use std::path::PathBuf;

use crate::error::LaunchError;

/// What a worker needs to join a domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainParams {
    /// Path of the domain's backing file.
    pub name: PathBuf,
    /// The worker's rank in `[0, N)`.
    pub rank: u32,
}

/// Publish domain parameters into this process's environment.
pub fn store(prefix: &str, params: &DomainParams) {
    std::env::set_var(format!("{prefix}_NAME"), &params.name);
    std::env::set_var(format!("{prefix}_RANK"), params.rank.to_string());
}

/// Load domain parameters from this process's environment.
pub fn load(prefix: &str) -> Result<DomainParams, LaunchError> {
    let name_var = format!("{prefix}_NAME");
    let rank_var = format!("{prefix}_RANK");
    let name = std::env::var_os(&name_var).ok_or(LaunchError::MissingEnv { var: name_var })?;
    let rank = std::env::var(&rank_var).map_err(|_| LaunchError::MissingEnv {
        var: rank_var.clone(),
    })?;
    // decimal, no sign: reject anything str::parse would wave through
    if rank.is_empty() || !rank.bytes().all(|b| b.is_ascii_digit()) {
        return Err(LaunchError::InvalidEnv { var: rank_var });
    }
    let rank: u32 = rank
        .parse()
        .map_err(|_| LaunchError::InvalidEnv { var: rank_var })?;
    Ok(DomainParams {
        name: PathBuf::from(name),
        rank,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_load_roundtrip() {
        let params = DomainParams {
            name: PathBuf::from("/tmp/.plexus-dom-abc123"),
            rank: 7,
        };
        store("PLEXUS_ENV_TEST_A", &params);
        assert_eq!(load("PLEXUS_ENV_TEST_A").unwrap(), params);
    }

    #[test]
    fn missing_variables_are_reported() {
        assert!(matches!(
            load("PLEXUS_ENV_TEST_ABSENT"),
            Err(LaunchError::MissingEnv { .. })
        ));
    }

    #[test]
    fn signed_or_junk_ranks_are_rejected() {
        std::env::set_var("PLEXUS_ENV_TEST_B_NAME", "/tmp/x");
        for bad in ["+3", "-1", "3x", "", " 3"] {
            std::env::set_var("PLEXUS_ENV_TEST_B_RANK", bad);
            assert!(
                matches!(
                    load("PLEXUS_ENV_TEST_B"),
                    Err(LaunchError::InvalidEnv { .. })
                ),
                "rank {bad:?} must be rejected"
            );
        }
    }
}
