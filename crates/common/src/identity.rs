//! Process identity and launch context
//!
//! Rank, group size and hub address are handed to each process by whatever
//! launched it. `LaunchContext` reads them once; nothing else in the system
//! looks at the environment for identity.

use crate::error::{LockstepError, Result};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::process::Command;
use tracing::debug;

/// Hub address used when `LOCKSTEP_HUB_ADDR` is unset
pub const DEFAULT_HUB_ADDR: &str = "127.0.0.1:50151";

const RANK_VARS: [&str; 3] = ["LOCKSTEP_RANK", "OMPI_COMM_WORLD_RANK", "PMI_RANK"];
const SIZE_VARS: [&str; 3] = ["LOCKSTEP_WORLD_SIZE", "OMPI_COMM_WORLD_SIZE", "PMI_SIZE"];

lazy_static! {
    static ref HOSTNAME: String = resolve_hostname();
}

/// Host-level identity of this process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostIdentity {
    pub hostname: String,
    pub pid: u32,
}

impl HostIdentity {
    /// Identity of the running process
    pub fn current() -> Self {
        Self {
            hostname: HOSTNAME.clone(),
            pid: std::process::id(),
        }
    }
}

fn resolve_hostname() -> String {
    if let Ok(name) = std::env::var("HOSTNAME") {
        if !name.trim().is_empty() {
            return name.trim().to_string();
        }
    }

    if let Ok(name) = std::fs::read_to_string("/proc/sys/kernel/hostname") {
        if !name.trim().is_empty() {
            return name.trim().to_string();
        }
    }

    match Command::new("hostname").output() {
        Ok(output) if output.status.success() => {
            let name = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if !name.is_empty() {
                return name;
            }
        }
        Ok(_) | Err(_) => debug!("hostname command unavailable"),
    }

    "unknown".to_string()
}

/// Rank, size and fabric address supplied by the launcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchContext {
    pub rank: usize,
    pub size: usize,
    pub hub_addr: String,
}

impl LaunchContext {
    /// Read the launch context from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the launch context through an arbitrary key lookup
    ///
    /// With neither rank nor size present the process runs as a singleton
    /// group. Supplying only one of them is a formation error.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let rank = first_number(&lookup, &RANK_VARS)?;
        let size = first_number(&lookup, &SIZE_VARS)?;
        let hub_addr = lookup("LOCKSTEP_HUB_ADDR").unwrap_or_else(|| DEFAULT_HUB_ADDR.to_string());

        let (rank, size) = match (rank, size) {
            (Some(rank), Some(size)) => (rank, size),
            (None, None) => (0, 1),
            (Some(_), None) => {
                return Err(LockstepError::group_formation("Rank is set but group size is missing"))
            }
            (None, Some(_)) => {
                return Err(LockstepError::group_formation("Group size is set but rank is missing"))
            }
        };

        let context = Self { rank, size, hub_addr };
        context.validate()?;
        Ok(context)
    }

    /// A singleton context, used by local runs
    pub fn singleton() -> Self {
        Self {
            rank: 0,
            size: 1,
            hub_addr: DEFAULT_HUB_ADDR.to_string(),
        }
    }

    /// Check `0 <= rank < size`
    pub fn validate(&self) -> Result<()> {
        if self.size == 0 {
            return Err(LockstepError::group_formation("Group size must be at least 1"));
        }
        if self.rank >= self.size {
            return Err(LockstepError::group_formation(format!(
                "Rank {} is outside a group of size {}",
                self.rank, self.size
            )));
        }
        Ok(())
    }

    pub fn is_singleton(&self) -> bool {
        self.size == 1
    }
}

fn first_number<F>(lookup: &F, keys: &[&str]) -> Result<Option<usize>>
where
    F: Fn(&str) -> Option<String>,
{
    for key in keys {
        if let Some(value) = lookup(key) {
            let parsed = value.trim().parse::<usize>().map_err(|_| {
                LockstepError::group_formation(format!("{} is not a valid number: {}", key, value))
            })?;
            return Ok(Some(parsed));
        }
    }
    Ok(None)
}
