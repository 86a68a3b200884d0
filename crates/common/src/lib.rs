//! Lockstep common library
//!
//! This crate contains shared code used across Lockstep components.

pub mod config;
pub mod error;
pub mod identity;
pub mod metrics;

// Re-export commonly used types
pub use config::LockstepConfig;
pub use error::{LockstepError, Result};
pub use identity::{HostIdentity, LaunchContext};
pub use metrics::{MetricsRegistry, METRICS};
