//! Per-rank run results

use serde::{Deserialize, Serialize};

/// What one rank produced; immutable once published
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub rank: usize,
    pub hostname: String,
    pub pid: u32,
    pub task_index: usize,
    pub prompt: String,
    pub response: String,
    pub load_seconds: f64,
    /// Total generation time across all runs
    pub elapsed_seconds: f64,
    /// Total units (tokens) across all runs
    pub units_produced: u64,
    pub memory_delta_bytes: i64,
    pub runs: u32,
}

impl RunResult {
    /// Units per second over all runs
    pub fn throughput(&self) -> f64 {
        if self.elapsed_seconds > 0.0 {
            self.units_produced as f64 / self.elapsed_seconds
        } else {
            0.0
        }
    }
}
