//! Rank-ordered reporting
//!
//! Ranks run concurrently with no shared clock. To print in rank order every
//! rank takes part in `size` barrier rounds and rank `i` writes its block
//! right after round `i`. Whole blocks come out in rank order; the protocol
//! says nothing about interleaving inside a block. Each pass costs `size`
//! collective round trips, which is fine for occasional human-readable
//! output and wrong for telemetry.

use crate::aggregate::{BandwidthReport, ClusterSummary};
use crate::barrier::PhaseBarrier;
use crate::collective::Collective;
use crate::result::RunResult;
use lockstep_common::config::OutputFormat;
use lockstep_common::error::{LockstepError, Result};
use lockstep_common::HostIdentity;
use serde_json::json;
use std::fmt;
use std::io::Write;
use std::str::FromStr;
use tracing::warn;

const RULE: &str = "--------------------------------------------------";
const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Emits one block per rank in increasing rank order
pub struct OrderedReporter {
    rank: usize,
    size: usize,
}

impl OrderedReporter {
    pub fn new(rank: usize, size: usize) -> Self {
        Self { rank, size }
    }

    /// Take part in one ordered pass, writing `block` in this rank's turn
    ///
    /// `None` takes part without writing. The outer error means the pass
    /// itself broke and the group is out of step. A failed write does not
    /// skip the remaining rounds, since peers would block on them forever;
    /// it comes back as the inner error once the pass has completed.
    pub async fn emit<C, W>(
        &self,
        barrier: &mut PhaseBarrier<'_, C>,
        out: &mut W,
        block: Option<&str>,
    ) -> Result<std::io::Result<()>>
    where
        C: Collective,
        W: Write,
    {
        let mut written = Ok(());

        for turn in 0..self.size {
            barrier.barrier().await?;

            if turn == self.rank {
                if let Some(block) = block {
                    if let Err(e) = write_block(out, block) {
                        warn!(rank = self.rank, "failed to write report block: {}", e);
                        written = Err(e);
                    }
                }
            }
        }

        Ok(written)
    }
}

fn write_block<W: Write>(out: &mut W, block: &str) -> std::io::Result<()> {
    out.write_all(block.as_bytes())?;
    if !block.ends_with('\n') {
        out.write_all(b"\n")?;
    }
    out.flush()
}

/// Rank-0 banner printed before any rank output
pub fn format_header(
    format: OutputFormat,
    members: &[HostIdentity],
    model_id: &str,
    run_id: &str,
) -> Option<String> {
    match format {
        OutputFormat::Text => {
            let hosts: Vec<String> = members
                .iter()
                .enumerate()
                .map(|(rank, m)| format!("rank{}@{}", rank, m.hostname))
                .collect();
            Some(format!(
                "=== Lockstep Distributed Inference ===\nRunning on {} processes\nHosts: {}\nModel: {}\nRun: {}\n{}\n",
                members.len(),
                hosts.join(", "),
                model_id,
                run_id,
                "=".repeat(40)
            ))
        }
        OutputFormat::Perf | OutputFormat::Json => None,
    }
}

/// One rank's block in the chosen format
pub fn format_block(format: OutputFormat, result: &RunResult) -> Result<String> {
    match format {
        OutputFormat::Text => Ok(format!(
            "\n[Rank {}/{}]\nPrompt: {}\nResponse: {}\nLoad time: {:.2}s | Memory: {:+.1}MB\nGeneration time: {:.2}s | Speed: {:.1} tok/s | Runs: {}\n{}\n",
            result.rank,
            result.hostname,
            result.prompt,
            result.response.trim(),
            result.load_seconds,
            result.memory_delta_bytes as f64 / BYTES_PER_MB,
            result.elapsed_seconds,
            result.throughput(),
            result.runs,
            RULE
        )),
        OutputFormat::Perf => Ok(format!("{}\n", PerfRecord::from_result(result))),
        OutputFormat::Json => Ok(format!("{}\n", serde_json::to_string(result)?)),
    }
}

/// Rank-0 closing summary
pub fn format_summary(
    format: OutputFormat,
    summary: &ClusterSummary,
    bandwidth: Option<&BandwidthReport>,
) -> Result<String> {
    match format {
        OutputFormat::Text => {
            let mut text = format!(
                "\n=== Inference Complete ===\nRanks: {} | Units: {} | Aggregate speed: {:.1} tok/s\nMean load: {:.2}s | Mean generation: {:.2}s | Memory: {:+.1}MB\n",
                summary.size,
                summary.total_units,
                summary.aggregate_throughput,
                summary.mean_load_seconds,
                summary.mean_elapsed_seconds,
                summary.total_memory_delta_bytes as f64 / BYTES_PER_MB
            );
            if let Some(bw) = bandwidth {
                text.push_str(&format!(
                    "Bandwidth: {:.1} MB/s ({} MB per rank, {:.3}s)\n",
                    bw.throughput_mb_s, bw.payload_mb, bw.elapsed_seconds
                ));
            }
            Ok(text)
        }
        OutputFormat::Perf => {
            let mut line = format!(
                "SUMMARY|RANKS_{}|UNITS_{}|LOAD_{:.2}s|ELAPSED_{:.2}s|SPEED_{:.1}tok/s|MEM_{:.1}MB",
                summary.size,
                summary.total_units,
                summary.mean_load_seconds,
                summary.mean_elapsed_seconds,
                summary.aggregate_throughput,
                summary.total_memory_delta_bytes as f64 / BYTES_PER_MB
            );
            if let Some(bw) = bandwidth {
                line.push_str(&format!("|BW_{:.1}MB/s", bw.throughput_mb_s));
            }
            line.push('\n');
            Ok(line)
        }
        OutputFormat::Json => Ok(format!(
            "{}\n",
            json!({ "summary": summary, "bandwidth": bandwidth })
        )),
    }
}

/// One machine-parsable performance line
///
/// `PERF|RANK_<r>|HOST_<h>|LOAD_<s>s|MEM_<m>MB|SPEED_<x>tok/s|RUNS_<n>`.
/// Fields split on `|`, then key and value split on the first `_`.
#[derive(Debug, Clone, PartialEq)]
pub struct PerfRecord {
    pub rank: usize,
    pub host: String,
    pub load_seconds: f64,
    pub memory_mb: f64,
    pub tokens_per_second: f64,
    pub runs: u32,
}

impl PerfRecord {
    pub fn from_result(result: &RunResult) -> Self {
        Self {
            rank: result.rank,
            host: result.hostname.replace('|', "-"),
            load_seconds: result.load_seconds,
            memory_mb: result.memory_delta_bytes as f64 / BYTES_PER_MB,
            tokens_per_second: result.throughput(),
            runs: result.runs,
        }
    }
}

impl fmt::Display for PerfRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PERF|RANK_{}|HOST_{}|LOAD_{:.2}s|MEM_{:.1}MB|SPEED_{:.1}tok/s|RUNS_{}",
            self.rank, self.host, self.load_seconds, self.memory_mb, self.tokens_per_second, self.runs
        )
    }
}

impl FromStr for PerfRecord {
    type Err = LockstepError;

    fn from_str(line: &str) -> Result<Self> {
        let bad = |what: &str| LockstepError::protocol(format!("bad PERF line ({}): {}", what, line));

        let mut fields = line.trim().split('|');
        if fields.next() != Some("PERF") {
            return Err(bad("missing PERF tag"));
        }

        let mut rank = None;
        let mut host = None;
        let mut load = None;
        let mut memory = None;
        let mut speed = None;
        let mut runs = None;

        for field in fields {
            let (key, value) = field.split_once('_').ok_or_else(|| bad(field))?;
            match key {
                "RANK" => rank = value.parse().ok(),
                "HOST" => host = Some(value.to_string()),
                "LOAD" => load = value.strip_suffix('s').and_then(|v| v.parse().ok()),
                "MEM" => memory = value.strip_suffix("MB").and_then(|v| v.parse().ok()),
                "SPEED" => speed = value.strip_suffix("tok/s").and_then(|v| v.parse().ok()),
                "RUNS" => runs = value.parse().ok(),
                _ => {}
            }
        }

        Ok(Self {
            rank: rank.ok_or_else(|| bad("RANK"))?,
            host: host.ok_or_else(|| bad("HOST"))?,
            load_seconds: load.ok_or_else(|| bad("LOAD"))?,
            memory_mb: memory.ok_or_else(|| bad("MEM"))?,
            tokens_per_second: speed.ok_or_else(|| bad("SPEED"))?,
            runs: runs.ok_or_else(|| bad("RUNS"))?,
        })
    }
}
