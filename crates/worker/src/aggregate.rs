//! Cluster-level figures from per-rank measurements
//!
//! Aggregation is a sum-reduction, so it must only run once every rank holds
//! a finished `RunResult`. Taking the result by reference enforces that
//! locally; the post-work barrier enforces it for the group.

use crate::collective::Collective;
use crate::group::ProcessGroup;
use crate::result::RunResult;
use lockstep_common::error::{LockstepError, Result};
use serde::Serialize;
use std::time::Instant;
use tracing::info;

const BYTES_PER_MB: usize = 1024 * 1024;

/// Mean of a cluster-wide sum
pub fn cluster_average(total: f64, size: usize) -> f64 {
    if size == 0 {
        0.0
    } else {
        total / size as f64
    }
}

/// Aggregate throughput for a fixed payload per rank
///
/// The collective returns only after every rank arrived, so one rank's
/// elapsed time stands in for the slowest one.
pub fn cluster_throughput(per_rank_payload: f64, size: usize, elapsed_seconds: f64) -> f64 {
    if elapsed_seconds <= 0.0 {
        0.0
    } else {
        per_rank_payload * size as f64 / elapsed_seconds
    }
}

/// Cluster-wide view of one run, derived and never mutated
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterSummary {
    pub size: usize,
    pub total_units: u64,
    pub mean_load_seconds: f64,
    pub mean_elapsed_seconds: f64,
    pub total_memory_delta_bytes: i64,
    /// Sum of every rank's units per second
    pub aggregate_throughput: f64,
}

/// Result of a payload all-reduce
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BandwidthReport {
    pub payload_mb: usize,
    pub size: usize,
    pub elapsed_seconds: f64,
    pub throughput_mb_s: f64,
}

/// Sums measurements across the group
pub struct MetricsAggregator<'g, C: Collective> {
    group: &'g ProcessGroup<C>,
}

impl<'g, C: Collective> MetricsAggregator<'g, C> {
    pub fn new(group: &'g ProcessGroup<C>) -> Self {
        Self { group }
    }

    /// Cluster-wide sum of one scalar
    pub async fn aggregate(&self, value: f64) -> Result<f64> {
        Ok(self.group.all_reduce_sum(&[value]).await?[0])
    }

    /// Cluster-wide sums of several scalars in one collective
    pub async fn aggregate_all(&self, values: &[f64]) -> Result<Vec<f64>> {
        self.group.all_reduce_sum(values).await
    }

    /// Cluster-wide mean of one scalar
    pub async fn average(&self, value: f64) -> Result<f64> {
        let total = self.aggregate(value).await?;
        Ok(cluster_average(total, self.group.size()))
    }

    /// Fold every rank's result into a `ClusterSummary`
    pub async fn summarize(&self, result: &RunResult) -> Result<ClusterSummary> {
        let totals = self
            .aggregate_all(&[
                result.units_produced as f64,
                result.load_seconds,
                result.elapsed_seconds,
                result.memory_delta_bytes as f64,
                result.throughput(),
            ])
            .await?;

        let size = self.group.size();
        Ok(ClusterSummary {
            size,
            total_units: totals[0].round() as u64,
            mean_load_seconds: cluster_average(totals[1], size),
            mean_elapsed_seconds: cluster_average(totals[2], size),
            total_memory_delta_bytes: totals[3].round() as i64,
            aggregate_throughput: totals[4],
        })
    }

    /// Time an all-reduce of `payload_mb` per rank
    pub async fn bandwidth_probe(&self, payload_mb: usize) -> Result<BandwidthReport> {
        let len = payload_mb * BYTES_PER_MB / std::mem::size_of::<f64>();
        let payload = vec![1.0f64; len.max(1)];
        let size = self.group.size();

        let start = Instant::now();
        let reduced = self.group.all_reduce_sum(&payload).await?;
        let elapsed_seconds = start.elapsed().as_secs_f64();

        if (reduced[0] - size as f64).abs() > 1e-6 {
            return Err(LockstepError::Internal(format!(
                "bandwidth probe reduced to {} (expected {})",
                reduced[0], size
            )));
        }

        let report = BandwidthReport {
            payload_mb,
            size,
            elapsed_seconds,
            throughput_mb_s: cluster_throughput(payload_mb as f64, size, elapsed_seconds),
        };

        info!(
            rank = self.group.rank(),
            payload_mb,
            elapsed_seconds,
            throughput_mb_s = report.throughput_mb_s,
            "bandwidth probe complete"
        );

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result_for(rank: usize) -> RunResult {
        RunResult {
            rank,
            hostname: format!("host-{}", rank),
            pid: 100 + rank as u32,
            task_index: rank,
            prompt: "p".to_string(),
            response: "r".to_string(),
            load_seconds: 1.0 + rank as f64,
            elapsed_seconds: 2.0,
            units_produced: 50,
            memory_delta_bytes: 1024,
            runs: 1,
        }
    }

    #[test]
    fn test_cluster_throughput_scenario() {
        assert!((cluster_throughput(10.0, 3, 0.5) - 60.0).abs() < 1e-9);
        assert_eq!(cluster_throughput(10.0, 3, 0.0), 0.0);
    }

    #[test]
    fn test_cluster_average() {
        assert_eq!(cluster_average(12.0, 4), 3.0);
        assert_eq!(cluster_average(12.0, 0), 0.0);
    }

    #[tokio::test]
    async fn test_constant_aggregates_to_c_times_n() {
        let n = 4;
        let c = 2.5;
        let tasks: Vec<_> = ProcessGroup::local(n)
            .into_iter()
            .map(|group| {
                tokio::spawn(async move {
                    let aggregator = MetricsAggregator::new(&group);
                    let total = aggregator.aggregate(c).await.unwrap();
                    let mean = aggregator.average(c).await.unwrap();
                    (total, mean)
                })
            })
            .collect();

        for task in tasks {
            let (total, mean) = task.await.unwrap();
            assert_eq!(total, c * n as f64);
            assert_eq!(mean, c);
        }
    }

    #[tokio::test]
    async fn test_four_ranks_contributing_one() {
        let tasks: Vec<_> = ProcessGroup::local(4)
            .into_iter()
            .map(|group| tokio::spawn(async move { MetricsAggregator::new(&group).aggregate(1.0).await }))
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), 4.0);
        }
    }

    #[tokio::test]
    async fn test_summarize() {
        let tasks: Vec<_> = ProcessGroup::local(3)
            .into_iter()
            .map(|group| {
                tokio::spawn(async move {
                    let result = result_for(group.rank());
                    MetricsAggregator::new(&group).summarize(&result).await
                })
            })
            .collect();

        for task in tasks {
            let summary = task.await.unwrap().unwrap();
            assert_eq!(summary.size, 3);
            assert_eq!(summary.total_units, 150);
            assert!((summary.mean_load_seconds - 2.0).abs() < 1e-9);
            assert!((summary.mean_elapsed_seconds - 2.0).abs() < 1e-9);
            assert_eq!(summary.total_memory_delta_bytes, 3072);
            assert!((summary.aggregate_throughput - 75.0).abs() < 1e-9);
        }
    }

    #[tokio::test]
    async fn test_bandwidth_probe() {
        let tasks: Vec<_> = ProcessGroup::local(2)
            .into_iter()
            .map(|group| tokio::spawn(async move { MetricsAggregator::new(&group).bandwidth_probe(1).await }))
            .collect();

        for task in tasks {
            let report = task.await.unwrap().unwrap();
            assert_eq!(report.payload_mb, 1);
            assert_eq!(report.size, 2);
            assert!(report.throughput_mb_s >= 0.0);
        }
    }
}
