//! The full replicated run
//!
//! Every rank walks the same stages in the same order:
//!
//! ```text
//! START -> GROUP_FORMED -> IDENTITY_REPORTED -> BARRIER_1 -> MODEL_READY
//!   -> BARRIER_2 -> WORK_ASSIGNED -> WORK_DONE -> METRICS_COLLECTED
//!   -> ORDERED_REPORT -> BARRIER_3 -> SUMMARY -> DONE
//! ```
//!
//! With health checks on, each barrier after a fallible step carries a
//! failure flag and the whole group stops together when any rank failed.
//! With health checks off a failing rank returns immediately and its peers
//! block on their next barrier forever.

use crate::aggregate::{BandwidthReport, ClusterSummary, MetricsAggregator};
use crate::barrier::PhaseBarrier;
use crate::collective::Collective;
use crate::engine::InferenceEngine;
use crate::group::ProcessGroup;
use crate::partition::{WorkloadAssignment, WorkloadPartitioner};
use crate::report::{format_block, format_header, format_summary, OrderedReporter};
use crate::result::RunResult;
use lockstep_common::config::LockstepConfig;
use lockstep_common::error::{LockstepError, Result};
use lockstep_common::METRICS;
use std::fmt;
use std::io::Write;
use std::time::Instant;
use tracing::{debug, error, info};

/// Position of this rank in the run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Start,
    GroupFormed,
    IdentityReported,
    Barrier1,
    ModelReady,
    Barrier2,
    WorkAssigned,
    WorkDone,
    MetricsCollected,
    OrderedReport,
    Barrier3,
    Summary,
    Done,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Start => "START",
            Stage::GroupFormed => "GROUP_FORMED",
            Stage::IdentityReported => "IDENTITY_REPORTED",
            Stage::Barrier1 => "BARRIER_1",
            Stage::ModelReady => "MODEL_READY",
            Stage::Barrier2 => "BARRIER_2",
            Stage::WorkAssigned => "WORK_ASSIGNED",
            Stage::WorkDone => "WORK_DONE",
            Stage::MetricsCollected => "METRICS_COLLECTED",
            Stage::OrderedReport => "ORDERED_REPORT",
            Stage::Barrier3 => "BARRIER_3",
            Stage::Summary => "SUMMARY",
            Stage::Done => "DONE",
            Stage::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Everything a rank knows when its run finishes
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub result: RunResult,
    pub summary: ClusterSummary,
    pub bandwidth: Option<BandwidthReport>,
    pub barriers: u64,
}

/// Local outcome of the work stage
struct WorkOutput {
    response: String,
    elapsed_seconds: f64,
    units: u64,
}

/// Drives one rank through a run
pub struct Orchestrator<E: InferenceEngine> {
    config: LockstepConfig,
    engine: E,
    partitioner: WorkloadPartitioner<String>,
    stage: Stage,
    history: Vec<Stage>,
}

impl<E: InferenceEngine> Orchestrator<E> {
    pub fn new(config: LockstepConfig, engine: E) -> Result<Self> {
        config.validate()?;
        let partitioner = WorkloadPartitioner::new(config.prompts.clone())?;

        Ok(Self {
            config,
            engine,
            partitioner,
            stage: Stage::Start,
            history: vec![Stage::Start],
        })
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Every stage entered so far, in order
    pub fn history(&self) -> &[Stage] {
        &self.history
    }

    /// Run every stage against `group`, writing reports to `out`
    pub async fn run<C, W>(&mut self, group: &ProcessGroup<C>, out: &mut W) -> Result<RunOutcome>
    where
        C: Collective,
        W: Write,
    {
        let outcome = self.run_stages(group, out).await;
        if let Err(e) = &outcome {
            error!(
                rank = group.rank(),
                host = %group.identity().hostname,
                stage = %self.stage,
                kind = e.kind(),
                "run failed: {}",
                e
            );
            self.advance(Stage::Failed);
        }
        outcome
    }

    async fn run_stages<C, W>(&mut self, group: &ProcessGroup<C>, out: &mut W) -> Result<RunOutcome>
    where
        C: Collective,
        W: Write,
    {
        let rank = group.rank();
        let mut barrier = PhaseBarrier::new(group);
        self.advance(Stage::GroupFormed);

        if self.config.verify_fabric {
            group.verify().await?;
        }
        info!(
            rank,
            size = group.size(),
            host = %group.identity().hostname,
            pid = group.identity().pid,
            run_id = group.run_id(),
            "replica ready"
        );
        let announced = match format_header(self.config.output, group.members(), &self.config.model_id, group.run_id()) {
            Some(header) if rank == 0 => write_now(out, &header),
            _ => Ok(()),
        };
        self.advance(Stage::IdentityReported);

        self.sync(&mut barrier, announced).await?;
        self.advance(Stage::Barrier1);

        let loaded = self.load_model(rank).await;
        if loaded.is_ok() {
            self.advance(Stage::ModelReady);
        }
        let (load_seconds, memory_delta_bytes) = self.sync(&mut barrier, loaded).await?;
        self.advance(Stage::Barrier2);

        let assignment = self.partitioner.assign(rank);
        debug!(rank, task_index = assignment.task_index, "work assigned");
        self.advance(Stage::WorkAssigned);

        let worked = self.execute(&assignment, &mut barrier).await;
        let work = self.sync(&mut barrier, worked).await?;
        self.advance(Stage::WorkDone);

        let identity = group.identity();
        let result = RunResult {
            rank,
            hostname: identity.hostname.clone(),
            pid: identity.pid,
            task_index: assignment.task_index,
            prompt: assignment.task,
            response: work.response,
            load_seconds,
            elapsed_seconds: work.elapsed_seconds,
            units_produced: work.units,
            memory_delta_bytes,
            runs: self.config.runs_per_rank,
        };

        let aggregator = MetricsAggregator::new(group);
        let summary = aggregator.summarize(&result).await?;
        let bandwidth = match self.config.bandwidth_probe_mb {
            Some(mb) => Some(aggregator.bandwidth_probe(mb).await?),
            None => None,
        };
        self.advance(Stage::MetricsCollected);

        // Every rank finishes the pass even when its own block is unusable
        let reporter = OrderedReporter::new(rank, group.size());
        let reported = match format_block(self.config.output, &result) {
            Ok(block) => reporter
                .emit(&mut barrier, out, Some(block.as_str()))
                .await?
                .map_err(LockstepError::Io),
            Err(e) => {
                // Nothing is written, so only the pass itself can fail
                let _ = reporter.emit(&mut barrier, out, None).await?;
                Err(e)
            }
        };
        self.advance(Stage::OrderedReport);

        self.sync(&mut barrier, reported).await?;
        self.advance(Stage::Barrier3);

        if rank == 0 {
            let text = format_summary(self.config.output, &summary, bandwidth.as_ref())?;
            write_now(out, &text)?;
            self.advance(Stage::Summary);
        }

        self.advance(Stage::Done);
        info!(rank, barriers = barrier.phase(), "run complete");

        Ok(RunOutcome {
            result,
            summary,
            bandwidth,
            barriers: barrier.phase(),
        })
    }

    /// Barrier after a step that may have failed on this rank
    ///
    /// Health-checked: every rank learns whether anyone failed and all of
    /// them stop at this barrier. Unchecked: a local failure returns at once
    /// and skips the barrier.
    async fn sync<C, T>(&self, barrier: &mut PhaseBarrier<'_, C>, step: Result<T>) -> Result<T>
    where
        C: Collective,
    {
        if let Err(e) = &step {
            METRICS.run.external_failures_total.inc();
            error!(
                rank = barrier.group().rank(),
                host = %barrier.group().identity().hostname,
                stage = %self.stage,
                "step failed: {}",
                e
            );
        }

        if self.config.health_checks {
            let checked = barrier.checked_barrier(step.is_ok()).await;
            let value = step?;
            checked?;
            Ok(value)
        } else {
            let value = step?;
            barrier.barrier().await?;
            Ok(value)
        }
    }

    async fn load_model(&mut self, rank: usize) -> Result<(f64, i64)> {
        let before = self.engine.memory_in_use();
        let start = Instant::now();

        info!(rank, model_id = %self.config.model_id, "loading model");
        self.engine.load(&self.config.model_id).await?;

        let load_seconds = start.elapsed().as_secs_f64();
        let memory_delta_bytes = self.engine.memory_in_use() as i64 - before as i64;

        METRICS.run.model_load_duration.observe(load_seconds);
        METRICS.run.memory_delta_bytes.set(memory_delta_bytes);
        info!(rank, load_seconds, memory_delta_bytes, "model loaded");

        Ok((load_seconds, memory_delta_bytes))
    }

    /// Generate `runs_per_rank` times, optionally syncing after each run
    async fn execute<C>(
        &mut self,
        assignment: &WorkloadAssignment<String>,
        barrier: &mut PhaseBarrier<'_, C>,
    ) -> Result<WorkOutput>
    where
        C: Collective,
    {
        let mut output = WorkOutput {
            response: String::new(),
            elapsed_seconds: 0.0,
            units: 0,
        };

        for run in 0..self.config.runs_per_rank {
            let start = Instant::now();
            let generated = self
                .engine
                .generate(&assignment.task, self.config.max_tokens)
                .await;
            let elapsed = start.elapsed().as_secs_f64();

            let generated = if self.config.sync_between_runs {
                self.sync(barrier, generated).await?
            } else {
                generated?
            };

            METRICS.run.generation_duration.observe(elapsed);
            METRICS.run.units_produced_total.inc_by(generated.units);
            debug!(rank = assignment.rank, run, units = generated.units, elapsed, "generation run done");

            output.elapsed_seconds += elapsed;
            output.units += generated.units;
            output.response = generated.text;
        }

        Ok(output)
    }

    fn advance(&mut self, next: Stage) {
        debug!(from = %self.stage, to = %next, "stage transition");
        self.stage = next;
        self.history.push(next);
    }
}

fn write_now<W: Write>(out: &mut W, text: &str) -> Result<()> {
    out.write_all(text.as_bytes())?;
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SyntheticEngine;
    use crate::report::PerfRecord;
    use lockstep_common::config::OutputFormat;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl SharedSink {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().clone()).unwrap()
        }
    }

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn test_config(output: OutputFormat) -> LockstepConfig {
        let mut config = LockstepConfig::default();
        config.output = output;
        config.max_tokens = 8;
        config.engine.weight_bytes = 1024 * 1024;
        config
    }

    fn spawn_ranks(
        size: usize,
        config: LockstepConfig,
        sink: &SharedSink,
    ) -> Vec<tokio::task::JoinHandle<(Result<RunOutcome>, Vec<Stage>)>> {
        ProcessGroup::local(size)
            .into_iter()
            .map(|group| {
                let config = config.clone();
                let mut out = sink.clone();
                tokio::spawn(async move {
                    let engine = SyntheticEngine::new(group.rank(), config.engine.clone());
                    let mut orchestrator = Orchestrator::new(config, engine).unwrap();
                    let outcome = orchestrator.run(&group, &mut out).await;
                    (outcome, orchestrator.history().to_vec())
                })
            })
            .collect()
    }

    struct BrokenSink;

    impl Write for BrokenSink {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stdout closed"))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// Run `size` ranks where `broken` writes to a sink that always fails
    async fn run_with_broken_sink(size: usize, config: LockstepConfig, broken: usize) -> Vec<(Result<RunOutcome>, Vec<Stage>)> {
        let sink = SharedSink::default();
        let tasks: Vec<_> = ProcessGroup::local(size)
            .into_iter()
            .map(|group| {
                let config = config.clone();
                let mut out: Box<dyn Write + Send> = if group.rank() == broken {
                    Box::new(BrokenSink)
                } else {
                    Box::new(sink.clone())
                };
                tokio::spawn(async move {
                    let engine = SyntheticEngine::new(group.rank(), config.engine.clone());
                    let mut orchestrator = Orchestrator::new(config, engine).unwrap();
                    let outcome = orchestrator.run(&group, &mut out).await;
                    (outcome, orchestrator.history().to_vec())
                })
            })
            .collect();

        let mut outcomes = Vec::new();
        for task in tasks {
            let finished = tokio::time::timeout(Duration::from_secs(5), task).await;
            outcomes.push(finished.expect("rank stranded at a barrier").unwrap());
        }
        outcomes
    }

    fn assert_aborted_by(outcomes: Vec<(Result<RunOutcome>, Vec<Stage>)>, broken: usize) {
        for (rank, (outcome, history)) in outcomes.into_iter().enumerate() {
            assert_eq!(history.last(), Some(&Stage::Failed));
            match outcome {
                Err(LockstepError::Io(e)) => {
                    assert_eq!(rank, broken);
                    assert_eq!(e.kind(), std::io::ErrorKind::BrokenPipe);
                }
                Err(LockstepError::GroupAborted { failed_ranks }) => {
                    assert_ne!(rank, broken);
                    assert_eq!(failed_ranks, 1);
                }
                other => panic!("rank {} unexpected outcome {:?}", rank, other.map(|o| o.barriers)),
            }
        }
    }

    #[tokio::test]
    async fn test_header_write_failure_aborts_group() {
        let outcomes = run_with_broken_sink(3, test_config(OutputFormat::Text), 0).await;
        for (_, history) in &outcomes {
            assert!(!history.contains(&Stage::Barrier1));
        }
        assert_aborted_by(outcomes, 0);
    }

    #[tokio::test]
    async fn test_report_write_failure_aborts_group() {
        let outcomes = run_with_broken_sink(3, test_config(OutputFormat::Json), 1).await;
        for (_, history) in &outcomes {
            assert!(history.contains(&Stage::OrderedReport));
            assert!(!history.contains(&Stage::Barrier3));
        }
        assert_aborted_by(outcomes, 1);
    }

    #[test]
    fn test_rejects_invalid_config() {
        let mut config = LockstepConfig::default();
        config.prompts.clear();
        let engine = SyntheticEngine::new(0, config.engine.clone());
        assert!(matches!(
            Orchestrator::new(config, engine),
            Err(LockstepError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_full_run_reports_in_rank_order() {
        let sink = SharedSink::default();
        let tasks = spawn_ranks(3, test_config(OutputFormat::Perf), &sink);

        for task in tasks {
            let (outcome, history) = task.await.unwrap();
            let outcome = outcome.unwrap();
            assert_eq!(outcome.summary.size, 3);
            assert_eq!(outcome.summary.total_units, 24);
            assert_eq!(outcome.result.units_produced, 8);
            assert_eq!(outcome.result.memory_delta_bytes, 1024 * 1024);
            assert_eq!(history.last(), Some(&Stage::Done));
            assert!(history.contains(&Stage::ModelReady));
            assert!(!history.contains(&Stage::Failed));
        }

        let text = sink.text();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);

        for (rank, line) in lines[..3].iter().enumerate() {
            let record: PerfRecord = line.parse().unwrap();
            assert_eq!(record.rank, rank);
            assert_eq!(record.runs, 1);
            assert!((record.memory_mb - 1.0).abs() < 1e-9);
        }
        assert!(lines[3].starts_with("SUMMARY|RANKS_3|UNITS_24|"));
    }

    #[tokio::test]
    async fn test_prompts_follow_rank_modulo() {
        let mut config = test_config(OutputFormat::Json);
        config.prompts = vec!["a".to_string(), "b".to_string()];
        let sink = SharedSink::default();

        let mut assigned = Vec::new();
        for task in spawn_ranks(3, config, &sink) {
            let (outcome, _) = task.await.unwrap();
            let result = outcome.unwrap().result;
            assigned.push((result.task_index, result.prompt));
        }

        assert_eq!(
            assigned,
            vec![(0, "a".to_string()), (1, "b".to_string()), (0, "a".to_string())]
        );
    }

    #[tokio::test]
    async fn test_health_checked_failure_aborts_group() {
        let mut config = test_config(OutputFormat::Text);
        config.engine.fail_load_on_ranks = vec![1];
        let sink = SharedSink::default();

        let mut outcomes = Vec::new();
        for task in spawn_ranks(3, config, &sink) {
            outcomes.push(task.await.unwrap());
        }

        for (rank, (outcome, history)) in outcomes.into_iter().enumerate() {
            assert_eq!(history.last(), Some(&Stage::Failed));
            assert!(!history.contains(&Stage::Barrier2));
            match outcome {
                Err(LockstepError::ExternalStep(_)) => assert_eq!(rank, 1),
                Err(LockstepError::GroupAborted { failed_ranks }) => {
                    assert_ne!(rank, 1);
                    assert_eq!(failed_ranks, 1);
                }
                other => panic!("rank {} unexpected outcome {:?}", rank, other.map(|o| o.barriers)),
            }
        }

        assert!(!sink.text().contains("[Rank"));
    }

    #[tokio::test]
    async fn test_generation_failure_with_synced_runs() {
        let mut config = test_config(OutputFormat::Json);
        config.runs_per_rank = 3;
        config.sync_between_runs = true;
        config.engine.fail_generate_on_ranks = vec![0, 2];
        let sink = SharedSink::default();

        for (rank, task) in spawn_ranks(3, config, &sink).into_iter().enumerate() {
            let (outcome, _) = task.await.unwrap();
            match outcome {
                Err(LockstepError::ExternalStep(_)) => assert_ne!(rank, 1),
                Err(LockstepError::GroupAborted { failed_ranks }) => {
                    assert_eq!(rank, 1);
                    assert_eq!(failed_ranks, 2);
                }
                _ => panic!("rank {} should have stopped", rank),
            }
        }
    }

    #[tokio::test]
    async fn test_unchecked_failure_strands_peers() {
        let mut config = test_config(OutputFormat::Text);
        config.health_checks = false;
        config.engine.fail_load_on_ranks = vec![1];
        let sink = SharedSink::default();

        let mut tasks = spawn_ranks(3, config, &sink);
        let failing = tasks.remove(1);

        let (outcome, history) = failing.await.unwrap();
        assert!(matches!(outcome, Err(LockstepError::ExternalStep(_))));
        assert_eq!(history.last(), Some(&Stage::Failed));

        for task in tasks {
            let waited = tokio::time::timeout(Duration::from_millis(300), task).await;
            assert!(waited.is_err(), "peer should still be blocked at its barrier");
        }
    }

    #[tokio::test]
    async fn test_collective_timeout_ends_stranded_run() {
        let mut config = test_config(OutputFormat::Text);
        config.health_checks = false;
        config.engine.fail_load_on_ranks = vec![0];
        let sink = SharedSink::default();

        let tasks: Vec<_> = ProcessGroup::local(2)
            .into_iter()
            .map(|group| group.with_timeout(Some(Duration::from_millis(200))))
            .map(|group| {
                let config = config.clone();
                let mut out = sink.clone();
                tokio::spawn(async move {
                    let engine = SyntheticEngine::new(group.rank(), config.engine.clone());
                    let mut orchestrator = Orchestrator::new(config, engine).unwrap();
                    orchestrator.run(&group, &mut out).await
                })
            })
            .collect();

        let results: Vec<_> = join_all(tasks).await;
        assert!(matches!(results[0], Err(LockstepError::ExternalStep(_))));
        assert!(matches!(results[1], Err(LockstepError::Timeout(_))));
    }

    async fn join_all<T>(tasks: Vec<tokio::task::JoinHandle<T>>) -> Vec<T> {
        let mut out = Vec::with_capacity(tasks.len());
        for task in tasks {
            out.push(task.await.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_singleton_run_completes() {
        let sink = SharedSink::default();
        let mut config = test_config(OutputFormat::Text);
        config.bandwidth_probe_mb = Some(1);

        let (outcome, _) = spawn_ranks(1, config, &sink).remove(0).await.unwrap();
        let outcome = outcome.unwrap();
        assert_eq!(outcome.summary.size, 1);
        assert!(outcome.bandwidth.is_some());

        let text = sink.text();
        assert!(text.contains("[Rank 0/"));
        let header = text.find("Lockstep Distributed Inference").unwrap();
        assert!(header < text.find("[Rank 0/").unwrap());
    }
}
