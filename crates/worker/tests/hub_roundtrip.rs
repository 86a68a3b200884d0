//! Replicas talking to a real hub over loopback TCP

use lockstep_common::config::OutputFormat;
use lockstep_common::{LaunchContext, LockstepConfig, LockstepError};
use lockstep_hub::ReductionHub;
use lockstep_worker::{Orchestrator, PhaseBarrier, ProcessGroup, SyntheticEngine};
use std::time::Duration;
use tokio::net::TcpListener;

const FORMATION: Duration = Duration::from_secs(10);

async fn start_hub() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let hub = ReductionHub::new(None);
    tokio::spawn(async move { hub.serve(&listener).await });
    addr
}

fn context(rank: usize, size: usize, hub_addr: &str) -> LaunchContext {
    LaunchContext {
        rank,
        size,
        hub_addr: hub_addr.to_string(),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sum_reduction_over_tcp() {
    let addr = start_hub().await;

    let tasks: Vec<_> = (0..3)
        .map(|rank| {
            let ctx = context(rank, 3, &addr);
            tokio::spawn(async move {
                let group = ProcessGroup::init(&ctx, FORMATION).await.unwrap();
                assert_eq!(group.size(), 3);
                assert_eq!(group.members().len(), 3);

                let ones = group.all_reduce_sum(&[1.0]).await.unwrap();
                let ranks = group.all_reduce_sum(&[rank as f64, 2.0]).await.unwrap();
                assert_eq!(group.verify().await.unwrap(), 3.0);

                let mut barrier = PhaseBarrier::new(&group);
                barrier.barrier().await.unwrap();

                (ones, ranks, group.run_id().to_string())
            })
        })
        .collect();

    let mut run_ids = Vec::new();
    for task in tasks {
        let (ones, ranks, run_id) = task.await.unwrap();
        assert_eq!(ones, vec![3.0]);
        assert_eq!(ranks, vec![3.0, 6.0]);
        run_ids.push(run_id);
    }
    run_ids.dedup();
    assert_eq!(run_ids.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shape_mismatch_reaches_every_rank() {
    let addr = start_hub().await;

    let tasks: Vec<_> = (0..2)
        .map(|rank| {
            let ctx = context(rank, 2, &addr);
            tokio::spawn(async move {
                let group = ProcessGroup::init(&ctx, FORMATION).await.unwrap();
                let operand = vec![1.0; rank + 1];
                group.all_reduce_sum(&operand).await
            })
        })
        .collect();

    for task in tasks {
        assert!(matches!(task.await.unwrap(), Err(LockstepError::Config(_))));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_formation_times_out_without_peers() {
    let addr = start_hub().await;
    let ctx = context(0, 2, &addr);

    let formed = ProcessGroup::init(&ctx, Duration::from_millis(300)).await;
    assert!(matches!(formed, Err(LockstepError::GroupFormation(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_full_run_over_tcp() {
    let addr = start_hub().await;

    let mut config = LockstepConfig::default();
    config.output = OutputFormat::Json;
    config.max_tokens = 5;
    config.runs_per_rank = 2;
    config.sync_between_runs = true;
    config.bandwidth_probe_mb = Some(1);

    let tasks: Vec<_> = (0..3)
        .map(|rank| {
            let ctx = context(rank, 3, &addr);
            let config = config.clone();
            tokio::spawn(async move {
                let group = ProcessGroup::init(&ctx, FORMATION).await.unwrap();
                let engine = SyntheticEngine::new(rank, config.engine.clone());
                let mut orchestrator = Orchestrator::new(config, engine).unwrap();
                let mut out = Vec::new();
                let outcome = orchestrator.run(&group, &mut out).await.unwrap();
                (outcome, String::from_utf8(out).unwrap())
            })
        })
        .collect();

    for (rank, task) in tasks.into_iter().enumerate() {
        let (outcome, text) = task.await.unwrap();
        assert_eq!(outcome.result.rank, rank);
        assert_eq!(outcome.result.units_produced, 10);
        assert_eq!(outcome.summary.total_units, 30);
        assert_eq!(outcome.bandwidth.unwrap().size, 3);

        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines[0]["rank"], rank);
        if rank == 0 {
            assert_eq!(lines.len(), 2);
            assert_eq!(lines[1]["summary"]["size"], 3);
        } else {
            assert_eq!(lines.len(), 1);
        }
    }
}
