//! Lockstep Worker - Main Entry Point
//!
//! Reads rank and world size from the launcher environment, joins the group
//! through the reduction hub and runs one replica to completion.

use lockstep_common::{LaunchContext, LockstepConfig, Result, METRICS};
use lockstep_worker::{Orchestrator, ProcessGroup, SyntheticEngine};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let config = LockstepConfig::load()?;

    // Initialize logging
    let default_filter = format!("lockstep_worker={}", config.observability.log_level);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let context = LaunchContext::from_env()?;
    info!(
        "Starting Lockstep Worker: rank={}, size={}, hub={}, model={}",
        context.rank, context.size, context.hub_addr, config.model_id
    );

    let group = ProcessGroup::init(&context, config.formation_timeout())
        .await?
        .with_timeout(config.collective_timeout());

    let engine = SyntheticEngine::new(group.rank(), config.engine.clone());
    let enable_metrics = config.observability.enable_metrics;
    let mut orchestrator = Orchestrator::new(config, engine)?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let outcome = orchestrator.run(&group, &mut out).await;

    if enable_metrics {
        eprintln!("{}", METRICS.gather());
    }

    match outcome {
        Ok(outcome) => {
            info!(
                rank = group.rank(),
                units = outcome.result.units_produced,
                barriers = outcome.barriers,
                collectives = group.collectives_issued(),
                "Lockstep Worker finished"
            );
            Ok(())
        }
        Err(e) => {
            error!(
                rank = group.rank(),
                host = %group.identity().hostname,
                kind = e.kind(),
                "Lockstep Worker failed: {}",
                e
            );
            Err(e)
        }
    }
}
