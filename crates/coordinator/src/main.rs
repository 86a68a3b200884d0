//! Lockstep Hub - Main Entry Point
//!
//! Binds the rendezvous address and serves one group after another until
//! interrupted.

use lockstep_common::{LockstepConfig, Result};
use lockstep_hub::ReductionHub;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let config = LockstepConfig::load()?;

    // Initialize logging
    let default_filter = format!("lockstep_hub={}", config.observability.log_level);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Lockstep Hub");

    let addr = format!("{}:{}", config.hub.bind_address, config.hub.port);
    let listener = TcpListener::bind(&addr).await?;
    let hub = ReductionHub::new(config.hub.expected_size);
    info!("Lockstep Hub listening on {}", addr);

    let mut runs = 0u64;
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
            served = hub.serve(&listener) => {
                served?;
                runs += 1;
                info!(runs, "run complete, waiting for the next group");
            }
        }
    }

    info!("Lockstep Hub shutdown complete");
    Ok(())
}
