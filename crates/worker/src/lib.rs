//! Lockstep Worker
//!
//! One replica of a data-parallel inference run. Every rank loads the same
//! model, takes its share of the prompts and reports through collective
//! barriers so the group starts, fails and finishes together.

pub mod aggregate;
pub mod barrier;
pub mod collective;
pub mod engine;
pub mod group;
pub mod orchestrator;
pub mod partition;
pub mod report;
pub mod result;
pub mod transport;

pub use aggregate::{BandwidthReport, ClusterSummary, MetricsAggregator};
pub use barrier::PhaseBarrier;
pub use collective::{Collective, Fabric, LocalCollective, LocalFabric, Membership};
pub use engine::{Generation, InferenceEngine, SyntheticEngine};
pub use group::ProcessGroup;
pub use orchestrator::{Orchestrator, RunOutcome, Stage};
pub use partition::{WorkloadAssignment, WorkloadPartitioner};
pub use report::{OrderedReporter, PerfRecord};
pub use result::RunResult;
pub use transport::TcpCollective;
