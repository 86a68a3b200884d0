//! Process identity and the group's single collective primitive
//!
//! A `ProcessGroup` is built once at process start and passed by reference to
//! every component that needs rank, size or the sum-reduction.

use crate::collective::{Collective, Fabric, LocalCollective, LocalFabric, Membership};
use crate::transport::TcpCollective;
use lockstep_common::error::{LockstepError, Result};
use lockstep_common::{HostIdentity, LaunchContext, METRICS};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

/// Membership plus the fabric that connects it
pub struct ProcessGroup<C: Collective = Fabric> {
    rank: usize,
    size: usize,
    identity: HostIdentity,
    membership: Membership,
    collective: C,
    timeout: Option<Duration>,
    calls: AtomicU64,
}

impl ProcessGroup<Fabric> {
    /// Form the group described by the launch context
    ///
    /// Either every rank joins or this returns `GroupFormation`; there is no
    /// partial membership. A singleton group needs no hub.
    pub async fn init(context: &LaunchContext, formation_timeout: Duration) -> Result<Self> {
        context.validate()?;
        let identity = HostIdentity::current();

        if context.is_singleton() {
            let membership = Membership {
                size: 1,
                run_id: uuid::Uuid::new_v4().to_string(),
                members: vec![identity.clone()],
            };
            let collective = LocalFabric::create(1)
                .pop()
                .ok_or_else(|| LockstepError::Internal("empty local fabric".to_string()))?;
            info!(host = %identity.hostname, "running as a singleton group");
            return Ok(Self::from_parts(0, identity, membership, Fabric::Local(collective)));
        }

        let connect = TcpCollective::connect(context, &identity);
        let (collective, membership) = match tokio::time::timeout(formation_timeout, connect).await {
            Ok(Ok(joined)) => joined,
            Ok(Err(e @ LockstepError::GroupFormation(_))) => return Err(e),
            Ok(Err(e)) => return Err(LockstepError::group_formation(e.to_string())),
            Err(_) => {
                return Err(LockstepError::group_formation(format!(
                    "group of {} did not form within {:?}",
                    context.size, formation_timeout
                )))
            }
        };

        info!(
            rank = context.rank,
            size = membership.size,
            run_id = %membership.run_id,
            "group formed"
        );

        Ok(Self::from_parts(context.rank, identity, membership, Fabric::Tcp(collective)))
    }
}

impl ProcessGroup<LocalCollective> {
    /// An in-process group of `size` ranks, indexed by rank
    pub fn local(size: usize) -> Vec<Self> {
        let identity = HostIdentity::current();
        let membership = Membership {
            size,
            run_id: uuid::Uuid::new_v4().to_string(),
            members: vec![identity.clone(); size],
        };

        LocalFabric::create(size)
            .into_iter()
            .map(|collective| {
                let rank = collective.rank();
                Self::from_parts(rank, identity.clone(), membership.clone(), collective)
            })
            .collect()
    }
}

impl<C: Collective> ProcessGroup<C> {
    /// Assemble a group from an already-formed membership
    pub fn from_parts(rank: usize, identity: HostIdentity, membership: Membership, collective: C) -> Self {
        Self {
            rank,
            size: membership.size,
            identity,
            membership,
            collective,
            timeout: None,
            calls: AtomicU64::new(0),
        }
    }

    /// Bound every collective wait; `None` waits forever
    ///
    /// A timed-out collective leaves the group out of step with its peers, so
    /// the error must end the run.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn identity(&self) -> &HostIdentity {
        &self.identity
    }

    /// Every member's identity, indexed by rank
    pub fn members(&self) -> &[HostIdentity] {
        &self.membership.members
    }

    /// Identifier shared by every member of this run
    pub fn run_id(&self) -> &str {
        &self.membership.run_id
    }

    /// Number of collectives this process has issued
    pub fn collectives_issued(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Elementwise sum of `values` over every member
    ///
    /// Blocks until every member has issued its matching call.
    pub async fn all_reduce_sum(&self, values: &[f64]) -> Result<Vec<f64>> {
        if values.is_empty() {
            return Err(LockstepError::config("collective operand must not be empty"));
        }

        let call = self.calls.fetch_add(1, Ordering::Relaxed);
        METRICS.collective.collectives_total.inc();
        let start = Instant::now();

        let reduced = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.collective.all_reduce_sum(values))
                .await
                .map_err(|_| {
                    LockstepError::timeout(format!(
                        "rank {} waited more than {:?} in collective #{}",
                        self.rank, limit, call
                    ))
                })??,
            None => self.collective.all_reduce_sum(values).await?,
        };

        let waited = start.elapsed();
        METRICS.collective.collective_wait.observe(waited.as_secs_f64());

        if reduced.len() != values.len() {
            return Err(LockstepError::protocol(format!(
                "collective #{} returned {} values for an operand of {}",
                call,
                reduced.len(),
                values.len()
            )));
        }

        trace!(rank = self.rank, call, ?waited, "collective complete");
        Ok(reduced)
    }

    /// Collective self-test: the sum of all ranks must be `size*(size-1)/2`
    pub async fn verify(&self) -> Result<f64> {
        let sum = self.all_reduce_sum(&[self.rank as f64]).await?[0];
        let expected = (self.size * self.size.saturating_sub(1) / 2) as f64;

        if (sum - expected).abs() > 1e-6 {
            return Err(LockstepError::Internal(format!(
                "fabric self-test failed: rank sum {} (expected {})",
                sum, expected
            )));
        }

        debug!(rank = self.rank, sum, "fabric self-test passed");
        Ok(sum)
    }
}
