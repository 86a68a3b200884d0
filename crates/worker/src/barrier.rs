//! Phase barriers built from the sum-reduction
//!
//! Every member must call the barrier the same number of times in the same
//! order. The collective cannot tell phases apart, so one extra or missing
//! call leaves the group permanently out of step.

use crate::collective::Collective;
use crate::group::ProcessGroup;
use lockstep_common::error::{LockstepError, Result};
use lockstep_common::METRICS;
use tracing::{debug, warn};

/// Happens-before checkpoint over one process group
pub struct PhaseBarrier<'g, C: Collective> {
    group: &'g ProcessGroup<C>,
    phase: u64,
}

impl<'g, C: Collective> PhaseBarrier<'g, C> {
    pub fn new(group: &'g ProcessGroup<C>) -> Self {
        Self { group, phase: 0 }
    }

    pub fn group(&self) -> &'g ProcessGroup<C> {
        self.group
    }

    /// Barriers completed so far
    pub fn phase(&self) -> u64 {
        self.phase
    }

    /// Wait until every member reaches its matching barrier
    ///
    /// The reduced value is discarded; only the blocking matters.
    pub async fn barrier(&mut self) -> Result<()> {
        self.group.all_reduce_sum(&[1.0]).await?;
        self.complete_phase();
        Ok(())
    }

    /// Barrier that also exchanges a failure flag
    ///
    /// Every member contributes 1 if it failed and 0 otherwise. A nonzero sum
    /// ends the run on all members at the same phase with `GroupAborted`.
    pub async fn checked_barrier(&mut self, healthy: bool) -> Result<()> {
        let flag = if healthy { 0.0 } else { 1.0 };
        let failed = self.group.all_reduce_sum(&[flag]).await?[0].round() as usize;
        self.complete_phase();

        if failed > 0 {
            METRICS.collective.health_aborts_total.inc();
            warn!(
                rank = self.group.rank(),
                phase = self.phase,
                failed_ranks = failed,
                "health check failed, aborting with the group"
            );
            return Err(LockstepError::GroupAborted { failed_ranks: failed });
        }

        Ok(())
    }

    fn complete_phase(&mut self) {
        self.phase += 1;
        METRICS.collective.barriers_total.inc();
        debug!(rank = self.group.rank(), phase = self.phase, "barrier passed");
    }
}
