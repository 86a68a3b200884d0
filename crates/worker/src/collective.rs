//! The sum-reduction seam
//!
//! `Collective` is the only way ranks exchange data: every member supplies a
//! vector of the same length and every member gets the elementwise sum back.
//! The k-th call of each rank is matched with the k-th call of every other
//! rank; nothing else identifies which logical phase a call belongs to.

use crate::transport::TcpCollective;
use lockstep_common::error::{LockstepError, Result};
use lockstep_common::HostIdentity;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::trace;

/// Blocking elementwise sum across all members of a group
pub trait Collective: Send + Sync {
    /// Contribute `values` to the next reduction and wait for the sum
    fn all_reduce_sum(&self, values: &[f64]) -> impl Future<Output = Result<Vec<f64>>> + Send;
}

/// Group membership as agreed when the group formed
#[derive(Debug, Clone)]
pub struct Membership {
    pub size: usize,
    pub run_id: String,
    /// Indexed by rank
    pub members: Vec<HostIdentity>,
}

/// Concrete fabric chosen at process start
pub enum Fabric {
    /// In-process ranks (singleton runs, tests)
    Local(LocalCollective),

    /// One TCP connection to a reduction hub
    Tcp(TcpCollective),
}

impl Collective for Fabric {
    async fn all_reduce_sum(&self, values: &[f64]) -> Result<Vec<f64>> {
        match self {
            Fabric::Local(local) => local.all_reduce_sum(values).await,
            Fabric::Tcp(tcp) => tcp.all_reduce_sum(values).await,
        }
    }
}

type RoundReply = std::result::Result<Vec<f64>, String>;

/// Partial state of one in-flight reduction
#[derive(Default)]
struct LocalRound {
    sum: Vec<f64>,
    arrived: usize,
    mismatch: Option<String>,
    waiters: Vec<oneshot::Sender<RoundReply>>,
}

/// In-process fabric shared by `size` rank handles
pub struct LocalFabric;

impl LocalFabric {
    /// Create one handle per rank, indexed by rank
    pub fn create(size: usize) -> Vec<LocalCollective> {
        let rounds = Arc::new(Mutex::new(HashMap::new()));
        (0..size)
            .map(|rank| LocalCollective {
                rank,
                size,
                seq: AtomicU64::new(0),
                rounds: rounds.clone(),
            })
            .collect()
    }
}

/// One rank's handle on a `LocalFabric`
pub struct LocalCollective {
    rank: usize,
    size: usize,
    seq: AtomicU64,
    rounds: Arc<Mutex<HashMap<u64, LocalRound>>>,
}

impl LocalCollective {
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl Collective for LocalCollective {
    async fn all_reduce_sum(&self, values: &[f64]) -> Result<Vec<f64>> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();

        {
            let mut rounds = self.rounds.lock();
            let round = rounds.entry(seq).or_default();

            if round.arrived == 0 {
                round.sum = values.to_vec();
            } else if round.sum.len() != values.len() {
                if round.mismatch.is_none() {
                    round.mismatch = Some(format!(
                        "collective #{}: rank {} contributed {} values, expected {}",
                        seq,
                        self.rank,
                        values.len(),
                        round.sum.len()
                    ));
                }
            } else {
                for (acc, v) in round.sum.iter_mut().zip(values) {
                    *acc += v;
                }
            }

            round.arrived += 1;
            round.waiters.push(tx);
            trace!(rank = self.rank, seq, arrived = round.arrived, "local contribution");

            if round.arrived == self.size {
                if let Some(done) = rounds.remove(&seq) {
                    let reply = match done.mismatch {
                        Some(msg) => Err(msg),
                        None => Ok(done.sum),
                    };
                    for waiter in done.waiters {
                        let _ = waiter.send(reply.clone());
                    }
                }
            }
        }

        match rx.await {
            Ok(Ok(sum)) => Ok(sum),
            Ok(Err(msg)) => Err(LockstepError::config(msg)),
            Err(_) => Err(LockstepError::Connection(
                "local fabric dropped a pending reduction".to_string(),
            )),
        }
    }
}
