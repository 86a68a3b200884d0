//! TCP transport to the reduction hub

use crate::collective::{Collective, Membership};
use lockstep_common::error::{LockstepError, Result};
use lockstep_common::{HostIdentity, LaunchContext};
use lockstep_proto::{frame, read_frame, write_frame, Frame};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Delay between attempts while the hub is not yet listening
const CONNECT_RETRY: Duration = Duration::from_millis(200);

/// A rank's connection to the hub
pub struct TcpCollective {
    rank: usize,
    stream: Mutex<TcpStream>,
    seq: AtomicU64,
}

impl TcpCollective {
    /// Connect, join and wait until the whole group has joined
    ///
    /// Retries refused connections until the caller's deadline cancels the
    /// future; any other failure is returned immediately.
    pub async fn connect(
        context: &LaunchContext,
        identity: &HostIdentity,
    ) -> Result<(Self, Membership)> {
        let mut stream = loop {
            match TcpStream::connect(&context.hub_addr).await {
                Ok(stream) => break stream,
                Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                    debug!(hub = %context.hub_addr, "hub not reachable yet, retrying");
                    tokio::time::sleep(CONNECT_RETRY).await;
                }
                Err(e) => {
                    return Err(LockstepError::Connection(format!(
                        "Failed to connect to hub {}: {}",
                        context.hub_addr, e
                    )))
                }
            }
        };
        stream.set_nodelay(true)?;

        let join = Frame::join(
            context.rank as u32,
            context.size as u32,
            identity.hostname.clone(),
            identity.pid,
        );
        write_frame(&mut stream, &join).await?;
        info!(rank = context.rank, hub = %context.hub_addr, "joined hub, waiting for group");

        let welcome = match read_frame(&mut stream).await? {
            Some(Frame { kind: Some(frame::Kind::Welcome(welcome)) }) => welcome,
            Some(Frame { kind: Some(frame::Kind::Fault(fault)) }) => {
                return Err(LockstepError::from_fault(fault.kind(), fault.message))
            }
            Some(other) => {
                return Err(LockstepError::protocol(format!(
                    "expected welcome, got {}",
                    other.name()
                )))
            }
            None => {
                return Err(LockstepError::Connection(
                    "hub closed the connection before the group formed".to_string(),
                ))
            }
        };

        if welcome.size as usize != context.size {
            return Err(LockstepError::group_formation(format!(
                "hub formed a group of {} but this rank expects {}",
                welcome.size, context.size
            )));
        }

        let mut members = vec![
            HostIdentity {
                hostname: "unknown".to_string(),
                pid: 0,
            };
            context.size
        ];
        for member in welcome.members {
            if let Some(slot) = members.get_mut(member.rank as usize) {
                *slot = HostIdentity {
                    hostname: member.hostname,
                    pid: member.pid,
                };
            }
        }

        let membership = Membership {
            size: context.size,
            run_id: welcome.run_id,
            members,
        };

        let collective = Self {
            rank: context.rank,
            stream: Mutex::new(stream),
            seq: AtomicU64::new(0),
        };

        Ok((collective, membership))
    }
}

impl Collective for TcpCollective {
    async fn all_reduce_sum(&self, values: &[f64]) -> Result<Vec<f64>> {
        let mut stream = self.stream.lock().await;
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);

        write_frame(&mut *stream, &Frame::contribute(seq, values.to_vec())).await?;

        match read_frame(&mut *stream).await? {
            Some(Frame { kind: Some(frame::Kind::Reduced(reduced)) }) if reduced.seq == seq => {
                Ok(reduced.values)
            }
            Some(Frame { kind: Some(frame::Kind::Reduced(reduced)) }) => Err(LockstepError::protocol(format!(
                "rank {} waited for collective #{} but hub answered #{}",
                self.rank, seq, reduced.seq
            ))),
            Some(Frame { kind: Some(frame::Kind::Fault(fault)) }) => {
                Err(LockstepError::from_fault(fault.kind(), fault.message))
            }
            Some(other) => Err(LockstepError::protocol(format!(
                "unexpected {} frame during collective #{}",
                other.name(),
                seq
            ))),
            None => Err(LockstepError::Connection(format!(
                "hub closed the connection during collective #{}",
                seq
            ))),
        }
    }
}
