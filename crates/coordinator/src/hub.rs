//! Group formation and elementwise sum-reduction
//!
//! Each replica holds one TCP connection. The hub waits until `size`
//! distinct ranks have joined, welcomes all of them at once, then answers
//! the `seq`-th contribution of every rank with their elementwise sum.
//! Contributions are matched by `seq` only, so ranks must issue their
//! collectives in the same order.

use lockstep_common::error::Result;
use lockstep_common::METRICS;
use lockstep_proto::{frame, read_frame, write_frame, Contribute, FaultKind, Frame, Join, Member};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};

/// Reason a frame was refused
#[derive(Debug, Clone)]
struct Rejection {
    kind: FaultKind,
    message: String,
}

impl Rejection {
    fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    fn into_frame(self) -> Frame {
        Frame::fault(self.kind, self.message)
    }
}

/// A joined member and the queue feeding its connection
struct MemberSlot {
    hostname: String,
    pid: u32,
    outbox: mpsc::UnboundedSender<Frame>,
}

/// Partial sum for one collective call
struct Round {
    contributed: Vec<bool>,
    count: usize,
    sum: Vec<f64>,
    mismatch: Option<String>,
}

impl Round {
    fn new(size: usize) -> Self {
        Self {
            contributed: vec![false; size],
            count: 0,
            sum: Vec::new(),
            mismatch: None,
        }
    }
}

/// State of the group currently being served
struct GroupState {
    size: Option<usize>,
    members: HashMap<usize, MemberSlot>,
    rounds: BTreeMap<u64, Round>,
    welcomed: bool,
    run_id: String,
}

impl GroupState {
    fn new(expected_size: Option<usize>) -> Self {
        Self {
            size: expected_size,
            members: HashMap::new(),
            rounds: BTreeMap::new(),
            welcomed: false,
            run_id: String::new(),
        }
    }

    fn broadcast(&self, frame: &Frame) {
        for (rank, member) in &self.members {
            if member.outbox.send(frame.clone()).is_err() {
                debug!(rank, "member outbox already closed");
            }
        }
    }
}

struct HubInner {
    expected_size: Option<usize>,
    state: Mutex<GroupState>,
    finished: Notify,
}

/// Serves one group at a time
#[derive(Clone)]
pub struct ReductionHub {
    inner: Arc<HubInner>,
}

impl ReductionHub {
    /// `expected_size` pins the group size; `None` takes it from the first joiner
    pub fn new(expected_size: Option<usize>) -> Self {
        Self {
            inner: Arc::new(HubInner {
                expected_size,
                state: Mutex::new(GroupState::new(expected_size)),
                finished: Notify::new(),
            }),
        }
    }

    /// Accept members until a formed group has fully disconnected
    pub async fn serve(&self, listener: &TcpListener) -> Result<()> {
        *self.inner.state.lock() = GroupState::new(self.inner.expected_size);
        info!(addr = %listener.local_addr()?, expected_size = ?self.inner.expected_size, "hub accepting members");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    debug!(%peer, "connection accepted");
                    let hub = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = hub.handle_connection(stream, peer).await {
                            warn!(%peer, "connection ended with error: {}", e);
                        }
                    });
                }
                _ = self.inner.finished.notified() => {
                    let run_id = self.inner.state.lock().run_id.clone();
                    info!(run_id = %run_id, "group finished");
                    return Ok(());
                }
            }
        }
    }

    async fn handle_connection(self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.into_split();
        let (outbox, mut queue) = mpsc::unbounded_channel::<Frame>();

        // A fault is the last frame a member receives
        let writer_task = tokio::spawn(async move {
            while let Some(frame) = queue.recv().await {
                let last = matches!(frame.kind, Some(frame::Kind::Fault(_)));
                write_frame(&mut writer, &frame).await?;
                if last {
                    break;
                }
            }
            writer.shutdown().await
        });

        let first = read_frame(&mut reader).await?;
        let rank = match first {
            Some(Frame { kind: Some(frame::Kind::Join(join)) }) => {
                match self.register(join, outbox.clone()) {
                    Ok(rank) => rank,
                    Err(rejection) => {
                        warn!(%peer, "join refused: {}", rejection.message);
                        METRICS.hub.faults_total.inc();
                        let _ = outbox.send(rejection.into_frame());
                        drop(outbox);
                        let _ = writer_task.await;
                        return Ok(());
                    }
                }
            }
            Some(other) => {
                warn!(%peer, "expected join, got {}", other.name());
                METRICS.hub.faults_total.inc();
                let _ = outbox.send(Frame::fault(FaultKind::Protocol, "first frame must be a join"));
                drop(outbox);
                let _ = writer_task.await;
                return Ok(());
            }
            None => return Ok(()),
        };

        loop {
            match read_frame(&mut reader).await {
                Ok(Some(Frame { kind: Some(frame::Kind::Contribute(contribution)) })) => {
                    if let Err(rejection) = self.contribute(rank, contribution) {
                        warn!(rank, "contribution refused: {}", rejection.message);
                        METRICS.hub.faults_total.inc();
                        let _ = outbox.send(rejection.into_frame());
                        break;
                    }
                }
                Ok(Some(other)) => {
                    warn!(rank, "unexpected {} frame from member", other.name());
                    METRICS.hub.faults_total.inc();
                    let _ = outbox.send(Frame::fault(FaultKind::Protocol, "members may only contribute after joining"));
                    break;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(rank, "read from member failed: {}", e);
                    break;
                }
            }
        }

        self.depart(rank);
        drop(outbox);
        if let Ok(Err(e)) = writer_task.await {
            debug!(rank, "writer closed: {}", e);
        }
        Ok(())
    }

    fn register(&self, join: Join, outbox: mpsc::UnboundedSender<Frame>) -> std::result::Result<usize, Rejection> {
        let mut state = self.inner.state.lock();
        let rank = join.rank as usize;
        let size = join.size as usize;

        if state.welcomed {
            return Err(Rejection::new(
                FaultKind::Protocol,
                format!("a group of {} is already running", state.members.len()),
            ));
        }
        if size == 0 {
            return Err(Rejection::new(FaultKind::SizeMismatch, "group size must be at least 1"));
        }
        if let Some(current) = state.size.filter(|current| *current != size) {
            return Err(Rejection::new(
                FaultKind::SizeMismatch,
                format!("rank {} expects a group of {} but the hub is forming {}", rank, size, current),
            ));
        }
        if rank >= size {
            return Err(Rejection::new(
                FaultKind::SizeMismatch,
                format!("rank {} is out of range for a group of {}", rank, size),
            ));
        }
        if state.members.contains_key(&rank) {
            return Err(Rejection::new(
                FaultKind::DuplicateRank,
                format!("rank {} has already joined", rank),
            ));
        }

        // Only an accepted member pins the size of the forming group
        state.size = Some(size);
        info!(rank, size, host = %join.hostname, pid = join.pid, "member joined");
        state.members.insert(
            rank,
            MemberSlot {
                hostname: join.hostname,
                pid: join.pid,
                outbox,
            },
        );
        METRICS.hub.members_connected.inc();

        if state.members.len() == size {
            state.welcomed = true;
            state.run_id = uuid::Uuid::new_v4().to_string();

            let mut members: Vec<Member> = state
                .members
                .iter()
                .map(|(rank, slot)| Member {
                    rank: *rank as u32,
                    hostname: slot.hostname.clone(),
                    pid: slot.pid,
                })
                .collect();
            members.sort_by_key(|m| m.rank);

            info!(size, run_id = %state.run_id, "group formed");
            let welcome = Frame::welcome(size as u32, state.run_id.clone(), members);
            state.broadcast(&welcome);
        }

        Ok(rank)
    }

    fn contribute(&self, rank: usize, contribution: Contribute) -> std::result::Result<(), Rejection> {
        let mut state = self.inner.state.lock();
        let size = match state.size {
            Some(size) if state.welcomed => size,
            _ => {
                return Err(Rejection::new(
                    FaultKind::Protocol,
                    "contribution sent before the group formed",
                ))
            }
        };

        let seq = contribution.seq;
        let round = state.rounds.entry(seq).or_insert_with(|| Round::new(size));
        if round.contributed[rank] {
            return Err(Rejection::new(
                FaultKind::Protocol,
                format!("rank {} contributed twice to collective #{}", rank, seq),
            ));
        }
        round.contributed[rank] = true;
        round.count += 1;

        if round.count == 1 {
            round.sum = contribution.values;
        } else if round.mismatch.is_none() {
            if round.sum.len() == contribution.values.len() {
                for (acc, value) in round.sum.iter_mut().zip(&contribution.values) {
                    *acc += value;
                }
            } else {
                round.mismatch = Some(format!(
                    "collective #{}: rank {} sent {} values, expected {}",
                    seq,
                    rank,
                    contribution.values.len(),
                    round.sum.len()
                ));
            }
        }

        if round.count < size {
            return Ok(());
        }

        let Some(round) = state.rounds.remove(&seq) else {
            return Ok(());
        };
        match round.mismatch {
            Some(message) => {
                error!(seq, "{}", message);
                METRICS.hub.faults_total.inc();
                state.broadcast(&Frame::fault(FaultKind::ShapeMismatch, message));
            }
            None => {
                debug!(seq, len = round.sum.len(), "collective reduced");
                METRICS.hub.reductions_total.inc();
                state.broadcast(&Frame::reduced(seq, round.sum));
            }
        }
        Ok(())
    }

    fn depart(&self, rank: usize) {
        let mut state = self.inner.state.lock();
        if state.members.remove(&rank).is_none() {
            return;
        }
        METRICS.hub.members_connected.dec();

        if !state.welcomed {
            info!(rank, "member left before the group formed");
            if state.members.is_empty() {
                state.size = self.inner.expected_size;
            }
            return;
        }

        if state.members.is_empty() {
            self.inner.finished.notify_one();
        } else {
            warn!(
                rank,
                remaining = state.members.len(),
                "member disconnected; collectives waiting on it will not complete"
            );
        }
    }
}
