//! Fixed-size process group with barrier and broadcast.
//!
//! Lifecycle: `Uninitialized → Ready → TornDown`, or `Uninitialized → Failed`
//! when rendezvous does not complete. `initialize` is accepted exactly once;
//! `teardown` is accepted in every state.

use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use relay_types::config::{Backend, NodeConfig, PipelineConfig};
use relay_types::node::RankTopology;
use relay_types::pipeline::HostTensor;

use crate::codec::{FrameCodec, TensorFrame, WireMessage};
use crate::error::{NetError, Result};

/// Upper bound on each best-effort goodbye during teardown.
const GOODBYE_TIMEOUT: Duration = Duration::from_secs(1);

// ── Configuration ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct GroupConfig {
    pub topology: RankTopology,
    pub master_addr: String,
    pub master_port: u16,
    pub backend: Backend,
    pub rendezvous_timeout: Duration,
    pub collective_timeout: Duration,
    pub connect_retry: Duration,
}

impl GroupConfig {
    pub fn from_node(node: &NodeConfig, pipeline: &PipelineConfig) -> relay_types::Result<Self> {
        Ok(Self {
            topology: node.topology()?,
            master_addr: node.master_addr.clone(),
            master_port: node.master_port,
            backend: node.backend,
            rendezvous_timeout: Duration::from_secs(pipeline.rendezvous_timeout_secs),
            collective_timeout: Duration::from_secs(pipeline.collective_timeout_secs),
            connect_retry: Duration::from_millis(pipeline.connect_retry_ms),
        })
    }
}

// ── State ────────────────────────────────────────────────────────────────────

enum Links {
    /// World size 1: collectives are no-ops.
    Solo,
    /// Rank 0: one stream per other rank, indexed by rank (slot 0 unused).
    Hub { peers: Vec<Option<TcpStream>> },
    /// Any other rank: a single stream to rank 0.
    Spoke { hub: TcpStream },
}

enum GroupState {
    Uninitialized,
    Ready { links: Links, run_id: String },
    Failed,
    TornDown,
}

impl GroupState {
    fn name(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Ready { .. }  => "ready",
            Self::Failed        => "failed",
            Self::TornDown      => "torn down",
        }
    }
}

// ── Process Group ────────────────────────────────────────────────────────────

/// Handle to this rank's membership in a process group.
pub struct ProcessGroup {
    config: GroupConfig,
    codec: FrameCodec,
    state: GroupState,
    /// Number of collectives started so far; identical on every rank.
    seq: u64,
}

impl ProcessGroup {
    pub fn new(config: GroupConfig) -> Self {
        Self {
            config,
            codec: FrameCodec::default(),
            state: GroupState::Uninitialized,
            seq: 0,
        }
    }

    // ── Accessors ────────────────────────────────────────────────────────

    pub fn topology(&self) -> RankTopology {
        self.config.topology
    }

    pub fn rank(&self) -> u32 {
        self.config.topology.rank()
    }

    pub fn world_size(&self) -> u32 {
        self.config.topology.world_size()
    }

    /// True on rank 0, and on any rank before the group is up.
    pub fn is_master(&self) -> bool {
        !self.is_initialized() || self.rank() == 0
    }

    pub fn is_initialized(&self) -> bool {
        matches!(self.state, GroupState::Ready { .. })
    }

    /// Identifier chosen by rank 0 for this run, once initialized.
    pub fn run_id(&self) -> Option<&str> {
        match &self.state {
            GroupState::Ready { run_id, .. } => Some(run_id),
            _ => None,
        }
    }

    // ── Rendezvous ───────────────────────────────────────────────────────

    /// Join the group: rank 0 listens at the rendezvous address, every other
    /// rank connects to it. Blocks until all ranks arrived or the rendezvous
    /// timeout elapses.
    pub async fn initialize(&mut self) -> Result<()> {
        if !matches!(self.state, GroupState::Uninitialized) {
            return Err(NetError::AlreadyInitialized);
        }
        // Anything short of success leaves the group failed; teardown still works.
        self.state = GroupState::Failed;

        let topology = self.config.topology;
        debug!(backend = %self.config.backend, %topology, "initializing process group");
        let deadline = Instant::now() + self.config.rendezvous_timeout;

        let (links, run_id) = if topology.world_size() == 1 {
            (Links::Solo, Uuid::new_v4().to_string())
        } else if topology.is_first() {
            self.rendezvous_as_hub(deadline).await?
        } else {
            self.rendezvous_as_spoke(deadline).await?
        };

        info!(
            rank = topology.rank(),
            world_size = topology.world_size(),
            %run_id,
            "process group initialized"
        );
        self.state = GroupState::Ready { links, run_id };
        Ok(())
    }

    async fn rendezvous_as_hub(&self, deadline: Instant) -> Result<(Links, String)> {
        let world_size = self.world_size();
        let addr = (self.config.master_addr.as_str(), self.config.master_port);
        let listener = TcpListener::bind(addr).await?;
        info!(
            addr = %self.config.master_addr,
            port = self.config.master_port,
            "rendezvous master listening"
        );

        let mut peers: Vec<Option<TcpStream>> = (0..world_size).map(|_| None).collect();
        let mut joined = 1u32;
        let timed_out = |joined| NetError::RendezvousTimeout {
            waited: self.config.rendezvous_timeout,
            joined,
            expected: world_size,
        };

        while joined < world_size {
            let (mut stream, peer_addr) = match timeout_at(deadline, listener.accept()).await {
                Ok(accepted) => accepted?,
                Err(_) => return Err(timed_out(joined)),
            };
            stream.set_nodelay(true)?;

            let hello = match timeout_at(deadline, self.codec.read_message(&mut stream)).await {
                Ok(Ok(msg)) => msg,
                Ok(Err(e)) => {
                    warn!(%peer_addr, %e, "dropping connection with unreadable handshake");
                    continue;
                }
                Err(_) => return Err(timed_out(joined)),
            };

            let WireMessage::Hello { rank, world_size: theirs } = hello else {
                warn!(%peer_addr, kind = hello.kind(), "expected Hello, dropping connection");
                continue;
            };

            let rejection = if theirs != world_size {
                Some(format!("world_size {theirs} does not match master's {world_size}"))
            } else if rank == 0 || rank >= world_size {
                Some(format!("rank {rank} is not a valid joining rank"))
            } else if peers[rank as usize].is_some() {
                Some(format!("rank {rank} already joined"))
            } else {
                None
            };

            if let Some(reason) = rejection {
                warn!(%peer_addr, rank, %reason, "rejecting rank");
                let _ = self
                    .codec
                    .write_message(&mut stream, &WireMessage::Reject { reason })
                    .await;
                continue;
            }

            info!(%peer_addr, rank, "rank joined");
            peers[rank as usize] = Some(stream);
            joined += 1;
        }

        let run_id = Uuid::new_v4().to_string();
        let welcome = self.codec.encode(&WireMessage::Welcome {
            run_id: run_id.clone(),
        })?;
        for stream in peers.iter_mut().flatten() {
            match timeout_at(deadline, self.codec.write_frame(stream, &welcome)).await {
                Ok(written) => written?,
                Err(_) => return Err(timed_out(joined)),
            }
        }

        Ok((Links::Hub { peers }, run_id))
    }

    async fn rendezvous_as_spoke(&self, deadline: Instant) -> Result<(Links, String)> {
        let topology = self.config.topology;
        let addr = (self.config.master_addr.as_str(), self.config.master_port);
        let timed_out = || NetError::RendezvousTimeout {
            waited: self.config.rendezvous_timeout,
            joined: 0,
            expected: topology.world_size(),
        };

        let mut stream = loop {
            match timeout_at(deadline, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => break stream,
                Ok(Err(e)) => debug!(%e, "rendezvous master not reachable yet"),
                Err(_) => return Err(timed_out()),
            }
            if Instant::now() + self.config.connect_retry >= deadline {
                return Err(timed_out());
            }
            tokio::time::sleep(self.config.connect_retry).await;
        };
        stream.set_nodelay(true)?;

        let hello = WireMessage::Hello {
            rank: topology.rank(),
            world_size: topology.world_size(),
        };
        match timeout_at(deadline, self.codec.write_message(&mut stream, &hello)).await {
            Ok(written) => written?,
            Err(_) => return Err(timed_out()),
        }
        debug!(rank = topology.rank(), "sent Hello, waiting for the remaining ranks");

        match timeout_at(deadline, self.codec.read_message(&mut stream)).await {
            Err(_) => Err(timed_out()),
            Ok(Err(e)) => Err(e),
            Ok(Ok(WireMessage::Welcome { run_id })) => Ok((Links::Spoke { hub: stream }, run_id)),
            Ok(Ok(WireMessage::Reject { reason })) => {
                Err(NetError::Protocol(format!("rendezvous rejected: {reason}")))
            }
            Ok(Ok(other)) => Err(NetError::Protocol(format!(
                "expected Welcome during rendezvous, got {}",
                other.kind()
            ))),
        }
    }

    // ── Collectives ──────────────────────────────────────────────────────

    /// Block until every rank has entered this barrier.
    pub async fn barrier(&mut self) -> Result<()> {
        let seq = self.next_seq();
        let codec = self.codec;
        let deadline = Deadline::after(self.config.collective_timeout, "barrier");

        match ready_links(&mut self.state)? {
            Links::Solo => {}
            Links::Hub { peers } => {
                for (rank, stream) in peers.iter_mut().enumerate() {
                    let Some(stream) = stream else { continue };
                    let msg = receive(codec, stream, deadline, rank as u32).await?;
                    expect_barrier(&msg, seq)?;
                }
                let release = codec.encode(&WireMessage::Release { seq })?;
                for (rank, stream) in peers.iter_mut().enumerate() {
                    let Some(stream) = stream else { continue };
                    send_raw(codec, stream, &release, deadline, rank as u32).await?;
                }
            }
            Links::Spoke { hub } => {
                let token = codec.encode(&WireMessage::Barrier { seq })?;
                send_raw(codec, hub, &token, deadline, 0).await?;
                match receive(codec, hub, deadline, 0).await? {
                    WireMessage::Release { seq: s } if s == seq => {}
                    other => return Err(unexpected("Release", seq, &other)),
                }
            }
        }

        debug!(rank = self.rank(), seq, "barrier passed");
        Ok(())
    }

    /// Copy `source`'s tensor into every rank's `tensor`.
    ///
    /// On `source` the buffer is read; on every other rank it must already
    /// have the sender's exact shape and dtype and is overwritten in place.
    pub async fn broadcast(&mut self, tensor: &mut HostTensor, source: u32) -> Result<()> {
        let world_size = self.world_size();
        if source >= world_size {
            return Err(NetError::InvalidSource { requested: source, world_size });
        }
        if !tensor.is_consistent() {
            return Err(NetError::Protocol(format!(
                "buffer holds {} bytes but shape {:?} of {} needs {}",
                tensor.data.len(),
                tensor.shape,
                tensor.dtype,
                tensor.element_count() * tensor.dtype.element_bytes()
            )));
        }

        let seq = self.next_seq();
        let me = self.rank();
        let codec = self.codec;
        let deadline = Deadline::after(self.config.collective_timeout, "broadcast");

        match ready_links(&mut self.state)? {
            Links::Solo => {}
            Links::Hub { peers } if me == source => {
                let frame = codec.encode(&WireMessage::Tensor(TensorFrame {
                    seq,
                    source_rank: source,
                    tensor: tensor.clone(),
                }))?;
                for (rank, stream) in peers.iter_mut().enumerate() {
                    let Some(stream) = stream else { continue };
                    send_raw(codec, stream, &frame, deadline, rank as u32).await?;
                }
            }
            Links::Hub { peers } => {
                let upstream = peers
                    .get_mut(source as usize)
                    .and_then(Option::as_mut)
                    .ok_or_else(|| NetError::Protocol(format!("no link to rank {source}")))?;
                let raw = receive_raw(codec, upstream, deadline, source).await?;
                let received = expect_tensor(codec.decode(&raw)?, seq, source)?;

                // Relay first so downstream ranks are never left waiting on us.
                for (rank, stream) in peers.iter_mut().enumerate() {
                    if rank as u32 == source {
                        continue;
                    }
                    if let Some(stream) = stream {
                        send_raw(codec, stream, &raw, deadline, rank as u32).await?;
                    }
                }
                adopt(tensor, received)?;
            }
            Links::Spoke { hub } if me == source => {
                let frame = codec.encode(&WireMessage::Tensor(TensorFrame {
                    seq,
                    source_rank: source,
                    tensor: tensor.clone(),
                }))?;
                send_raw(codec, hub, &frame, deadline, 0).await?;
            }
            Links::Spoke { hub } => {
                let msg = receive(codec, hub, deadline, 0).await?;
                adopt(tensor, expect_tensor(msg, seq, source)?)?;
            }
        }

        debug!(rank = me, source, seq, shape = ?tensor.shape, "broadcast complete");
        Ok(())
    }

    // ── Teardown ─────────────────────────────────────────────────────────

    /// Leave the group. Best effort: peers are told we are leaving, errors
    /// are logged and swallowed. Safe to call in any state, repeatedly.
    pub async fn teardown(&mut self) {
        let previous = std::mem::replace(&mut self.state, GroupState::TornDown);
        let rank = self.rank();

        let streams: Vec<TcpStream> = match previous {
            GroupState::Ready { links: Links::Hub { peers }, .. } => {
                peers.into_iter().flatten().collect()
            }
            GroupState::Ready { links: Links::Spoke { hub }, .. } => vec![hub],
            GroupState::Ready { links: Links::Solo, .. } => Vec::new(),
            other => {
                debug!(rank, state = other.name(), "teardown without live links");
                return;
            }
        };

        let goodbye = match self.codec.encode(&WireMessage::Goodbye { rank }) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(rank, %e, "cannot encode Goodbye, closing links silently");
                return;
            }
        };

        for mut stream in streams {
            match timeout(GOODBYE_TIMEOUT, self.codec.write_frame(&mut stream, &goodbye)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(rank, %e, "peer already gone"),
                Err(_) => debug!(rank, "goodbye timed out"),
            }
            let _ = stream.shutdown().await;
        }

        info!(rank, "process group torn down");
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn ready_links(state: &mut GroupState) -> Result<&mut Links> {
    match state {
        GroupState::Ready { links, .. } => Ok(links),
        _ => Err(NetError::NotInitialized),
    }
}

/// One deadline shared by every read and write of a collective.
#[derive(Debug, Clone, Copy)]
struct Deadline {
    at: Instant,
    budget: Duration,
    op: &'static str,
}

impl Deadline {
    fn after(budget: Duration, op: &'static str) -> Self {
        Self { at: Instant::now() + budget, budget, op }
    }

    fn expired(&self, peer: u32) -> NetError {
        NetError::CollectiveTimeout { op: self.op, peer, after: self.budget }
    }
}

async fn send_raw(
    codec: FrameCodec,
    stream: &mut TcpStream,
    payload: &[u8],
    deadline: Deadline,
    peer: u32,
) -> Result<()> {
    match timeout_at(deadline.at, codec.write_frame(stream, payload)).await {
        Err(_) => Err(deadline.expired(peer)),
        Ok(result) => result,
    }
}

async fn receive_raw(
    codec: FrameCodec,
    stream: &mut TcpStream,
    deadline: Deadline,
    peer: u32,
) -> Result<Vec<u8>> {
    match timeout_at(deadline.at, codec.read_frame(stream)).await {
        Err(_) => Err(deadline.expired(peer)),
        Ok(Err(NetError::Io(e))) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(NetError::PeerLeft(peer))
        }
        Ok(result) => result,
    }
}

async fn receive(
    codec: FrameCodec,
    stream: &mut TcpStream,
    deadline: Deadline,
    peer: u32,
) -> Result<WireMessage> {
    let raw = receive_raw(codec, stream, deadline, peer).await?;
    match codec.decode(&raw)? {
        WireMessage::Goodbye { rank } => Err(NetError::PeerLeft(rank)),
        msg => Ok(msg),
    }
}

fn unexpected(wanted: &str, seq: u64, got: &WireMessage) -> NetError {
    NetError::Protocol(format!("expected {wanted} #{seq}, got {}", got.kind()))
}

fn expect_barrier(msg: &WireMessage, seq: u64) -> Result<()> {
    match msg {
        WireMessage::Barrier { seq: s } if *s == seq => Ok(()),
        other => Err(unexpected("Barrier", seq, other)),
    }
}

fn expect_tensor(msg: WireMessage, seq: u64, source: u32) -> Result<HostTensor> {
    match msg {
        WireMessage::Tensor(frame) if frame.seq == seq && frame.source_rank == source => {
            Ok(frame.tensor)
        }
        WireMessage::Goodbye { rank } => Err(NetError::PeerLeft(rank)),
        other => Err(unexpected("Tensor", seq, &other)),
    }
}

/// Overwrite `buffer` with `received` after checking they agree in kind.
fn adopt(buffer: &mut HostTensor, received: HostTensor) -> Result<()> {
    if buffer.shape != received.shape || buffer.dtype != received.dtype {
        return Err(NetError::CollectiveShapeMismatch {
            expected_shape: buffer.shape.clone(),
            expected_dtype: buffer.dtype,
            got_shape: received.shape,
            got_dtype: received.dtype,
        });
    }
    if !received.is_consistent() {
        return Err(NetError::Protocol(format!(
            "received {} bytes for shape {:?} of {}",
            received.data.len(),
            received.shape,
            received.dtype
        )));
    }
    buffer.data = received.data;
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
