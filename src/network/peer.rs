#![forbid(unsafe_code)]

//! Per-peer protocol driver: hello exchange, request correlation and the
//! block synchronization walk. Each connection runs one read task and one
//! write task; outbound requests park a oneshot waiter keyed by `req_id`
//! and time out by closing the peer.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use super::protocol::{
    self, BlocksPayload, Frame, FrameCodec, FrameKind, GetBlocksRequest, Hello, ERR_BAD_REQUEST,
    OP_ERROR, OP_GET_BLOCKS, OP_HELLO, OP_NEW_BLOCK, OP_NEW_OPERATIONS,
};
use super::AddressBook;
use crate::block::Block;
use crate::blockchain::{AddBlockResult, ChainHandle};
use crate::core::now_ts;
use crate::defaults::{SYNC_WINDOW, TIMEOUT_IDLE, TIMEOUT_REQUEST, USER_AGENT};

const OUTBOUND_QUEUE: usize = 32;
const HELLO_PEERS_LIMIT: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerState {
    HelloSent,
    Ready,
    Closed,
}

/// What the peer told us about itself in its hello.
#[derive(Clone, Debug)]
pub struct RemoteInfo {
    pub listen_port: u16,
    pub height: u32,
    pub safebox_hash: crate::core::Hash32,
    pub cumulative_difficulty: num_bigint::BigUint,
}

struct PeerShared {
    state: Mutex<PeerState>,
    pending: Mutex<HashMap<u32, oneshot::Sender<Frame>>>,
    next_req_id: AtomicU32,
    remote: Mutex<Option<RemoteInfo>>,
    closed: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct PeerHandle {
    pub addr: SocketAddr,
    pub direction: Direction,
    out: mpsc::Sender<Frame>,
    shared: Arc<PeerShared>,
}

impl PeerHandle {
    pub fn state(&self) -> PeerState {
        *self.shared.state.lock().expect("peer state lock")
    }

    pub fn remote(&self) -> Option<RemoteInfo> {
        self.shared.remote.lock().expect("peer remote lock").clone()
    }

    fn set_state(&self, state: PeerState) {
        *self.shared.state.lock().expect("peer state lock") = state;
    }

    /// Marks the peer closed and wakes both connection tasks.
    pub fn close(&self) {
        self.set_state(PeerState::Closed);
        let _ = self.shared.closed.send(true);
    }

    async fn send(&self, frame: Frame) -> Result<()> {
        self.out
            .send(frame)
            .await
            .map_err(|_| anyhow!("peer write queue closed"))
    }

    /// Sends a request and waits for the correlated response. A timeout
    /// closes the peer, per protocol policy.
    pub async fn request(&self, op: u16, payload: Vec<u8>) -> Result<Frame> {
        let req_id = self.shared.next_req_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .expect("peer pending lock")
            .insert(req_id, tx);
        self.send(Frame::request(op, req_id, payload)).await?;

        match tokio::time::timeout(TIMEOUT_REQUEST, rx).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => bail!("peer {} closed while request pending", self.addr),
            Err(_) => {
                self.shared
                    .pending
                    .lock()
                    .expect("peer pending lock")
                    .remove(&req_id);
                self.close();
                bail!("request {req_id} to {} timed out", self.addr)
            }
        }
    }

    fn deliver_response(&self, frame: Frame) {
        let waiter = self
            .shared
            .pending
            .lock()
            .expect("peer pending lock")
            .remove(&frame.req_id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(frame);
            }
            None => debug!(peer = %self.addr, req_id = frame.req_id, "response without a waiter"),
        }
    }
}

/// Drives the PASL protocol for every connection handed over by the node.
pub struct PeerManager {
    nonce: Vec<u8>,
    listen_port: u16,
    chain: ChainHandle,
    address_book: Arc<Mutex<AddressBook>>,
    peers: Arc<Mutex<HashMap<SocketAddr, PeerHandle>>>,
}

impl PeerManager {
    pub fn new(
        nonce: Vec<u8>,
        listen_port: u16,
        chain: ChainHandle,
        address_book: Arc<Mutex<AddressBook>>,
    ) -> Arc<Self> {
        Arc::new(PeerManager {
            nonce,
            listen_port,
            chain,
            address_book,
            peers: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn peer_count(&self, direction: Direction) -> usize {
        self.peers
            .lock()
            .expect("peer table lock")
            .values()
            .filter(|peer| peer.direction == direction && peer.state() != PeerState::Closed)
            .count()
    }

    pub fn is_connected(&self, addr: &SocketAddr) -> bool {
        self.peers.lock().expect("peer table lock").contains_key(addr)
    }

    /// Registers a fresh TCP connection and spawns its read/write tasks.
    pub fn on_new_connection(
        self: &Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
        direction: Direction,
    ) {
        let (sink, mut frames) = Framed::new(stream, FrameCodec).split();
        let (out_tx, mut out_rx) = mpsc::channel::<Frame>(OUTBOUND_QUEUE);
        let (closed_tx, closed_rx) = watch::channel(false);
        let handle = PeerHandle {
            addr,
            direction,
            out: out_tx,
            shared: Arc::new(PeerShared {
                state: Mutex::new(PeerState::HelloSent),
                pending: Mutex::new(HashMap::new()),
                next_req_id: AtomicU32::new(0),
                remote: Mutex::new(None),
                closed: closed_tx,
            }),
        };
        self.peers
            .lock()
            .expect("peer table lock")
            .insert(addr, handle.clone());
        info!(peer = %addr, ?direction, "peer connected");

        // write task: serializes all outbound frames for this peer
        let mut write_closed = closed_rx.clone();
        tokio::spawn(async move {
            let mut sink = sink;
            loop {
                tokio::select! {
                    frame = out_rx.recv() => match frame {
                        Some(frame) => {
                            if let Err(err) = sink.send(frame).await {
                                debug!(peer = %addr, "write failed: {err}");
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = write_closed.changed() => break,
                }
            }
        });

        // read task: drives the whole per-peer protocol
        let manager = Arc::clone(self);
        let peer = handle.clone();
        let mut read_closed = closed_rx;
        tokio::spawn(async move {
            if let Err(err) = manager.send_hello(&peer).await {
                warn!(peer = %addr, "hello failed: {err:#}");
                manager.drop_peer(&peer);
                return;
            }
            loop {
                let frame = tokio::select! {
                    frame = tokio::time::timeout(TIMEOUT_IDLE, frames.next()) => frame,
                    _ = read_closed.changed() => break,
                };
                match frame {
                    Ok(Some(Ok(frame))) => {
                        if let Err(err) = manager.handle_frame(&peer, frame).await {
                            warn!(peer = %addr, "peer error: {err:#}");
                            // best-effort error report before closing
                            let _ = peer
                                .send(Frame::auto(OP_ERROR, err.to_string().into_bytes()))
                                .await;
                            break;
                        }
                        if peer.state() == PeerState::Closed {
                            break;
                        }
                    }
                    Ok(Some(Err(err))) => {
                        warn!(peer = %addr, "protocol error: {err}");
                        break;
                    }
                    Ok(None) => break,
                    Err(_) => {
                        debug!(peer = %addr, "idle timeout");
                        break;
                    }
                }
            }
            manager.drop_peer(&peer);
        });
    }

    fn drop_peer(&self, peer: &PeerHandle) {
        peer.close();
        self.peers
            .lock()
            .expect("peer table lock")
            .remove(&peer.addr);
        info!(peer = %peer.addr, "peer disconnected");
    }

    async fn local_hello(&self) -> Result<Hello> {
        let state = self.chain.get_state().await?;
        let peers = self
            .address_book
            .lock()
            .expect("address book lock")
            .sample(HELLO_PEERS_LIMIT);
        Ok(Hello {
            listen_port: self.listen_port,
            nonce: self.nonce.clone(),
            height: state.height,
            safebox_hash: state.safebox_hash,
            cumulative_difficulty: state.cumulative_difficulty,
            timestamp: now_ts(),
            user_agent: USER_AGENT.to_string(),
            peers,
        })
    }

    async fn send_hello(self: &Arc<Self>, peer: &PeerHandle) -> Result<()> {
        let hello = self.local_hello().await?;
        let manager = Arc::clone(self);
        let peer = peer.clone();
        let payload = hello.serialize();
        tokio::spawn(async move {
            match peer.request(OP_HELLO, payload).await {
                Ok(frame) => {
                    let mut buf = frame.payload.as_slice();
                    match Hello::deserialize(&mut buf) {
                        Ok(hello) => {
                            if let Err(err) = manager.register_hello(&peer, hello).await {
                                warn!(peer = %peer.addr, "hello rejected: {err:#}");
                                manager.drop_peer(&peer);
                            }
                        }
                        Err(err) => {
                            warn!(peer = %peer.addr, "malformed hello response: {err}");
                            manager.drop_peer(&peer);
                        }
                    }
                }
                Err(err) => {
                    debug!(peer = %peer.addr, "hello request failed: {err:#}");
                    manager.drop_peer(&peer);
                }
            }
        });
        Ok(())
    }

    /// Absorbs a peer's hello: self-connection guard, address exchange,
    /// state transition, and a sync kick if the peer is ahead.
    async fn register_hello(self: &Arc<Self>, peer: &PeerHandle, hello: Hello) -> Result<()> {
        if hello.nonce == self.nonce {
            bail!("connected to ourselves");
        }
        {
            let mut book = self.address_book.lock().expect("address book lock");
            book.merge_advertised(&hello.peers);
            book.note_seen(peer.addr.ip(), hello.listen_port);
        }
        let remote = RemoteInfo {
            listen_port: hello.listen_port,
            height: hello.height,
            safebox_hash: hello.safebox_hash,
            cumulative_difficulty: hello.cumulative_difficulty,
        };
        let already_ready = peer.state() == PeerState::Ready;
        *peer.shared.remote.lock().expect("peer remote lock") = Some(remote.clone());
        if already_ready {
            // both sides said hello; keep the fresher chain state only
            return Ok(());
        }
        peer.set_state(PeerState::Ready);
        debug!(peer = %peer.addr, height = remote.height, "peer ready");

        let manager = Arc::clone(self);
        let peer = peer.clone();
        tokio::spawn(async move {
            if let Err(err) = manager.sync_with(&peer, remote).await {
                warn!(peer = %peer.addr, "sync aborted: {err:#}");
                manager.drop_peer(&peer);
            }
        });
        Ok(())
    }

    async fn handle_frame(self: &Arc<Self>, peer: &PeerHandle, frame: Frame) -> Result<()> {
        match frame.kind {
            FrameKind::Response => {
                peer.deliver_response(frame);
                Ok(())
            }
            FrameKind::Request => self.handle_request(peer, frame).await,
            FrameKind::Auto => self.handle_auto(peer, frame).await,
        }
    }

    async fn handle_request(self: &Arc<Self>, peer: &PeerHandle, frame: Frame) -> Result<()> {
        match frame.op {
            OP_HELLO => {
                let mut buf = frame.payload.as_slice();
                let hello = Hello::deserialize(&mut buf).context("malformed hello")?;
                let reply = self.local_hello().await?.serialize();
                peer.send(Frame::response(OP_HELLO, frame.req_id, reply)).await?;
                self.register_hello(peer, hello).await
            }
            OP_GET_BLOCKS => {
                let mut buf = frame.payload.as_slice();
                let request =
                    GetBlocksRequest::deserialize(&mut buf).context("malformed get_blocks")?;
                if request.to < request.from
                    || request.to - request.from >= SYNC_WINDOW
                {
                    peer.send(Frame::error_response(
                        OP_GET_BLOCKS,
                        frame.req_id,
                        ERR_BAD_REQUEST,
                    ))
                    .await?;
                    return Ok(());
                }
                let mut payload = BlocksPayload::default();
                for index in request.from..=request.to {
                    match self.chain.get_block(index).await? {
                        Some(data) => payload.blocks.push(data),
                        None => break,
                    }
                }
                peer.send(Frame::response(
                    OP_GET_BLOCKS,
                    frame.req_id,
                    payload.serialize(),
                ))
                .await
            }
            other => {
                debug!(peer = %peer.addr, op = other, "unknown request op");
                peer.send(Frame::error_response(other, frame.req_id, ERR_BAD_REQUEST))
                    .await
            }
        }
    }

    async fn handle_auto(self: &Arc<Self>, peer: &PeerHandle, frame: Frame) -> Result<()> {
        match frame.op {
            OP_NEW_BLOCK => {
                match self.chain.add_block_serialized(frame.payload).await? {
                    AddBlockResult::Accepted => {}
                    AddBlockResult::Duplicate => {}
                    AddBlockResult::Orphan => {
                        // the peer is ahead of us; catch up
                        if let Some(remote) = peer.remote() {
                            let manager = Arc::clone(self);
                            let peer = peer.clone();
                            tokio::spawn(async move {
                                if let Err(err) = manager.sync_with(&peer, remote).await {
                                    debug!(peer = %peer.addr, "catch-up failed: {err:#}");
                                }
                            });
                        }
                    }
                    AddBlockResult::Invalid(reason) => bail!("invalid gossiped block: {reason}"),
                }
                Ok(())
            }
            OP_NEW_OPERATIONS => {
                let mut buf = frame.payload.as_slice();
                let operations =
                    protocol::deserialize_operations(&mut buf).context("malformed operations")?;
                for result in self.chain.add_operations(operations).await? {
                    if let Err(reason) = result {
                        debug!(peer = %peer.addr, "operation not admitted: {reason}");
                    }
                }
                Ok(())
            }
            OP_ERROR => {
                warn!(
                    peer = %peer.addr,
                    "peer reported error: {}",
                    String::from_utf8_lossy(&frame.payload)
                );
                peer.close();
                Ok(())
            }
            other => {
                debug!(peer = %peer.addr, op = other, "unknown auto op");
                Ok(())
            }
        }
    }

    async fn fetch_blocks(&self, peer: &PeerHandle, from: u32, to: u32) -> Result<Vec<Vec<u8>>> {
        let request = GetBlocksRequest { from, to };
        let frame = peer.request(OP_GET_BLOCKS, request.serialize()).await?;
        if frame.err_code != protocol::ERR_NONE {
            bail!("peer rejected get_blocks with code {}", frame.err_code);
        }
        let mut buf = frame.payload.as_slice();
        Ok(BlocksPayload::deserialize(&mut buf)
            .context("malformed blocks response")?
            .blocks)
    }

    /// Header of the peer's block at `index`, for ancestor probing.
    async fn fetch_header(&self, peer: &PeerHandle, index: u32) -> Result<Block> {
        let blocks = self.fetch_blocks(peer, index, index).await?;
        let data = blocks
            .first()
            .ok_or_else(|| anyhow!("peer has no block {index}"))?;
        let mut buf = data.as_slice();
        Block::deserialize(&mut buf).map_err(|err| anyhow!("peer block {index}: {err}"))
    }

    fn local_header(&self, data: Option<Vec<u8>>, index: u32) -> Result<Block> {
        let data = data.ok_or_else(|| anyhow!("missing local block {index}"))?;
        let mut buf = data.as_slice();
        Block::deserialize(&mut buf).map_err(|err| anyhow!("stored block {index}: {err}"))
    }

    /// Sync algorithm: if the peer has more cumulative work, pull blocks
    /// forward in windows; on a fingerprint mismatch at our height, walk
    /// backward by halving to a common ancestor and reorg from there.
    async fn sync_with(&self, peer: &PeerHandle, remote: RemoteInfo) -> Result<()> {
        let local = self.chain.get_state().await?;
        if remote.cumulative_difficulty <= local.cumulative_difficulty {
            return Ok(());
        }

        let diverged = if local.height == 0 {
            false
        } else if remote.height <= local.height {
            // more work on a shorter chain means we are on the wrong branch
            true
        } else {
            let probe = self.fetch_header(peer, local.height).await?;
            probe.header.prev_safebox_hash != local.safebox_hash
        };

        if !diverged {
            info!(peer = %peer.addr, from = local.height, to = remote.height, "syncing");
            let mut next = local.height;
            while next < remote.height {
                let to = remote.height.min(next + SYNC_WINDOW) - 1;
                let blocks = self.fetch_blocks(peer, next, to).await?;
                if blocks.is_empty() {
                    bail!("peer returned no blocks for {next}..={to}");
                }
                for data in blocks {
                    match self.chain.add_block_serialized(data).await? {
                        AddBlockResult::Accepted | AddBlockResult::Duplicate => {}
                        AddBlockResult::Orphan => bail!("peer sent blocks out of order"),
                        AddBlockResult::Invalid(reason) => bail!("invalid block: {reason}"),
                    }
                }
                let state = self.chain.get_state().await?;
                if state.height <= next {
                    bail!("sync made no progress at height {next}");
                }
                next = state.height;
            }
            return Ok(());
        }

        // divergence: find the greatest height where both chains agree
        let mut step = 1u32;
        let mut probe = local.height.min(remote.height);
        let mut ancestor = 0u32;
        while probe > 0 {
            probe = probe.saturating_sub(step);
            step = step.saturating_mul(2);
            let theirs = self.fetch_header(peer, probe).await?;
            let ours = self.local_header(self.chain.get_block(probe).await?, probe)?;
            if theirs.header.prev_safebox_hash == ours.header.prev_safebox_hash {
                ancestor = probe;
                break;
            }
        }
        info!(peer = %peer.addr, ancestor, "chain divergence, fetching branch");

        let mut branch = Vec::new();
        let mut next = ancestor;
        while next < remote.height {
            let to = remote.height.min(next + SYNC_WINDOW) - 1;
            let blocks = self.fetch_blocks(peer, next, to).await?;
            if blocks.is_empty() {
                bail!("peer returned no blocks for {next}..={to}");
            }
            for data in blocks {
                let mut buf = data.as_slice();
                branch.push(
                    Block::deserialize(&mut buf).map_err(|err| anyhow!("branch block: {err}"))?,
                );
            }
            next = ancestor + branch.len() as u32;
        }
        match self.chain.add_alt_chain(ancestor, branch).await? {
            AddBlockResult::Accepted => Ok(()),
            AddBlockResult::Duplicate | AddBlockResult::Orphan => Ok(()),
            AddBlockResult::Invalid(reason) => bail!("branch rejected: {reason}"),
        }
    }

    /// Fans chain updates out to every ready peer as fire-and-forget
    /// `Auto` frames. Lagged subscribers drop the oldest events.
    pub fn spawn_gossip(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        let mut blocks = self.chain.subscribe_blocks();
        let mut txpool = self.chain.subscribe_txpool();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    update = blocks.recv() => match update {
                        Ok(update) => {
                            let payload = update.block.serialize();
                            manager.broadcast(Frame::auto(OP_NEW_BLOCK, payload));
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "gossip lagged behind block updates");
                        }
                        Err(_) => break,
                    },
                    update = txpool.recv() => match update {
                        Ok(update) => {
                            let payload =
                                protocol::serialize_operations(&[(*update.operation).clone()]);
                            manager.broadcast(Frame::auto(OP_NEW_OPERATIONS, payload));
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "gossip lagged behind txpool updates");
                        }
                        Err(_) => break,
                    },
                }
            }
        })
    }

    /// Fire-and-forget: a peer with a full write queue misses the frame
    /// rather than stalling the fan-out.
    fn broadcast(&self, frame: Frame) {
        let peers: Vec<PeerHandle> = {
            self.peers
                .lock()
                .expect("peer table lock")
                .values()
                .filter(|peer| peer.state() == PeerState::Ready)
                .cloned()
                .collect()
        };
        for peer in peers {
            if peer.out.try_send(frame.clone()).is_err() {
                debug!(peer = %peer.addr, "broadcast dropped for slow peer");
            }
        }
    }

    /// Closes every peer, used during shutdown.
    pub fn close_all(&self) {
        let peers: Vec<PeerHandle> = self
            .peers
            .lock()
            .expect("peer table lock")
            .values()
            .cloned()
            .collect();
        for peer in peers {
            peer.close();
        }
    }
}
