//! The chunk pool: queueing, paced dispatch, timeout recovery, and response
//! handling for ledger chunk requests.
//!
//! ## Concurrency
//!
//! Two long-lived tasks run between [`ChunkPool::start`] and
//! [`ChunkPool::stop`]: the dispatch loop draining the pending queue, and the
//! timeout loop sweeping the in-flight map. Inbound responses arrive on the
//! network layer's task through [`ChunkPool::handle`], which never suspends.
//! The queue and the in-flight map each sit behind their own mutex; `target`
//! and the gate are plain atomics because their readers only need advisory
//! values.
//!
//! A timeout-driven retry can race a late response for the same chunk.
//! Whichever path observes the chunk still pending acts on it; the loser
//! finds the chunk completed or re-armed and backs off.

use crate::chunk::{split_chunks, ChunkRequest, ChunkState};
use crate::message::{Cmd, GetChunk, Message, SubLedger, WireError};
use crate::peer::{BlockReceiver, IdSource, Peer, PeerSelector};
use crate::{
    DEFAULT_CHUNK_TIMEOUT_SECS, DEFAULT_DISPATCH_TICK_MS, DEFAULT_GATE_MARGIN,
    DEFAULT_MAX_INFLIGHT,
};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Tuning knobs for the chunk pool.
#[derive(Debug, Clone)]
pub struct ChunkPoolConfig {
    /// Deadline granted to each in-flight request
    pub chunk_timeout: Duration,
    /// Pace of the queue-draining loop
    pub dispatch_tick: Duration,
    /// Height window within which the dispatch gate stays open
    pub gate_margin: u64,
    /// Bound on chunks concurrently drawn from the queue
    pub max_inflight: usize,
}

impl Default for ChunkPoolConfig {
    fn default() -> Self {
        Self {
            chunk_timeout: Duration::from_secs(DEFAULT_CHUNK_TIMEOUT_SECS),
            dispatch_tick: Duration::from_millis(DEFAULT_DISPATCH_TICK_MS),
            gate_margin: DEFAULT_GATE_MARGIN,
            max_inflight: DEFAULT_MAX_INFLIGHT,
        }
    }
}

/// Coordinator for fetching ledger chunks from remote peers.
///
/// See the crate docs for the protocol flow. All methods take `&self`; the
/// pool is meant to be shared behind an `Arc` between the network layer and
/// the ledger pipeline.
pub struct ChunkPool<S, R> {
    shared: Arc<Shared<S, R>>,
    term: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// State shared with the spawned loops.
struct Shared<S, R> {
    config: ChunkPoolConfig,
    selector: Arc<S>,
    receiver: Arc<R>,
    ids: Arc<dyn IdSource>,
    /// Chunks awaiting dispatch, in enqueue order.
    queue: Mutex<VecDeque<ChunkRequest>>,
    /// Chunks dispatched and not yet completed or abandoned, by id.
    inflight: Mutex<HashMap<u64, ChunkRequest>>,
    /// Highest height ever dispatched; never decreases.
    target: AtomicU64,
    /// Whether the dispatch loop may draw from the queue.
    gate: AtomicBool,
}

impl<S, R> ChunkPool<S, R>
where
    S: PeerSelector + 'static,
    R: BlockReceiver + 'static,
{
    /// Creates a pool. No task runs until [`start`](Self::start).
    pub fn new(
        config: ChunkPoolConfig,
        selector: Arc<S>,
        receiver: Arc<R>,
        ids: Arc<dyn IdSource>,
    ) -> Self {
        let (term, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                config,
                selector,
                receiver,
                ids,
                queue: Mutex::new(VecDeque::new()),
                inflight: Mutex::new(HashMap::new()),
                target: AtomicU64::new(0),
                gate: AtomicBool::new(false),
            }),
            term,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Name under which the inbound dispatcher registers this handler.
    pub fn name(&self) -> &'static str {
        "chunk pool"
    }

    /// Command codes this handler consumes.
    pub fn cmds(&self) -> &'static [Cmd] {
        &[Cmd::SubLedger]
    }

    /// Spawns the dispatch and timeout loops. Does nothing if already
    /// running.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }

        self.term.send_replace(false);
        tasks.push(tokio::spawn(dispatch_loop(
            Arc::clone(&self.shared),
            self.term.subscribe(),
        )));
        tasks.push(tokio::spawn(timeout_loop(
            Arc::clone(&self.shared),
            self.term.subscribe(),
        )));
    }

    /// Stops both loops and drops all queued and in-flight chunks without
    /// further callbacks. Calling `stop` on a stopped pool is a no-op.
    pub async fn stop(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock();
            if tasks.is_empty() {
                return;
            }
            self.term.send_replace(true);
            tasks.drain(..).collect()
        };

        for handle in handles {
            let _ = handle.await;
        }

        {
            let mut inflight = self.shared.inflight.lock();
            for chunk in inflight.values_mut() {
                chunk.state = ChunkState::Cancelled;
            }
            inflight.clear();
        }
        self.shared.queue.lock().clear();

        info!("Chunk pool stopped");
    }

    /// Queues `[from, to]` for paced fetch.
    pub fn add(&self, from: u64, to: u64) {
        let chunks = self.shared.make_chunks(from, to);
        if chunks.is_empty() {
            return;
        }
        debug!("Queued {} chunks covering [{}, {}]", chunks.len(), from, to);
        self.shared.queue.lock().extend(chunks);
    }

    /// Fetches `[from, to]` immediately, bypassing the queue, the gate, and
    /// the in-flight bound. Meant for small top-up ranges near the tip.
    pub fn exec(&self, from: u64, to: u64) {
        for chunk in self.shared.make_chunks(from, to) {
            self.shared.request(chunk);
        }
    }

    /// Updates the backpressure gate from the local chain height.
    ///
    /// The gate opens only while the local chain is within the configured
    /// margin of the furthest height the pool has asked a peer for.
    pub fn threshold(&self, current: u64) {
        let target = self.shared.target.load(Ordering::Relaxed);
        let open = current.saturating_add(self.shared.config.gate_margin) > target;
        self.shared.gate.store(open, Ordering::Relaxed);
    }

    /// Routes an inbound message from the network layer.
    ///
    /// Decode failures are recovered locally by retrying the chunk and are
    /// not surfaced; responses with an unknown id are discarded; messages
    /// tagged with a command the pool does not handle trigger a defensive
    /// retry.
    pub fn handle(&self, msg: Message, sender: &dyn Peer) -> Result<(), WireError> {
        match msg.cmd {
            Cmd::SubLedger => {
                let res = match SubLedger::from_bytes(&msg.payload) {
                    Ok(res) => res,
                    Err(e) => {
                        warn!(
                            "Malformed chunk response from {}: {}",
                            sender.remote_addr(),
                            e
                        );
                        self.shared.retry(msg.id);
                        return Ok(());
                    }
                };

                debug!("Received {} from {}", res, sender.remote_addr());
                self.shared.apply_response(msg.id, res);
                Ok(())
            }
            other => {
                warn!(
                    "Unexpected command {} from {}, retrying chunk {}",
                    other,
                    sender.remote_addr(),
                    msg.id
                );
                self.shared.retry(msg.id);
                Ok(())
            }
        }
    }

    /// Number of chunks awaiting dispatch.
    pub fn queued_len(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Number of chunks currently in flight.
    pub fn inflight_len(&self) -> usize {
        self.shared.inflight.lock().len()
    }

    /// Highest height the pool has asked any peer for.
    pub fn target(&self) -> u64 {
        self.shared.target.load(Ordering::Relaxed)
    }

    /// Whether the dispatch loop may currently draw from the queue.
    pub fn gate_open(&self) -> bool {
        self.shared.gate.load(Ordering::Relaxed)
    }
}

impl<S, R> Shared<S, R>
where
    S: PeerSelector + 'static,
    R: BlockReceiver + 'static,
{
    /// Splits a range and builds chunk records with encoded payloads.
    fn make_chunks(&self, from: u64, to: u64) -> Vec<ChunkRequest> {
        split_chunks(from, to)
            .into_iter()
            .map(|(lo, hi)| {
                let payload = GetChunk { start: lo, end: hi }.to_bytes();
                ChunkRequest::new(self.ids.next_id(), lo, hi, payload)
            })
            .collect()
    }

    /// Assigns a peer if the chunk has none, then issues the request.
    ///
    /// With no peer able to serve the chunk's upper height the chunk is
    /// abandoned immediately.
    fn request(&self, mut chunk: ChunkRequest) {
        if chunk.peer.is_none() {
            let peers = self.selector.pick(chunk.to);
            match peers.choose(&mut rand::thread_rng()) {
                Some(peer) => chunk.peer = Some(Arc::clone(peer)),
                None => {
                    self.catch(chunk);
                    return;
                }
            }
        }

        self.target.fetch_max(chunk.to, Ordering::Relaxed);
        self.issue(chunk);
    }

    /// Arms the deadline, tracks the chunk in flight, and fires the send.
    fn issue(&self, mut chunk: ChunkRequest) {
        let Some(peer) = chunk.peer.clone() else {
            return;
        };

        chunk.deadline = Instant::now() + self.config.chunk_timeout;
        chunk.state = ChunkState::Pending;

        let id = chunk.id;
        let payload = chunk.msg.clone();
        debug!(
            "Requesting chunk [{}, {}] from {}",
            chunk.from,
            chunk.to,
            peer.remote_addr()
        );

        self.inflight.lock().insert(id, chunk);
        peer.send(Cmd::GetChunk, id, payload);
    }

    /// Moves a stalled or failed chunk to a different peer, or abandons it
    /// when no other peer can serve it.
    ///
    /// A no-op when the chunk is unknown or no longer pending, which is how
    /// a retry that lost the race against a completing response backs off.
    fn retry(&self, id: u64) {
        let (to, old) = {
            let mut inflight = self.inflight.lock();
            let Some(chunk) = inflight.get_mut(&id) else {
                return;
            };
            if chunk.state != ChunkState::Pending {
                return;
            }
            (chunk.to, chunk.peer.take())
        };

        // Pick outside the lock; the selector is foreign code.
        let replacement = self.selector.pick(to).into_iter().find(|p| {
            old.as_ref()
                .map_or(true, |prev| p.peer_id() != prev.peer_id())
        });

        let mut inflight = self.inflight.lock();
        let Some(chunk) = inflight.get_mut(&id) else {
            return;
        };
        if chunk.state != ChunkState::Pending {
            return;
        }

        match replacement {
            Some(peer) => {
                chunk.peer = Some(Arc::clone(&peer));
                chunk.deadline = Instant::now() + self.config.chunk_timeout;
                let payload = chunk.msg.clone();
                let (from, to) = (chunk.from, chunk.to);
                drop(inflight);

                debug!(
                    "Retrying chunk [{}, {}] against {}",
                    from,
                    to,
                    peer.remote_addr()
                );
                peer.send(Cmd::GetChunk, id, payload);
            }
            None => {
                let Some(chunk) = inflight.remove(&id) else {
                    return;
                };
                drop(inflight);
                self.catch(chunk);
            }
        }
    }

    /// Declares a chunk unrecoverable and reports it upward, exactly once.
    fn catch(&self, mut chunk: ChunkRequest) {
        chunk.state = ChunkState::Error;
        warn!(
            "Abandoning chunk [{}, {}]: no peer can serve it",
            chunk.from, chunk.to
        );
        self.receiver.catch(&mut chunk);
    }

    /// Delivers a decoded response and advances the owning chunk.
    ///
    /// Account blocks land before snapshot blocks; the snapshot-block count
    /// accumulates toward the chunk width. Responses for ids the pool no
    /// longer tracks are dropped here.
    fn apply_response(&self, id: u64, res: SubLedger) {
        let SubLedger {
            account_blocks,
            snapshot_blocks,
        } = res;
        let received = snapshot_blocks.len() as u64;

        for block in account_blocks {
            self.receiver.receive_account_block(block);
        }
        for block in snapshot_blocks {
            self.receiver.receive_snapshot_block(block);
        }

        let mut inflight = self.inflight.lock();
        let Some(chunk) = inflight.get_mut(&id) else {
            return;
        };

        chunk.state = ChunkState::Respond;
        chunk.count = (chunk.count + received).min(chunk.width());

        if chunk.count >= chunk.width() {
            if let Some(mut done) = inflight.remove(&id) {
                done.state = ChunkState::Done;
                drop(inflight);
                debug!("Chunk [{}, {}] complete", done.from, done.to);
            }
        } else {
            // Partial chunk: re-arm so the timeout sweep keeps covering it.
            chunk.deadline = Instant::now() + self.config.chunk_timeout;
            chunk.state = ChunkState::Pending;
        }
    }
}

/// Drains the pending queue one chunk per tick while the gate is open and
/// the in-flight bound has room.
async fn dispatch_loop<S, R>(shared: Arc<Shared<S, R>>, mut term: watch::Receiver<bool>)
where
    S: PeerSelector + 'static,
    R: BlockReceiver + 'static,
{
    let mut tick = tokio::time::interval(shared.config.dispatch_tick);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = tick.tick() => {
                if !shared.gate.load(Ordering::Relaxed) {
                    continue;
                }
                if shared.inflight.lock().len() >= shared.config.max_inflight {
                    continue;
                }
                let Some(chunk) = shared.queue.lock().pop_front() else {
                    continue;
                };
                shared.request(chunk);
            }
            changed = term.changed() => {
                if changed.is_err() || *term.borrow() {
                    break;
                }
            }
        }
    }
}

/// Sweeps the in-flight map on a timeout-sized tick, retrying every pending
/// chunk whose deadline has passed.
async fn timeout_loop<S, R>(shared: Arc<Shared<S, R>>, mut term: watch::Receiver<bool>)
where
    S: PeerSelector + 'static,
    R: BlockReceiver + 'static,
{
    let mut tick = tokio::time::interval(shared.config.chunk_timeout);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = tick.tick() => {
                let now = Instant::now();
                // Snapshot ids first; retry mutates the map.
                let expired: Vec<u64> = shared
                    .inflight
                    .lock()
                    .iter()
                    .filter(|(_, chunk)| chunk.is_expired(now))
                    .map(|(id, _)| *id)
                    .collect();
                for id in expired {
                    shared.retry(id);
                }
            }
            changed = term.changed() => {
                if changed.is_err() || *term.borrow() {
                    break;
                }
            }
        }
    }
}
