//! Tests for the chunk pool
//!
//! Time-driven scenarios run under a paused tokio clock, so dispatch ticks
//! and timeout sweeps fire deterministically without real waiting.

use lattice_sync::{
    BlockReceiver, ChunkPool, ChunkPoolConfig, Cmd, GetChunk, Message, Peer, PeerId,
    PeerSelector, Piece, SequentialIds, SubLedger,
};
use lattice_types::{AccountBlock, Address, SnapshotBlock, H256};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Test doubles
// ============================================================================

#[derive(Default)]
struct RecordingReceiver {
    account_blocks: Mutex<Vec<AccountBlock>>,
    snapshot_blocks: Mutex<Vec<SnapshotBlock>>,
    failures: Mutex<Vec<(u64, u64)>>,
}

impl RecordingReceiver {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn snapshot_heights(&self) -> Vec<u64> {
        self.snapshot_blocks.lock().iter().map(|b| b.height).collect()
    }

    fn failures(&self) -> Vec<(u64, u64)> {
        self.failures.lock().clone()
    }
}

impl BlockReceiver for RecordingReceiver {
    fn receive_account_block(&self, block: AccountBlock) {
        self.account_blocks.lock().push(block);
    }

    fn receive_snapshot_block(&self, block: SnapshotBlock) {
        self.snapshot_blocks.lock().push(block);
    }

    fn catch(&self, piece: &mut dyn Piece) {
        self.failures.lock().push(piece.band());
    }
}

struct MockPeer {
    id: PeerId,
    height: u64,
    addr: SocketAddr,
    sent: Mutex<Vec<(Cmd, u64, Vec<u8>)>>,
}

impl MockPeer {
    fn new(tag: u8, height: u64) -> Arc<Self> {
        Arc::new(Self {
            id: [tag; 32],
            height,
            addr: SocketAddr::from(([127, 0, 0, 1], 9000 + tag as u16)),
            sent: Mutex::new(Vec::new()),
        })
    }

    fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    fn sent_at(&self, index: usize) -> (Cmd, u64, Vec<u8>) {
        self.sent.lock()[index].clone()
    }

    fn last_sent(&self) -> Option<(Cmd, u64, Vec<u8>)> {
        self.sent.lock().last().cloned()
    }
}

impl Peer for MockPeer {
    fn peer_id(&self) -> PeerId {
        self.id
    }

    fn send(&self, cmd: Cmd, request_id: u64, payload: Vec<u8>) {
        self.sent.lock().push((cmd, request_id, payload));
    }

    fn remote_addr(&self) -> SocketAddr {
        self.addr
    }
}

struct PeerDirectory {
    peers: Vec<Arc<MockPeer>>,
}

impl PeerDirectory {
    fn new(peers: Vec<Arc<MockPeer>>) -> Arc<Self> {
        Arc::new(Self { peers })
    }
}

impl PeerSelector for PeerDirectory {
    fn pick(&self, height: u64) -> Vec<Arc<dyn Peer>> {
        self.peers
            .iter()
            .filter(|p| p.height >= height)
            .map(|p| Arc::clone(p) as Arc<dyn Peer>)
            .collect()
    }
}

fn new_pool(
    selector: &Arc<PeerDirectory>,
    receiver: &Arc<RecordingReceiver>,
) -> ChunkPool<PeerDirectory, RecordingReceiver> {
    ChunkPool::new(
        ChunkPoolConfig::default(),
        Arc::clone(selector),
        Arc::clone(receiver),
        Arc::new(SequentialIds::new()),
    )
}

/// Builds a full response for an encoded `GetChunk` payload: one snapshot
/// block per height, each pinning one account block.
fn response_for(payload: &[u8]) -> SubLedger {
    let req = GetChunk::from_bytes(payload).unwrap();
    sub_ledger(req.start, req.end)
}

fn sub_ledger(start: u64, end: u64) -> SubLedger {
    let account = Address::from([7u8; 20]);
    let mut res = SubLedger::default();
    for height in start..=end {
        let block = AccountBlock::new(account, height, H256::NIL);
        let mut snapshot = SnapshotBlock::new(height, H256::NIL);
        snapshot.push_entry(account, height, block.hash());
        res.account_blocks.push(block);
        res.snapshot_blocks.push(snapshot);
    }
    res
}

// ============================================================================
// Synchronous surface
// ============================================================================

#[test]
fn test_empty_range_queues_nothing() {
    let peer = MockPeer::new(1, 100);
    let selector = PeerDirectory::new(vec![peer]);
    let receiver = RecordingReceiver::new();
    let pool = new_pool(&selector, &receiver);

    pool.add(10, 9);
    pool.add(1, 0);
    assert_eq!(pool.queued_len(), 0);
}

#[test]
fn test_target_never_decreases() {
    let peer = MockPeer::new(1, 100_000);
    let selector = PeerDirectory::new(vec![peer]);
    let receiver = RecordingReceiver::new();
    let pool = new_pool(&selector, &receiver);

    pool.exec(981, 1_000);
    assert_eq!(pool.target(), 1_000);

    pool.exec(1, 20);
    assert_eq!(pool.target(), 1_000);
}

#[test]
fn test_gate_follows_margin_arithmetic() {
    let peer = MockPeer::new(1, 100_000);
    let selector = PeerDirectory::new(vec![peer]);
    let receiver = RecordingReceiver::new();
    let pool = new_pool(&selector, &receiver);

    pool.exec(481, 500);
    assert_eq!(pool.target(), 500);

    pool.threshold(0);
    assert!(!pool.gate_open());

    pool.threshold(1);
    assert!(pool.gate_open());
}

#[test]
fn test_handler_registration_surface() {
    let selector = PeerDirectory::new(Vec::new());
    let receiver = RecordingReceiver::new();
    let pool = new_pool(&selector, &receiver);

    assert_eq!(pool.name(), "chunk pool");
    assert_eq!(pool.cmds(), &[Cmd::SubLedger]);
}

#[test]
fn test_unknown_response_id_is_discarded() {
    let peer = MockPeer::new(1, 100);
    let selector = PeerDirectory::new(vec![Arc::clone(&peer)]);
    let receiver = RecordingReceiver::new();
    let pool = new_pool(&selector, &receiver);

    let res = sub_ledger(1, 5);
    let outcome = pool.handle(
        Message::new(Cmd::SubLedger, 424_242, res.to_bytes()),
        peer.as_ref(),
    );

    assert!(outcome.is_ok());
    // Blocks are delivered before the chunk lookup, even for a stale id.
    assert_eq!(receiver.snapshot_heights(), vec![1, 2, 3, 4, 5]);
    assert_eq!(pool.inflight_len(), 0);
    assert!(receiver.failures().is_empty());
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_fetches_range_chunk_by_chunk() {
    let peer = MockPeer::new(1, 1_000);
    let selector = PeerDirectory::new(vec![Arc::clone(&peer)]);
    let receiver = RecordingReceiver::new();
    let pool = new_pool(&selector, &receiver);

    pool.start();
    pool.threshold(0);
    pool.add(1, 60);
    assert_eq!(pool.queued_len(), 3);

    // Three dispatch ticks drain the queue in height order.
    tokio::time::sleep(Duration::from_millis(650)).await;
    assert_eq!(peer.sent_count(), 3);
    assert_eq!(pool.inflight_len(), 3);
    assert_eq!(pool.target(), 60);

    for index in 0..3 {
        let (cmd, id, payload) = peer.sent_at(index);
        assert_eq!(cmd, Cmd::GetChunk);
        let req = GetChunk::from_bytes(&payload).unwrap();
        assert_eq!((req.start, req.end), (index as u64 * 20 + 1, (index as u64 + 1) * 20));

        let res = response_for(&payload);
        pool.handle(Message::new(Cmd::SubLedger, id, res.to_bytes()), peer.as_ref())
            .unwrap();
        pool.threshold(req.end);
    }

    assert_eq!(pool.inflight_len(), 0);
    assert_eq!(pool.queued_len(), 0);
    assert_eq!(receiver.snapshot_heights(), (1..=60).collect::<Vec<_>>());
    assert!(receiver.failures().is_empty());

    pool.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_gate_blocks_dispatch_until_chain_catches_up() {
    let peer = MockPeer::new(1, 20_000);
    let selector = PeerDirectory::new(vec![Arc::clone(&peer)]);
    let receiver = RecordingReceiver::new();
    let pool = new_pool(&selector, &receiver);

    pool.start();

    // An urgent top-up bypasses queue and gate, and pushes the target out.
    pool.exec(9_981, 10_000);
    assert_eq!(peer.sent_count(), 1);
    assert_eq!(pool.target(), 10_000);

    pool.threshold(0);
    assert!(!pool.gate_open());
    pool.add(1, 40);

    tokio::time::sleep(Duration::from_millis(1_900)).await;
    assert_eq!(peer.sent_count(), 1);
    assert_eq!(pool.queued_len(), 2);

    // 9_600 + 500 > 10_000: the chain is close enough, dispatch resumes.
    pool.threshold(9_600);
    assert!(pool.gate_open());

    tokio::time::sleep(Duration::from_millis(450)).await;
    assert_eq!(peer.sent_count(), 3);
    assert_eq!(pool.queued_len(), 0);

    pool.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_inflight_bound_paces_dispatch() {
    let peer = MockPeer::new(1, 1_000);
    let selector = PeerDirectory::new(vec![Arc::clone(&peer)]);
    let receiver = RecordingReceiver::new();
    let pool = new_pool(&selector, &receiver);

    pool.start();
    pool.threshold(0);
    pool.add(1, 140);
    assert_eq!(pool.queued_len(), 7);

    // Plenty of ticks pass, but only five chunks may be in flight at once.
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert_eq!(peer.sent_count(), 5);
    assert_eq!(pool.inflight_len(), 5);
    assert_eq!(pool.queued_len(), 2);

    // Completing one chunk frees a slot for the next tick.
    let (_, id, payload) = peer.sent_at(0);
    pool.handle(
        Message::new(Cmd::SubLedger, id, response_for(&payload).to_bytes()),
        peer.as_ref(),
    )
    .unwrap();
    assert_eq!(pool.inflight_len(), 4);

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(peer.sent_count(), 6);
    assert_eq!(pool.inflight_len(), 5);
    assert_eq!(pool.queued_len(), 1);

    pool.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_chunk_moves_to_another_peer() {
    let a = MockPeer::new(1, 1_000);
    let b = MockPeer::new(2, 1_000);
    let selector = PeerDirectory::new(vec![Arc::clone(&a), Arc::clone(&b)]);
    let receiver = RecordingReceiver::new();
    let pool = new_pool(&selector, &receiver);

    pool.start();
    pool.threshold(0);
    pool.add(1, 20);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let (first, other) = if a.sent_count() == 1 {
        (Arc::clone(&a), Arc::clone(&b))
    } else {
        (Arc::clone(&b), Arc::clone(&a))
    };
    let (_, id, _) = first.last_sent().unwrap();

    // No response arrives; the sweep re-targets the chunk.
    tokio::time::sleep(Duration::from_secs(45)).await;

    assert_eq!(first.sent_count(), 1);
    assert_eq!(other.sent_count(), 1);
    let (cmd, retried_id, _) = other.last_sent().unwrap();
    assert_eq!(cmd, Cmd::GetChunk);
    assert_eq!(retried_id, id);
    assert_eq!(pool.inflight_len(), 1);
    assert!(receiver.failures().is_empty());

    pool.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_no_peer_surfaces_failure_once() {
    // The only peer is too short for the requested range.
    let peer = MockPeer::new(1, 10);
    let selector = PeerDirectory::new(vec![Arc::clone(&peer)]);
    let receiver = RecordingReceiver::new();
    let pool = new_pool(&selector, &receiver);

    pool.start();
    pool.threshold(0);
    pool.add(1, 20);

    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(receiver.failures(), vec![(1, 20)]);
    assert_eq!(peer.sent_count(), 0);
    assert_eq!(pool.inflight_len(), 0);
    assert_eq!(pool.queued_len(), 0);

    pool.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_malformed_response_triggers_immediate_retry() {
    let a = MockPeer::new(1, 1_000);
    let b = MockPeer::new(2, 1_000);
    let selector = PeerDirectory::new(vec![Arc::clone(&a), Arc::clone(&b)]);
    let receiver = RecordingReceiver::new();
    let pool = new_pool(&selector, &receiver);

    pool.start();
    pool.threshold(0);
    pool.add(1, 20);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let (first, other) = if a.sent_count() == 1 {
        (Arc::clone(&a), Arc::clone(&b))
    } else {
        (Arc::clone(&b), Arc::clone(&a))
    };
    let (_, id, _) = first.last_sent().unwrap();

    // The decode failure stays local: the chunk is retried, no error escapes.
    let outcome = pool.handle(
        Message::new(Cmd::SubLedger, id, b"not a payload".to_vec()),
        first.as_ref(),
    );

    assert!(outcome.is_ok());
    assert_eq!(other.sent_count(), 1);
    assert_eq!(other.last_sent().unwrap().1, id);
    assert!(receiver.snapshot_heights().is_empty());
    assert!(receiver.failures().is_empty());

    pool.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_unexpected_command_retries_defensively() {
    let a = MockPeer::new(1, 1_000);
    let b = MockPeer::new(2, 1_000);
    let selector = PeerDirectory::new(vec![Arc::clone(&a), Arc::clone(&b)]);
    let receiver = RecordingReceiver::new();
    let pool = new_pool(&selector, &receiver);

    pool.start();
    pool.threshold(0);
    pool.add(1, 20);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let (first, other) = if a.sent_count() == 1 {
        (Arc::clone(&a), Arc::clone(&b))
    } else {
        (Arc::clone(&b), Arc::clone(&a))
    };
    let (_, id, _) = first.last_sent().unwrap();

    let outcome = pool.handle(Message::new(Cmd::Status, id, Vec::new()), first.as_ref());

    assert!(outcome.is_ok());
    assert_eq!(other.sent_count(), 1);
    assert_eq!(other.last_sent().unwrap().1, id);

    pool.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_retry_with_no_alternative_peer_abandons_chunk() {
    // A single peer cannot replace itself after a failure.
    let peer = MockPeer::new(1, 1_000);
    let selector = PeerDirectory::new(vec![Arc::clone(&peer)]);
    let receiver = RecordingReceiver::new();
    let pool = new_pool(&selector, &receiver);

    pool.start();
    pool.threshold(0);
    pool.add(1, 20);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(peer.sent_count(), 1);
    let (_, id, _) = peer.last_sent().unwrap();

    let outcome = pool.handle(
        Message::new(Cmd::SubLedger, id, b"garbage".to_vec()),
        peer.as_ref(),
    );

    // The decode failure itself is not surfaced; giving up on the chunk is
    // reported through the receiver instead.
    assert!(outcome.is_ok());
    assert_eq!(peer.sent_count(), 1);
    assert_eq!(receiver.failures(), vec![(1, 20)]);
    assert_eq!(pool.inflight_len(), 0);

    pool.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_partial_responses_accumulate_to_completion() {
    let peer = MockPeer::new(1, 1_000);
    let selector = PeerDirectory::new(vec![Arc::clone(&peer)]);
    let receiver = RecordingReceiver::new();
    let pool = new_pool(&selector, &receiver);

    pool.start();
    pool.threshold(0);
    pool.add(1, 20);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let (_, id, _) = peer.last_sent().unwrap();

    // Half the chunk arrives: the chunk stays in flight.
    pool.handle(
        Message::new(Cmd::SubLedger, id, sub_ledger(1, 10).to_bytes()),
        peer.as_ref(),
    )
    .unwrap();
    assert_eq!(pool.inflight_len(), 1);

    // An overlapping remainder over-counts; completion still triggers and
    // nothing underflows.
    pool.handle(
        Message::new(Cmd::SubLedger, id, sub_ledger(6, 20).to_bytes()),
        peer.as_ref(),
    )
    .unwrap();
    assert_eq!(pool.inflight_len(), 0);
    assert_eq!(receiver.snapshot_heights().len(), 25);
    assert!(receiver.failures().is_empty());

    pool.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_drops_inflight_without_callbacks() {
    let peer = MockPeer::new(1, 1_000);
    let selector = PeerDirectory::new(vec![Arc::clone(&peer)]);
    let receiver = RecordingReceiver::new();
    let pool = new_pool(&selector, &receiver);

    pool.start();
    pool.threshold(0);
    pool.add(1, 60);

    tokio::time::sleep(Duration::from_millis(650)).await;
    assert_eq!(pool.inflight_len(), 3);

    pool.stop().await;
    assert_eq!(pool.inflight_len(), 0);
    assert_eq!(pool.queued_len(), 0);
    assert!(receiver.failures().is_empty());
    assert!(receiver.snapshot_heights().is_empty());

    // Idempotent: a second stop is a no-op.
    pool.stop().await;

    // A response raced against shutdown hits an empty map and is dropped.
    let (_, id, payload) = peer.last_sent().unwrap();
    pool.handle(
        Message::new(Cmd::SubLedger, id, response_for(&payload).to_bytes()),
        peer.as_ref(),
    )
    .unwrap();
    assert_eq!(pool.inflight_len(), 0);

    pool.stop().await;
}
