//! `Node` (§3): the process-wide singleton holding the routing table,
//! the peer set, the auth cookie, and the output-queue backpressure
//! accounting.
//!
//! Generalizes the teacher's `bft::communication::{Node, NodeConfig}`
//! (a fixed, statically-known peer set resolved once at `bootstrap`)
//! to an open routing table that peers join and leave at runtime via
//! `UPDATE_IDS` publication (§6).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::collections::{hash_map, hash_set, HashMap, HashSet};
use crate::communication::message::KEY_ID_LEN;
use crate::communication::Address;
use crate::communication::socket::KeepaliveConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::peer::{LoopbackSink, PeerState};
use crate::transaction::TransactionIdAllocator;

/// A fixed-width key identifier, matching the wire header's `key_id`
/// field (§3).
pub type KeyId = [u8; KEY_ID_LEN];

/// Node configuration (§6 "Node configuration (recognized options)").
/// Parsing a config file into this struct is the embedder's job (§1's
/// Non-goals); the `serde` derive is a convenience for embedders that
/// do own one, not a parser this crate implements (SPEC_FULL.md §A.3).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct NodeConfig {
    /// Local listen addresses, in `host:port:family` text form.
    pub addrs: Vec<String>,
    pub cookie: Vec<u8>,
    pub wait_timeout: Duration,
    pub keep_cnt: i32,
    pub keep_idle: i32,
    pub keep_interval: i32,
    pub client_prio: i32,
    pub server_prio: i32,
    pub net_thread_num: usize,
    pub io_thread_num: usize,
    pub nonblocking_io_thread_num: usize,
    pub io_queue_soft_limit: usize,
    pub io_queue_low_watermark: usize,
    /// Accepted connections allocate an internal socketpair and bridge
    /// it to the real socket (§4.2's duplex decoupling) instead of
    /// reading/writing the TCP stream directly, letting a foreground
    /// handler inject synthetic messages into a peer's inbound stream.
    /// Off by default: plain accepted peers need neither the extra
    /// bridge task nor the injection path.
    pub duplex_decoupling: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            addrs: Vec::new(),
            cookie: Vec::new(),
            wait_timeout: Duration::from_secs(60),
            keep_cnt: 3,
            keep_idle: 30,
            keep_interval: 5,
            client_prio: 0,
            server_prio: 0,
            net_thread_num: 4,
            io_thread_num: 4,
            nonblocking_io_thread_num: 2,
            io_queue_soft_limit: 16 * 1024 * 1024,
            io_queue_low_watermark: 8 * 1024 * 1024,
            duplex_decoupling: false,
        }
    }
}

/// One published id range (§6: `UPDATE_IDS` "carries a container of
/// per-backend id ranges").
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct IdRange {
    pub start: KeyId,
    pub backend_id: u32,
}

/// The peer and backend a published range maps a key to.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct RouteEntry {
    pub peer: Address,
    pub backend_id: u32,
}

/// The key-range → peer mapping (§3's "Route table / DHT"), modeled as
/// a consistent-hashing ring: the owner of a key is the entry whose
/// start is the greatest one not exceeding the key, wrapping around to
/// the entry with the greatest start of all when the key precedes
/// every published start. The core owns this structure; it never
/// decides range *assignment* itself — that policy lives in the
/// collaborator that calls [`Node::publish_ids`] (§1 Non-goals: "The
/// routing/DHT ID index... is deliberately out of scope").
#[derive(Default)]
pub struct RouteTable {
    ring: std::collections::BTreeMap<KeyId, RouteEntry>,
}

impl RouteTable {
    pub fn new() -> Self {
        RouteTable::default()
    }

    pub fn publish(&mut self, start: KeyId, entry: RouteEntry) {
        self.ring.insert(start, entry);
    }

    /// Removes every range owned by `peer`, the routing-table half of
    /// `PeerState::reset` (§4.2 "reset": "remove from the routing
    /// table").
    pub fn evict_peer(&mut self, peer: Address) {
        self.ring.retain(|_, entry| entry.peer != peer);
    }

    pub fn owner(&self, key: &KeyId) -> Option<RouteEntry> {
        self.ring
            .range(..=*key)
            .next_back()
            .or_else(|| self.ring.iter().next_back())
            .map(|(_, entry)| *entry)
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }
}

/// Output-queue backpressure accounting (§4.4 "Output backpressure").
/// `Node::total_queued_bytes` (summed live across every peer's
/// `send_queue`) stands in for the source's single `full_lock`-guarded
/// counter; `drain_notify` stands in for its condition variable.
struct IoStats {
    soft_limit: usize,
    low_watermark: usize,
    drain_notify: Notify,
    forwards: AtomicU64,
}

impl IoStats {
    fn new(soft_limit: usize, low_watermark: usize) -> Self {
        IoStats {
            soft_limit,
            low_watermark,
            drain_notify: Notify::new(),
            forwards: AtomicU64::new(0),
        }
    }
}

/// The process-wide singleton (§3's "Node").
pub struct Node {
    pub config: NodeConfig,
    peers: Mutex<HashMap<Address, Arc<PeerState>>>,
    route: Mutex<RouteTable>,
    reconnect_list: Mutex<HashSet<Address>>,
    id_alloc: TransactionIdAllocator,
    /// Node-wide fault-injection bitmask (SPEC_FULL.md §A.5), shared
    /// with every `PeerState` so `send_request` can consult it without
    /// a back-reference to `Node`.
    test_inject_mask: Arc<AtomicU64>,
    io_stats: IoStats,
    self_addr: OnceLock<Address>,
    self_peer: OnceLock<Arc<PeerState>>,
}

impl Node {
    pub fn new(config: NodeConfig) -> Arc<Self> {
        let io_stats = IoStats::new(config.io_queue_soft_limit, config.io_queue_low_watermark);
        Arc::new(Node {
            config,
            peers: Mutex::new(hash_map()),
            route: Mutex::new(RouteTable::new()),
            reconnect_list: Mutex::new(hash_set()),
            id_alloc: TransactionIdAllocator::new(),
            test_inject_mask: Arc::new(AtomicU64::new(0)),
            io_stats,
            self_addr: OnceLock::new(),
            self_peer: OnceLock::new(),
        })
    }

    /// Installs the node's own loopback peer handle (§4.2 "Enqueue
    /// short-circuit"). Must run exactly once, before any other peer
    /// is added.
    pub fn install_self_peer(&self, addr: Address, sink: LoopbackSink) -> Arc<PeerState> {
        let peer = PeerState::loopback(addr, sink);
        peer.set_test_inject_mask(self.test_inject_mask.clone());
        let _ = self.self_addr.set(addr);
        let _ = self.self_peer.set(peer.clone());
        self.peers.lock().insert(addr, peer.clone());
        peer
    }

    pub fn self_addr(&self) -> Address {
        *self
            .self_addr
            .get()
            .expect("install_self_peer must run before self_addr is queried")
    }

    pub fn self_peer(&self) -> Arc<PeerState> {
        self.self_peer
            .get()
            .expect("install_self_peer must run before self_peer is queried")
            .clone()
    }

    pub fn is_self(&self, peer: &Arc<PeerState>) -> bool {
        Arc::ptr_eq(peer, &self.self_peer())
    }

    /// Registers a newly established peer. Fails with
    /// [`ErrorKind::Duplicate`] if this address is already tracked
    /// (§7: "attempt to add a peer address that already exists").
    pub fn add_peer(&self, peer: Arc<PeerState>) -> Result<()> {
        let mut peers = self.peers.lock();
        if peers.contains_key(&peer.primary_addr) {
            return Err(Error::simple(ErrorKind::Duplicate));
        }
        peer.set_test_inject_mask(self.test_inject_mask.clone());
        peers.insert(peer.primary_addr, peer);
        Ok(())
    }

    /// Removes a peer from the live set and evicts every route-table
    /// entry it owned (§4.2 "reset").
    pub fn remove_peer(&self, addr: &Address) -> Option<Arc<PeerState>> {
        let removed = self.peers.lock().remove(addr);
        self.route.lock().evict_peer(*addr);
        removed
    }

    pub fn get_peer(&self, addr: &Address) -> Option<Arc<PeerState>> {
        self.peers.lock().get(addr).cloned()
    }

    pub fn all_peers(&self) -> Vec<Arc<PeerState>> {
        self.peers.lock().values().cloned().collect()
    }

    /// This node's contribution-summed output backlog, across every
    /// connected peer's `send_queue` (§4.4 "Output backpressure").
    pub fn total_queued_bytes(&self) -> usize {
        self.peers.lock().values().map(|p| p.queued_bytes()).sum()
    }

    pub fn over_soft_limit(&self) -> bool {
        self.total_queued_bytes() > self.io_stats.soft_limit
    }

    /// Blocks the calling I/O worker until the output backlog drains
    /// at or below the low watermark (§4.4, §5: "Client-side send
    /// functions: may block on the backpressure condition variable").
    /// Network threads never call this — they apply backpressure at
    /// the TCP layer by simply not reading.
    pub async fn wait_for_drain(&self) {
        loop {
            let notified = self.io_stats.drain_notify.notified();
            if self.total_queued_bytes() <= self.io_stats.low_watermark {
                return;
            }
            notified.await;
        }
    }

    /// Wakes every task blocked in [`Node::wait_for_drain`]. Called by
    /// the reactor's per-peer writer loop after a send completes.
    pub fn notify_drain(&self) {
        self.io_stats.drain_notify.notify_waiters();
    }

    pub fn incr_forwards(&self) -> u64 {
        self.io_stats.forwards.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn forwards(&self) -> u64 {
        self.io_stats.forwards.load(Ordering::Relaxed)
    }

    pub fn next_trans_id(&self) -> u64 {
        self.id_alloc.alloc()
    }

    pub fn cookie_matches(&self, candidate: &[u8]) -> bool {
        self.config.cookie.as_slice() == candidate
    }

    pub fn keepalive_config(&self) -> KeepaliveConfig {
        KeepaliveConfig {
            count: self.config.keep_cnt,
            idle: self.config.keep_idle,
            interval: self.config.keep_interval,
        }
    }

    /// Publishes a batch of id ranges under `peer` (§4.3/§6
    /// `UPDATE_IDS`). Republishing the same start simply overwrites
    /// the prior owner; this is a routine, not an error path — the
    /// originating collaborator is trusted to be the source of truth
    /// for range assignment (§1 Non-goals).
    pub fn publish_ids(&self, peer: Address, ranges: Vec<IdRange>) {
        let mut route = self.route.lock();
        for range in ranges {
            route.publish(
                range.start,
                RouteEntry {
                    peer,
                    backend_id: range.backend_id,
                },
            );
        }
    }

    pub fn route_owner(&self, key: &KeyId) -> Option<RouteEntry> {
        self.route.lock().owner(key)
    }

    /// Sets the test-injection opcode bitmask (SPEC_FULL.md §A.5):
    /// bit `cmd % 64` set causes `send_request` for that opcode to
    /// silently drop its `IoReq`, simulating a lost message.
    pub fn set_test_inject_mask(&self, mask: u64) {
        self.test_inject_mask.store(mask, Ordering::Relaxed);
    }

    pub fn test_inject_mask(&self) -> u64 {
        self.test_inject_mask.load(Ordering::Relaxed)
    }

    pub fn schedule_reconnect(&self, addr: Address) {
        self.reconnect_list.lock().insert(addr);
    }

    pub fn drain_reconnect_list(&self) -> Vec<Address> {
        self.reconnect_list.lock().drain().collect()
    }

    pub fn reconnect_list_len(&self) -> usize {
        self.reconnect_list.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> Address {
        Address::parse(&format!("127.0.0.1:{}:2", port)).unwrap()
    }

    fn key(byte: u8) -> KeyId {
        [byte; KEY_ID_LEN]
    }

    #[test]
    fn route_table_owner_picks_the_greatest_start_not_exceeding_the_key() {
        let mut table = RouteTable::new();
        let a = addr(1025);
        let b = addr(1026);
        table.publish(key(0), RouteEntry { peer: a, backend_id: 0 });
        table.publish(key(100), RouteEntry { peer: b, backend_id: 0 });

        assert_eq!(table.owner(&key(50)).unwrap().peer, a);
        assert_eq!(table.owner(&key(150)).unwrap().peer, b);
    }

    #[test]
    fn route_table_owner_wraps_around_for_keys_before_the_first_start() {
        let mut table = RouteTable::new();
        let a = addr(1025);
        let b = addr(1026);
        table.publish(key(50), RouteEntry { peer: a, backend_id: 0 });
        table.publish(key(200), RouteEntry { peer: b, backend_id: 0 });

        // a key smaller than every published start wraps to the ring's
        // last entry, not `None`.
        assert_eq!(table.owner(&key(10)).unwrap().peer, b);
    }

    #[test]
    fn route_table_owner_is_none_when_empty() {
        let table = RouteTable::new();
        assert!(table.owner(&key(10)).is_none());
    }

    #[test]
    fn evict_peer_removes_only_that_peers_ranges() {
        let mut table = RouteTable::new();
        let a = addr(1025);
        let b = addr(1026);
        table.publish(key(0), RouteEntry { peer: a, backend_id: 0 });
        table.publish(key(100), RouteEntry { peer: b, backend_id: 0 });

        table.evict_peer(a);
        assert_eq!(table.len(), 1);
        assert_eq!(table.owner(&key(50)).unwrap().peer, b);
    }

    #[test]
    fn republishing_a_start_overwrites_the_previous_owner() {
        let mut table = RouteTable::new();
        let a = addr(1025);
        let b = addr(1026);
        table.publish(key(0), RouteEntry { peer: a, backend_id: 0 });
        table.publish(key(0), RouteEntry { peer: b, backend_id: 1 });

        assert_eq!(table.len(), 1);
        let entry = table.owner(&key(0)).unwrap();
        assert_eq!(entry.peer, b);
        assert_eq!(entry.backend_id, 1);
    }

    #[test]
    fn node_add_peer_rejects_duplicate_address() {
        let node = Node::new(NodeConfig::default());
        let (tx, _rx) = tokio::sync::mpsc::channel(8);
        let peer = PeerState::loopback(addr(1025), tx.clone());
        node.add_peer(peer.clone()).unwrap();

        let dup = PeerState::loopback(addr(1025), tx);
        let err = node.add_peer(dup).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Duplicate);
    }

    #[test]
    fn node_cookie_matches_is_bytewise_equality() {
        let mut cfg = NodeConfig::default();
        cfg.cookie = vec![1, 2, 3, 4];
        let node = Node::new(cfg);
        assert!(node.cookie_matches(&[1, 2, 3, 4]));
        assert!(!node.cookie_matches(&[1, 2, 3, 5]));
    }
}
