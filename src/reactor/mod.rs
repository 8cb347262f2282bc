//! The reactor & dispatcher (§4.4): connection lifecycle tasks,
//! request routing (local / forward), the timeout sweep, and the
//! reconnect scan.
//!
//! Grounded in the teacher's `bft::communication::mod.rs`
//! `tx_side_connect`/`rx_side_accept` per-connection task-spawning
//! shape, generalized from a fixed, statically-known peer set to
//! connect/accept against an open routing table. `Nnet`'s "each
//! network thread owns an event-poll set, peers assigned round-robin"
//! rides tokio's own multi-threaded scheduler rather than a second,
//! hand-rolled epoll layer: `net_thread_num` becomes
//! `tokio::runtime::Builder::worker_threads` (see `async_runtime`),
//! and one task per peer half is tokio's registered-socket
//! round-robin, expressed natively.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian};
use bytes::Bytes;
use either::Either;
use threadpool_crossbeam_channel::ThreadPool;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::async_runtime;
use crate::communication::message::{Opcode, KEY_ID_LEN};
use crate::communication::socket::{Listener, PeerRole, Socket};
use crate::communication::{Address, CommandHeader, Flags, WireMessage};
use crate::error::{Error, ErrorKind, Result, ResultWrappedExt};
use crate::node::{IdRange, Node, NodeConfig};
use crate::peer::{build_request, ConnState, IoReq, JoinState, PeerState};
use crate::transaction::{Transaction, TransactionOutcome};

/// How long the reconnect scan sleeps between passes over the
/// reconnect list (§4.4 "reconnect thread... scans at a fixed
/// interval"). Not itself a recognized `NodeConfig` option (§6 lists
/// none for this), so a fixed constant rather than an invented field.
const RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// Depth of the unified inbound I/O queue that framed, non-reply
/// messages are handed to for dispatch (§4.4's `Nio` input queue). A
/// bounded `tokio::sync::mpsc` channel's `send().await` blocking *is*
/// this queue's natural backpressure, expressed without a hand-rolled
/// condition variable.
const IO_QUEUE_CAPACITY: usize = 1024;

/// A fully decoded local request, handed to a [`Backend`] (§2: "local
/// backend execution").
pub struct BackendRequest {
    pub header: CommandHeader,
    pub body: Bytes,
}

/// One reply a [`Backend`] emits for a request. A handler returning
/// more than one reply is the MORE-flagged streaming case (§6); the
/// dispatcher sends all but the last with `MORE` set.
pub struct BackendReply {
    pub status: i32,
    pub body: Bytes,
}

impl BackendReply {
    pub fn ok(body: Bytes) -> Self {
        BackendReply { status: 0, body }
    }

    pub fn error(status: i32) -> Self {
        BackendReply {
            status,
            body: Bytes::new(),
        }
    }
}

/// The local key→blob storage engine the core forwards owned requests
/// to (§3's "Backend" glossary entry). Synchronous and possibly
/// blocking on disk I/O — the dispatcher runs it on the `Nio` thread
/// pool, never on a reactor task (§4.4, §5).
pub trait Backend: Send + Sync + 'static {
    fn handle(&self, req: BackendRequest) -> Vec<BackendReply>;
}

type IoQueueItem = (Arc<PeerState>, WireMessage);

/// Outcome of [`Dispatcher::decide_owner`]: `Left` serves the request
/// locally, `Right` carries the peer to forward it to. The same
/// two-way-branch shape the teacher reaches for `either::Either` over
/// in `bft::ordering`, reused here for the local-vs-forward decision.
type DecideOwner = Either<(), Arc<PeerState>>;

/// The dispatcher: owns the `Nio` thread pool and the tasks that
/// drive every peer's reader/writer halves, the timeout sweep, and the
/// reconnect scan (§4.4).
pub struct Dispatcher {
    node: Arc<Node>,
    backend: Arc<dyn Backend>,
    io_pool: ThreadPool,
    io_tx: mpsc::Sender<IoQueueItem>,
}

impl Dispatcher {
    /// Builds the node, binds every configured listen address, wires
    /// the loopback short-circuit, and spawns the reader/writer tasks
    /// for the reactor's two auxiliary singletons (timeout sweep,
    /// reconnect scan) plus one acceptor task per listener.
    pub async fn bootstrap(config: NodeConfig, backend: Arc<dyn Backend>) -> Result<(Arc<Node>, Arc<Dispatcher>)> {
        async_runtime::init(config.net_thread_num)?;

        let addrs: Vec<Address> = config
            .addrs
            .iter()
            .map(|text| Address::parse(text))
            .collect::<Result<Vec<_>>>()?;
        if addrs.is_empty() {
            return Err(Error::simple(ErrorKind::InvalidAddress));
        }

        let node = Node::new(config);
        let (io_tx, io_rx) = mpsc::channel(IO_QUEUE_CAPACITY);

        let (loopback_tx, mut loopback_rx) = mpsc::channel::<WireMessage>(IO_QUEUE_CAPACITY);
        let self_peer = node.install_self_peer(addrs[0], loopback_tx);

        let io_thread_num = node.config.io_thread_num.max(1);
        let io_pool = ThreadPool::with_name("elliptics-io".into(), io_thread_num);

        let dispatcher = Arc::new(Dispatcher {
            node: node.clone(),
            backend,
            io_pool,
            io_tx,
        });

        // Bridges the loopback sink into the same unified queue every
        // reader task feeds, tagging each message with the node's own
        // peer handle (§4.2 "Enqueue short-circuit").
        let bridge_tx = dispatcher.io_tx.clone();
        async_runtime::spawn(async move {
            while let Some(msg) = loopback_rx.recv().await {
                if bridge_tx.send((self_peer.clone(), msg)).await.is_err() {
                    break;
                }
            }
        });

        let io_rx = Arc::new(AsyncMutex::new(io_rx));
        for _ in 0..io_thread_num {
            let dispatcher = dispatcher.clone();
            let io_rx = io_rx.clone();
            async_runtime::spawn(async move {
                dispatcher.io_worker_loop(io_rx).await;
            });
        }

        for addr in addrs {
            let listener = Listener::bind(addr.socket_addr()).await?;
            let dispatcher = dispatcher.clone();
            async_runtime::spawn(async move {
                dispatcher.accept_loop(listener).await;
            });
        }

        let sweep_dispatcher = dispatcher.clone();
        async_runtime::spawn(async move {
            sweep_dispatcher.timeout_sweep_loop().await;
        });

        let reconnect_dispatcher = dispatcher.clone();
        async_runtime::spawn(async move {
            reconnect_dispatcher.reconnect_loop().await;
        });

        Ok((node, dispatcher))
    }

    /// Initiates an outbound connection, runs the client side of the
    /// `AUTH` handshake, and spawns the peer's reader/writer tasks
    /// (§4.2 "Connection lifecycle": Connecting → HandshakeOut →
    /// HandshakeWait → Established).
    pub async fn connect(self: &Arc<Self>, addr: Address) -> Result<Arc<PeerState>> {
        let socket = Socket::connect(addr.socket_addr()).await?;
        socket.apply_options(self.node.keepalive_config(), PeerRole::Client, self.node.config.client_prio)?;
        let peer = PeerState::from_connected(addr, socket);

        if let Err(e) = self.handshake_outbound(&peer).await {
            peer.reset(Error::wrapped(e.kind(), e.to_string())).await;
            return Err(e);
        }

        peer.set_join_state(JoinState::Client);
        peer.set_conn_state(ConnState::Established);
        self.node.add_peer(peer.clone())?;
        self.spawn_peer_tasks(peer.clone());
        Ok(peer)
    }

    async fn accept_loop(self: Arc<Self>, listener: Listener) {
        loop {
            match listener.accept().await {
                Ok((socket, remote)) => {
                    let dispatcher = self.clone();
                    async_runtime::spawn(async move {
                        dispatcher.accept_one(socket, remote).await;
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                }
            }
        }
    }

    async fn accept_one(self: Arc<Self>, socket: Socket, remote: SocketAddr) {
        if let Err(e) = socket.apply_options(self.node.keepalive_config(), PeerRole::Server, self.node.config.server_prio) {
            tracing::warn!(error = %e, %remote, "failed to apply socket options to accepted peer");
            return;
        }
        let addr = Address::from_socket_addr(remote);
        let peer = if self.node.config.duplex_decoupling {
            match PeerState::from_accepted_duplex(addr, socket) {
                Ok(peer) => peer,
                Err(e) => {
                    tracing::warn!(error = %e, %remote, "failed to set up duplex decoupling for accepted peer");
                    return;
                }
            }
        } else {
            PeerState::from_accepted(addr, socket)
        };

        match self.handshake_inbound(&peer).await {
            Ok(()) => {
                peer.set_join_state(JoinState::JoinedServer);
                peer.set_conn_state(ConnState::Established);
                if let Err(e) = self.node.add_peer(peer.clone()) {
                    tracing::info!(error = %e, %addr, "accepted peer address already tracked");
                    peer.reset(e).await;
                    return;
                }
                self.spawn_peer_tasks(peer);
            }
            Err(e) => {
                tracing::warn!(error = %e, %addr, "inbound handshake failed");
                peer.reset(e).await;
            }
        }
    }

    fn spawn_peer_tasks(self: &Arc<Self>, peer: Arc<PeerState>) {
        let reader = self.clone();
        let reader_peer = peer.clone();
        async_runtime::spawn(async move {
            reader.run_peer(reader_peer).await;
        });

        let writer = self.clone();
        async_runtime::spawn(async move {
            writer.peer_writer_loop(peer).await;
        });
    }

    /// Client side of the cookie-compare handshake (§4.2): send
    /// `AUTH` with the node's cookie, then expect a status-0 reply.
    async fn handshake_outbound(&self, peer: &Arc<PeerState>) -> Result<()> {
        peer.set_conn_state(ConnState::HandshakeOut);
        let header = auth_header(self.node.config.cookie.len() as u64);
        let req = build_request(&header, Bytes::from(self.node.config.cookie.clone()))?;
        peer.enqueue(req).await?;
        peer.drive_send().await?;

        peer.set_conn_state(ConnState::HandshakeWait);
        let reply = peer
            .receive_one()
            .await?
            .ok_or_else(|| Error::simple(ErrorKind::AuthReject))?;
        if reply.header.cmd != Opcode::AUTH || reply.header.status != 0 {
            return Err(Error::simple(ErrorKind::AuthReject));
        }
        Ok(())
    }

    /// Server side of the handshake: expect `AUTH` carrying the peer's
    /// cookie, byte-compare against ours, and reply with a status
    /// reflecting the result.
    async fn handshake_inbound(&self, peer: &Arc<PeerState>) -> Result<()> {
        let request = peer
            .receive_one()
            .await?
            .ok_or_else(|| Error::simple(ErrorKind::AuthReject))?;
        if request.header.cmd != Opcode::AUTH {
            return Err(Error::simple(ErrorKind::AuthReject));
        }
        let accepted = self.node.cookie_matches(&request.body);
        let status = if accepted { 0 } else { ErrorKind::AuthReject.status_code() };

        let reply_header = CommandHeader {
            flags: Flags::REPLY,
            status,
            ..request.header
        };
        let req = build_request(&reply_header, Bytes::new())?;
        peer.enqueue(req).await?;
        peer.drive_send().await?;

        if accepted {
            Ok(())
        } else {
            Err(Error::simple(ErrorKind::AuthReject))
        }
    }

    /// Single reader task for one peer: the sole consumer of its read
    /// half (§4.4 "A single network thread is the sole reader of
    /// `read_fd`"). Replies are matched immediately; requests are
    /// forwarded onto the unified I/O queue for dispatch.
    async fn run_peer(self: Arc<Self>, peer: Arc<PeerState>) {
        loop {
            match peer.receive_one().await {
                Ok(Some(msg)) => {
                    let trans_id = msg.header.trans_id;
                    if msg.header.flags.contains(Flags::REPLY) {
                        if !peer.match_reply(msg) {
                            tracing::warn!(trans = trans_id, peer = %peer.primary_addr, "late or unknown reply");
                        }
                    } else if self.io_tx.send((peer.clone(), msg)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    peer.reset(Error::simple(ErrorKind::Closed)).await;
                    break;
                }
                Err(e) => {
                    peer.reset(Error::wrapped(e.kind(), e.to_string())).await;
                    break;
                }
            }
            if peer.conn_state() == ConnState::Terminal {
                break;
            }
        }
        self.teardown_peer(&peer);
    }

    fn teardown_peer(&self, peer: &Arc<PeerState>) {
        self.node.remove_peer(&peer.primary_addr);
        if peer.join_state() == JoinState::JoinedServer {
            self.node.schedule_reconnect(peer.primary_addr);
        }
    }

    /// Single writer task for one peer: drains `send_queue` whenever
    /// there is work, then notifies anything blocked on output
    /// backpressure (§4.4's send-path algorithm, §5).
    async fn peer_writer_loop(self: Arc<Self>, peer: Arc<PeerState>) {
        loop {
            peer.wait_for_send_work().await;
            if matches!(peer.conn_state(), ConnState::Resetting | ConnState::Terminal) {
                break;
            }
            let _ = peer.drive_send().await;
            self.node.notify_drain();
        }
    }

    async fn io_worker_loop(self: Arc<Self>, rx: Arc<AsyncMutex<mpsc::Receiver<IoQueueItem>>>) {
        loop {
            let item = { rx.lock().await.recv().await };
            match item {
                Some((peer, msg)) => self.clone().dispatch(peer, msg).await,
                None => break,
            }
        }
    }

    async fn dispatch(self: Arc<Self>, peer: Arc<PeerState>, msg: WireMessage) {
        if msg.header.flags.contains(Flags::REPLY) {
            tracing::warn!(trans = msg.header.trans_id, "unexpected reply reached the dispatcher");
            return;
        }
        match msg.header.cmd {
            Opcode::UPDATE_IDS => self.handle_update_ids(&peer, &msg).await,
            Opcode::AUTH => {
                tracing::warn!(peer = %peer.primary_addr, "AUTH received after handshake, ignoring");
            }
            _ => match self.decide_owner(&msg) {
                Ok(Either::Left(())) => self.serve_locally(peer, msg).await,
                Ok(Either::Right(owner)) => self.forward(peer, owner, msg).await,
                Err(e) => self.reply_error(&peer, &msg.header, e.kind()).await,
            },
        }
    }

    /// §4.3 "Forwarding": decides whether a request's target key is
    /// owned locally or by another peer. `DIRECT` always forces local
    /// service (§6), bypassing the route lookup entirely.
    fn decide_owner(&self, msg: &WireMessage) -> Result<DecideOwner> {
        if msg.header.flags.contains(Flags::DIRECT) {
            return Ok(Either::Left(()));
        }
        match self.node.route_owner(&msg.header.key_id) {
            Some(entry) if entry.peer == self.node.self_addr() => Ok(Either::Left(())),
            Some(entry) => self
                .node
                .get_peer(&entry.peer)
                .map(Either::Right)
                .ok_or_else(|| Error::simple(ErrorKind::NoRoute)),
            None => Err(Error::simple(ErrorKind::NoRoute)),
        }
    }

    async fn handle_update_ids(&self, peer: &Arc<PeerState>, msg: &WireMessage) {
        const RECORD_LEN: usize = KEY_ID_LEN + 4;
        let mut ranges = Vec::with_capacity(msg.body.len() / RECORD_LEN);
        for chunk in msg.body.chunks_exact(RECORD_LEN) {
            let mut start = [0u8; KEY_ID_LEN];
            start.copy_from_slice(&chunk[..KEY_ID_LEN]);
            let backend_id = LittleEndian::read_u32(&chunk[KEY_ID_LEN..]);
            ranges.push(IdRange { start, backend_id });
        }
        self.node.publish_ids(peer.primary_addr, ranges);
        self.reply_status(peer, &msg.header, 0).await;
    }

    /// Runs a locally-owned request on the `Nio` thread pool (§4.4:
    /// "Backend handlers may block on disk I/O"), then replies with
    /// every `BackendReply` in order, MORE-flagged except the last.
    async fn serve_locally(self: Arc<Self>, peer: Arc<PeerState>, msg: WireMessage) {
        let backend = self.backend.clone();
        let header = msg.header;
        let body = msg.body;
        let (tx, rx) = ::oneshot::channel();
        self.io_pool.execute(move || {
            let replies = backend.handle(BackendRequest { header, body });
            let _ = tx.send(replies);
        });

        let replies = match rx.await {
            Ok(replies) => replies,
            Err(_) => {
                self.reply_error(&peer, &header, ErrorKind::Transport).await;
                return;
            }
        };
        self.send_replies(&peer, &header, replies).await;
    }

    async fn send_replies(&self, peer: &Arc<PeerState>, orig_header: &CommandHeader, replies: Vec<BackendReply>) {
        if replies.is_empty() {
            self.reply_status(peer, orig_header, 0).await;
            return;
        }
        let last = replies.len() - 1;
        for (i, reply) in replies.into_iter().enumerate() {
            let flags = if i == last { Flags::REPLY } else { Flags::REPLY | Flags::MORE };
            let header = CommandHeader {
                flags,
                status: reply.status,
                size: reply.body.len() as u64,
                ..*orig_header
            };
            if let Ok(req) = build_request(&header, reply.body) {
                let _ = self.enqueue_backpressured(peer, req).await;
            }
        }
    }

    async fn reply_status(&self, peer: &Arc<PeerState>, orig_header: &CommandHeader, status: i32) {
        let header = CommandHeader {
            flags: Flags::REPLY,
            status,
            size: 0,
            ..*orig_header
        };
        if let Ok(req) = build_request(&header, Bytes::new()) {
            let _ = self.enqueue_backpressured(peer, req).await;
        }
    }

    async fn reply_error(&self, peer: &Arc<PeerState>, orig_header: &CommandHeader, kind: ErrorKind) {
        self.reply_status(peer, orig_header, kind.status_code()).await;
    }

    /// Allocates a sub-transaction on `owner` whose callback relays
    /// the eventual reply back to `origin` with the original
    /// transaction id restored (§4.3 "Forwarding").
    async fn forward(self: Arc<Self>, origin: Arc<PeerState>, owner: Arc<PeerState>, msg: WireMessage) {
        let original_header = msg.header;
        let new_id = self.node.next_trans_id();
        let fwd_header = CommandHeader {
            trans_id: new_id,
            ..original_header
        };
        let req = match build_request(&fwd_header, msg.body) {
            Ok(req) => req,
            Err(e) => {
                self.reply_error(&origin, &original_header, e.kind()).await;
                return;
            }
        };

        let dispatcher = self.clone();
        let origin_for_cb = origin.clone();
        let callback: Box<dyn FnMut(TransactionOutcome) + Send> = Box::new(move |outcome| {
            let dispatcher = dispatcher.clone();
            let origin = origin_for_cb.clone();
            async_runtime::spawn(async move {
                dispatcher.relay_forwarded_reply(origin, original_header, outcome).await;
            });
        });
        let trans = Transaction::new(new_id, original_header.cmd, self.node.config.wait_timeout, callback);

        self.node.incr_forwards();
        if let Err(e) = owner.send_request(trans, req).await {
            self.reply_error(&origin, &original_header, e.kind()).await;
        }
    }

    async fn relay_forwarded_reply(self: Arc<Self>, origin: Arc<PeerState>, original_header: CommandHeader, outcome: TransactionOutcome) {
        match outcome {
            TransactionOutcome::Reply { message, more } => {
                let mut flags = (message.header.flags | Flags::REPLY) & !Flags::MORE;
                if more {
                    flags |= Flags::MORE;
                }
                let header = CommandHeader {
                    trans_id: original_header.trans_id,
                    key_id: original_header.key_id,
                    flags,
                    ..message.header
                };
                if let Ok(req) = build_request(&header, message.body) {
                    let _ = self.enqueue_backpressured(&origin, req).await;
                }
            }
            TransactionOutcome::Failed(err) => {
                self.reply_error(&origin, &original_header, err.kind()).await;
            }
        }
    }

    /// Applies output backpressure before an I/O worker enqueues onto
    /// a peer's send queue (§4.4, §5): blocks until the node-wide
    /// backlog is below the low watermark, then enqueues.
    async fn enqueue_backpressured(&self, peer: &Arc<PeerState>, req: IoReq) -> Result<()> {
        if self.node.over_soft_limit() {
            self.node.wait_for_drain().await;
        }
        peer.enqueue(req).await
    }

    /// Wakes at the earliest deadline across every peer and removes
    /// every transaction whose deadline has elapsed, completing each
    /// with `Timeout` (§4.3 "Timeout sweep").
    async fn timeout_sweep_loop(self: Arc<Self>) {
        loop {
            let earliest = self
                .node
                .all_peers()
                .iter()
                .filter_map(|p| p.trans.earliest_deadline())
                .min();
            match earliest {
                Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
                None => tokio::time::sleep(Duration::from_millis(100)).await,
            }
            let now = Instant::now();
            for peer in self.node.all_peers() {
                for trans in peer.trans.sweep_expired(now) {
                    tracing::debug!(trans = trans.id, peer = %peer.primary_addr, "transaction timed out");
                    trans.complete(TransactionOutcome::Failed(Error::simple(ErrorKind::Timeout)));
                }
            }
        }
    }

    /// Scans the reconnect list at a fixed interval and attempts to
    /// re-establish every address on it, re-scheduling on failure
    /// (§4.4 "reconnect thread").
    async fn reconnect_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(RECONNECT_INTERVAL);
        loop {
            ticker.tick().await;
            for addr in self.node.drain_reconnect_list() {
                if self.connect(addr).await.is_err() {
                    self.node.schedule_reconnect(addr);
                }
            }
        }
    }
}

fn auth_header(cookie_len: u64) -> CommandHeader {
    CommandHeader {
        key_id: [0u8; KEY_ID_LEN],
        trans_id: 0,
        flags: Flags::empty(),
        cmd: Opcode::AUTH,
        status: 0,
        backend_id: 0,
        trace_id: 0,
        size: cookie_len,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoBackend;

    impl Backend for EchoBackend {
        fn handle(&self, req: BackendRequest) -> Vec<BackendReply> {
            vec![BackendReply::ok(req.body)]
        }
    }

    fn config(addr_text: &str, cookie: &[u8]) -> NodeConfig {
        NodeConfig {
            addrs: vec![addr_text.to_string()],
            cookie: cookie.to_vec(),
            wait_timeout: Duration::from_secs(5),
            ..NodeConfig::default()
        }
    }

    #[tokio::test]
    async fn two_nodes_handshake_and_exchange_a_direct_request() {
        let cookie = b"shared-secret".to_vec();

        let (node_a, dispatcher_a) = Dispatcher::bootstrap(config("127.0.0.1:0:2", &cookie), Arc::new(EchoBackend))
            .await
            .unwrap();
        let (node_b, dispatcher_b) = Dispatcher::bootstrap(config("127.0.0.1:0:2", &cookie), Arc::new(EchoBackend))
            .await
            .unwrap();

        // addresses were requested with port 0; discover the actual
        // bound port for B by asking its listener indirectly through a
        // loopback self-connect is unnecessary here — instead bind to
        // an explicit port for the connect target.
        let _ = (node_a, node_b);

        // Re-bootstrap B on a fixed high port so A can dial it by
        // address rather than by introspecting the ephemeral bind.
        let fixed_cookie = cookie.clone();
        let (node_b2, _dispatcher_b2) = Dispatcher::bootstrap(config("127.0.0.1:18490:2", &fixed_cookie), Arc::new(EchoBackend))
            .await
            .unwrap();

        let peer = dispatcher_a.connect(Address::parse("127.0.0.1:18490:2").unwrap()).await.unwrap();
        assert_eq!(peer.conn_state(), ConnState::Established);

        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        let header = CommandHeader {
            key_id: [0u8; KEY_ID_LEN],
            trans_id: 0,
            flags: Flags::DIRECT | Flags::NEED_ACK,
            cmd: Opcode::READ,
            status: 0,
            backend_id: 0,
            trace_id: 0,
            size: 5,
        };
        let trans_id = node_b2.next_trans_id();
        let trans = Transaction::new(
            trans_id,
            Opcode::READ,
            Duration::from_secs(5),
            Box::new(move |outcome| {
                if let TransactionOutcome::Reply { message, more: false } = outcome {
                    if &message.body[..] == b"hello" {
                        seen2.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }),
        );
        let req = build_request(&CommandHeader { trans_id, ..header }, Bytes::from_static(b"hello")).unwrap();
        peer.send_request(trans, req).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}

