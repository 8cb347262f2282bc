//! Core networking and transaction subsystem for a distributed
//! object-storage cluster node.
//!
//! A node is one member of a peer-to-peer storage fleet: it accepts
//! object read/write/lookup requests from clients, routes them to the
//! owning peer by key, serves local requests against its backends, and
//! replies. This crate is the per-peer connection state machine plus
//! the transaction multiplexer that deliver correlated request/reply
//! messaging over many long-lived TCP connections, with forwarding,
//! timeouts, backpressure, and graceful peer-loss recovery.
//!
//! Object storage backends, the routing/DHT id index's assignment
//! policy, persistent metadata, configuration parsing, and logging
//! backends are external collaborators this crate consumes through
//! narrow interfaces ([`reactor::Backend`], [`node::Node::publish_ids`])
//! rather than implements.
//!
//! The four cooperating components, leaves-first:
//!
//! - [`communication`] — the wire codec & framer: address parsing and
//!   the `command_header || attribute_block? || payload?` frame shape.
//! - [`peer`] — [`peer::PeerState`], one instance per connected remote
//!   address: the send queue, the dual-indexed transaction table, the
//!   send-path algorithm, the loopback short-circuit, and the
//!   connection lifecycle.
//! - [`transaction`] — the multiplexer: id allocation, reply matching,
//!   and the timeout sweep.
//! - [`reactor`] — the dispatcher: [`reactor::Dispatcher::bootstrap`]
//!   wires a [`node::Node`] and every background task (acceptor,
//!   per-peer reader/writer, timeout sweep, reconnect scan) together.
//!
//! [`error`], [`collections`], and [`async_runtime`] are the ambient
//! plumbing those four share.

pub mod async_runtime;
pub mod collections;
pub mod communication;
pub mod error;
pub mod node;
pub mod peer;
pub mod reactor;
pub mod transaction;

pub use error::{Error, ErrorKind, Result};
pub use node::{Node, NodeConfig};
pub use reactor::{Backend, BackendReply, BackendRequest, Dispatcher};
