//! The transaction multiplexer (§4.3): id allocation, the dual-indexed
//! `trans_by_id`/`trans_by_deadline` collection, reply matching, and
//! the timeout sweep.
//!
//! `PeerState` owns one [`TransactionTable`] per connection; `Node`
//! owns the one [`TransactionIdAllocator`] every peer allocates from,
//! since ids are a per-node monotonic counter, not a per-peer one
//! (§4.3's opening line).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::communication::{Flags, Opcode, WireMessage};

/// Per-node monotonic transaction id counter. Reuse after 2^64 is not
/// a concern (§4.3).
#[derive(Debug, Default)]
pub struct TransactionIdAllocator {
    next: AtomicU64,
}

impl TransactionIdAllocator {
    pub fn new() -> Self {
        // id 0 is reserved: a header with `trans_id == 0` and the
        // REPLY flag clear is never a forwarded/matched transaction,
        // which gives the loopback and forwarding paths a safe sentinel.
        TransactionIdAllocator {
            next: AtomicU64::new(1),
        }
    }

    pub fn alloc(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

/// Running counters for one transaction (§3: "cumulative stats").
#[derive(Debug, Default, Copy, Clone)]
pub struct TransactionStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub send_queue_latency: Duration,
    pub receive_queue_latency: Duration,
    pub reply_count: u32,
}

/// The terminal or intermediate outcome delivered to a transaction's
/// completion callback.
#[derive(Debug)]
pub enum TransactionOutcome {
    /// A reply was received; `more` mirrors the header's `MORE` flag.
    Reply { message: WireMessage, more: bool },
    /// The peer reset, the deadline elapsed, or the send itself failed
    /// before any reply arrived.
    Failed(crate::error::Error),
}

type Callback = Box<dyn FnMut(TransactionOutcome) + Send>;

/// An outstanding request awaiting one or more replies (§3).
pub struct Transaction {
    pub id: u64,
    pub cmd: Opcode,
    pub started: Instant,
    pub wait: Duration,
    deadline: Mutex<Instant>,
    callback: Mutex<Callback>,
    pub stats: Mutex<TransactionStats>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("cmd", &self.cmd)
            .field("deadline", &*self.deadline.lock())
            .finish()
    }
}

impl Transaction {
    pub fn new(id: u64, cmd: Opcode, wait: Duration, callback: Callback) -> Arc<Self> {
        let now = Instant::now();
        Arc::new(Transaction {
            id,
            cmd,
            started: now,
            wait,
            deadline: Mutex::new(now + wait),
            callback: Mutex::new(callback),
            stats: Mutex::new(TransactionStats::default()),
        })
    }

    pub fn deadline(&self) -> Instant {
        *self.deadline.lock()
    }

    fn set_deadline(&self, deadline: Instant) {
        *self.deadline.lock() = deadline;
    }

    /// Invokes the completion callback. Called outside of any
    /// `TransactionTable` lock, per §5's lock hierarchy (the timer
    /// thread "touches only level 3" and never runs a callback while
    /// holding it).
    pub fn complete(&self, outcome: TransactionOutcome) {
        (self.callback.lock())(outcome);
    }
}

/// Key for the deadline index: `(deadline, id)` so ties are broken by
/// id, matching §3's "ordered sequence... keyed by absolute monotonic
/// deadline (ties broken by id)".
type DeadlineKey = (Instant, u64);

/// The dual-indexed collection of a single peer's outstanding
/// transactions (§3's `trans_by_id` + `trans_by_deadline`).
#[derive(Default)]
pub struct TransactionTable {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    by_id: intmap::IntMap<Arc<Transaction>>,
    by_deadline: BTreeMap<DeadlineKey, u64>,
}

/// Result of [`TransactionTable::match_reply`].
pub enum MatchOutcome {
    /// No such transaction — a late reply after timeout, or a reply
    /// for an id this peer never issued. Callers log and discard.
    NotFound,
    /// A non-terminal (`MORE`-flagged) reply matched. The transaction
    /// stays in `trans_by_id` but is out of the deadline index for the
    /// duration of the callback; the caller must call
    /// [`TransactionTable::resume_more`] once the callback returns.
    More(Arc<Transaction>),
    /// A terminal reply matched; the transaction has already been
    /// removed from both indexes.
    Terminal(Arc<Transaction>),
}

impl TransactionTable {
    pub fn new() -> Self {
        TransactionTable::default()
    }

    /// Inserts `trans` into both indexes, per §4.3 "Insertion". Fails
    /// with [`ErrorKind::Duplicate`] on an id collision — unreachable
    /// under the monotonic allocator, kept as a defensive check rather
    /// than an `unwrap`, per the spec's "enforced as a safety
    /// assertion".
    ///
    /// [`ErrorKind::Duplicate`]: crate::error::ErrorKind::Duplicate
    pub fn insert(&self, trans: Arc<Transaction>) -> crate::error::Result<()> {
        use crate::error::{Error, ErrorKind};

        let mut inner = self.inner.lock();
        if inner.by_id.contains_key(trans.id) {
            debug_assert!(false, "transaction id {} collided", trans.id);
            return Err(Error::simple(ErrorKind::Duplicate));
        }
        inner.by_deadline.insert((trans.deadline(), trans.id), trans.id);
        inner.by_id.insert(trans.id, trans);
        Ok(())
    }

    /// Removes a transaction from both indexes unconditionally, used
    /// by `enqueue` failure rollback and by `reset`.
    pub fn remove(&self, id: u64) -> Option<Arc<Transaction>> {
        let mut inner = self.inner.lock();
        remove_locked(&mut inner, id)
    }

    /// Looks up `id` without removing it, for the send path's
    /// best-effort stats update (§4.2 step 5) — the transaction may
    /// already be gone if a reply or timeout raced the write.
    pub fn peek(&self, id: u64) -> Option<Arc<Transaction>> {
        self.inner.lock().by_id.get(id).cloned()
    }

    /// Looks up `id` and applies the MORE-flag-driven state transition
    /// of §4.3 "Match".
    pub fn match_reply(&self, id: u64, flags: Flags) -> MatchOutcome {
        let mut inner = self.inner.lock();
        let Some(trans) = inner.by_id.get(id).cloned() else {
            return MatchOutcome::NotFound;
        };
        if flags.contains(Flags::MORE) {
            inner.by_deadline.remove(&(trans.deadline(), id));
            MatchOutcome::More(trans)
        } else {
            remove_locked(&mut inner, id);
            MatchOutcome::Terminal(trans)
        }
    }

    /// Reinserts a `MORE`-matched transaction into the deadline index
    /// with a refreshed deadline, once its callback has returned.
    pub fn resume_more(&self, trans: &Arc<Transaction>) {
        let new_deadline = Instant::now() + trans.wait;
        trans.set_deadline(new_deadline);
        let mut inner = self.inner.lock();
        // the caller may have reset the peer while the callback ran;
        // only reinsert if the transaction is still tracked.
        if inner.by_id.contains_key(trans.id) {
            inner.by_deadline.insert((new_deadline, trans.id), trans.id);
        }
    }

    /// The earliest deadline across all tracked transactions, i.e.
    /// when the timer thread should next wake for this peer.
    pub fn earliest_deadline(&self) -> Option<Instant> {
        self.inner.lock().by_deadline.keys().next().map(|(d, _)| *d)
    }

    /// Removes and returns every transaction whose deadline is at or
    /// before `now` (§4.3 "Timeout sweep"). A transaction whose
    /// callback is currently running is absent from `by_deadline` and
    /// is correctly skipped.
    pub fn sweep_expired(&self, now: Instant) -> Vec<Arc<Transaction>> {
        let mut inner = self.inner.lock();
        let expired_keys: Vec<DeadlineKey> = inner
            .by_deadline
            .range(..=(now, u64::MAX))
            .map(|(k, _)| *k)
            .collect();
        let mut out = Vec::with_capacity(expired_keys.len());
        for key in expired_keys {
            inner.by_deadline.remove(&key);
            if let Some(trans) = inner.by_id.remove(key.1) {
                out.push(trans);
            }
        }
        out
    }

    /// Drains every remaining transaction from both indexes, for
    /// `PeerState::reset` (§4.2, §5 "Cancellation").
    pub fn drain_all(&self) -> Vec<Arc<Transaction>> {
        let mut inner = self.inner.lock();
        inner.by_deadline.clear();
        let ids: Vec<u64> = inner.by_id.iter().map(|(id, _)| *id).collect();
        let mut drained = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(trans) = inner.by_id.remove(id) {
                drained.push(trans);
            }
        }
        drained
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().by_id.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().by_id.len()
    }
}

fn remove_locked(inner: &mut Inner, id: u64) -> Option<Arc<Transaction>> {
    let trans = inner.by_id.remove(id)?;
    inner.by_deadline.remove(&(trans.deadline(), id));
    Some(trans)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn noop_callback() -> Callback {
        Box::new(|_| {})
    }

    #[test]
    fn insert_then_match_terminal_empties_both_indexes() {
        let table = TransactionTable::new();
        let trans = Transaction::new(7, Opcode::READ, Duration::from_millis(50), noop_callback());
        table.insert(trans.clone()).unwrap();
        assert_eq!(table.len(), 1);

        match table.match_reply(7, Flags::REPLY) {
            MatchOutcome::Terminal(t) => assert_eq!(t.id, 7),
            _ => panic!("expected a terminal match"),
        }
        assert!(table.is_empty());
        assert!(table.earliest_deadline().is_none());
    }

    #[test]
    fn more_flagged_match_leaves_transaction_in_id_index_only() {
        let table = TransactionTable::new();
        let trans = Transaction::new(11, Opcode::READ, Duration::from_millis(50), noop_callback());
        table.insert(trans.clone()).unwrap();

        match table.match_reply(11, Flags::REPLY | Flags::MORE) {
            MatchOutcome::More(t) => {
                assert_eq!(t.id, 11);
                // out of the deadline index while the callback "runs"
                assert!(table.earliest_deadline().is_none());
            }
            _ => panic!("expected a MORE match"),
        }
        assert_eq!(table.len(), 1);
        table.resume_more(&trans);
        assert!(table.earliest_deadline().is_some());
    }

    #[test]
    fn match_reply_for_unknown_id_reports_not_found() {
        let table = TransactionTable::new();
        assert!(matches!(table.match_reply(99, Flags::REPLY), MatchOutcome::NotFound));
    }

    #[test]
    fn sweep_expired_removes_only_elapsed_deadlines() {
        let table = TransactionTable::new();
        let soon = Transaction::new(1, Opcode::READ, Duration::from_millis(0), noop_callback());
        let later = Transaction::new(2, Opcode::READ, Duration::from_secs(60), noop_callback());
        table.insert(soon).unwrap();
        table.insert(later).unwrap();

        std::thread::sleep(Duration::from_millis(5));
        let expired = table.sweep_expired(Instant::now());
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, 1);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn id_allocator_is_monotonic_and_never_zero() {
        let alloc = TransactionIdAllocator::new();
        let seen = AtomicU32::new(0);
        let mut last = 0;
        for _ in 0..1000 {
            let id = alloc.alloc();
            assert!(id > last);
            last = id;
            seen.fetch_add(1, Ordering::Relaxed);
        }
        assert_eq!(seen.load(Ordering::Relaxed), 1000);
    }
}
