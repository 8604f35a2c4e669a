//! The future-node arena and chain state machine.
//!
//! Every node of every chain lives in one [Slab] arena owned by the
//! scheduler's shared [Core], addressed by [NodeId] instead of by pointer.
//! A node links forward to at most one continuation (`next`) and back to the
//! first node of its chain (`head`), so firing any handle on a chain always
//! resubmits from the root.
//!
//! All mutation goes through the single state mutex. The lock is only ever
//! held for short field updates; user-supplied closures (combinator bodies,
//! callbacks) always run with the lock released.

use std::{
    any::Any,
    cmp::Ordering,
    collections::BinaryHeap,
    sync::{Arc, Condvar, Mutex, MutexGuard},
    time::Instant,
};

use slab::Slab;

use crate::latch::Latch;

/// Type-erased result slot. Values are shared `Arc`s so pass-through nodes
/// (delay, side-effect callbacks) forward them without cloning the payload.
pub(crate) type Value = Arc<dyn Any + Send + Sync>;

/// The computation a node runs when the scheduler dequeues it. Receives the
/// shared core and the node's own id; runs exactly once, on the scheduler
/// thread, with no locks held.
pub(crate) type Action = Box<dyn FnOnce(&Arc<Core>, NodeId) + Send>;

/// Arena index of a future node.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct NodeId(usize);

/// One step of a deferred computation.
pub(crate) struct Node {
    pub result: Option<Value>,
    pub completed: bool,
    /// True once some thread has asked for this chain to be driven, either
    /// by firing the head or by being enqueued as a continuation. Governs
    /// whether completing the node propagates to `next`.
    pub subscribed: bool,
    pub trigger_at: Instant,
    pub action: Option<Action>,
    /// Single consumer: attaching a second continuation overwrites the
    /// first.
    pub next: Option<NodeId>,
    pub head: NodeId,
    pub waiters: Arc<Latch>,
}

/// Heap entry; orders the scheduler queue by ascending trigger time, FIFO
/// among equal trigger times.
struct Entry {
    at: Instant,
    seq: u64,
    id: NodeId,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert so the earliest entry pops first.
        other.at.cmp(&self.at).then_with(|| other.seq.cmp(&self.seq))
    }
}

pub(crate) struct State {
    nodes: Slab<Node>,
    queue: BinaryHeap<Entry>,
    seq: u64,
    shutdown: bool,
}

/// Shared state between the scheduler thread and every handle.
pub(crate) struct Core {
    state: Mutex<State>,
    /// Wakes the scheduler thread on new submissions and on shutdown.
    tick: Condvar,
}

impl Core {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                nodes: Slab::new(),
                queue: BinaryHeap::new(),
                seq: 0,
                shutdown: false,
            }),
            tick: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Create a chain head: pre-completed when `result` is `Some`
    /// (an immediate value), otherwise a pending placeholder.
    pub fn insert_head(&self, result: Option<Value>) -> NodeId {
        let mut st = self.lock();
        let entry = st.nodes.vacant_entry();
        let id = NodeId(entry.key());
        entry.insert(Node {
            completed: result.is_some(),
            result,
            subscribed: false,
            trigger_at: Instant::now(),
            action: None,
            next: None,
            head: id,
            waiters: Arc::new(Latch::new()),
        });
        id
    }

    /// Create a fan-in head: pending, with an action that wires up and fires
    /// its children once the node itself is fired.
    pub fn insert_head_with_action(&self, action: Action) -> NodeId {
        let id = self.insert_head(None);
        self.lock().nodes[id.0].action = Some(action);
        id
    }

    /// Append a continuation to `parent`'s chain. Copies the chain head onto
    /// the new node and overwrites `parent.next`.
    pub fn append(&self, parent: NodeId, trigger_at: Instant, action: Action) -> NodeId {
        let mut st = self.lock();
        let head = st.nodes[parent.0].head;
        let entry = st.nodes.vacant_entry();
        let id = NodeId(entry.key());
        entry.insert(Node {
            result: None,
            completed: false,
            subscribed: false,
            trigger_at,
            action: Some(action),
            next: None,
            head,
            waiters: Arc::new(Latch::new()),
        });
        st.nodes[parent.0].next = Some(id);
        id
    }

    /// Complete a node with `value`. First writer wins: a second call is a
    /// no-op returning `false`. On first completion the continuation is
    /// enqueued (if the chain is subscribed) and every blocked waiter is
    /// released.
    pub fn complete(&self, id: NodeId, value: Value) -> bool {
        let mut st = self.lock();
        let node = &mut st.nodes[id.0];
        if node.completed {
            return false;
        }
        node.result = Some(value);
        node.completed = true;

        let waiters = node.waiters.clone();
        let next = if node.subscribed { node.next } else { None };
        let mut woken = false;
        if let Some(next) = next {
            Self::enqueue_locked(&mut st, next);
            woken = true;
        }
        drop(st);

        if woken {
            self.tick.notify_one();
        }
        waiters.open();
        true
    }

    /// Fire the chain this node belongs to. Marks the head subscribed and
    /// submits it unless it is a still-pending placeholder, in which case a
    /// later `complete` call drives the chain instead.
    pub fn fire(&self, id: NodeId) {
        let mut st = self.lock();
        let head = st.nodes[id.0].head;
        let node = &mut st.nodes[head.0];
        node.subscribed = true;
        if node.completed || node.action.is_some() {
            Self::enqueue_locked(&mut st, head);
            drop(st);
            self.tick.notify_one();
        }
    }

    /// Re-drive the continuation of an already-completed node. Used by the
    /// scheduler when it pops a node whose action has already run.
    pub fn advance(&self, id: NodeId) {
        let mut st = self.lock();
        if let Some(next) = st.nodes[id.0].next {
            Self::enqueue_locked(&mut st, next);
            drop(st);
            self.tick.notify_one();
        }
    }

    fn enqueue_locked(st: &mut State, id: NodeId) {
        st.nodes[id.0].subscribed = true;
        let at = st.nodes[id.0].trigger_at;
        let seq = st.seq;
        st.seq += 1;
        st.queue.push(Entry { at, seq, id });
    }

    /// The completed result of a node, if any.
    pub fn result(&self, id: NodeId) -> Option<Value> {
        let st = self.lock();
        let node = &st.nodes[id.0];
        if node.completed {
            node.result.clone()
        } else {
            None
        }
    }

    /// The completed result, or the latch to park on. Checked atomically so
    /// a completion racing the caller can never strand it: the latch is
    /// sticky and `complete` opens it after publishing the result.
    pub fn result_or_latch(&self, id: NodeId) -> Result<Value, Arc<Latch>> {
        let st = self.lock();
        let node = &st.nodes[id.0];
        if node.completed {
            Ok(node.result.clone().expect("completed node without a result"))
        } else {
            Err(node.waiters.clone())
        }
    }

    pub fn is_complete(&self, id: NodeId) -> bool {
        self.lock().nodes[id.0].completed
    }

    pub fn request_shutdown(&self) {
        self.lock().shutdown = true;
        self.tick.notify_one();
    }

    /// Scheduler thread entry: block until something is runnable. Returns
    /// the next due node's id and its action (taken out of the node), or
    /// `None` on shutdown.
    pub fn next_ready(&self) -> Option<(NodeId, Option<Action>, bool)> {
        let mut st = self.lock();
        loop {
            if st.shutdown {
                return None;
            }

            let now = Instant::now();
            match st.queue.peek().map(|entry| entry.at) {
                None => st = self.tick.wait(st).unwrap(),
                Some(at) if at > now => {
                    let (guard, _) = self.tick.wait_timeout(st, at - now).unwrap();
                    st = guard;
                }
                Some(_) => {
                    let id = st.queue.pop().unwrap().id;
                    let node = &mut st.nodes[id.0];
                    return Some((id, node.action.take(), node.completed));
                }
            }
        }
    }
}
