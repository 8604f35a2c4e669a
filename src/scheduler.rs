//! Scheduler lifecycle and run loop.
//!
//! A [Scheduler] owns one background thread that drains a trigger-time
//! ordered queue of ready-to-run continuations. Every scheduled action runs
//! on that thread, serially; no two actions ever run concurrently, so action
//! bodies need no locking of their own. All other threads are
//! producers (`fire`, `complete`) or consumers (`block`).
//!
//! Schedulers are explicit instances rather than a process-wide global:
//! tests can create an isolated scheduler and shut it down deterministically
//! via [Scheduler::shutdown] or by dropping it.
//!
//! # Example
//!
//! ```
//! use deferred::Scheduler;
//!
//! let sched = Scheduler::new();
//! assert_eq!(sched.completed(2 + 8).block(), 10);
//! sched.shutdown();
//! ```

use std::{
    any::Any,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Instant,
};

use log::{debug, error, trace};

use crate::{
    chain::{Core, Value},
    deferred::{AnyDeferred, Deferred},
};

/// The scheduler: one thread, one trigger-time ordered queue.
///
/// Dropping the scheduler (or calling [Scheduler::shutdown]) stops the
/// thread and joins it. Work that has not completed by then is abandoned;
/// there is no cancellation or timeout policy for in-flight chains.
pub struct Scheduler {
    handle: Handle,
    thread: Option<JoinHandle<()>>,
}

/// A cheap, cloneable constructor handle for a [Scheduler].
///
/// Combinator closures must be `Send + 'static`, so they cannot borrow the
/// scheduler itself; move a `Handle` into them instead to create new futures
/// from inside a chain.
#[derive(Clone)]
pub struct Handle {
    core: Arc<Core>,
}

impl Scheduler {
    /// Start a scheduler with its own background thread.
    pub fn new() -> Self {
        let core = Arc::new(Core::new());
        let thread_core = core.clone();

        let thread = thread::Builder::new()
            .name("deferred-scheduler".into())
            .spawn(move || run_loop(&thread_core))
            .expect("failed to spawn scheduler thread");

        Self {
            handle: Handle { core },
            thread: Some(thread),
        }
    }

    /// A cloneable handle for constructing futures on this scheduler.
    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    /// An immediately-ready future holding `value`.
    pub fn completed<T: Send + Sync + 'static>(&self, value: T) -> Deferred<T> {
        self.handle.completed(value)
    }

    /// A placeholder future, resolved later via [Deferred::complete] from
    /// any thread.
    pub fn pending<T>(&self) -> Deferred<T> {
        self.handle.pending()
    }

    /// A future that completes once every child has completed. See
    /// [Handle::all_of].
    pub fn all_of<I>(&self, children: I) -> Deferred<()>
    where
        I: IntoIterator<Item = AnyDeferred>,
    {
        self.handle.all_of(children)
    }

    /// Stop the scheduler thread and wait for it to exit.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.handle.core.request_shutdown();
            let _ = thread.join();
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Handle {
    /// An immediately-ready future holding `value`.
    pub fn completed<T: Send + Sync + 'static>(&self, value: T) -> Deferred<T> {
        let value: Value = Arc::new(value);
        let id = self.core.insert_head(Some(value));
        Deferred::from_parts(self.core.clone(), id)
    }

    /// A placeholder future, resolved later via [Deferred::complete].
    pub fn pending<T>(&self) -> Deferred<T> {
        let id = self.core.insert_head(None);
        Deferred::from_parts(self.core.clone(), id)
    }

    /// Fan-in: a future that completes (with no payload) once all `children`
    /// have completed, in whatever order they finish. Firing it fires every
    /// child; children completed from independent threads decrement a shared
    /// atomic counter, and whichever decrement reaches zero completes the
    /// fan-in node.
    ///
    /// An empty child set completes as soon as the node is fired.
    pub fn all_of<I>(&self, children: I) -> Deferred<()>
    where
        I: IntoIterator<Item = AnyDeferred>,
    {
        let children: Vec<AnyDeferred> = children.into_iter().collect();
        let remaining = Arc::new(AtomicUsize::new(children.len()));

        let id = self.core.insert_head_with_action(Box::new(move |core, me| {
            if children.is_empty() {
                core.complete(me, Arc::new(()));
                return;
            }

            let target = core.clone();
            for child in children {
                let remaining = remaining.clone();
                let target = target.clone();
                let (child_core, child_id) = child.into_parts();

                // The bridge lives on the child's chain (and possibly a
                // different scheduler); it completes back into the fan-in
                // node's own core.
                child_core.append(
                    child_id,
                    Instant::now(),
                    Box::new(move |child_core, bridge| {
                        let value = child_core
                            .result(child_id)
                            .expect("child incomplete when its fan-in bridge ran");
                        if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                            target.complete(me, Arc::new(()));
                        }
                        child_core.complete(bridge, value);
                    }),
                );
                child_core.fire(child_id);
            }
        }));

        Deferred::from_parts(self.core.clone(), id)
    }
}

/// The scheduler thread: pop due nodes and run their actions serially. A
/// panicking action is contained and reported, but the chain is not advanced
/// past the failing node, so any waiter on that chain stays blocked.
fn run_loop(core: &Arc<Core>) {
    debug!("scheduler thread started");

    while let Some((id, action, completed)) = core.next_ready() {
        match action {
            Some(action) => {
                trace!("running action for node {id:?}");
                if let Err(payload) = catch_unwind(AssertUnwindSafe(|| action(core, id))) {
                    error!(
                        "action for node {id:?} panicked: {}; chain stalled",
                        panic_message(&*payload)
                    );
                }
            }
            // Re-fired node whose action already ran: re-drive the
            // continuation.
            None if completed => core.advance(id),
            // Still-pending placeholder: its complete() call drives the
            // chain.
            None => {}
        }
    }

    debug!("scheduler thread exiting");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("non-string panic payload")
    }
}
