//! Typed future handles and combinators.
//!
//! A [Deferred] is a handle onto one node of a chain. Combinators
//! ([Deferred::delay], [Deferred::on_complete], [Deferred::and_then]) each
//! append exactly one node to the chain and return a handle to it. Chains
//! are single-consumer: attaching a second continuation to the same node
//! overwrites the first.
//!
//! A chain does nothing until it is driven, either by [Deferred::fire]
//! (non-blocking) or [Deferred::block] (fire, then park the caller until the
//! result is available). Both operate on the chain's *head*, so any handle
//! on the chain can drive it.
//!
//! # Example
//!
//! ```
//! use deferred::Scheduler;
//! use std::thread;
//!
//! let sched = Scheduler::new();
//!
//! // A placeholder stands in for in-flight work; whichever thread notices
//! // completion resolves it.
//! let request = sched.pending::<u32>();
//! let logged = request.on_complete(|n| println!("request finished: {n}"));
//!
//! let completer = {
//!     let request = request.clone();
//!     thread::spawn(move || {
//!         request.complete(21);
//!     })
//! };
//!
//! assert_eq!(logged.block(), 21);
//! completer.join().unwrap();
//! ```

use std::{
    marker::PhantomData,
    sync::Arc,
    time::{Duration, Instant},
};

use crate::chain::{Core, NodeId, Value};

/// A typed handle onto one future node.
///
/// Handles are cheap to clone and may be shared across threads; the
/// underlying chain is still single-consumer.
pub struct Deferred<T> {
    core: Arc<Core>,
    id: NodeId,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            id: self.id,
            _marker: PhantomData,
        }
    }
}

/// A type-erased future handle, consumed by fan-in
/// ([crate::Handle::all_of]). Fan-in never reads child payloads, so any
/// `Deferred<T>` converts into one.
pub struct AnyDeferred {
    core: Arc<Core>,
    id: NodeId,
}

impl<T> From<Deferred<T>> for AnyDeferred {
    fn from(deferred: Deferred<T>) -> Self {
        Self {
            core: deferred.core,
            id: deferred.id,
        }
    }
}

impl AnyDeferred {
    pub(crate) fn into_parts(self) -> (Arc<Core>, NodeId) {
        (self.core, self.id)
    }
}

fn downcast<T: Send + Sync + 'static>(value: &Value) -> Arc<T> {
    value
        .clone()
        .downcast::<T>()
        .unwrap_or_else(|_| panic!("chain value has an unexpected type"))
}

impl<T> Deferred<T> {
    pub(crate) fn from_parts(core: Arc<Core>, id: NodeId) -> Self {
        Self {
            core,
            id,
            _marker: PhantomData,
        }
    }

    /// Submit this chain's head for execution without blocking the caller.
    /// A pending placeholder head is only marked as driven; the later
    /// `complete` call advances the chain. Re-firing a finished chain
    /// re-drives its continuations.
    pub fn fire(&self) -> &Self {
        self.core.fire(self.id);
        self
    }

    /// Whether this node has completed.
    pub fn is_complete(&self) -> bool {
        self.core.is_complete(self.id)
    }

    /// Append a timed continuation: it forwards this node's result
    /// unchanged, but not before `delay` has elapsed from the call to this
    /// method.
    pub fn delay(&self, delay: Duration) -> Deferred<T> {
        let parent = self.id;
        let id = self.core.append(
            parent,
            Instant::now() + delay,
            Box::new(move |core, me| {
                let value = core
                    .result(parent)
                    .expect("parent incomplete when delay continuation ran");
                core.complete(me, value);
            }),
        );
        Deferred::from_parts(self.core.clone(), id)
    }
}

impl<T: Clone + Send + Sync + 'static> Deferred<T> {
    /// Resolve this node with `value`, advancing the chain if it has been
    /// fired. The first writer wins: returns `false` (and changes nothing)
    /// if the node already completed.
    ///
    /// This is the completion entry point for placeholders created with
    /// [crate::Scheduler::pending]; external threads (I/O callbacks,
    /// selector loops) call it from wherever completion is noticed.
    pub fn complete(&self, value: T) -> bool {
        self.core.complete(self.id, Arc::new(value))
    }

    /// Fire this chain and park the calling thread until the result is
    /// available, then return it. Returns immediately if the node has
    /// already completed. Any number of threads may block on the same node;
    /// completion releases them all.
    ///
    /// A chain stalled by a panicking action never completes, so this blocks
    /// forever past such a node.
    pub fn block(&self) -> T {
        match self.core.result_or_latch(self.id) {
            Ok(value) => (*downcast::<T>(&value)).clone(),
            Err(latch) => {
                self.fire();
                latch.wait();
                let value = self
                    .core
                    .result(self.id)
                    .expect("waiter woken without a result");
                (*downcast::<T>(&value)).clone()
            }
        }
    }

    /// Append a side-effecting continuation: `f` observes this node's result
    /// and the result is passed through unchanged.
    pub fn on_complete<F>(&self, f: F) -> Deferred<T>
    where
        F: FnOnce(&T) + Send + 'static,
    {
        let parent = self.id;
        let id = self.core.append(
            parent,
            Instant::now(),
            Box::new(move |core, me| {
                let value = core
                    .result(parent)
                    .expect("parent incomplete when continuation ran");
                f(&downcast::<T>(&value));
                core.complete(me, value);
            }),
        );
        Deferred::from_parts(self.core.clone(), id)
    }

    /// Append a dependent continuation: `f` receives this node's result and
    /// returns a new future; the returned node completes with that child
    /// future's result. This is how nested asynchronous work is sequenced.
    ///
    /// The child may live on a different scheduler; the bridge node is
    /// appended to the child's own chain and completes back into this one.
    pub fn and_then<U, F>(&self, f: F) -> Deferred<U>
    where
        F: FnOnce(&T) -> Deferred<U> + Send + 'static,
    {
        let parent = self.id;
        let id = self.core.append(
            parent,
            Instant::now(),
            Box::new(move |core, me| {
                let value = core
                    .result(parent)
                    .expect("parent incomplete when continuation ran");
                let child = f(&downcast::<T>(&value));

                let target = core.clone();
                let child_id = child.id;
                child.core.append(
                    child_id,
                    Instant::now(),
                    Box::new(move |child_core, bridge| {
                        let value = child_core
                            .result(child_id)
                            .expect("child incomplete when its bridge ran");
                        target.complete(me, value.clone());
                        child_core.complete(bridge, value);
                    }),
                );
                child.core.fire(child_id);
            }),
        );
        Deferred::from_parts(self.core.clone(), id)
    }
}

#[cfg(test)]
mod tests {
    use crate::{AnyDeferred, Scheduler};
    use anyhow::{anyhow, Result};
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        thread,
        time::{Duration, Instant},
    };

    #[test]
    fn immediate_chain_has_no_scheduler_delay() {
        let sched = Scheduler::new();
        let handle = sched.handle();

        let before = Instant::now();
        let result = sched
            .completed(2i32)
            .and_then(move |n: &i32| handle.completed(n + 8))
            .on_complete(|n| assert_eq!(*n, 10))
            .block();

        assert_eq!(result, 10);
        assert!(Instant::now() - before < Duration::from_millis(250));
    }

    #[test]
    fn delay_blocks_for_at_least_the_requested_duration() {
        let sched = Scheduler::new();

        let before = Instant::now();
        let result = sched
            .completed(String::from("late"))
            .delay(Duration::from_millis(200))
            .block();

        assert_eq!(result, "late");
        assert!(Instant::now() - before >= Duration::from_millis(200));
    }

    #[test]
    fn compose_into_a_delayed_chain() {
        let sched = Scheduler::new();
        let handle = sched.handle();

        let before = Instant::now();
        let result = sched
            .completed(String::new())
            .and_then(move |_: &String| {
                handle
                    .completed(String::from("hello"))
                    .delay(Duration::from_millis(500))
            })
            .on_complete(|s| assert_eq!(s.as_str(), "hello"))
            .block();

        assert_eq!(result, "hello");
        let elapsed = Instant::now() - before;
        assert!(elapsed >= Duration::from_millis(500));
        assert!(elapsed < Duration::from_millis(1500));
    }

    #[test]
    fn placeholder_fired_before_completion_still_propagates() {
        let sched = Scheduler::new();
        let request = sched.pending::<String>();
        let calls = Arc::new(AtomicUsize::new(0));

        let tail = {
            let calls = calls.clone();
            request.on_complete(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            })
        };
        tail.fire();

        let completer = {
            let request = request.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(100));
                request.complete(String::from("io done"));
            })
        };

        let before = Instant::now();
        assert_eq!(tail.block(), "io done");
        assert!(Instant::now() - before >= Duration::from_millis(50));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        completer.join().unwrap();
    }

    #[test]
    fn double_completion_is_a_silent_noop() {
        let sched = Scheduler::new();
        let request = sched.pending::<&'static str>();
        let calls = Arc::new(AtomicUsize::new(0));

        let tail = {
            let calls = calls.clone();
            request.on_complete(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            })
        };

        assert!(request.complete("first"));
        assert!(!request.complete("second"));

        assert_eq!(tail.block(), "first");
        // Let the scheduler settle before counting callback invocations.
        thread::sleep(Duration::from_millis(50));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn multiple_blockers_are_all_released() {
        let sched = Scheduler::new();
        let request = sched.pending::<u32>();

        let blockers: Vec<_> = (0..4)
            .map(|_| {
                let request = request.clone();
                thread::spawn(move || request.block())
            })
            .collect();

        thread::sleep(Duration::from_millis(50));
        request.complete(99);

        for blocker in blockers {
            assert_eq!(blocker.join().unwrap(), 99);
        }
    }

    #[test]
    fn all_of_completes_once_on_the_last_completion() {
        let sched = Scheduler::new();
        let children: Vec<_> = (0..5).map(|_| sched.pending::<u32>()).collect();
        let completions = Arc::new(AtomicUsize::new(0));

        let joined = {
            let completions = completions.clone();
            sched
                .all_of(children.iter().cloned().map(Into::into))
                .on_complete(move |_| {
                    completions.fetch_add(1, Ordering::SeqCst);
                })
        };

        // Shuffled completion order, each from its own thread.
        let racers: Vec<_> = [3usize, 0, 4, 1, 2]
            .iter()
            .map(|&i| {
                let child = children[i].clone();
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(10 * (i as u64 + 1)));
                    child.complete(i as u32);
                })
            })
            .collect();

        joined.block();
        for racer in racers {
            racer.join().unwrap();
        }
        thread::sleep(Duration::from_millis(50));
        assert_eq!(completions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn all_of_over_delays_completes_with_the_slowest() {
        let sched = Scheduler::new();

        let a = sched.completed("a").delay(Duration::from_millis(100));
        let b = sched.completed("b").delay(Duration::from_millis(50));
        let c = sched.completed("c").delay(Duration::from_millis(10));

        let before = Instant::now();
        let children: [AnyDeferred; 3] = [a.into(), b.into(), c.into()];
        sched.all_of(children).block();

        let elapsed = Instant::now() - before;
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(400));
    }

    #[test]
    fn all_of_with_no_children_completes_immediately() {
        let sched = Scheduler::new();

        let before = Instant::now();
        sched.all_of(Vec::new()).block();
        assert!(Instant::now() - before < Duration::from_millis(250));
    }

    #[test]
    fn sequential_requests_fan_into_one_future() {
        let sched = Scheduler::new();
        let handle = sched.handle();
        let served = Arc::new(AtomicUsize::new(0));

        let chains = (0..20).map(|_| {
            let mut chain = sched.completed(String::new());
            for _ in 0..2 {
                let handle = handle.clone();
                let served = served.clone();
                chain = chain.and_then(move |_: &String| {
                    handle
                        .completed(String::from("hello"))
                        .delay(Duration::from_millis(20))
                        .on_complete(move |s| {
                            assert_eq!(s.as_str(), "hello");
                            served.fetch_add(1, Ordering::SeqCst);
                        })
                });
            }
            chain.into()
        });

        sched.all_of(chains.collect::<Vec<AnyDeferred>>()).block();
        assert_eq!(served.load(Ordering::SeqCst), 40);
    }

    #[test]
    fn racing_completions_do_not_cross_talk() -> Result<()> {
        let _ = env_logger::builder().is_test(true).try_init();
        let sched = Scheduler::new();

        let chains: Vec<_> = (0..1000u32)
            .map(|i| {
                let request = sched.pending::<u32>();
                let tail = request.on_complete(move |n| assert_eq!(*n, i));
                tail.fire();
                (request, tail, i)
            })
            .collect();

        let racers: Vec<_> = chains
            .iter()
            .map(|(request, _, i)| {
                let request = request.clone();
                let i = *i;
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis((i % 20) as u64));
                    assert!(request.complete(i));
                })
            })
            .collect();

        for (_, tail, i) in &chains {
            assert_eq!(tail.block(), *i);
        }
        for racer in racers {
            racer
                .join()
                .map_err(|_| anyhow!("completer thread panicked"))?;
        }
        Ok(())
    }
}
