//! # `deferred`: a minimal timer-driven future library
//!
//! This crate implements a small, self-contained deferred-computation
//! library, written in as few lines as possible: composable future chains
//! (value propagation, timed delays, side-effecting callbacks, dependent
//! composition, fan-in) driven by a single scheduler thread. It is built
//! entirely from primitive thread synchronization (one OS thread, a
//! trigger-time ordered queue, mutexes, condition variables and atomics)
//! with no async runtime underneath, making it a useful study of how
//! promise/future semantics fall out of those primitives.
//!
//! A chain starts from an immediately-ready value or from a pending
//! placeholder resolved later by whatever thread notices completion (an I/O
//! callback, a selector loop). Combinators append one node at a time; the
//! chain is then either *fired* (non-blocking) or *blocked on* (fired, then
//! waited for). See the [scheduler] and [deferred] modules for details, and
//! the [latch] module for the blocking bridge.
//!
//! ## Example
//!
//! ```
//! use deferred::Scheduler;
//! use std::time::Duration;
//!
//! let sched = Scheduler::new();
//! let handle = sched.handle();
//!
//! let greeting = sched
//!     .completed(String::from("hello"))
//!     .delay(Duration::from_millis(50))
//!     .and_then(move |s: &String| handle.completed(format!("{s}, world")))
//!     .block();
//!
//! assert_eq!(greeting, "hello, world");
//! ```
//!
//! ## Limitations
//!
//! Chains are single-consumer (attaching a second continuation to a node
//! overwrites the first), there is no cancellation or timeout for a fired
//! chain, and no structured error channel: a panicking continuation is
//! contained and logged by the scheduler, but the chain stalls at that node
//! and waiters on it block forever.

pub(crate) mod chain;
pub mod deferred;
pub mod latch;
pub mod scheduler;

pub use deferred::{AnyDeferred, Deferred};
pub use scheduler::{Handle, Scheduler};
