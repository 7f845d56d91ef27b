//! # `weft`: a structured-concurrency runtime
//!
//! This project implements a minimalistic structured-concurrency runtime in
//! as few lines as possible. It provides a *real* multi-threaded executor
//! (tasks run in parallel across named worker pools) together with the
//! primitives that make concurrent code composable: cancellation scopes,
//! deadline guards, closable FIFO channels, a fair `select`, and a
//! task-aware mutex.
//!
//! Everything hangs off one contract: tasks are **cooperative**. A body
//! runs until it reaches a suspension point (channel operation, mutex
//! acquisition, delay, await) and yields its worker there. Cancellation
//! rides the same points: it is a request, observed at the next suspension
//! point or voluntary check, never a forced interruption. **Correctness**
//! is not compromised for minimalism: cleanup always runs before a task's
//! terminal state is observable, and a failure is never silently dropped.
//!
//! For spawning and managing tasks, refer to the [task] module; for the
//! cancellation tree, see [scope]; the suspension primitives live under
//! [futures].
//!
//! ## Example
//!
//! A producer feeding two consumers through a rendezvous channel:
//!
//! ```
//! use weft::futures::channel::{produce, Capacity};
//! use weft::scope::Scope;
//! use weft::task::{Dispatcher, Executor};
//!
//! let scope = Scope::new();
//! let (chan, _producer) = produce(&scope, Dispatcher::Default, Capacity::Rendezvous, |chan| async move {
//!     for i in 0..10 {
//!         chan.send(i).await.unwrap();
//!     }
//! });
//!
//! let consumers: Vec<_> = (0..2)
//!     .map(|_| {
//!         let chan = chan.clone();
//!         Executor::spawn(&scope, Dispatcher::Default, async move {
//!             let mut sum = 0;
//!             while let Some(v) = chan.next().await {
//!                 sum += v;
//!             }
//!             sum
//!         })
//!     })
//!     .collect();
//!
//! let total: i32 = Executor::block_on(async move {
//!     let mut total = 0;
//!     for c in consumers {
//!         total += c.await.unwrap();
//!     }
//!     total
//! });
//! assert_eq!(total, 45);
//! ```
pub mod error;
pub mod futures;
pub mod scope;
pub mod task;
pub(crate) mod timer;
