//! Future sub-modules.
//!
//! The `futures` module collects the suspension primitives of the runtime.
//! Each sub-module implements one kind of future; together they are the
//! well-defined points at which a task yields its worker, and therefore the
//! points at which cancellation is observed.
//!
//! The following sub-modules are exposed:
//!
//! - `channel`: a capacity-bounded, closable FIFO channel for inter-task
//!   communication.
//! - `event`: a notification primitive for inter-task signalling.
//! - `mutex`: a task-aware mutual-exclusion primitive with FIFO handoff.
//! - `select`: races several channel operations and completes exactly one.
//! - `timeout`: deadline guards around arbitrary bodies.
//! - `timer`: suspends a task for a period of time without blocking its
//!   worker.

pub mod channel;
pub mod event;
pub mod mutex;
pub mod select;
pub mod timeout;
pub mod timer;
