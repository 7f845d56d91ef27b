//! Async timer futures.
//!
//! Timers are the runtime's only time-based suspension point. A [`Timer`]
//! registers its deadline with the crate's timer driver, which wakes the
//! owning task once the deadline passes; the worker is never blocked. The
//! main use-case is putting a task to sleep for a period of time via
//! [`delay`].
//!
//! # Example
//!
//! ```
//! use std::time::{Duration, Instant};
//! use weft::futures::timer::delay;
//! use weft::task::Executor;
//!
//! let now = Instant::now();
//! Executor::block_on(async {
//!     delay(Duration::from_millis(200)).await;
//! });
//! assert!(now.elapsed() >= Duration::from_millis(200));
//! ```

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::{Duration, Instant},
};

use crate::timer::Driver;

/// Asynchronous timer.
///
/// A future that completes once its deadline has passed. It is guaranteed to
/// suspend the task for *at least* the requested duration; it may sleep for
/// longer.
pub struct Timer {
    deadline: Instant,
    key: Option<usize>,
}

impl Timer {
    /// Put the current task to sleep for the specified duration.
    #[must_use]
    pub fn sleep(duration: Duration) -> Self {
        Self {
            deadline: Instant::now() + duration,
            key: None,
        }
    }
}

impl Future for Timer {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if Instant::now() >= self.deadline {
            if let Some(key) = self.key.take() {
                Driver::get().cancel(key);
            }
            return Poll::Ready(());
        }

        let deadline = self.deadline;
        self.key = Some(match self.key {
            Some(key) => Driver::get().refresh(key, deadline, cx.waker().clone()),
            None => Driver::get().register(deadline, cx.waker().clone()),
        });

        Poll::Pending
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            Driver::get().cancel(key);
        }
    }
}

/// Suspends the calling task for `duration` without blocking its worker.
pub async fn delay(duration: Duration) {
    Timer::sleep(duration).await;
}
