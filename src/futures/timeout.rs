//! Deadline guards.
//!
//! [`with_timeout`] races a body against a deadline. The body runs under a
//! fresh child scope of the ambient one; if the deadline fires first, that
//! scope is cancelled (taking down any tasks the body spawned through
//! [`Scope::current`]), the body is dropped so its cleanup runs, and the
//! guard reports [`Error::Timeout`].
//!
//! The guard's poll is the single source of truth for the race: body
//! completion is checked before the deadline, so a body that finishes in
//! the same instant the timer fires still wins, and no outcome is ever
//! reported twice. Cancellation remains cooperative: the deadline marks
//! the scope cancelled at expiry, but work in flight only stops when it
//! next suspends or checks.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use weft::error::Error;
//! use weft::futures::timeout::{with_timeout, with_timeout_or_none};
//! use weft::futures::timer::delay;
//! use weft::task::Executor;
//!
//! Executor::block_on(async {
//!     let fast = with_timeout(Duration::from_millis(500), async { 5 }).await;
//!     assert_eq!(fast, Ok(5));
//!
//!     let slow = with_timeout(Duration::from_millis(50), async {
//!         delay(Duration::from_secs(60)).await;
//!     })
//!     .await;
//!     assert_eq!(slow, Err(Error::Timeout));
//!
//!     let graceful = with_timeout_or_none(Duration::from_millis(50), async {
//!         delay(Duration::from_secs(60)).await;
//!         "never"
//!     })
//!     .await;
//!     assert_eq!(graceful, None);
//! });
//! ```

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use log::trace;

use crate::{error::Error, futures::timer::Timer, scope::Scope, task};

/// Runs `body` with a deadline. See the [module docs](self) for semantics.
pub fn with_timeout<F: Future>(duration: Duration, body: F) -> Timeout<F> {
    Timeout {
        body: Some(Box::pin(body)),
        timer: Timer::sleep(duration),
        scope: None,
    }
}

/// Like [`with_timeout`], but converts the timeout into `None` instead of
/// an error.
pub async fn with_timeout_or_none<F: Future>(duration: Duration, body: F) -> Option<F::Output> {
    with_timeout(duration, body).await.ok()
}

/// Future returned by [`with_timeout`].
pub struct Timeout<F: Future> {
    body: Option<Pin<Box<F>>>,
    timer: Timer,
    scope: Option<Scope>,
}

impl<F: Future> Future for Timeout<F> {
    type Output = Result<F::Output, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        let Some(body) = this.body.as_mut() else {
            return Poll::Ready(Err(Error::IllegalState(
                "timeout guard polled after completion",
            )));
        };

        let scope = this
            .scope
            .get_or_insert_with(|| Scope::current().unwrap_or_default().child());

        // Completion is checked first; ties go to the body.
        let polled = task::with_ambient_scope(scope, || body.as_mut().poll(cx));
        if let Poll::Ready(value) = polled {
            this.body = None;
            return Poll::Ready(Ok(value));
        }

        if Pin::new(&mut this.timer).poll(cx).is_ready() {
            trace!("timeout guard expired, cancelling body scope");
            scope.cancel();
            this.body = None;
            return Poll::Ready(Err(Error::Timeout));
        }

        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        time::{Duration, Instant},
    };

    use super::{with_timeout, with_timeout_or_none};
    use crate::{
        error::Error,
        futures::timer::delay,
        scope::Scope,
        task::{Dispatcher, Executor},
    };

    #[test]
    fn fast_body_wins() {
        let result = Executor::block_on(with_timeout(Duration::from_millis(500), async {
            delay(Duration::from_millis(50)).await;
            "done"
        }));
        assert_eq!(result, Ok("done"));
    }

    #[test]
    fn slow_body_times_out() {
        let before = Instant::now();
        let result = Executor::block_on(with_timeout(Duration::from_millis(100), async {
            delay(Duration::from_secs(60)).await;
        }));
        assert_eq!(result, Err(Error::Timeout));
        assert!(before.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn or_none_converts_the_timeout() {
        Executor::block_on(async {
            let timed_out = with_timeout_or_none(Duration::from_millis(50), async {
                delay(Duration::from_secs(60)).await;
                1
            })
            .await;
            assert_eq!(timed_out, None);

            let finished = with_timeout_or_none(Duration::from_millis(500), async { 1 }).await;
            assert_eq!(finished, Some(1));
        });
    }

    #[test]
    fn expiry_cancels_tasks_spawned_under_the_guard() {
        let finished = Arc::new(AtomicBool::new(false));
        let witness = finished.clone();

        let result = Executor::block_on(async move {
            with_timeout(Duration::from_millis(100), async move {
                let scope = Scope::current().unwrap();
                let inner = Executor::spawn(&scope, Dispatcher::Default, async move {
                    delay(Duration::from_millis(500)).await;
                    witness.store(true, Ordering::SeqCst);
                });
                inner.await
            })
            .await
        });

        assert_eq!(result, Err(Error::Timeout));
        // The guard's scope went down with it.
        std::thread::sleep(Duration::from_millis(700));
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[test]
    fn cleanup_runs_when_the_deadline_fires() {
        struct SetOnDrop(Arc<AtomicBool>);
        impl Drop for SetOnDrop {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let cleaned = Arc::new(AtomicBool::new(false));
        let witness = cleaned.clone();

        let result = Executor::block_on(with_timeout(Duration::from_millis(50), async move {
            let _cleanup = SetOnDrop(witness);
            delay(Duration::from_secs(60)).await;
        }));

        assert_eq!(result, Err(Error::Timeout));
        assert!(cleaned.load(Ordering::SeqCst));
    }
}
