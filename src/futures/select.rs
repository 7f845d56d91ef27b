//! Racing channel operations.
//!
//! [`Select`] registers a set of clauses (receives and sends on any mix of
//! channels) and completes **exactly one** of them: the first that can
//! finish without suspending. Each clause carries a mapping closure that
//! converts its operation outcome into the select's common result type.
//!
//! When several clauses are ready at once, which one wins is not specified,
//! but selection is fair over repeated calls: clause probing starts at a
//! rotating offset, so a persistently ready clause cannot starve another.
//! A receive clause on a closed, drained channel is considered ready and
//! completes with the [`Error::Closed`] outcome rather than blocking.
//!
//! # Example
//!
//! ```
//! use weft::futures::channel::{Capacity, Channel};
//! use weft::futures::select::Select;
//! use weft::task::Executor;
//!
//! let a = Channel::new(Capacity::Unbounded);
//! let b = Channel::new(Capacity::Unbounded);
//!
//! Executor::block_on(async {
//!     a.send("from a").await.unwrap();
//!
//!     let winner = Select::new()
//!         .recv(&a, |r| r.unwrap())
//!         .recv(&b, |r| r.unwrap())
//!         .await;
//!     assert_eq!(winner, "from a");
//! });
//! ```

use std::{
    future::Future,
    pin::Pin,
    sync::atomic::{AtomicUsize, Ordering},
    task::{Context, Poll},
};

use crate::{
    error::Error,
    futures::channel::{Channel, TrySend},
};

/// Rotates the probe origin across select calls so simultaneously-ready
/// clauses take turns winning.
static ROTATION: AtomicUsize = AtomicUsize::new(0);

trait Clause<R> {
    /// Attempts the clause's operation; registers with the channel's wake
    /// list when it cannot complete yet.
    fn poll_clause(&mut self, cx: &mut Context<'_>) -> Poll<R>;
}

struct RecvClause<'a, T, F> {
    chan: &'a Channel<T>,
    map: Option<F>,
}

impl<T, R, F> Clause<R> for RecvClause<'_, T, F>
where
    F: FnOnce(Result<T, Error>) -> R,
{
    fn poll_clause(&mut self, cx: &mut Context<'_>) -> Poll<R> {
        match self.chan.try_receive() {
            Some(outcome) => {
                let map = self.map.take().unwrap();
                Poll::Ready(map(outcome))
            }
            None => {
                self.chan.register_select(cx.waker());
                Poll::Pending
            }
        }
    }
}

struct SendClause<'a, T, F> {
    chan: &'a Channel<T>,
    element: Option<T>,
    map: Option<F>,
}

impl<T, R, F> Clause<R> for SendClause<'_, T, F>
where
    F: FnOnce(Result<(), Error>) -> R,
{
    fn poll_clause(&mut self, cx: &mut Context<'_>) -> Poll<R> {
        let element = self.element.take().unwrap();
        match self.chan.try_send(element) {
            TrySend::Sent => {
                let map = self.map.take().unwrap();
                Poll::Ready(map(Ok(())))
            }
            TrySend::Closed(_) => {
                let map = self.map.take().unwrap();
                Poll::Ready(map(Err(Error::Closed)))
            }
            TrySend::Full(element) => {
                self.element = Some(element);
                self.chan.register_select(cx.waker());
                Poll::Pending
            }
        }
    }
}

/// A one-shot race over channel operations. Build with [`Select::new`],
/// add clauses, then `.await`.
pub struct Select<'a, R> {
    clauses: Vec<Box<dyn Clause<R> + Send + 'a>>,
    offset: usize,
}

impl<'a, R> Select<'a, R> {
    pub fn new() -> Self {
        Self {
            clauses: Vec::new(),
            offset: ROTATION.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Adds a receive clause on `chan`. `map` sees `Ok(element)` or
    /// `Err(Closed)` once the channel is closed and drained.
    pub fn recv<T, F>(mut self, chan: &'a Channel<T>, map: F) -> Self
    where
        T: Send,
        F: FnOnce(Result<T, Error>) -> R + Send + 'a,
    {
        self.clauses.push(Box::new(RecvClause {
            chan,
            map: Some(map),
        }));
        self
    }

    /// Adds a send clause offering `element` to `chan`. `map` sees `Ok(())`
    /// on delivery or `Err(Closed)` if the channel is closed.
    pub fn send<T, F>(mut self, chan: &'a Channel<T>, element: T, map: F) -> Self
    where
        T: Send,
        F: FnOnce(Result<(), Error>) -> R + Send + 'a,
    {
        self.clauses.push(Box::new(SendClause {
            chan,
            element: Some(element),
            map: Some(map),
        }));
        self
    }
}

impl<R> Default for Select<'_, R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> Future for Select<'_, R> {
    type Output = R;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        debug_assert!(!this.clauses.is_empty(), "select with no clauses");

        let len = this.clauses.len();
        for i in 0..len {
            let idx = (this.offset + i) % len;
            if let Poll::Ready(result) = this.clauses[idx].poll_clause(cx) {
                return Poll::Ready(result);
            }
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::Select;
    use crate::{
        error::Error,
        futures::{
            channel::{Capacity, Channel},
            timer::delay,
        },
        scope::Scope,
        task::{Dispatcher, Executor},
    };

    #[test]
    fn completes_exactly_one_ready_clause() {
        let a = Channel::new(Capacity::Unbounded);
        let b = Channel::new(Capacity::Unbounded);

        Executor::block_on(async {
            b.send(7).await.unwrap();

            let got = Select::new()
                .recv(&a, |r| ("a", r.unwrap()))
                .recv(&b, |r| ("b", r.unwrap()))
                .await;
            assert_eq!(got, ("b", 7));
            // The other clause was left untouched.
            assert!(a.try_receive().is_none());
        });
    }

    #[test]
    fn repeated_selects_are_fair() {
        let a = Channel::new(Capacity::Unbounded);
        let b = Channel::new(Capacity::Unbounded);

        Executor::block_on(async {
            for i in 0..1000 {
                a.send(i).await.unwrap();
                b.send(i).await.unwrap();
            }

            let mut from_a = 0usize;
            let mut from_b = 0usize;
            for _ in 0..1000 {
                let winner = Select::new().recv(&a, |_| 'a').recv(&b, |_| 'b').await;
                match winner {
                    'a' => from_a += 1,
                    _ => from_b += 1,
                }
            }

            // Both always-ready channels must win sometimes.
            assert!(from_a > 0, "channel a was starved");
            assert!(from_b > 0, "channel b was starved");
            assert_eq!(from_a + from_b, 1000);
        });
    }

    #[test]
    fn suspends_until_a_clause_becomes_ready() {
        let scope = Scope::new();
        let a: Channel<u32> = Channel::new(Capacity::Rendezvous);
        let b: Channel<u32> = Channel::new(Capacity::Rendezvous);

        let tx = b.clone();
        Executor::spawn(&scope, Dispatcher::Default, async move {
            delay(Duration::from_millis(100)).await;
            tx.send(42).await.unwrap();
        });

        Executor::block_on(async {
            let got = Select::new()
                .recv(&a, |r| r.unwrap())
                .recv(&b, |r| r.unwrap())
                .await;
            assert_eq!(got, 42);
        });
    }

    #[test]
    fn closed_drained_channel_is_a_ready_clause() {
        let a: Channel<u32> = Channel::new(Capacity::Unbounded);
        let b: Channel<u32> = Channel::new(Capacity::Unbounded);
        a.close().unwrap();

        Executor::block_on(async {
            let got = Select::new()
                .recv(&a, |r| match r {
                    Ok(_) => unreachable!(),
                    Err(Error::Closed) => "closed",
                    Err(_) => unreachable!(),
                })
                .recv(&b, |_| "data")
                .await;
            assert_eq!(got, "closed");
        });
    }

    #[test]
    fn send_clause_delivers_into_free_capacity() {
        let full = Channel::new(Capacity::Bounded(1));
        let open = Channel::new(Capacity::Bounded(1));

        Executor::block_on(async {
            full.send(0).await.unwrap();

            let sent_to = Select::new()
                .send(&full, 1, |r| r.map(|()| "full"))
                .send(&open, 2, |r| r.map(|()| "open"))
                .await
                .unwrap();
            assert_eq!(sent_to, "open");
            assert_eq!(open.receive().await, Ok(2));
        });
    }
}
