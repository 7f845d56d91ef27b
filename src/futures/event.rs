//! Inter-task event signalling.
//!
//! An [`Event`] carries permits: [`Event::notify_one`] banks one permit and
//! wakes a waiter, [`Event::wait`] consumes a permit or suspends until one
//! arrives. A permit posted before anyone waits is not lost. The runtime
//! uses events to signal task completion to join handles; they are exposed
//! because they are equally useful as a standalone "something happened"
//! signal between tasks.

use std::{
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll, Waker},
};

#[derive(Clone)]
pub struct Event {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
}

struct State {
    permits: usize,
    wakers: Vec<Waker>,
}

impl Event {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    permits: 0,
                    wakers: Vec::new(),
                }),
            }),
        }
    }

    /// Posts one permit, waking a waiter if any is parked.
    pub fn notify_one(&self) {
        let waker = {
            let mut state = self.inner.state.lock().unwrap();
            state.permits += 1;
            state.wakers.pop()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Wakes every currently parked waiter without posting permits.
    ///
    /// Useful for "re-check your condition" broadcasts; a woken waiter that
    /// finds no permit simply parks again.
    pub fn notify_all(&self) {
        let wakers = {
            let mut state = self.inner.state.lock().unwrap();
            std::mem::take(&mut state.wakers)
        };
        for waker in wakers {
            waker.wake();
        }
    }

    /// Waits for a permit, consuming it.
    pub fn wait(&self) -> EventWait {
        EventWait {
            inner: self.inner.clone(),
        }
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

/// Future returned by [`Event::wait`].
pub struct EventWait {
    inner: Arc<Inner>,
}

impl Future for EventWait {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.inner.state.lock().unwrap();

        if state.permits > 0 {
            state.permits -= 1;
            return Poll::Ready(());
        }

        state.wakers.retain(|w| !w.will_wake(cx.waker()));
        state.wakers.push(cx.waker().clone());
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::Event;
    use crate::{
        futures::timer::delay,
        scope::Scope,
        task::{Dispatcher, Executor},
    };

    #[test]
    fn early_permit_is_not_lost() {
        let evt = Event::new();
        evt.notify_one();
        Executor::block_on(evt.wait());
    }

    #[test]
    fn wait_crosses_tasks() {
        let scope = Scope::new();
        let evt = Event::new();

        let evt2 = evt.clone();
        let waiter = Executor::spawn(&scope, Dispatcher::Default, async move {
            evt2.wait().await;
            "signalled"
        });

        Executor::block_on(async move {
            delay(Duration::from_millis(50)).await;
            evt.notify_one();
            assert_eq!(waiter.await, Ok("signalled"));
        });
    }

    #[test]
    fn notify_all_wakes_every_waiter() {
        let scope = Scope::new();
        let evt = Event::new();

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let evt = evt.clone();
                Executor::spawn(&scope, Dispatcher::Default, async move {
                    evt.wait().await;
                })
            })
            .collect();

        Executor::block_on(async move {
            delay(Duration::from_millis(50)).await;
            // Broadcast wakes the waiters; the permits let them through.
            evt.notify_one();
            evt.notify_one();
            evt.notify_one();
            evt.notify_all();
            for handle in handles {
                assert_eq!(handle.await, Ok(()));
            }
        });
    }
}
