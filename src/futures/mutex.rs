//! ### Async Mutexes
//!
//! This module provides **cross-task, non-blocking mutexes** for guarding
//! shared mutable state reached by many tasks. When the mutex is already
//! held, an acquiring task does **not block** its worker: it is parked on a
//! FIFO wait queue and resumed when the lock is handed to it. Release
//! transfers ownership directly to the head of the queue, so waiters are
//! served strictly in arrival order.
//!
//! The lock is non-reentrant. The holder's [`TaskId`] is recorded for
//! diagnostics and for the contract check on [`Mutex::release`]: releasing
//! from a task that is not the holder is an error, not undefined behaviour.
//!
//! The primary API is RAII: [`Mutex::lock`] yields a [`LockGuard`] that
//! releases on every exit path: normal return, failure, or cancellation of
//! the holding task. The raw [`Mutex::acquire`]/[`Mutex::release`] pair
//! exists for callers that need to span a critical section across non-lexical
//! boundaries and are prepared to uphold the release contract themselves.
//!
//! #### Example
//!
//! ```rust
//! use std::sync::Arc;
//! use weft::futures::mutex::Mutex;
//! use weft::scope::Scope;
//! use weft::task::{Dispatcher, Executor};
//!
//! let counter = Arc::new(Mutex::new(0u32));
//! let scope = Scope::new();
//!
//! let tasks: Vec<_> = (0..4)
//!     .map(|_| {
//!         let counter = counter.clone();
//!         Executor::spawn(&scope, Dispatcher::Default, async move {
//!             for _ in 0..100 {
//!                 *counter.lock().await += 1;
//!             }
//!         })
//!     })
//!     .collect();
//!
//! Executor::block_on(async move {
//!     for task in tasks {
//!         task.await.unwrap();
//!     }
//!     assert_eq!(*counter.lock().await, 400);
//! });
//! ```

use std::{
    cell::UnsafeCell,
    collections::VecDeque,
    future::Future,
    ops::{Deref, DerefMut},
    pin::Pin,
    sync::{Arc, Mutex as StdMutex},
    task::{Context, Poll, Waker},
};

use crate::{
    error::Error,
    task::{self, TaskId},
};

/// A task-aware mutex.
///
/// See the [module-level documentation](self) for more information.
pub struct Mutex<T> {
    state: StdMutex<State>,
    obj: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

struct State {
    locked: bool,
    owner: Option<TaskId>,
    waiters: VecDeque<Arc<Waiter>>,
}

struct Waiter {
    state: StdMutex<WaiterState>,
}

struct WaiterState {
    task: Option<TaskId>,
    waker: Option<Waker>,
    granted: bool,
    aborted: bool,
}

/// A lock held by a task.
///
/// Returned by [`Mutex::lock`] and [`Mutex::try_lock`]; dereferences to the
/// guarded value and releases the lock when dropped, handing ownership to
/// the next queued waiter.
pub struct LockGuard<'a, T> {
    mtx: &'a Mutex<T>,
}

impl<T> Mutex<T> {
    /// Creates a new mutex wrapping `obj`.
    pub fn new(obj: T) -> Self {
        Self {
            state: StdMutex::new(State {
                locked: false,
                owner: None,
                waiters: VecDeque::new(),
            }),
            obj: UnsafeCell::new(obj),
        }
    }

    /// Acquires the lock, suspending the task while it is held elsewhere,
    /// and returns a guard that releases on drop.
    pub async fn lock(&self) -> LockGuard<'_, T> {
        self.acquire().await;
        LockGuard { mtx: self }
    }

    /// Attempts to acquire the lock without suspending.
    pub fn try_lock(&self) -> Option<LockGuard<'_, T>> {
        let mut state = self.state.lock().unwrap();
        if state.locked {
            return None;
        }
        state.locked = true;
        state.owner = task::current_task_id();
        Some(LockGuard { mtx: self })
    }

    /// Runs `f` with exclusive access to the guarded value. The lock is
    /// released on every exit path of `f`.
    pub async fn with_lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.lock().await;
        f(&mut guard)
    }

    /// Raw acquisition: marks the calling task as holder without producing a
    /// guard. Pair with [`Mutex::release`].
    pub fn acquire(&self) -> Acquire<'_, T> {
        Acquire {
            mtx: self,
            waiter: None,
        }
    }

    /// Raw release. Fails with [`Error::IllegalState`] when the lock is not
    /// held or the caller is not the holding task; otherwise ownership moves
    /// to the head of the wait queue, which is woken.
    pub fn release(&self) -> Result<(), Error> {
        {
            let state = self.state.lock().unwrap();
            if !state.locked {
                return Err(Error::IllegalState("release() of an unheld mutex"));
            }
            if state.owner != task::current_task_id() {
                return Err(Error::IllegalState("release() by a non-holding task"));
            }
        }
        self.unlock_transfer();
        Ok(())
    }

    /// The task currently holding the lock, if any. Diagnostics only.
    pub fn holder(&self) -> Option<TaskId> {
        let state = self.state.lock().unwrap();
        if state.locked {
            state.owner
        } else {
            None
        }
    }

    /// Hands the lock to the first live waiter, or unlocks. Callers must
    /// hold the lock (the guard proves it; `release` checks first).
    fn unlock_transfer(&self) {
        let waker = {
            let mut state = self.state.lock().unwrap();
            loop {
                match state.waiters.pop_front() {
                    Some(waiter) => {
                        let mut ws = waiter.state.lock().unwrap();
                        if ws.aborted {
                            continue;
                        }
                        ws.granted = true;
                        state.owner = ws.task;
                        break ws.waker.take();
                    }
                    None => {
                        state.locked = false;
                        state.owner = None;
                        break None;
                    }
                }
            }
        };

        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

/// Future returned by [`Mutex::acquire`].
pub struct Acquire<'a, T> {
    mtx: &'a Mutex<T>,
    waiter: Option<Arc<Waiter>>,
}

impl<T> Future for Acquire<'_, T> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // Already queued: check whether release handed us the lock.
        if let Some(waiter) = &self.waiter {
            let mut ws = waiter.state.lock().unwrap();
            if ws.granted {
                drop(ws);
                self.waiter = None;
                return Poll::Ready(());
            }
            ws.waker = Some(cx.waker().clone());
            return Poll::Pending;
        }

        let mut state = self.mtx.state.lock().unwrap();
        if !state.locked {
            state.locked = true;
            state.owner = task::current_task_id();
            return Poll::Ready(());
        }

        let waiter = Arc::new(Waiter {
            state: StdMutex::new(WaiterState {
                task: task::current_task_id(),
                waker: Some(cx.waker().clone()),
                granted: false,
                aborted: false,
            }),
        });
        state.waiters.push_back(waiter.clone());
        drop(state);

        self.waiter = Some(waiter);
        Poll::Pending
    }
}

impl<T> Drop for Acquire<'_, T> {
    fn drop(&mut self) {
        let Some(waiter) = self.waiter.take() else {
            return;
        };

        // If the lock was handed to us after our last poll, pass it on;
        // otherwise mark the queue entry dead so release skips it.
        let granted = {
            let mut ws = waiter.state.lock().unwrap();
            if ws.granted {
                true
            } else {
                ws.aborted = true;
                false
            }
        };
        if granted {
            self.mtx.unlock_transfer();
        }
    }
}

impl<T> Deref for LockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.mtx.obj.get() }
    }
}

impl<T> DerefMut for LockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.mtx.obj.get() }
    }
}

impl<T> Drop for LockGuard<'_, T> {
    fn drop(&mut self) {
        self.mtx.unlock_transfer();
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use anyhow::Result;

    use super::Mutex;
    use crate::{
        error::Error,
        futures::timer::{delay, Timer},
        scope::Scope,
        task::{Dispatcher, Executor},
    };

    #[test]
    fn simple() -> Result<()> {
        let scope = Scope::new();
        let v = Arc::new(Mutex::new(vec![0u8]));
        let v2 = v.clone();

        Executor::block_on(async move {
            let mut lock = v.lock().await;

            let v3 = v.clone();
            let t2 = Executor::spawn(&scope, Dispatcher::Default, async move {
                v3.lock().await.push(2);
            });
            Timer::sleep(Duration::from_millis(250)).await;
            lock.push(1);

            drop(lock);

            t2.await.unwrap();
        });

        assert_eq!(Arc::into_inner(v2).unwrap().obj.into_inner(), vec![0, 1, 2]);
        Ok(())
    }

    #[test]
    fn counter_has_no_lost_updates() {
        const TASKS: usize = 8;
        const INCREMENTS: usize = 500;

        let scope = Scope::new();
        let counter = Arc::new(Mutex::new(0usize));

        let handles: Vec<_> = (0..TASKS)
            .map(|_| {
                let counter = counter.clone();
                Executor::spawn(&scope, Dispatcher::Default, async move {
                    for _ in 0..INCREMENTS {
                        counter.with_lock(|c| *c += 1).await;
                    }
                })
            })
            .collect();

        Executor::block_on(async move {
            for handle in handles {
                handle.await.unwrap();
            }
            assert_eq!(*counter.lock().await, TASKS * INCREMENTS);
        });
    }

    #[test]
    fn release_by_non_holder_is_rejected() {
        let scope = Scope::new();
        let mtx = Arc::new(Mutex::new(()));

        let holder = mtx.clone();
        let t = Executor::spawn(&scope, Dispatcher::Default, async move {
            holder.acquire().await;
            delay(Duration::from_millis(300)).await;
            holder.release()
        });

        Executor::block_on(async move {
            delay(Duration::from_millis(100)).await;
            // Held by the spawned task, not by us.
            assert!(matches!(mtx.release(), Err(Error::IllegalState(_))));
            assert!(mtx.holder().is_some());
            assert_eq!(t.await.unwrap(), Ok(()));
            assert!(mtx.holder().is_none());
        });
    }

    #[test]
    fn releasing_unheld_mutex_is_rejected() {
        let mtx = Mutex::new(0);
        assert!(matches!(mtx.release(), Err(Error::IllegalState(_))));
    }

    #[test]
    fn waiters_are_served_in_fifo_order() {
        let scope = Scope::new();
        let mtx = Arc::new(Mutex::new(Vec::new()));

        Executor::block_on(async move {
            let gate = mtx.lock().await;

            let mut handles = Vec::new();
            for i in 0..4 {
                let mtx = mtx.clone();
                handles.push(Executor::spawn(&scope, Dispatcher::Default, async move {
                    mtx.lock().await.push(i);
                }));
                // Give each waiter time to reach the queue before the next.
                delay(Duration::from_millis(50)).await;
            }

            drop(gate);
            for handle in handles {
                handle.await.unwrap();
            }

            assert_eq!(*mtx.lock().await, vec![0, 1, 2, 3]);
        });
    }
}
