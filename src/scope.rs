//! Cancellation scopes.
//!
//! Every task lives inside a [`Scope`]. Scopes form a tree: cancelling a
//! scope requests cancellation of every task spawned into it and of every
//! descendant scope's tasks. Cancellation is cooperative: the flag is set
//! and parked tasks are woken, but a running body is never interrupted; it
//! observes the signal at its next suspension point, or voluntarily via
//! [`Scope::is_active`] / [`crate::task::is_active`].
//!
//! A scope does not eagerly push its flag into children. Instead, a task's
//! effective cancellation state is computed lazily by walking the ancestor
//! chain, so cancelling a scope is cheap no matter how deep the tree is.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use weft::futures::timer::delay;
//! use weft::scope::Scope;
//! use weft::task::{Dispatcher, Executor};
//!
//! let scope = Scope::new();
//! let child = scope.child();
//! let task = Executor::spawn(&child, Dispatcher::Default, async {
//!     delay(Duration::from_secs(60)).await;
//! });
//! scope.cancel(); // cancels the child scope's tasks too
//! assert!(!child.is_active());
//! assert!(Executor::block_on(task).is_err());
//! ```

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, Weak,
};

use log::trace;
use slab::Slab;

use crate::task::{self, Task};

/// A node in the cancellation tree.
///
/// `Scope` is a cheap handle; clones refer to the same node. Dropping every
/// handle destroys the node once its tasks have reached a terminal state
/// (task records only hold weak references back to the scope).
#[derive(Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

pub(crate) struct ScopeInner {
    cancelled: AtomicBool,
    parent: Weak<ScopeInner>,
    children: Mutex<Children>,
}

struct Children {
    /// Live tasks spawned directly into this scope, keyed by their
    /// attachment handle. The arena owns the cancellation relationship, not
    /// the task results, so entries are weak.
    tasks: Slab<Weak<Task>>,
    scopes: Vec<Weak<ScopeInner>>,
}

impl Scope {
    /// Creates a root scope with no parent.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                cancelled: AtomicBool::new(false),
                parent: Weak::new(),
                children: Mutex::new(Children {
                    tasks: Slab::new(),
                    scopes: Vec::new(),
                }),
            }),
        }
    }

    /// Creates a child scope. Cancelling `self` cancels the child; the child
    /// can be cancelled on its own without affecting `self`.
    pub fn child(&self) -> Self {
        let child = Self {
            inner: Arc::new(ScopeInner {
                cancelled: AtomicBool::new(false),
                parent: Arc::downgrade(&self.inner),
                children: Mutex::new(Children {
                    tasks: Slab::new(),
                    scopes: Vec::new(),
                }),
            }),
        };

        let mut children = self.inner.children.lock().unwrap();
        children.scopes.retain(|s| s.strong_count() > 0);
        children.scopes.push(Arc::downgrade(&child.inner));

        child
    }

    /// The scope of the currently running task, if any. Inside a
    /// `with_timeout` body this is the guard's child scope.
    pub fn current() -> Option<Self> {
        task::current_scope()
    }

    /// Requests cancellation of this scope's whole subtree.
    ///
    /// Sets the flag and wakes every live descendant task so parked work can
    /// observe the signal. Running bodies are not interrupted; tasks spawned
    /// into the subtree from here on never begin their bodies. Cancelling an
    /// already-cancelled scope is a no-op.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        trace!("scope cancelled, waking subtree");
        wake_subtree(&self.inner);
    }

    /// Whether this scope's effective cancellation flag reads true, i.e.
    /// whether it or any ancestor has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// The inverse of [`Scope::is_cancelled`].
    pub fn is_active(&self) -> bool {
        !self.is_cancelled()
    }

    /// Spawns `future` into this scope on the given dispatcher. Shorthand
    /// for [`Executor::spawn`](crate::task::Executor::spawn).
    pub fn spawn<F, T>(&self, dispatcher: task::Dispatcher, future: F) -> task::JoinHandle<T>
    where
        F: std::future::Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        task::Executor::spawn(self, dispatcher, future)
    }

    /// Registers a task record, returning the key for [`Scope::detach`].
    pub(crate) fn attach(&self, task: &Arc<Task>) -> usize {
        let mut children = self.inner.children.lock().unwrap();
        children.tasks.insert(Arc::downgrade(task))
    }

    /// Removes a terminated task record from the arena.
    pub(crate) fn detach(&self, key: usize) {
        let mut children = self.inner.children.lock().unwrap();
        children.tasks.try_remove(key);
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopeInner {
    pub(crate) fn is_cancelled(self: &Arc<Self>) -> bool {
        let mut cur = Some(Arc::clone(self));
        while let Some(scope) = cur {
            if scope.cancelled.load(Ordering::SeqCst) {
                return true;
            }
            cur = scope.parent.upgrade();
        }
        false
    }
}

/// Wakes every live task in `inner`'s subtree. Flags are not touched: the
/// ancestor walk in [`ScopeInner::is_cancelled`] makes descendants read as
/// cancelled already.
fn wake_subtree(inner: &Arc<ScopeInner>) {
    let (tasks, scopes) = {
        let mut children = inner.children.lock().unwrap();
        let tasks: Vec<_> = children
            .tasks
            .iter()
            .filter_map(|(_, t)| t.upgrade())
            .collect();
        children.scopes.retain(|s| s.strong_count() > 0);
        let scopes: Vec<_> = children.scopes.iter().filter_map(Weak::upgrade).collect();
        (tasks, scopes)
    };

    for task in tasks {
        task.schedule();
    }
    for scope in scopes {
        wake_subtree(&scope);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        time::Duration,
    };

    use super::Scope;
    use crate::{
        error::Error,
        futures::timer::delay,
        task::{Dispatcher, Executor},
    };

    #[test]
    fn cancel_marks_whole_subtree() {
        let root = Scope::new();
        let mid = root.child();
        let leaf = mid.child();

        assert!(leaf.is_active());
        root.cancel();
        assert!(root.is_cancelled());
        assert!(mid.is_cancelled());
        assert!(leaf.is_cancelled());
    }

    #[test]
    fn sibling_scope_is_unaffected() {
        let root = Scope::new();
        let a = root.child();
        let b = root.child();

        a.cancel();
        assert!(a.is_cancelled());
        assert!(b.is_active());
        assert!(root.is_active());
    }

    #[test]
    fn parked_descendants_observe_cancellation() {
        let scope = Scope::new();
        let child = scope.child();

        let t1 = child.spawn(Dispatcher::Default, async {
            delay(Duration::from_secs(30)).await;
        });
        let t2 = scope.spawn(Dispatcher::Default, async {
            delay(Duration::from_secs(30)).await;
        });

        Executor::block_on(async move {
            delay(Duration::from_millis(50)).await;
            scope.cancel();
            assert_eq!(t1.await, Err(Error::Cancelled));
            assert_eq!(t2.await, Err(Error::Cancelled));
        });
    }

    #[test]
    fn task_spawned_after_cancel_never_runs() {
        let scope = Scope::new();
        scope.cancel();

        let ran = Arc::new(AtomicBool::new(false));
        let witness = ran.clone();
        let task = scope.spawn(Dispatcher::Default, async move {
            witness.store(true, Ordering::SeqCst);
        });

        assert_eq!(Executor::block_on(task), Err(Error::Cancelled));
        assert!(!ran.load(Ordering::SeqCst));
    }
}
