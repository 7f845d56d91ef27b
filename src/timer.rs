//! The timer driver.
//!
//! A single background thread owns every pending deadline in the process.
//! Timer futures register a `(deadline, waker)` pair and receive a key; the
//! driver pops due entries off a min-heap, wakes them, and sleeps on a
//! condvar until the next deadline (or until a registration shortens it).
//!
//! Heap entries can go stale: a timer that is dropped or re-armed leaves its
//! old `(deadline, key)` pair behind. The driver detects this by comparing
//! the popped deadline against the entry table; a mismatch means the pair is
//! stale and is skipped. A spurious wake caused by a reused key is harmless,
//! since timer futures re-check their own deadline on every poll.

use std::{
    cmp::Reverse,
    collections::BinaryHeap,
    sync::{Condvar, Mutex, OnceLock},
    task::Waker,
    thread,
    time::Instant,
};

use log::trace;
use slab::Slab;

struct Entry {
    deadline: Instant,
    waker: Waker,
}

struct State {
    entries: Slab<Entry>,
    heap: BinaryHeap<Reverse<(Instant, usize)>>,
}

pub(crate) struct Driver {
    state: Mutex<State>,
    cv: Condvar,
}

static DRIVER: OnceLock<Driver> = OnceLock::new();

impl Driver {
    /// Returns the process-wide driver, spawning its thread on first use.
    pub(crate) fn get() -> &'static Driver {
        let driver = DRIVER.get_or_init(|| Driver {
            state: Mutex::new(State {
                entries: Slab::new(),
                heap: BinaryHeap::new(),
            }),
            cv: Condvar::new(),
        });

        static STARTED: OnceLock<()> = OnceLock::new();
        STARTED.get_or_init(|| {
            thread::Builder::new()
                .name("weft-timer".into())
                .spawn(|| Driver::get().run())
                .unwrap();
        });

        driver
    }

    /// Registers a deadline, returning the key under which it is tracked.
    pub(crate) fn register(&self, deadline: Instant, waker: Waker) -> usize {
        let mut state = self.state.lock().unwrap();

        let key = state.entries.insert(Entry { deadline, waker });
        state.heap.push(Reverse((deadline, key)));
        trace!("timer {key} armed for {deadline:?}");

        self.cv.notify_one();
        key
    }

    /// Refreshes the waker stored for `key`, re-registering if the entry has
    /// already fired. Returns the key the caller should track from now on.
    pub(crate) fn refresh(&self, key: usize, deadline: Instant, waker: Waker) -> usize {
        let mut state = self.state.lock().unwrap();

        match state.entries.get_mut(key) {
            Some(entry) if entry.deadline == deadline => {
                entry.waker = waker;
                key
            }
            _ => {
                let key = state.entries.insert(Entry { deadline, waker });
                state.heap.push(Reverse((deadline, key)));
                self.cv.notify_one();
                key
            }
        }
    }

    /// Discards the entry under `key`, if it is still pending.
    pub(crate) fn cancel(&self, key: usize) {
        let mut state = self.state.lock().unwrap();
        state.entries.try_remove(key);
    }

    fn run(&'static self) {
        let mut state = self.state.lock().unwrap();

        loop {
            let now = Instant::now();
            let mut due = Vec::new();

            while let Some(&Reverse((deadline, key))) = state.heap.peek() {
                if deadline > now {
                    break;
                }
                state.heap.pop();

                // Skip stale pairs left behind by cancel/re-arm.
                if state
                    .entries
                    .get(key)
                    .is_some_and(|e| e.deadline == deadline)
                {
                    due.push(state.entries.remove(key).waker);
                }
            }

            if !due.is_empty() {
                drop(state);
                trace!("timer driver waking {} entries", due.len());
                for waker in due {
                    waker.wake();
                }
                state = self.state.lock().unwrap();
                continue;
            }

            state = match state.heap.peek() {
                Some(&Reverse((deadline, _))) => {
                    let wait = deadline.saturating_duration_since(now);
                    self.cv.wait_timeout(state, wait).unwrap().0
                }
                None => self.cv.wait(state).unwrap(),
            };
        }
    }
}
