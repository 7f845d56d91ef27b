//! Inter-task channels.
//!
//! A [`Channel`] is a FIFO queue with a configurable [`Capacity`]:
//!
//! - [`Capacity::Rendezvous`]: no buffer; a send completes only by direct
//!   handoff to a receiver.
//! - [`Capacity::Bounded`]: up to `n` buffered elements; senders suspend
//!   while the buffer is full.
//! - [`Capacity::Unbounded`]: sends never suspend.
//!
//! A channel is one shared object: clones refer to the same queue, and any
//! clone may send, receive, or close. Concurrent receivers fan out: each
//! element goes to exactly one of them, in the order they arrived at the
//! wait queue. Closing is one-shot: blocked senders fail with
//! [`Error::Closed`], buffered elements stay receivable until drained, and
//! after the drain every receive reports [`Error::Closed`].
//!
//! # Example
//!
//! A bounded channel drains after close:
//!
//! ```
//! use weft::error::Error;
//! use weft::futures::channel::{Capacity, Channel};
//! use weft::task::Executor;
//!
//! let chan = Channel::new(Capacity::Bounded(8));
//! Executor::block_on(async move {
//!     chan.send(1).await.unwrap();
//!     chan.send(2).await.unwrap();
//!     chan.close().unwrap();
//!
//!     assert_eq!(chan.receive().await, Ok(1));
//!     assert_eq!(chan.receive().await, Ok(2));
//!     assert_eq!(chan.receive().await, Err(Error::Closed));
//! });
//! ```

use std::{
    collections::VecDeque,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll, Waker},
};

use log::trace;

use crate::{
    error::Error,
    scope::Scope,
    task::{Dispatcher, Executor, JoinHandle},
};

/// Buffer policy of a [`Channel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capacity {
    /// No buffer; send and receive synchronize pairwise.
    Rendezvous,
    /// Up to the given number of buffered elements (must be non-zero; use
    /// `Rendezvous` for a zero-size buffer).
    Bounded(usize),
    /// No limit; send never suspends.
    Unbounded,
}

/// Outcome of [`Channel::try_send`]. The element is handed back on the
/// non-sent paths so nothing is lost.
#[derive(Debug, PartialEq, Eq)]
pub enum TrySend<T> {
    /// The element was delivered or buffered.
    Sent,
    /// The channel is at capacity (or rendezvous with no waiting receiver).
    Full(T),
    /// The channel is closed.
    Closed(T),
}

/// A typed, capacity-bounded, closable FIFO channel.
///
/// Cheap to clone; all clones refer to the same queue.
pub struct Channel<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

struct Shared<T> {
    state: Mutex<State<T>>,
}

struct State<T> {
    capacity: Capacity,
    queue: VecDeque<T>,
    closed: bool,
    /// Senders parked with their element, FIFO.
    senders: VecDeque<Arc<SendWaiter<T>>>,
    /// Receivers parked with an empty delivery slot, FIFO.
    ///
    /// Invariant: a receiver is only parked while the buffer is empty and no
    /// live sender is parked, and elements are never buffered past a parked
    /// receiver; they are delivered into its slot instead.
    receivers: VecDeque<Arc<RecvWaiter<T>>>,
    /// Wakers parked by `select` on any state change that could make one of
    /// its clauses ready.
    select_wakers: Vec<Waker>,
}

struct SendWaiter<T> {
    state: Mutex<SendWaiterState<T>>,
}

struct SendWaiterState<T> {
    element: Option<T>,
    outcome: Option<Result<(), Error>>,
    waker: Option<Waker>,
    aborted: bool,
}

struct RecvWaiter<T> {
    state: Mutex<RecvWaiterState<T>>,
}

struct RecvWaiterState<T> {
    slot: Option<Result<T, Error>>,
    waker: Option<Waker>,
    aborted: bool,
}

/// Delivers `outcome` into a parked receiver's slot and returns its waker.
fn fill_slot<T>(waiter: &RecvWaiter<T>, outcome: Result<T, Error>) -> Option<Waker> {
    let mut ws = waiter.state.lock().unwrap();
    ws.slot = Some(outcome);
    ws.waker.take()
}

/// Resolves a parked sender and returns its element and waker.
fn resolve_sender<T>(
    waiter: &SendWaiter<T>,
    outcome: Result<(), Error>,
) -> (Option<T>, Option<Waker>) {
    let mut ws = waiter.state.lock().unwrap();
    ws.outcome = Some(outcome);
    (ws.element.take(), ws.waker.take())
}

impl<T> State<T> {
    fn has_space(&self) -> bool {
        match self.capacity {
            Capacity::Rendezvous => false,
            Capacity::Bounded(n) => self.queue.len() < n,
            Capacity::Unbounded => true,
        }
    }

    /// Pops the first parked receiver that has not been cancelled.
    fn pop_live_receiver(&mut self) -> Option<Arc<RecvWaiter<T>>> {
        while let Some(waiter) = self.receivers.pop_front() {
            if !waiter.state.lock().unwrap().aborted {
                return Some(waiter);
            }
        }
        None
    }

    /// Pops the first parked sender that has not been cancelled.
    fn pop_live_sender(&mut self) -> Option<Arc<SendWaiter<T>>> {
        while let Some(waiter) = self.senders.pop_front() {
            if !waiter.state.lock().unwrap().aborted {
                return Some(waiter);
            }
        }
        None
    }

    fn take_select_wakers(&mut self) -> Vec<Waker> {
        std::mem::take(&mut self.select_wakers)
    }

    /// Attempts a receive under the channel lock. On success the caller
    /// must invoke the returned wakers after releasing the lock.
    fn try_receive_inner(&mut self) -> Option<(Result<T, Error>, Vec<Waker>)> {
        if let Some(element) = self.queue.pop_front() {
            let mut wakers = Vec::new();
            // Space opened up: promote a parked sender's element into the
            // buffer so FIFO order is preserved across the handoff.
            if let Some(sender) = self.pop_live_sender() {
                let (moved, waker) = resolve_sender(&sender, Ok(()));
                if let Some(moved) = moved {
                    self.queue.push_back(moved);
                }
                wakers.extend(waker);
            }
            wakers.extend(self.take_select_wakers());
            return Some((Ok(element), wakers));
        }

        if let Some(sender) = self.pop_live_sender() {
            // Rendezvous handoff: take the element straight from the sender.
            let (element, waker) = resolve_sender(&sender, Ok(()));
            let mut wakers = Vec::new();
            wakers.extend(waker);
            wakers.extend(self.take_select_wakers());
            return element.map(|e| (Ok(e), wakers));
        }

        if self.closed {
            return Some((Err(Error::Closed), Vec::new()));
        }

        None
    }
}

impl<T> Channel<T> {
    /// Creates a channel with the given capacity.
    pub fn new(capacity: Capacity) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    capacity,
                    queue: VecDeque::new(),
                    closed: false,
                    senders: VecDeque::new(),
                    receivers: VecDeque::new(),
                    select_wakers: Vec::new(),
                }),
            }),
        }
    }

    /// Sends an element, suspending while the channel is at capacity (or,
    /// for a rendezvous channel, until a receiver takes the element).
    ///
    /// Fails with [`Error::Closed`] if the channel is or becomes closed
    /// before the element is delivered.
    pub fn send(&self, element: T) -> SendFuture<'_, T> {
        SendFuture {
            chan: self,
            element: Some(element),
            waiter: None,
        }
    }

    /// Receives the next element, suspending while the channel is empty.
    ///
    /// Once the channel is closed and drained, fails with [`Error::Closed`].
    pub fn receive(&self) -> RecvFuture<'_, T> {
        RecvFuture {
            chan: self,
            waiter: None,
        }
    }

    /// Receives the next element, mapping the closed outcome to `None`.
    ///
    /// `while let Some(v) = chan.next().await` consumes the channel as a
    /// lazy sequence that is finite once the channel closes.
    pub async fn next(&self) -> Option<T> {
        self.receive().await.ok()
    }

    /// Non-suspending send. See [`TrySend`].
    pub fn try_send(&self, element: T) -> TrySend<T> {
        let mut state = self.shared.state.lock().unwrap();

        if state.closed {
            return TrySend::Closed(element);
        }

        if let Some(receiver) = state.pop_live_receiver() {
            let waker = fill_slot(&receiver, Ok(element));
            let select_wakers = state.take_select_wakers();
            drop(state);
            wake_all(waker, select_wakers);
            return TrySend::Sent;
        }

        if state.has_space() {
            state.queue.push_back(element);
            let select_wakers = state.take_select_wakers();
            drop(state);
            wake_all(None, select_wakers);
            return TrySend::Sent;
        }

        TrySend::Full(element)
    }

    /// Non-suspending receive. `None` means the channel is empty but open;
    /// `Some(Err(Closed))` means closed and drained.
    pub fn try_receive(&self) -> Option<Result<T, Error>> {
        let mut state = self.shared.state.lock().unwrap();
        let (outcome, wakers) = state.try_receive_inner()?;
        drop(state);
        for waker in wakers {
            waker.wake();
        }
        Some(outcome)
    }

    /// Closes the channel.
    ///
    /// One-shot: a second close fails with [`Error::IllegalState`]. Parked
    /// senders are woken with [`Error::Closed`]; buffered elements stay
    /// receivable until drained.
    pub fn close(&self) -> Result<(), Error> {
        let (senders, receivers, select_wakers) = {
            let mut state = self.shared.state.lock().unwrap();
            if state.closed {
                return Err(Error::IllegalState("channel is already closed"));
            }
            state.closed = true;
            trace!(
                "channel closed with {} buffered elements",
                state.queue.len()
            );
            (
                std::mem::take(&mut state.senders),
                std::mem::take(&mut state.receivers),
                state.take_select_wakers(),
            )
        };

        for sender in senders {
            let (_, waker) = resolve_sender(&sender, Err(Error::Closed));
            if let Some(waker) = waker {
                waker.wake();
            }
        }
        // A parked receiver implies an empty buffer, so it gets the closed
        // outcome directly.
        for receiver in receivers {
            if let Some(waker) = fill_slot(&receiver, Err(Error::Closed)) {
                waker.wake();
            }
        }
        for waker in select_wakers {
            waker.wake();
        }

        Ok(())
    }

    /// Number of buffered elements.
    pub fn len(&self) -> usize {
        self.shared.state.lock().unwrap().queue.len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the channel has been closed.
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().unwrap().closed
    }

    /// Parks a waker to be woken on any state change that could make a
    /// select clause on this channel ready.
    pub(crate) fn register_select(&self, waker: &Waker) {
        let mut state = self.shared.state.lock().unwrap();
        state.select_wakers.retain(|w| !w.will_wake(waker));
        state.select_wakers.push(waker.clone());
    }
}

fn wake_all(first: Option<Waker>, rest: Vec<Waker>) {
    if let Some(waker) = first {
        waker.wake();
    }
    for waker in rest {
        waker.wake();
    }
}

/// Future returned by [`Channel::send`].
pub struct SendFuture<'a, T> {
    chan: &'a Channel<T>,
    element: Option<T>,
    waiter: Option<Arc<SendWaiter<T>>>,
}

// The element is only ever moved, never pinned.
impl<T> Unpin for SendFuture<'_, T> {}

impl<T> Future for SendFuture<'_, T> {
    type Output = Result<(), Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;

        // Parked: the outcome is written by a receiver or by close.
        if let Some(waiter) = &this.waiter {
            let mut ws = waiter.state.lock().unwrap();
            if let Some(outcome) = ws.outcome.take() {
                drop(ws);
                this.waiter = None;
                return Poll::Ready(outcome);
            }
            ws.waker = Some(cx.waker().clone());
            return Poll::Pending;
        }

        // Polled again after completion: nothing left to deliver.
        let Some(element) = this.element.take() else {
            return Poll::Ready(Ok(()));
        };

        let mut state = this.chan.shared.state.lock().unwrap();

        if state.closed {
            return Poll::Ready(Err(Error::Closed));
        }

        if let Some(receiver) = state.pop_live_receiver() {
            let waker = fill_slot(&receiver, Ok(element));
            let select_wakers = state.take_select_wakers();
            drop(state);
            wake_all(waker, select_wakers);
            return Poll::Ready(Ok(()));
        }

        if state.has_space() {
            state.queue.push_back(element);
            let select_wakers = state.take_select_wakers();
            drop(state);
            wake_all(None, select_wakers);
            return Poll::Ready(Ok(()));
        }

        // Full (or rendezvous with nobody waiting): park with the element.
        let waiter = Arc::new(SendWaiter {
            state: Mutex::new(SendWaiterState {
                element: Some(element),
                outcome: None,
                waker: Some(cx.waker().clone()),
                aborted: false,
            }),
        });
        state.senders.push_back(waiter.clone());
        // A parked sender makes a receive clause ready.
        let select_wakers = state.take_select_wakers();
        drop(state);
        wake_all(None, select_wakers);

        this.waiter = Some(waiter);
        Poll::Pending
    }
}

impl<T> Drop for SendFuture<'_, T> {
    fn drop(&mut self) {
        if let Some(waiter) = self.waiter.take() {
            let mut ws = waiter.state.lock().unwrap();
            if ws.outcome.is_none() {
                ws.aborted = true;
            }
        }
    }
}

/// Future returned by [`Channel::receive`].
pub struct RecvFuture<'a, T> {
    chan: &'a Channel<T>,
    waiter: Option<Arc<RecvWaiter<T>>>,
}

impl<T> Future for RecvFuture<'_, T> {
    type Output = Result<T, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;

        if let Some(waiter) = &this.waiter {
            let mut ws = waiter.state.lock().unwrap();
            if let Some(outcome) = ws.slot.take() {
                drop(ws);
                this.waiter = None;
                return Poll::Ready(outcome);
            }
            ws.waker = Some(cx.waker().clone());
            return Poll::Pending;
        }

        let mut state = this.chan.shared.state.lock().unwrap();

        if let Some((outcome, wakers)) = state.try_receive_inner() {
            drop(state);
            for waker in wakers {
                waker.wake();
            }
            return Poll::Ready(outcome);
        }

        // Empty and open: park with a delivery slot, under the same lock so
        // no element can slip past between the check and the park.
        let waiter = Arc::new(RecvWaiter {
            state: Mutex::new(RecvWaiterState {
                slot: None,
                waker: Some(cx.waker().clone()),
                aborted: false,
            }),
        });
        state.receivers.push_back(waiter.clone());
        // A parked receiver makes a rendezvous send clause ready.
        let select_wakers = state.take_select_wakers();
        drop(state);
        wake_all(None, select_wakers);

        this.waiter = Some(waiter);
        Poll::Pending
    }
}

impl<T> Drop for RecvFuture<'_, T> {
    fn drop(&mut self) {
        let Some(waiter) = self.waiter.take() else {
            return;
        };

        let delivered = {
            let mut ws = waiter.state.lock().unwrap();
            ws.aborted = true;
            ws.slot.take()
        };

        // An element handed to our slot that we never observed is passed on
        // to the next parked receiver (or put back at the head of the
        // queue), so it is not lost to cancellation.
        if let Some(Ok(element)) = delivered {
            let mut state = self.chan.shared.state.lock().unwrap();
            let waker = match state.pop_live_receiver() {
                Some(receiver) => fill_slot(&receiver, Ok(element)),
                None => {
                    state.queue.push_front(element);
                    None
                }
            };
            let select_wakers = state.take_select_wakers();
            drop(state);
            wake_all(waker, select_wakers);
        }
    }
}

/// Spawns a producer task writing into a fresh channel.
///
/// The body receives a clone of the channel; the channel is closed when the
/// body finishes *or* is cancelled, so consumers iterating with
/// [`Channel::next`] always terminate. Returns the channel and the
/// producer's handle (cancel the handle to stop production early).
pub fn produce<T, F, Fut>(
    scope: &Scope,
    dispatcher: Dispatcher,
    capacity: Capacity,
    f: F,
) -> (Channel<T>, JoinHandle<()>)
where
    T: Send + 'static,
    F: FnOnce(Channel<T>) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    struct CloseOnDrop<T>(Channel<T>);

    impl<T> Drop for CloseOnDrop<T> {
        fn drop(&mut self) {
            // The producer may have closed the channel itself.
            let _ = self.0.close();
        }
    }

    let chan = Channel::new(capacity);
    let body = f(chan.clone());
    let guard = CloseOnDrop(chan.clone());

    let handle = Executor::spawn(scope, dispatcher, async move {
        body.await;
        drop(guard);
    });

    (chan, handle)
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use super::{produce, Capacity, Channel, TrySend};
    use crate::{
        error::Error,
        futures::timer::delay,
        scope::Scope,
        task::{Dispatcher, Executor},
    };

    #[test]
    fn rendezvous_hands_off_in_order() {
        let scope = Scope::new();
        let chan = Channel::new(Capacity::Rendezvous);

        let tx = chan.clone();
        let sent = Arc::new(AtomicUsize::new(0));
        let sent2 = sent.clone();
        Executor::spawn(&scope, Dispatcher::Default, async move {
            for i in 1..=3u32 {
                tx.send(i).await.unwrap();
                sent2.store(i as usize, Ordering::SeqCst);
            }
        });

        Executor::block_on(async move {
            delay(Duration::from_millis(100)).await;
            // No receiver yet: the first send cannot have completed.
            assert_eq!(sent.load(Ordering::SeqCst), 0);

            assert_eq!(chan.receive().await, Ok(1));
            assert_eq!(chan.receive().await, Ok(2));
            assert_eq!(chan.receive().await, Ok(3));
        });
    }

    #[test]
    fn buffered_elements_drain_after_close() {
        let chan = Channel::new(Capacity::Bounded(16));
        Executor::block_on(async move {
            for i in 0..4 {
                chan.send(i).await.unwrap();
            }
            chan.close().unwrap();

            assert!(matches!(chan.try_send(99), TrySend::Closed(99)));
            for i in 0..4 {
                assert_eq!(chan.receive().await, Ok(i));
            }
            assert_eq!(chan.receive().await, Err(Error::Closed));
            assert_eq!(chan.receive().await, Err(Error::Closed));
        });
    }

    #[test]
    fn close_is_one_shot() {
        let chan = Channel::<u8>::new(Capacity::Unbounded);
        assert_eq!(chan.close(), Ok(()));
        assert!(matches!(chan.close(), Err(Error::IllegalState(_))));
    }

    #[test]
    fn full_bounded_channel_suspends_sender() {
        let scope = Scope::new();
        let chan = Channel::new(Capacity::Bounded(1));

        let tx = chan.clone();
        let t = Executor::spawn(&scope, Dispatcher::Default, async move {
            tx.send(1).await.unwrap();
            tx.send(2).await.unwrap(); // suspends until 1 is received
            "done"
        });

        Executor::block_on(async move {
            delay(Duration::from_millis(100)).await;
            assert_eq!(chan.len(), 1);
            assert_eq!(chan.receive().await, Ok(1));
            assert_eq!(chan.receive().await, Ok(2));
            assert_eq!(t.await, Ok("done"));
        });
    }

    #[test]
    fn fan_out_delivers_each_element_once() {
        const ELEMENTS: usize = 50;
        const PROCESSORS: usize = 5;

        let scope = Scope::new();
        let (chan, _producer) = produce(
            &scope,
            Dispatcher::Default,
            Capacity::Rendezvous,
            |chan| async move {
                for i in 0..ELEMENTS {
                    chan.send(i).await.unwrap();
                }
            },
        );

        let received = Arc::new(AtomicUsize::new(0));
        let processors: Vec<_> = (0..PROCESSORS)
            .map(|_| {
                let chan = chan.clone();
                let received = received.clone();
                Executor::spawn(&scope, Dispatcher::Default, async move {
                    let mut count = 0usize;
                    while chan.next().await.is_some() {
                        received.fetch_add(1, Ordering::SeqCst);
                        count += 1;
                    }
                    count
                })
            })
            .collect();

        Executor::block_on(async move {
            let mut total = 0;
            for p in processors {
                total += p.await.unwrap();
            }
            assert_eq!(total, ELEMENTS);
            assert_eq!(received.load(Ordering::SeqCst), ELEMENTS);
        });
    }

    #[test]
    fn cancelling_the_producer_ends_iteration() {
        let scope = Scope::new();
        let (chan, producer) = produce(
            &scope,
            Dispatcher::Default,
            Capacity::Rendezvous,
            |chan| async move {
                let mut i = 0u64;
                loop {
                    chan.send(i).await.unwrap();
                    i += 1;
                    delay(Duration::from_millis(10)).await;
                }
            },
        );

        Executor::block_on(async move {
            assert_eq!(chan.next().await, Some(0));
            assert_eq!(chan.next().await, Some(1));

            producer.cancel_and_join().await.unwrap_err();
            // Producer gone: the channel closes and iteration terminates.
            while chan.next().await.is_some() {}
            assert!(chan.is_closed());
        });
    }

    #[test]
    fn unbounded_send_never_suspends() {
        let chan = Channel::new(Capacity::Unbounded);
        Executor::block_on(async move {
            for i in 0..1000 {
                chan.send(i).await.unwrap();
            }
            assert_eq!(chan.len(), 1000);
            for i in 0..1000 {
                assert_eq!(chan.receive().await, Ok(i));
            }
        });
    }
}
