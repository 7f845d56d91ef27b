//! Task and execution management
//!
//! This module provides the methods needed to spawn tasks and execute them
//! until completion. Work is scheduled onto named worker pools called
//! *dispatchers*: [`Dispatcher::Default`] for compute-style work and
//! [`Dispatcher::Io`] for work that parks for long stretches. Which pool a
//! task runs on never affects correctness, only where its body executes.
//!
//! Tasks are cooperative. A body runs until it reaches a suspension point
//! (channel operation, mutex acquisition, delay, await) and then yields its
//! worker; a body that never suspends monopolizes that worker until it
//! returns. Cancellation rides the same contract: it is observed at
//! suspension points (or voluntarily via [`is_active`]), never forced.
//!
//! # Example
//!
//! Spawn a task into a scope and wait for its value:
//!
//! ```
//! use weft::scope::Scope;
//! use weft::task::{Dispatcher, Executor};
//!
//! let scope = Scope::new();
//! let task = Executor::spawn(&scope, Dispatcher::Default, async { 2 + 8 });
//! let x = Executor::block_on(task).unwrap();
//! assert_eq!(x, 10);
//! ```
//!
//! A failure inside a body is caught at the task boundary and re-raised to
//! the awaiter:
//!
//! ```
//! use weft::error::Error;
//! use weft::scope::Scope;
//! use weft::task::{Dispatcher, Executor};
//!
//! let scope = Scope::new();
//! let task = Executor::spawn::<_, ()>(&scope, Dispatcher::Default, async {
//!     panic!("boom");
//! });
//! assert!(matches!(Executor::block_on(task), Err(Error::Failed(_))));
//! ```

use std::{
    any::Any,
    cell::RefCell,
    collections::VecDeque,
    future::Future,
    panic::{catch_unwind, AssertUnwindSafe},
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Condvar, Mutex, Once, OnceLock, Weak,
    },
    task::{Context, Poll, Wake, Waker},
    thread,
};

use log::{error, trace, warn};

use crate::{error::Error, futures::event::Event, scope::Scope};

/// Identity of a spawned task, unique for the lifetime of the process.
///
/// Used for diagnostics (e.g. mutex owner tracking); it carries no
/// capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

fn next_task_id() -> TaskId {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    TaskId(NEXT.fetch_add(1, Ordering::Relaxed))
}

/// A named worker pool.
///
/// `Default` sizes itself to the machine's available parallelism; `Io` is a
/// larger fixed pool intended for bodies that spend most of their time
/// suspended. Pool sizes can be overridden with the `WEFT_DEFAULT_WORKERS`
/// and `WEFT_IO_WORKERS` environment variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatcher {
    /// The compute pool.
    Default,
    /// The pool for long-parking work.
    Io,
}

// ---------------------------------------------------------------------------
// Current-task context
// ---------------------------------------------------------------------------

thread_local! {
    static CURRENT: RefCell<Option<TaskContext>> = const { RefCell::new(None) };
}

#[derive(Clone)]
struct TaskContext {
    id: TaskId,
    scope: Scope,
    cancel: Option<Arc<AtomicBool>>,
}

struct ContextGuard {
    prev: Option<TaskContext>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        CURRENT.with(|c| *c.borrow_mut() = self.prev.take());
    }
}

fn enter_context(ctx: TaskContext) -> ContextGuard {
    let prev = CURRENT.with(|c| c.borrow_mut().replace(ctx));
    ContextGuard { prev }
}

/// Runs `f` with the ambient scope swapped to `scope`, keeping the current
/// task identity. Used by the timeout guard to retarget spawns inside its
/// body at the guard's child scope.
pub(crate) fn with_ambient_scope<R>(scope: &Scope, f: impl FnOnce() -> R) -> R {
    let ctx = CURRENT.with(|c| c.borrow().clone());
    let _guard = match ctx {
        Some(mut ctx) => {
            ctx.scope = scope.clone();
            enter_context(ctx)
        }
        None => enter_context(TaskContext {
            id: next_task_id(),
            scope: scope.clone(),
            cancel: None,
        }),
    };
    f()
}

pub(crate) fn current_scope() -> Option<Scope> {
    CURRENT.with(|c| c.borrow().as_ref().map(|ctx| ctx.scope.clone()))
}

pub(crate) fn current_task_id() -> Option<TaskId> {
    CURRENT.with(|c| c.borrow().as_ref().map(|ctx| ctx.id))
}

/// Whether the currently running task has been asked to cancel, either
/// directly or through its scope. The voluntary counterpart of the
/// suspension-point check: a body in a tight loop can poll this and unwind
/// on its own.
pub fn is_cancelled() -> bool {
    CURRENT.with(|c| match c.borrow().as_ref() {
        Some(ctx) => {
            ctx.cancel
                .as_ref()
                .is_some_and(|f| f.load(Ordering::SeqCst))
                || ctx.scope.is_cancelled()
        }
        None => false,
    })
}

/// The inverse of [`is_cancelled`].
pub fn is_active() -> bool {
    !is_cancelled()
}

// ---------------------------------------------------------------------------
// Uncaught-failure sink
// ---------------------------------------------------------------------------

type FailureHandler = Box<dyn Fn(&Error) + Send + Sync>;

static FAILURE_HANDLER: Mutex<Option<FailureHandler>> = Mutex::new(None);

/// Installs the process-wide handler for failures of tasks nobody awaits.
///
/// A fire-and-forget task that panics reports its failure here exactly once
/// instead of throwing into an unrelated call stack. Without a handler such
/// failures are logged at error level.
pub fn set_failure_handler(handler: impl Fn(&Error) + Send + Sync + 'static) {
    *FAILURE_HANDLER.lock().unwrap() = Some(Box::new(handler));
}

/// Removes a previously installed failure handler.
pub fn clear_failure_handler() {
    *FAILURE_HANDLER.lock().unwrap() = None;
}

pub(crate) fn report_failure(err: &Error) {
    let handler = FAILURE_HANDLER.lock().unwrap();
    match handler.as_ref() {
        Some(h) => h(err),
        None => error!("uncaught task failure: {err}"),
    }
}

// ---------------------------------------------------------------------------
// Task records and worker pools
// ---------------------------------------------------------------------------

/// A schedulable task record. The waker contract is the record itself:
/// waking re-enqueues the record on its dispatcher.
pub(crate) struct Task {
    id: TaskId,
    dispatcher: Dispatcher,
    scope: Scope,
    cancel: Arc<AtomicBool>,
    queued: AtomicBool,
    future: Mutex<Option<Pin<Box<dyn Future<Output = ()> + Send>>>>,
}

impl Task {
    pub(crate) fn schedule(self: &Arc<Self>) {
        if !self.queued.swap(true, Ordering::AcqRel) {
            runtime().pool(self.dispatcher).push(self.clone());
        }
    }
}

impl Wake for Task {
    fn wake(self: Arc<Self>) {
        self.schedule();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.schedule();
    }
}

struct Pool {
    name: &'static str,
    size: usize,
    queue: Mutex<VecDeque<Arc<Task>>>,
    cv: Condvar,
    started: Once,
}

impl Pool {
    fn new(name: &'static str, size: usize) -> Self {
        Self {
            name,
            size,
            queue: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
            started: Once::new(),
        }
    }

    fn push(&'static self, task: Arc<Task>) {
        self.started.call_once(|| {
            trace!("starting {} workers for pool {}", self.size, self.name);
            for i in 0..self.size {
                thread::Builder::new()
                    .name(format!("{}-{i}", self.name))
                    .spawn(move || self.worker_loop())
                    .unwrap();
            }
        });

        let mut queue = self.queue.lock().unwrap();
        queue.push_back(task);
        drop(queue);
        self.cv.notify_one();
    }

    fn worker_loop(&self) {
        loop {
            let task = {
                let mut queue = self.queue.lock().unwrap();
                loop {
                    match queue.pop_front() {
                        Some(task) => break task,
                        None => queue = self.cv.wait(queue).unwrap(),
                    }
                }
            };

            // Clear the queued bit before polling so a wake that lands
            // mid-poll re-enqueues the task for another pass.
            task.queued.store(false, Ordering::Release);
            run_task(&task);
        }
    }
}

fn run_task(task: &Arc<Task>) {
    let waker = Waker::from(task.clone());
    let mut cx = Context::from_waker(&waker);

    // Polling happens under the slot lock; a concurrent wake can only hand
    // the record to another worker, which then blocks here briefly and
    // re-polls once we are done. The extra poll is spurious but harmless.
    let mut slot = task.future.lock().unwrap();
    let Some(future) = slot.as_mut() else {
        return;
    };

    let _guard = enter_context(TaskContext {
        id: task.id,
        scope: task.scope.clone(),
        cancel: Some(task.cancel.clone()),
    });

    if future.as_mut().poll(&mut cx).is_ready() {
        *slot = None;
    }
}

struct Runtime {
    default_pool: Pool,
    io_pool: Pool,
}

impl Runtime {
    fn pool(&self, dispatcher: Dispatcher) -> &Pool {
        match dispatcher {
            Dispatcher::Default => &self.default_pool,
            Dispatcher::Io => &self.io_pool,
        }
    }
}

fn pool_size(var: &str, default: usize) -> usize {
    match std::env::var(var) {
        Ok(v) => match v.parse::<usize>() {
            Ok(n) if n > 0 => n,
            _ => {
                warn!("ignoring invalid {var}={v:?}, using {default}");
                default
            }
        },
        Err(_) => default,
    }
}

fn runtime() -> &'static Runtime {
    static RUNTIME: OnceLock<Runtime> = OnceLock::new();
    RUNTIME.get_or_init(|| {
        let parallelism = thread::available_parallelism().map(usize::from).unwrap_or(4);
        Runtime {
            default_pool: Pool::new("weft-default", pool_size("WEFT_DEFAULT_WORKERS", parallelism)),
            io_pool: Pool::new("weft-io", pool_size("WEFT_IO_WORKERS", 16)),
        }
    })
}

// ---------------------------------------------------------------------------
// Results and join handles
// ---------------------------------------------------------------------------

struct CellState<T> {
    outcome: Option<Result<T, Error>>,
    /// Failures outlive their first observation: awaiting a failed task
    /// re-raises the same error every time.
    failure: Option<Error>,
    value_taken: bool,
    observed: bool,
    handle_dropped: bool,
}

struct ResultCell<T> {
    state: Mutex<CellState<T>>,
}

impl<T> ResultCell<T> {
    fn new() -> Self {
        Self {
            state: Mutex::new(CellState {
                outcome: None,
                failure: None,
                value_taken: false,
                observed: false,
                handle_dropped: false,
            }),
        }
    }

    fn complete(&self, outcome: Result<T, Error>) {
        let mut state = self.state.lock().unwrap();
        if let Err(err) = &outcome {
            state.failure = Some(err.clone());
            // Fire-and-forget failure: nobody is left to await it.
            if state.handle_dropped && !state.observed && matches!(err, Error::Failed(_)) {
                state.observed = true;
                report_failure(err);
            }
        }
        state.outcome = Some(outcome);
    }
}

/// A handle to a running task.
///
/// Await the handle to suspend until the task completes and obtain its
/// outcome; this is also the Deferred/Future side of the API, since a spawned
/// body that computes a value is awaited exactly like one spawned for its
/// effects. Awaiting an already-completed handle returns without
/// suspension, and a cached failure is re-raised on every await (`Future`
/// is implemented for `&mut JoinHandle` for that reason). Dropping the
/// handle detaches the task: the body keeps running, its value is lost, and
/// a failure is routed to the process-wide failure sink.
pub struct JoinHandle<T> {
    cell: Arc<ResultCell<T>>,
    finished: Event,
    cancel: Arc<AtomicBool>,
    task: Weak<Task>,
}

impl<T> JoinHandle<T> {
    /// Requests cancellation of this task.
    ///
    /// Advisory, like scope cancellation: the body observes the request at
    /// its next suspension point. If the body is currently parked it is
    /// woken so the observation happens promptly.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
        if let Some(task) = self.task.upgrade() {
            task.schedule();
        }
    }

    /// Cancels the task and waits for it to reach a terminal state. Returns
    /// only after the body's cleanup has run; the usual outcome is
    /// `Err(Error::Cancelled)`, unless the body won the race by completing
    /// first.
    pub async fn cancel_and_join(mut self) -> Result<T, Error> {
        self.cancel();
        (&mut self).await
    }

    /// Blocks the calling thread until the task finishes.
    ///
    /// Only for synchronous contexts; inside a task, `.await` the handle
    /// instead.
    pub fn join(mut self) -> Result<T, Error> {
        Executor::block_on(&mut self)
    }

    fn poll_outcome(&mut self, cx: &mut Context<'_>) -> Poll<Result<T, Error>> {
        loop {
            {
                let mut state = self.cell.state.lock().unwrap();
                if state.outcome.is_some() {
                    state.observed = true;
                    match state.outcome.take() {
                        Some(Ok(value)) => {
                            state.value_taken = true;
                            return Poll::Ready(Ok(value));
                        }
                        Some(Err(err)) => return Poll::Ready(Err(err)),
                        None => unreachable!(),
                    }
                }
                if let Some(err) = state.failure.clone() {
                    return Poll::Ready(Err(err));
                }
                if state.value_taken {
                    return Poll::Ready(Err(Error::IllegalState(
                        "join result was already taken",
                    )));
                }
            }

            let mut waiter = self.finished.wait();
            match Pin::new(&mut waiter).poll(cx) {
                // The completion permit arrived between the state check and
                // the wait; loop to pick the outcome up.
                Poll::Ready(()) => continue,
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.get_mut().poll_outcome(cx)
    }
}

impl<T> Drop for JoinHandle<T> {
    fn drop(&mut self) {
        let mut state = self.cell.state.lock().unwrap();
        state.handle_dropped = true;
        if !state.observed {
            if let Some(Err(err @ Error::Failed(_))) = &state.outcome {
                let err = err.clone();
                state.observed = true;
                report_failure(&err);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// The task body wrapper
// ---------------------------------------------------------------------------

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked".to_string()
    }
}

/// Gates a user body with cancellation observation and outcome capture.
///
/// The gate check runs before every body poll, which makes suspension
/// points the places where cancellation is observed: a parked body is woken
/// by the cancel request, lands here, and is dropped (running its cleanup)
/// before the `Cancelled` outcome becomes visible. A body that reaches
/// `Poll::Ready` before the gate sees the request wins the race and
/// completes normally.
struct TaskBody<F: Future> {
    id: TaskId,
    body: Option<Pin<Box<F>>>,
    cell: Arc<ResultCell<F::Output>>,
    finished: Event,
    cancel: Arc<AtomicBool>,
    scope: Scope,
    scope_key: usize,
}

impl<F: Future> TaskBody<F> {
    fn finish(&mut self, outcome: Result<F::Output, Error>) {
        self.scope.detach(self.scope_key);
        self.cell.complete(outcome);
        self.finished.notify_one();
    }

    /// Drops the body for cancellation. Cleanup that panics is reported to
    /// the failure sink next to the `Cancelled` outcome, never swallowed.
    fn drop_body_for_cancel(&mut self) {
        let body = self.body.take();
        if let Err(payload) = catch_unwind(AssertUnwindSafe(move || drop(body))) {
            let err = Error::Failed(panic_message(payload));
            error!("cleanup failed during cancellation of task {:?}", self.id);
            report_failure(&err);
        }
    }
}

impl<F: Future> Future for TaskBody<F> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        let Some(body) = this.body.as_mut() else {
            return Poll::Ready(());
        };

        if this.cancel.load(Ordering::SeqCst) || this.scope.is_cancelled() {
            trace!("task {:?} observed cancellation", this.id);
            this.drop_body_for_cancel();
            this.finish(Err(Error::Cancelled));
            return Poll::Ready(());
        }

        match catch_unwind(AssertUnwindSafe(|| body.as_mut().poll(cx))) {
            Ok(Poll::Pending) => Poll::Pending,
            Ok(Poll::Ready(value)) => {
                this.body = None;
                this.finish(Ok(value));
                Poll::Ready(())
            }
            Err(payload) => {
                let message = panic_message(payload);
                trace!("task {:?} failed: {message}", this.id);
                this.drop_body_for_cancel();
                this.finish(Err(Error::Failed(message)));
                Poll::Ready(())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// The executor
// ---------------------------------------------------------------------------

/// The entry points for launching and driving tasks.
pub struct Executor;

impl Executor {
    /// Spawns `future` as a task of `scope`, queued on `dispatcher`.
    ///
    /// The returned [`JoinHandle`] can be awaited for the task's outcome or
    /// used to cancel it. If `scope` is already cancelled the body never
    /// starts and the outcome is `Err(Error::Cancelled)`.
    pub fn spawn<F, T>(scope: &Scope, dispatcher: Dispatcher, future: F) -> JoinHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let id = next_task_id();
        let cell = Arc::new(ResultCell::new());
        let finished = Event::new();
        let cancel = Arc::new(AtomicBool::new(false));

        let task = Arc::new(Task {
            id,
            dispatcher,
            scope: scope.clone(),
            cancel: cancel.clone(),
            queued: AtomicBool::new(false),
            future: Mutex::new(None),
        });
        let scope_key = scope.attach(&task);

        let body = TaskBody {
            id,
            body: Some(Box::pin(future)),
            cell: cell.clone(),
            finished: finished.clone(),
            cancel: cancel.clone(),
            scope: scope.clone(),
            scope_key,
        };
        *task.future.lock().unwrap() = Some(Box::pin(body));

        trace!("spawned task {id:?} on {dispatcher:?}");
        let handle = JoinHandle {
            cell,
            finished,
            cancel,
            task: Arc::downgrade(&task),
        };
        task.schedule();
        handle
    }

    /// Drives `future` to completion on the calling thread, establishing a
    /// root scope and task identity for the duration.
    ///
    /// This is the bridge from synchronous code into the runtime; worker
    /// pools keep running independently, so tasks spawned from inside
    /// `future` make progress even while the calling thread is parked.
    pub fn block_on<F: Future>(future: F) -> F::Output {
        struct ThreadWaker {
            thread: thread::Thread,
            notified: AtomicBool,
        }

        impl Wake for ThreadWaker {
            fn wake(self: Arc<Self>) {
                self.wake_by_ref();
            }

            fn wake_by_ref(self: &Arc<Self>) {
                if !self.notified.swap(true, Ordering::AcqRel) {
                    self.thread.unpark();
                }
            }
        }

        let root = Scope::new();
        let parker = Arc::new(ThreadWaker {
            thread: thread::current(),
            notified: AtomicBool::new(false),
        });
        let waker = Waker::from(parker.clone());
        let mut cx = Context::from_waker(&waker);
        let mut future = Box::pin(future);

        let _guard = enter_context(TaskContext {
            id: next_task_id(),
            scope: root,
            cancel: None,
        });

        loop {
            match future.as_mut().poll(&mut cx) {
                Poll::Ready(value) => return value,
                Poll::Pending => {
                    while !parker.notified.swap(false, Ordering::AcqRel) {
                        thread::park();
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use super::*;
    use crate::futures::timer::delay;

    #[test]
    fn spawn_and_join_value() {
        let scope = Scope::new();
        let task = Executor::spawn(&scope, Dispatcher::Default, async { 21 * 2 });
        assert_eq!(task.join(), Ok(42));
    }

    #[test]
    fn await_from_within_a_task() {
        let scope = Scope::new();
        let result = Executor::block_on(async {
            let inner = Executor::spawn(&scope, Dispatcher::Default, async {
                delay(Duration::from_millis(20)).await;
                7
            });
            inner.await
        });
        assert_eq!(result, Ok(7));
    }

    #[test]
    fn dispatchers_both_execute() {
        let scope = Scope::new();
        let a = Executor::spawn(&scope, Dispatcher::Default, async { "default" });
        let b = Executor::spawn(&scope, Dispatcher::Io, async { "io" });
        Executor::block_on(async move {
            assert_eq!(a.await, Ok("default"));
            assert_eq!(b.await, Ok("io"));
        });
    }

    #[test]
    fn failure_is_reraised_and_cached() {
        let scope = Scope::new();
        let mut task = Executor::spawn::<_, ()>(&scope, Dispatcher::Default, async {
            panic!("deliberate");
        });

        Executor::block_on(async move {
            let first = (&mut task).await;
            let second = (&mut task).await;
            assert_eq!(first, Err(Error::Failed("deliberate".into())));
            assert_eq!(second, first);
        });
    }

    #[test]
    fn awaiting_completed_handle_is_immediate() {
        let scope = Scope::new();
        let task = Executor::spawn(&scope, Dispatcher::Default, async { 5 });
        // Let it finish first.
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(Executor::block_on(task), Ok(5));
    }

    #[test]
    fn cancel_and_join_waits_for_cleanup() {
        struct SetOnDrop(Arc<AtomicBool>);
        impl Drop for SetOnDrop {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let cleaned = Arc::new(AtomicBool::new(false));
        let witness = cleaned.clone();
        let scope = Scope::new();
        let task = Executor::spawn(&scope, Dispatcher::Default, async move {
            let _cleanup = SetOnDrop(witness);
            delay(Duration::from_secs(30)).await;
        });

        let cleaned2 = cleaned.clone();
        Executor::block_on(async move {
            delay(Duration::from_millis(50)).await;
            assert_eq!(task.cancel_and_join().await, Err(Error::Cancelled));
            assert!(cleaned2.load(Ordering::SeqCst));
        });
    }

    #[test]
    fn cooperative_check_sees_handle_cancel() {
        let scope = Scope::new();
        let task = Executor::spawn(&scope, Dispatcher::Default, async {
            let mut steps = 0usize;
            while is_active() {
                steps += 1;
                delay(Duration::from_millis(10)).await;
            }
            steps
        });

        Executor::block_on(async move {
            delay(Duration::from_millis(100)).await;
            task.cancel_and_join().await
        })
        .expect_err("cancelled task must not complete normally");
    }

    #[test]
    fn unawaited_failure_reaches_the_sink() {
        static SEEN: AtomicUsize = AtomicUsize::new(0);
        set_failure_handler(|_| {
            SEEN.fetch_add(1, Ordering::SeqCst);
        });

        let scope = Scope::new();
        let task = Executor::spawn::<_, ()>(&scope, Dispatcher::Default, async {
            panic!("nobody listens");
        });
        drop(task);

        std::thread::sleep(Duration::from_millis(200));
        assert!(SEEN.load(Ordering::SeqCst) >= 1);
        clear_failure_handler();
    }
}
