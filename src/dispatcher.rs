//! Background work for the interactive thread.
//!
//! Operations run on a bounded blocking pool. Their progress and outcome travel
//! back through one channel and are only turned into callback invocations when
//! the interactive thread drains it ([`Dispatcher::pump`], [`Dispatcher::next`]
//! or [`Dispatcher::wait_idle`]), so callbacks may freely touch UI-side state.

use anyhow::Result;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::Quack2TexError;

pub type TaskId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkState::Completed | WorkState::Failed | WorkState::Cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum WorkError {
    #[error("{message}")]
    Failed { message: String },

    #[error("worker panicked: {0}")]
    Panicked(String),

    #[error("task was cancelled")]
    Cancelled,

    #[error("task produced a result of an unexpected type")]
    TypeMismatch,
}

impl WorkError {
    /// Keeps the whole context chain, e.g. `request failed: connection refused`.
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        WorkError::Failed {
            message: format!("{:#}", err),
        }
    }
}

enum Outcome {
    Completed(Box<dyn Any + Send>),
    Failed(WorkError),
}

enum Delivery {
    Progress { id: TaskId, message: String },
    Done { id: TaskId, outcome: Outcome },
}

/// Handed to a running operation so it can report intermediate messages.
pub struct Progress {
    id: TaskId,
    tx: async_channel::Sender<Delivery>,
}

impl Progress {
    pub fn report(&self, message: impl Into<String>) {
        let _ = self.tx.try_send(Delivery::Progress {
            id: self.id,
            message: message.into(),
        });
    }
}

type ResultFn<T> = Box<dyn FnOnce(T)>;
type ErrorFn = Box<dyn FnOnce(WorkError)>;
type ProgressFn = Box<dyn FnMut(String)>;
type FinishedFn = Box<dyn FnOnce()>;

/// Interactive-thread reactions to one task. None of them need to be `Send`.
pub struct Callbacks<T> {
    on_result: Option<ResultFn<T>>,
    on_error: Option<ErrorFn>,
    on_progress: Option<ProgressFn>,
    on_finished: Option<FinishedFn>,
}

impl<T: 'static> Callbacks<T> {
    pub fn new() -> Self {
        Self {
            on_result: None,
            on_error: None,
            on_progress: None,
            on_finished: None,
        }
    }

    /// Single closure receiving whichever terminal outcome arrives.
    pub fn outcome<F>(f: F) -> Self
    where
        F: FnOnce(Result<T, WorkError>) + 'static,
    {
        let slot = Rc::new(RefCell::new(Some(f)));
        let err_slot = Rc::clone(&slot);
        Self::new()
            .on_result(move |value| {
                let taken = slot.borrow_mut().take();
                if let Some(f) = taken {
                    f(Ok(value));
                }
            })
            .on_error(move |err| {
                let taken = err_slot.borrow_mut().take();
                if let Some(f) = taken {
                    f(Err(err));
                }
            })
    }

    pub fn on_result(mut self, f: impl FnOnce(T) + 'static) -> Self {
        self.on_result = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl FnOnce(WorkError) + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    pub fn on_progress(mut self, f: impl FnMut(String) + 'static) -> Self {
        self.on_progress = Some(Box::new(f));
        self
    }

    pub fn on_finished(mut self, f: impl FnOnce() + 'static) -> Self {
        self.on_finished = Some(Box::new(f));
        self
    }
}

impl<T: 'static> Default for Callbacks<T> {
    fn default() -> Self {
        Self::new()
    }
}

trait PendingTask {
    fn progress(&mut self, message: String);
    fn finish(self: Box<Self>, outcome: Outcome);
}

impl<T: 'static> PendingTask for Callbacks<T> {
    fn progress(&mut self, message: String) {
        if let Some(f) = self.on_progress.as_mut() {
            f(message);
        }
    }

    fn finish(self: Box<Self>, outcome: Outcome) {
        let Callbacks {
            on_result,
            on_error,
            on_finished,
            ..
        } = *self;

        let result = match outcome {
            Outcome::Completed(value) => value
                .downcast::<T>()
                .map(|v| *v)
                .map_err(|_| WorkError::TypeMismatch),
            Outcome::Failed(err) => Err(err),
        };
        match result {
            Ok(value) => {
                if let Some(f) = on_result {
                    f(value);
                }
            }
            Err(err) => {
                if let Some(f) = on_error {
                    f(err);
                }
            }
        }
        if let Some(f) = on_finished {
            f();
        }
    }
}

struct TaskShared {
    state: Mutex<WorkState>,
    cancelled: AtomicBool,
}

impl TaskShared {
    fn set_state(&self, state: WorkState) {
        if let Ok(mut guard) = self.state.lock() {
            *guard = state;
        }
    }
}

/// Requester-side view of a submitted task.
#[derive(Clone)]
pub struct TaskHandle {
    id: TaskId,
    shared: Arc<TaskShared>,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn state(&self) -> WorkState {
        self.shared
            .state
            .lock()
            .map(|s| *s)
            .unwrap_or(WorkState::Failed)
    }

    /// Best effort: a queued task never runs, a running one has its result
    /// replaced by [`WorkError::Cancelled`]. Work already in flight is not interrupted.
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }
}

struct Inner {
    runtime: RefCell<Option<tokio::runtime::Runtime>>,
    tx: async_channel::Sender<Delivery>,
    rx: async_channel::Receiver<Delivery>,
    registry: RefCell<HashMap<TaskId, Box<dyn PendingTask>>>,
    next_id: Cell<TaskId>,
    pool_size: usize,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Late results from still-running workers are dropped with the channel.
        if let Some(runtime) = self.runtime.get_mut().take() {
            runtime.shutdown_background();
        }
    }
}

/// Cheap to clone; every clone refers to the same pool and registry. Not
/// `Send`: it belongs to the interactive thread.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Rc<Inner>,
}

impl Dispatcher {
    pub fn new(pool_size: usize) -> Result<Self> {
        if pool_size == 0 {
            return Err(Quack2TexError::Worker("pool size must be at least 1".to_string()).into());
        }
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(pool_size)
            .thread_name("quack2tex-worker")
            .enable_all()
            .build()
            .map_err(|e| Quack2TexError::Worker(format!("failed to start worker pool: {}", e)))?;
        let (tx, rx) = async_channel::unbounded();

        debug!("Worker pool started with {} thread(s)", pool_size);
        Ok(Self {
            inner: Rc::new(Inner {
                runtime: RefCell::new(Some(runtime)),
                tx,
                rx,
                registry: RefCell::new(HashMap::new()),
                next_id: Cell::new(1),
                pool_size,
            }),
        })
    }

    pub fn pool_size(&self) -> usize {
        self.inner.pool_size
    }

    /// Tasks whose terminal outcome has not been delivered yet.
    pub fn pending(&self) -> usize {
        self.inner.registry.borrow().len()
    }

    pub fn submit<T, F>(&self, operation: F, callbacks: Callbacks<T>) -> TaskHandle
    where
        T: Send + 'static,
        F: FnOnce(&Progress) -> Result<T> + Send + 'static,
    {
        let id = self.inner.next_id.get();
        self.inner.next_id.set(id + 1);

        let shared = Arc::new(TaskShared {
            state: Mutex::new(WorkState::Pending),
            cancelled: AtomicBool::new(false),
        });
        self.inner
            .registry
            .borrow_mut()
            .insert(id, Box::new(callbacks));

        let progress = Progress {
            id,
            tx: self.inner.tx.clone(),
        };
        let task = Arc::clone(&shared);
        match self.inner.runtime.borrow().as_ref() {
            Some(runtime) => {
                runtime.spawn_blocking(move || run_operation(id, task, progress, operation));
            }
            None => {
                task.set_state(WorkState::Failed);
                let _ = self.inner.tx.try_send(Delivery::Done {
                    id,
                    outcome: Outcome::Failed(WorkError::Failed {
                        message: "worker pool is shut down".to_string(),
                    }),
                });
            }
        }
        debug!("Submitted task {}", id);

        TaskHandle { id, shared }
    }

    /// Forget a requester's callbacks; anything the task delivers later is dropped.
    pub fn detach(&self, handle: &TaskHandle) {
        if self.inner.registry.borrow_mut().remove(&handle.id).is_some() {
            debug!("Detached task {}", handle.id);
        }
    }

    /// Stops the pool and forgets every pending callback. Callbacks often hold
    /// dispatcher clones, so this is what breaks those cycles when the owner
    /// goes away. Later submissions fail immediately.
    pub fn shutdown(&self) {
        if let Some(runtime) = self.inner.runtime.borrow_mut().take() {
            runtime.shutdown_background();
        }
        let pending = std::mem::take(&mut *self.inner.registry.borrow_mut());
        if !pending.is_empty() {
            debug!("Dropping {} pending task(s) on shutdown", pending.len());
        }
        drop(pending);
        while self.inner.rx.try_recv().is_ok() {}
    }

    /// Delivers everything already waiting, without blocking. Returns the number of deliveries.
    pub fn pump(&self) -> usize {
        let mut count = 0;
        while let Ok(delivery) = self.inner.rx.try_recv() {
            self.deliver(delivery);
            count += 1;
        }
        count
    }

    /// Waits for the next delivery and handles it.
    pub async fn next(&self) {
        if let Ok(delivery) = self.inner.rx.recv().await {
            self.deliver(delivery);
        }
    }

    /// Blocks the calling thread until every registered task has delivered.
    pub fn wait_idle(&self) {
        while self.pending() > 0 {
            match self.inner.rx.recv_blocking() {
                Ok(delivery) => self.deliver(delivery),
                Err(_) => break,
            }
        }
    }

    fn deliver(&self, delivery: Delivery) {
        match delivery {
            Delivery::Progress { id, message } => {
                // Taken out while the callback runs so it can submit more work.
                let entry = self.inner.registry.borrow_mut().remove(&id);
                match entry {
                    Some(mut pending) => {
                        pending.progress(message);
                        self.inner.registry.borrow_mut().insert(id, pending);
                    }
                    None => debug!("Dropping progress for detached task {}", id),
                }
            }
            Delivery::Done { id, outcome } => {
                let entry = self.inner.registry.borrow_mut().remove(&id);
                match entry {
                    Some(pending) => pending.finish(outcome),
                    None => debug!("Dropping stale result for task {}", id),
                }
            }
        }
    }
}

fn run_operation<T, F>(id: TaskId, task: Arc<TaskShared>, progress: Progress, operation: F)
where
    T: Send + 'static,
    F: FnOnce(&Progress) -> Result<T>,
{
    if task.cancelled.load(Ordering::SeqCst) {
        debug!("Task {} cancelled before it started", id);
        task.set_state(WorkState::Cancelled);
        let _ = progress.tx.try_send(Delivery::Done {
            id,
            outcome: Outcome::Failed(WorkError::Cancelled),
        });
        return;
    }

    task.set_state(WorkState::Running);
    let result = std::panic::catch_unwind(AssertUnwindSafe(|| operation(&progress)));

    let (state, outcome) = match result {
        Ok(Ok(_)) if task.cancelled.load(Ordering::SeqCst) => {
            debug!("Task {} finished after cancellation, discarding result", id);
            (WorkState::Cancelled, Outcome::Failed(WorkError::Cancelled))
        }
        Ok(Ok(value)) => (WorkState::Completed, Outcome::Completed(Box::new(value))),
        Ok(Err(err)) => {
            warn!("Task {} failed: {:#}", id, err);
            (WorkState::Failed, Outcome::Failed(WorkError::from_anyhow(&err)))
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            warn!("Task {} panicked: {}", id, message);
            (WorkState::Failed, Outcome::Failed(WorkError::Panicked(message)))
        }
    };

    task.set_state(state);
    let _ = progress.tx.try_send(Delivery::Done { id, outcome });
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
