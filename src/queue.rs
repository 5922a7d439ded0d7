//! Single-consumer task queue shared by every background worker
//!
//! Each worker owns one FIFO queue and one consumer loop running on its own
//! tokio task. The loop holds at most one in-flight task future; it keeps
//! receiving commands (enqueue, cancel, clear, shutdown) while that future
//! runs, so cancellation only ever touches tasks that have not started.
//!
//! Every dequeued task produces exactly one terminal outcome. Whether a
//! failure is reported to the owner or only logged is the handler's
//! [`FailurePolicy`].

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use std::collections::{HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{Result, WorkerError};

/// What happens when a task fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Emit a terminal error event to the owner
    Report,
    /// Log the failure and move on to the next task
    Swallow,
}

/// A unit of queued work
pub trait QueuedTask: Send + Sync + 'static {
    /// Correlation token supplied by the owner
    fn task_id(&self) -> Option<&str> {
        None
    }

    /// Submissions sharing a key with a queued or running task are dropped
    fn dedup_key(&self) -> Option<String> {
        self.task_id().map(str::to_string)
    }
}

/// Outbound half of a worker's message channel
#[derive(Debug)]
pub struct EventSink<E> {
    tx: mpsc::UnboundedSender<E>,
}

impl<E> Clone for EventSink<E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<E> EventSink<E> {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<E>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Send an event; a departed owner is not an error
    pub fn emit(&self, event: E) {
        if self.tx.send(event).is_err() {
            debug!("Event receiver dropped, discarding event");
        }
    }
}

/// Per-worker task semantics plugged into the queue core
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    type Task: QueuedTask;
    type Output: Send + 'static;
    type Event: Send + 'static;

    fn failure_policy(&self) -> FailurePolicy;

    /// Run one task to completion. Progress may be emitted through `events`.
    async fn execute(&self, task: &Self::Task, events: &EventSink<Self::Event>)
    -> Result<Self::Output>;

    /// Terminal event for a successful task
    fn completed(&self, task: &Self::Task, output: Self::Output) -> Option<Self::Event>;

    /// Terminal event for a failed task, used under [`FailurePolicy::Report`]
    fn failed(&self, _task: &Self::Task, _error: &WorkerError) -> Option<Self::Event> {
        None
    }

    /// Event for a task removed from the queue before it started
    fn cancelled(&self, _task: &Self::Task) -> Option<Self::Event> {
        None
    }

    /// Runs once the queue is idle after a shutdown request; returns the
    /// acknowledgment sent to the owner
    async fn finish(&self, _events: &EventSink<Self::Event>) -> Option<Self::Event> {
        None
    }
}

enum Command<T> {
    Enqueue(T),
    Cancel(String),
    Clear,
    Shutdown(oneshot::Sender<()>),
}

/// Owner-side handle to a running worker
pub struct WorkerHandle<T> {
    tx: mpsc::UnboundedSender<Command<T>>,
}

impl<T: QueuedTask> WorkerHandle<T> {
    /// Append a task to the tail of the queue
    pub fn enqueue(&self, task: T) -> Result<()> {
        self.send(Command::Enqueue(task))
    }

    /// Remove a task that has not started yet; no-op otherwise
    pub fn cancel(&self, task_id: impl Into<String>) -> Result<()> {
        self.send(Command::Cancel(task_id.into()))
    }

    /// Drop every queued task without per-task notification
    pub fn clear(&self) -> Result<()> {
        self.send(Command::Clear)
    }

    /// Wait until the queue is empty and nothing runs, then stop the worker
    pub async fn shutdown(&self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.send(Command::Shutdown(ack_tx))?;
        ack_rx.await.map_err(|_| WorkerError::WorkerStopped)
    }

    fn send(&self, command: Command<T>) -> Result<()> {
        self.tx.send(command).map_err(|_| WorkerError::WorkerStopped)
    }
}

/// Start a worker loop for `handler`, reporting through `events`
pub fn spawn_worker<H: TaskHandler>(
    handler: Arc<H>,
    events: EventSink<H::Event>,
) -> WorkerHandle<H::Task> {
    let (tx, rx) = mpsc::unbounded_channel();
    let queue = TaskQueue {
        handler,
        events,
        pending: VecDeque::new(),
        keys: HashSet::new(),
        in_flight: None,
    };
    tokio::spawn(queue.run(rx));
    WorkerHandle { tx }
}

type InFlight<H> = BoxFuture<
    'static,
    (
        <H as TaskHandler>::Task,
        Result<<H as TaskHandler>::Output>,
    ),
>;

struct TaskQueue<H: TaskHandler> {
    handler: Arc<H>,
    events: EventSink<H::Event>,
    pending: VecDeque<H::Task>,
    /// Dedup keys of queued and running tasks
    keys: HashSet<String>,
    in_flight: Option<InFlight<H>>,
}

impl<H: TaskHandler> TaskQueue<H> {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command<H::Task>>) {
        let mut waiters: Vec<oneshot::Sender<()>> = Vec::new();
        let mut open = true;

        loop {
            self.drain();

            if self.is_idle() {
                if !waiters.is_empty() {
                    if let Some(event) = self.handler.finish(&self.events).await {
                        self.events.emit(event);
                    }
                    for waiter in waiters.drain(..) {
                        let _ = waiter.send(());
                    }
                    break;
                }
                if !open {
                    break;
                }
            }

            tokio::select! {
                command = rx.recv(), if open => match command {
                    Some(Command::Enqueue(task)) => self.enqueue(task),
                    Some(Command::Cancel(task_id)) => self.cancel(&task_id),
                    Some(Command::Clear) => self.clear(),
                    Some(Command::Shutdown(ack)) => waiters.push(ack),
                    None => open = false,
                },
                (task, outcome) = next_outcome(&mut self.in_flight) => {
                    self.in_flight = None;
                    self.complete(task, outcome);
                }
            }
        }

        debug!("Worker loop stopped");
    }

    fn is_idle(&self) -> bool {
        self.in_flight.is_none() && self.pending.is_empty()
    }

    fn enqueue(&mut self, task: H::Task) {
        if let Some(key) = task.dedup_key() {
            if !self.keys.insert(key.clone()) {
                debug!("Dropping duplicate task {}", key);
                return;
            }
        }
        self.pending.push_back(task);
    }

    fn cancel(&mut self, task_id: &str) {
        let position = self
            .pending
            .iter()
            .position(|t| t.task_id() == Some(task_id));

        match position.and_then(|i| self.pending.remove(i)) {
            Some(task) => {
                self.release_key(&task);
                debug!("Cancelled queued task {}", task_id);
                if let Some(event) = self.handler.cancelled(&task) {
                    self.events.emit(event);
                }
            }
            None => debug!("Cancel for {} ignored: not queued", task_id),
        }
    }

    fn clear(&mut self) {
        let dropped: Vec<H::Task> = self.pending.drain(..).collect();
        for task in &dropped {
            self.release_key(task);
        }
        debug!("Cleared {} queued tasks", dropped.len());
    }

    /// Start the head of the queue unless a task is already running
    fn drain(&mut self) {
        if self.in_flight.is_some() {
            return;
        }
        let Some(task) = self.pending.pop_front() else {
            return;
        };

        let handler = Arc::clone(&self.handler);
        let events = self.events.clone();
        self.in_flight = Some(
            async move {
                let outcome = AssertUnwindSafe(handler.execute(&task, &events))
                    .catch_unwind()
                    .await
                    .unwrap_or(Err(WorkerError::Panicked));
                (task, outcome)
            }
            .boxed(),
        );
    }

    fn complete(&mut self, task: H::Task, outcome: Result<H::Output>) {
        self.release_key(&task);

        match outcome {
            Ok(output) => {
                if let Some(event) = self.handler.completed(&task, output) {
                    self.events.emit(event);
                }
            }
            Err(error) => match self.handler.failure_policy() {
                FailurePolicy::Report => {
                    warn!("Task {} failed: {}", task.task_id().unwrap_or("-"), error);
                    if let Some(event) = self.handler.failed(&task, &error) {
                        self.events.emit(event);
                    }
                }
                FailurePolicy::Swallow => {
                    warn!("Background task failed: {}", error);
                }
            },
        }
    }

    fn release_key(&mut self, task: &H::Task) {
        if let Some(key) = task.dedup_key() {
            self.keys.remove(&key);
        }
    }
}

async fn next_outcome<T>(slot: &mut Option<BoxFuture<'static, T>>) -> T {
    match slot {
        Some(future) => future.await,
        None => std::future::pending().await,
    }
}
