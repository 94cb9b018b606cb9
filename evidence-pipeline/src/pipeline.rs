use crate::traits::Task;
use crate::types::{PipelineError, Result};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub type TaskId = Uuid;

/// Finished tasks whose final state stays queryable; older ones are forgotten.
pub const RETAINED_RESULTS: usize = 1024;

/// Lifecycle of a submitted task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Running { attempt: u32 },
    Retrying { attempt: u32, error: String },
    Succeeded { attempts: u32 },
    FailedPermanently { attempts: u32, error: String },
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Succeeded { .. } | TaskState::FailedPermanently { .. })
    }
}

struct QueuedTask {
    id: TaskId,
    task: Arc<dyn Task>,
    attempt: u32,
}

/// Live tasks plus the most recent finished ones, oldest evicted first.
struct StateTable {
    states: HashMap<TaskId, TaskState>,
    finished: VecDeque<TaskId>,
    retained: usize,
}

impl StateTable {
    fn new(retained: usize) -> Self {
        Self {
            states: HashMap::new(),
            finished: VecDeque::new(),
            retained,
        }
    }

    fn insert(&mut self, id: TaskId, state: TaskState) {
        let terminal = state.is_terminal();
        self.states.insert(id, state);

        if terminal {
            self.finished.push_back(id);
            while self.finished.len() > self.retained {
                if let Some(oldest) = self.finished.pop_front() {
                    self.states.remove(&oldest);
                }
            }
        }
    }
}

struct Shared {
    sender: mpsc::UnboundedSender<QueuedTask>,
    table: Mutex<StateTable>,
    /// Number of tasks not yet in a terminal state; every state change notifies watchers
    outstanding: watch::Sender<usize>,
}

impl Shared {
    fn table(&self) -> MutexGuard<'_, StateTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, id: TaskId, state: TaskState) {
        let terminal = state.is_terminal();
        self.table().insert(id, state);

        if terminal {
            self.outstanding.send_modify(|n| *n = n.saturating_sub(1));
        } else {
            self.outstanding.send_modify(|_| {});
        }
    }
}

/// Background workers running retryable tasks off the request path.
///
/// Failed attempts are re-submitted after the task's backoff delay by a timer,
/// so a waiting retry never holds a worker.
pub struct TaskQueue {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl TaskQueue {
    /// Spawns `workers` workers on the current tokio runtime.
    pub fn new(workers: usize) -> Self {
        Self::with_retention(workers, RETAINED_RESULTS)
    }

    /// Like `new`, keeping the final state of at most `retained` finished tasks.
    pub fn with_retention(workers: usize, retained: usize) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (outstanding, _) = watch::channel(0);
        let shared = Arc::new(Shared {
            sender,
            table: Mutex::new(StateTable::new(retained)),
            outstanding,
        });

        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let workers = (0..workers.max(1))
            .map(|index| Self::spawn_worker(index, receiver.clone(), shared.clone()))
            .collect();

        Self {
            shared,
            workers: Mutex::new(workers),
            closed: AtomicBool::new(false),
        }
    }

    /// Queues a task and returns immediately.
    pub fn submit(&self, task: Arc<dyn Task>) -> Result<TaskId> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PipelineError::General("task queue is shut down".to_string()));
        }

        let id = Uuid::new_v4();
        let name = task.name();

        self.shared.outstanding.send_modify(|n| *n += 1);
        self.shared.set_state(id, TaskState::Queued);

        if self.shared.sender.send(QueuedTask { id, task, attempt: 1 }).is_err() {
            self.shared.set_state(
                id,
                TaskState::FailedPermanently {
                    attempts: 0,
                    error: "task queue is closed".to_string(),
                },
            );
            return Err(PipelineError::General("task queue is closed".to_string()));
        }

        debug!("Queued {} as {}", name, id);
        Ok(id)
    }

    /// `None` for unknown ids and for finished tasks already evicted.
    pub fn state(&self, id: TaskId) -> Option<TaskState> {
        self.shared.table().states.get(&id).cloned()
    }

    pub fn states(&self) -> HashMap<TaskId, TaskState> {
        self.shared.table().states.clone()
    }

    pub fn outstanding(&self) -> usize {
        *self.shared.outstanding.borrow()
    }

    /// Waits until the task reaches a terminal state. `None` for unknown or evicted ids.
    pub async fn wait_for(&self, id: TaskId) -> Option<TaskState> {
        let mut changes = self.shared.outstanding.subscribe();
        loop {
            match self.state(id) {
                None => return None,
                Some(state) if state.is_terminal() => return Some(state),
                Some(_) => {}
            }

            if changes.changed().await.is_err() {
                return self.state(id);
            }
        }
    }

    /// Waits until every submitted task, including scheduled retries, has finished.
    pub async fn wait_idle(&self) {
        let mut changes = self.shared.outstanding.subscribe();
        let _ = changes.wait_for(|outstanding| *outstanding == 0).await;
    }

    /// Stops accepting tasks, drains outstanding work, then stops the workers.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.wait_idle().await;

        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        for worker in workers {
            worker.abort();
        }
        info!("Task queue shut down");
    }

    fn spawn_worker(
        index: usize,
        receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<QueuedTask>>>,
        shared: Arc<Shared>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            debug!("Worker {} started", index);
            loop {
                let next = receiver.lock().await.recv().await;
                let Some(queued) = next else { break };
                Self::run_attempt(&shared, queued).await;
            }
            debug!("Worker {} stopped", index);
        })
    }

    async fn run_attempt(shared: &Arc<Shared>, queued: QueuedTask) {
        let QueuedTask { id, task, attempt } = queued;
        let name = task.name();
        let max_attempts = task.max_attempts().max(1);

        shared.set_state(id, TaskState::Running { attempt });
        info!("Running {} (attempt {}/{})", name, attempt, max_attempts);

        // A panicking task fails its attempt instead of taking the worker down
        let runner = task.clone();
        let result = match tokio::spawn(async move { runner.execute(attempt).await }).await {
            Ok(result) => result,
            Err(join_error) => Err(PipelineError::General(format!("task panicked: {}", join_error))),
        };

        match result {
            Ok(()) => {
                info!("{} succeeded on attempt {}", name, attempt);
                shared.set_state(id, TaskState::Succeeded { attempts: attempt });
            }
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                let delay = task.backoff().delay_after(attempt);
                warn!(
                    "{} failed on attempt {}/{}: {}, retrying in {:?}",
                    name, attempt, max_attempts, e, delay
                );
                shared.set_state(
                    id,
                    TaskState::Retrying {
                        attempt,
                        error: e.to_string(),
                    },
                );

                let shared = shared.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let retry = QueuedTask {
                        id,
                        task,
                        attempt: attempt + 1,
                    };
                    if shared.sender.send(retry).is_err() {
                        error!("Could not re-queue {}: queue closed", name);
                        shared.set_state(
                            id,
                            TaskState::FailedPermanently {
                                attempts: attempt,
                                error: e.to_string(),
                            },
                        );
                    }
                });
            }
            Err(e) => {
                error!(
                    "{} failed permanently after {} attempt(s): {}",
                    name, attempt, e
                );
                shared.set_state(
                    id,
                    TaskState::FailedPermanently {
                        attempts: attempt,
                        error: e.to_string(),
                    },
                );
            }
        }
    }
}
