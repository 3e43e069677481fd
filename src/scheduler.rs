//! Scheduler — polls a `TaskClient` once a second for due tasks and runs
//! their registered callback, rescheduling recurring tasks forward by their
//! interval.
//!
//! Grounded in `original_source/src/cue/services/scheduler.py`. The
//! original resolves a callback by dynamically importing
//! `{module, name}` strings; we replace that with an explicit
//! `CallbackRegistry` the caller populates ahead of time, per the
//! REDESIGN FLAGS guidance against dynamic import in a statically typed
//! runtime.

use crate::error::SchedulerError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskType {
    OneTime,
    Recurring,
}

#[derive(Debug, Clone)]
pub struct ScheduledTask {
    pub id: String,
    pub instruction: String,
    pub schedule_time: chrono::NaiveDateTime,
    pub task_type: TaskType,
    pub interval: Option<chrono::Duration>,
    pub callback_name: String,
    pub callback_args: serde_json::Value,
    pub is_completed: bool,
    pub last_error: Option<String>,
}

impl ScheduledTask {
    pub fn new(
        id: impl Into<String>,
        instruction: impl Into<String>,
        schedule_time: chrono::NaiveDateTime,
        callback_name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            instruction: instruction.into(),
            schedule_time,
            task_type: TaskType::OneTime,
            interval: None,
            callback_name: callback_name.into(),
            callback_args: serde_json::Value::Null,
            is_completed: false,
            last_error: None,
        }
    }

    pub fn recurring(mut self, interval: chrono::Duration) -> Self {
        self.task_type = TaskType::Recurring;
        self.interval = Some(interval);
        self
    }

    pub fn with_args(mut self, args: serde_json::Value) -> Self {
        self.callback_args = args;
        self
    }
}

/// The scheduler's collaborator for task storage — an HTTP-backed store in
/// the original, an in-memory or database-backed store here.
#[async_trait]
pub trait TaskClient: Send + Sync {
    async fn create(&self, task: ScheduledTask) -> Result<ScheduledTask, SchedulerError>;
    async fn get(&self, id: &str) -> Result<Option<ScheduledTask>, SchedulerError>;
    async fn get_due_tasks(&self) -> Result<Vec<ScheduledTask>, SchedulerError>;
    async fn mark_completed(&self, id: &str, error: Option<String>) -> Result<(), SchedulerError>;
    async fn reschedule_recurring(
        &self,
        id: &str,
        next_time: chrono::NaiveDateTime,
    ) -> Result<(), SchedulerError>;
}

/// A registered callback, looked up by name at execution time.
pub type TaskCallback = Arc<dyn Fn(serde_json::Value) -> CallbackFuture + Send + Sync>;
type CallbackFuture = std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), String>> + Send>>;

/// Explicit replacement for the original's dynamic `{module, name}` import:
/// callers register named callbacks once at startup, and tasks reference
/// them by name.
#[derive(Default, Clone)]
pub struct CallbackRegistry {
    callbacks: HashMap<String, TaskCallback>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, callback: TaskCallback) {
        self.callbacks.insert(name.into(), callback);
    }

    fn get(&self, name: &str) -> Option<TaskCallback> {
        self.callbacks.get(name).cloned()
    }
}

/// In-memory store of naive-UTC normalized tasks, matching the original's
/// "make sure schedule_time has no timezone" normalization (SPEC_FULL.md
/// §4.I); production deployments swap this for an HTTP/database-backed
/// `TaskClient`.
#[derive(Default)]
pub struct InMemoryTaskClient {
    tasks: Mutex<HashMap<String, ScheduledTask>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl InMemoryTaskClient {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskClient for InMemoryTaskClient {
    async fn create(&self, mut task: ScheduledTask) -> Result<ScheduledTask, SchedulerError> {
        if task.task_type == TaskType::Recurring && task.interval.is_none() {
            return Err(SchedulerError::MissingInterval(task.id));
        }
        if task.id.is_empty() {
            let n = self.next_id.fetch_add(1, Ordering::SeqCst);
            task.id = format!("task-{n}");
        }
        self.tasks.lock().await.insert(task.id.clone(), task.clone());
        Ok(task)
    }

    async fn get(&self, id: &str) -> Result<Option<ScheduledTask>, SchedulerError> {
        Ok(self.tasks.lock().await.get(id).cloned())
    }

    async fn get_due_tasks(&self) -> Result<Vec<ScheduledTask>, SchedulerError> {
        let now = chrono::Utc::now().naive_utc();
        Ok(self
            .tasks
            .lock()
            .await
            .values()
            .filter(|t| !t.is_completed && t.schedule_time <= now)
            .cloned()
            .collect())
    }

    async fn mark_completed(&self, id: &str, error: Option<String>) -> Result<(), SchedulerError> {
        let mut tasks = self.tasks.lock().await;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| SchedulerError::TaskNotFound(id.to_string()))?;
        // Recurring tasks are never marked completed by their own run —
        // only `reschedule_recurring` advances them.
        if task.task_type == TaskType::OneTime {
            task.is_completed = true;
        }
        task.last_error = error;
        Ok(())
    }

    async fn reschedule_recurring(
        &self,
        id: &str,
        next_time: chrono::NaiveDateTime,
    ) -> Result<(), SchedulerError> {
        let mut tasks = self.tasks.lock().await;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| SchedulerError::TaskNotFound(id.to_string()))?;
        task.schedule_time = next_time;
        task.is_completed = false;
        Ok(())
    }
}

/// Polls `task_client` once a second for due tasks and runs their
/// registered callback. `start()`/`stop()` mirror the original's
/// start/cancel-and-await pair.
pub struct Scheduler<C: TaskClient + 'static> {
    task_client: Arc<C>,
    callbacks: CallbackRegistry,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<C: TaskClient + 'static> Scheduler<C> {
    pub fn new(task_client: Arc<C>, callbacks: CallbackRegistry) -> Self {
        Self {
            task_client,
            callbacks,
            running: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    pub async fn schedule_task(
        &self,
        instruction: impl Into<String>,
        schedule_time: chrono::DateTime<chrono::Utc>,
        callback_name: impl Into<String>,
        task_type: TaskType,
        interval: Option<chrono::Duration>,
    ) -> Result<String, SchedulerError> {
        if task_type == TaskType::Recurring && interval.is_none() {
            return Err(SchedulerError::MissingInterval(instruction.into()));
        }

        let mut task = ScheduledTask::new(String::new(), instruction, schedule_time.naive_utc(), callback_name);
        task.task_type = task_type;
        task.interval = interval;

        let created = self.task_client.create(task).await?;
        Ok(created.id)
    }

    async fn execute_task(task_client: &C, callbacks: &CallbackRegistry, task_id: &str) {
        let Ok(Some(task)) = task_client.get(task_id).await else {
            tracing::error!(task_id, "due task vanished before execution");
            return;
        };
        if task.is_completed {
            return;
        }

        let error = match callbacks.get(&task.callback_name) {
            Some(callback) => callback(task.callback_args.clone()).await.err(),
            None => Some(format!("no callback registered: {}", task.callback_name)),
        };

        if let Some(ref e) = error {
            tracing::error!(task_id = %task.id, error = %e, "scheduled task failed");
        }
        let _ = task_client.mark_completed(&task.id, error).await;

        if let Some(interval) = task.interval {
            let next_time = chrono::Utc::now().naive_utc() + interval;
            let _ = task_client.reschedule_recurring(&task.id, next_time).await;
        }
    }

    async fn poll_loop(task_client: Arc<C>, callbacks: CallbackRegistry, running: Arc<AtomicBool>) {
        while running.load(Ordering::SeqCst) {
            match task_client.get_due_tasks().await {
                Ok(due) => {
                    for task in due {
                        Self::execute_task(&task_client, &callbacks, &task.id).await;
                    }
                }
                Err(e) => tracing::error!(error = %e, "error checking due tasks"),
            }
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        }
    }

    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let task_client = self.task_client.clone();
        let callbacks = self.callbacks.clone();
        let running = self.running.clone();
        let handle = tokio::spawn(Self::poll_loop(task_client, callbacks, running));
        *self.handle.lock().await = Some(handle);
    }

    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.handle.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }
    }
}
