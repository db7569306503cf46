//! Task Manager
//!
//! Priority-ordered, concurrency-bounded dispatch of async units of work.
//! Pending tasks wait in a binary heap (higher priority first, FIFO on ties)
//! and are started whenever the running count is below the window.
//!
//! A task that exceeds its timeout is marked failed, but its body is not
//! aborted: it keeps running detached until it finishes on its own.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::TaskConfig;
use crate::error::{Result, TradeflowError};

type Work = BoxFuture<'static, anyhow::Result<Value>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    pub name: Option<String>,
    pub timeout_ms: Option<u64>,
    /// Higher runs first
    pub priority: i32,
}

impl TaskOptions {
    pub fn named(name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            ..Self::default()
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub name: String,
    pub status: TaskStatus,
    pub priority: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStats {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub max_concurrent: usize,
}

/// Terminal outcome, published to waiters
#[derive(Debug, Clone)]
enum Finish {
    Completed(Value),
    Failed(String),
    TimedOut(String),
    Cancelled,
}

impl Finish {
    fn into_result(self) -> Result<Value> {
        match self {
            Finish::Completed(value) => Ok(value),
            Finish::Failed(e) => Err(TradeflowError::TaskFailed(e)),
            Finish::TimedOut(e) => Err(TradeflowError::Timeout(e)),
            Finish::Cancelled => Err(TradeflowError::Cancelled),
        }
    }
}

/// Heap entry; ordering puts higher priority first, then lower sequence
#[derive(Debug, PartialEq, Eq)]
struct Queued {
    priority: i32,
    sequence: u64,
    id: String,
}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        match self.priority.cmp(&other.priority) {
            CmpOrdering::Equal => other.sequence.cmp(&self.sequence),
            ord => ord,
        }
    }
}

struct Entry {
    task: Task,
    work: Option<Work>,
    done: watch::Sender<Option<Finish>>,
}

struct State {
    tasks: HashMap<String, Entry>,
    queue: BinaryHeap<Queued>,
    sequence: u64,
    pending: usize,
    running: usize,
    max_concurrent: usize,
}

struct Inner {
    state: Mutex<State>,
    processing: AtomicBool,
    config: TaskConfig,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Pop the next runnable task if the window has room
    fn next_runnable(&self) -> Option<(String, Work, Option<u64>)> {
        let mut state = self.lock();
        if state.running >= state.max_concurrent {
            return None;
        }
        while let Some(queued) = state.queue.pop() {
            let Some(entry) = state.tasks.get_mut(&queued.id) else {
                continue;
            };
            if entry.task.status != TaskStatus::Pending {
                // Cancelled while queued
                continue;
            }
            let Some(work) = entry.work.take() else {
                continue;
            };
            entry.task.status = TaskStatus::Running;
            entry.task.started_at = Some(Utc::now());
            let timeout = entry.task.timeout_ms;
            state.pending -= 1;
            state.running += 1;
            return Some((queued.id, work, timeout));
        }
        None
    }

    fn finish(&self, id: &str, finish: Finish) {
        let mut state = self.lock();
        state.running = state.running.saturating_sub(1);
        if let Some(entry) = state.tasks.get_mut(id) {
            let task = &mut entry.task;
            task.completed_at = Some(Utc::now());
            match &finish {
                Finish::Completed(value) => {
                    task.status = TaskStatus::Completed;
                    task.result = Some(value.clone());
                    debug!(task_id = %id, name = %task.name, "Task completed");
                }
                Finish::Failed(e) | Finish::TimedOut(e) => {
                    task.status = TaskStatus::Failed;
                    task.error = Some(e.clone());
                    warn!(task_id = %id, name = %task.name, error = %e, "Task failed");
                }
                Finish::Cancelled => task.status = TaskStatus::Cancelled,
            }
            entry.done.send_replace(Some(finish));
        }

        if state.tasks.len() > self.config.max_tasks {
            let before = state.tasks.len();
            state.tasks.retain(|_, e| {
                !matches!(e.task.status, TaskStatus::Completed | TaskStatus::Failed)
            });
            debug!(evicted = before - state.tasks.len(), "Task table cleanup");
        }
    }
}

/// Start queued work while the window has room. Concurrent calls coalesce:
/// only one caller drains at a time, and it rechecks before leaving.
fn process_queue(inner: &Arc<Inner>) {
    loop {
        if inner.processing.swap(true, Ordering::SeqCst) {
            return;
        }
        while let Some((id, work, timeout)) = inner.next_runnable() {
            spawn_task(inner.clone(), id, work, timeout);
        }
        inner.processing.store(false, Ordering::SeqCst);

        let more = {
            let state = inner.lock();
            state.running < state.max_concurrent && state.pending > 0
        };
        if !more {
            return;
        }
    }
}

fn spawn_task(inner: Arc<Inner>, id: String, work: Work, timeout_ms: Option<u64>) {
    tokio::spawn(async move {
        // The body gets its own task so a timeout can walk away from it.
        let body = tokio::spawn(work);
        let joined = match timeout_ms {
            Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), body).await {
                Ok(joined) => joined,
                Err(_) => {
                    inner.finish(&id, Finish::TimedOut(format!("Task timeout after {}ms", ms)));
                    process_queue(&inner);
                    return;
                }
            },
            None => body.await,
        };

        let finish = match joined {
            Ok(Ok(value)) => Finish::Completed(value),
            Ok(Err(e)) => Finish::Failed(format!("{:#}", e)),
            Err(e) if e.is_panic() => Finish::Failed("task panicked".to_string()),
            Err(e) => Finish::Failed(e.to_string()),
        };
        inner.finish(&id, finish);
        process_queue(&inner);
    });
}

/// A finish sent before the sender was dropped is still observed.
async fn await_finish(mut rx: watch::Receiver<Option<Finish>>, id: &str) -> Result<Value> {
    loop {
        if let Some(finish) = rx.borrow_and_update().clone() {
            return finish.into_result();
        }
        rx.changed()
            .await
            .map_err(|_| TradeflowError::Internal(format!("task {} dropped", id)))?;
    }
}

/// Cheap to clone; clones share the same queue
#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<Inner>,
}

impl TaskManager {
    pub fn new(config: TaskConfig) -> Self {
        let max_concurrent = config.max_concurrent.max(1);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    tasks: HashMap::new(),
                    queue: BinaryHeap::new(),
                    sequence: 0,
                    pending: 0,
                    running: 0,
                    max_concurrent,
                }),
                processing: AtomicBool::new(false),
                config,
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(TaskConfig::default())
    }

    /// Queue a unit of work. Must be called inside a tokio runtime.
    pub fn enqueue<F>(&self, work: F, options: TaskOptions) -> Task
    where
        F: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.enqueue_watched(work, options).0
    }

    /// Enqueue and hand back a receiver subscribed before the work can start,
    /// so the outcome survives eviction of the finished entry.
    fn enqueue_watched<F>(&self, work: F, options: TaskOptions) -> (Task, watch::Receiver<Option<Finish>>)
    where
        F: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let id = Uuid::new_v4().to_string();
        let task = Task {
            name: options.name.unwrap_or_else(|| format!("task-{}", &id[..8])),
            id: id.clone(),
            status: TaskStatus::Pending,
            priority: options.priority,
            timeout_ms: options.timeout_ms.or(self.inner.config.default_timeout_ms),
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };

        let rx = {
            let mut state = self.inner.lock();
            let sequence = state.sequence;
            state.sequence += 1;
            state.pending += 1;
            state.queue.push(Queued {
                priority: task.priority,
                sequence,
                id: id.clone(),
            });
            let (done, rx) = watch::channel(None);
            state.tasks.insert(
                id,
                Entry {
                    task: task.clone(),
                    work: Some(work.boxed()),
                    done,
                },
            );
            rx
        };
        debug!(task_id = %task.id, name = %task.name, priority = task.priority, "Task enqueued");

        process_queue(&self.inner);
        (task, rx)
    }

    /// Enqueue and wait for the result
    pub async fn run<F>(&self, work: F, options: TaskOptions) -> Result<Value>
    where
        F: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let (task, rx) = self.enqueue_watched(work, options);
        await_finish(rx, &task.id).await
    }

    /// Wait until a task finishes and return its result
    pub async fn wait_for(&self, id: &str) -> Result<Value> {
        let rx = {
            let state = self.inner.lock();
            let entry = state
                .tasks
                .get(id)
                .ok_or_else(|| TradeflowError::NotFound(format!("task {}", id)))?;
            entry.done.subscribe()
        };
        await_finish(rx, id).await
    }

    /// Cancel a pending task. Running and finished tasks are not affected.
    pub fn cancel(&self, id: &str) -> bool {
        let mut state = self.inner.lock();
        let Some(entry) = state.tasks.get_mut(id) else {
            return false;
        };
        if entry.task.status != TaskStatus::Pending {
            return false;
        }
        entry.task.status = TaskStatus::Cancelled;
        entry.task.completed_at = Some(Utc::now());
        entry.work = None;
        entry.done.send_replace(Some(Finish::Cancelled));
        state.pending -= 1;
        info!(task_id = %id, "Task cancelled");
        true
    }

    /// Poll until nothing is pending or running
    pub async fn wait_all(&self) {
        let poll = Duration::from_millis(self.inner.config.poll_interval_ms.max(1));
        loop {
            {
                let state = self.inner.lock();
                if state.pending == 0 && state.running == 0 {
                    return;
                }
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Resize the concurrency window; growing it starts queued work at once
    pub fn set_max_concurrent(&self, max: usize) {
        self.inner.lock().max_concurrent = max.max(1);
        process_queue(&self.inner);
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.lock().max_concurrent
    }

    pub fn get(&self, id: &str) -> Option<Task> {
        self.inner.lock().tasks.get(id).map(|e| e.task.clone())
    }

    pub fn stats(&self) -> TaskStats {
        let state = self.inner.lock();
        let count = |status: TaskStatus| state.tasks.values().filter(|e| e.task.status == status).count();
        TaskStats {
            total: state.tasks.len(),
            pending: state.pending,
            running: state.running,
            completed: count(TaskStatus::Completed),
            failed: count(TaskStatus::Failed),
            cancelled: count(TaskStatus::Cancelled),
            max_concurrent: state.max_concurrent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn manager(max_concurrent: usize) -> TaskManager {
        TaskManager::new(TaskConfig {
            max_concurrent,
            ..TaskConfig::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_is_never_exceeded() {
        let tasks = manager(3);
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for i in 0..20 {
            let current = current.clone();
            let peak = peak.clone();
            tasks.enqueue(
                async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10 + i % 4)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok(json!(i))
                },
                TaskOptions::default(),
            );
            assert!(tasks.stats().running <= 3);
        }

        tasks.wait_all().await;
        assert_eq!(peak.load(Ordering::SeqCst), 3);
        let stats = tasks.stats();
        assert_eq!(stats.completed, 20);
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.running, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_then_fifo() {
        let tasks = manager(1);
        let order = Arc::new(Mutex::new(Vec::new()));

        let record = |name: &'static str| {
            let order = order.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                order.lock().unwrap().push(name);
                Ok(Value::Null)
            }
        };

        tasks.enqueue(record("blocker"), TaskOptions::default());
        tasks.enqueue(record("low"), TaskOptions::default().priority(1));
        tasks.enqueue(record("high"), TaskOptions::default().priority(10));
        tasks.enqueue(record("mid"), TaskOptions::default().priority(5));
        tasks.enqueue(record("high-2"), TaskOptions::default().priority(10));

        tasks.wait_all().await;
        assert_eq!(*order.lock().unwrap(), vec!["blocker", "high", "high-2", "mid", "low"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fails_task() {
        let tasks = manager(2);
        let task = tasks.enqueue(
            async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(json!("late"))
            },
            TaskOptions::named("slow").timeout_ms(50),
        );

        let err = tasks.wait_for(&task.id).await.unwrap_err();
        assert!(err.to_string().contains("timeout"), "{err}");
        let stored = tasks.get(&task.id).unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert!(stored.error.unwrap().contains("timeout"));
        assert_eq!(tasks.stats().running, 0);
    }

    #[tokio::test]
    async fn test_run_returns_value_and_error() {
        let tasks = manager(2);
        let value = tasks.run(async { Ok(json!({ "ok": 1 })) }, TaskOptions::default()).await;
        tokio_test::assert_ok!(&value);
        assert_eq!(value.unwrap(), json!({ "ok": 1 }));

        let failed = tasks
            .run(async { Err(anyhow::anyhow!("venue down")) }, TaskOptions::default())
            .await;
        assert!(matches!(failed, Err(TradeflowError::TaskFailed(ref e)) if e == "venue down"));
    }

    #[tokio::test]
    async fn test_panicking_task_fails() {
        let tasks = manager(1);
        let result = tasks
            .run(
                async {
                    if true {
                        panic!("boom");
                    }
                    Ok(Value::Null)
                },
                TaskOptions::default(),
            )
            .await;
        assert!(matches!(result, Err(TradeflowError::TaskFailed(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_only_pending() {
        let tasks = manager(1);
        let running = tasks.enqueue(
            async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(Value::Null)
            },
            TaskOptions::default(),
        );
        let queued = tasks.enqueue(async { Ok(json!("never")) }, TaskOptions::default());

        assert!(!tasks.cancel(&running.id));
        assert!(tasks.cancel(&queued.id));
        assert!(!tasks.cancel(&queued.id));
        assert!(matches!(tasks.wait_for(&queued.id).await, Err(TradeflowError::Cancelled)));

        tasks.wait_all().await;
        let stats = tasks.stats();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.cancelled, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_growing_window_starts_queued_work() {
        let tasks = manager(1);
        for _ in 0..3 {
            tasks.enqueue(
                async {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(Value::Null)
                },
                TaskOptions::default(),
            );
        }
        assert_eq!(tasks.stats().running, 1);

        tasks.set_max_concurrent(3);
        assert_eq!(tasks.stats().running, 3);
        assert_eq!(tasks.max_concurrent(), 3);
        tasks.wait_all().await;
    }

    #[tokio::test]
    async fn test_cleanup_evicts_finished_tasks() {
        let tasks = TaskManager::new(TaskConfig {
            max_tasks: 10,
            ..TaskConfig::default()
        });
        for i in 0..12 {
            tasks.run(async move { Ok(json!(i)) }, TaskOptions::default()).await.unwrap();
        }
        assert!(tasks.stats().total <= 10);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_run_survives_eviction_on_worker_threads() {
        let tasks = TaskManager::new(TaskConfig {
            max_concurrent: 8,
            max_tasks: 1,
            ..TaskConfig::default()
        });

        let mut handles = Vec::new();
        for worker in 0..8u64 {
            let tasks = tasks.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..250u64 {
                    let n = worker * 1_000 + i;
                    let value = tasks.run(async move { Ok(json!(n)) }, TaskOptions::default()).await?;
                    assert_eq!(value, json!(n));
                }
                Ok::<(), TradeflowError>(())
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert!(tasks.stats().total <= 8);
    }
}
