//! Scheduler
//!
//! Recurring invocation of callbacks on an interval or a cron cadence. Each
//! armed task owns one timer loop; disarming signals the loop, which exits
//! before its next tick. A run that is already executing is never cut short.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::cron::CronSchedule;
use crate::error::{Result, TradeflowError};

/// Callback invoked on every tick
pub type ScheduledFn = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Wrap an async closure as a `ScheduledFn`
pub fn job<F, Fut>(f: F) -> ScheduledFn
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move || f().boxed())
}

#[derive(Debug, Clone, Default)]
pub struct ScheduleOptions {
    pub name: Option<String>,
    /// Period in milliseconds
    pub interval: Option<u64>,
    pub cron: Option<String>,
    /// Run once as soon as the task is armed
    pub immediate: bool,
    /// Disable after the first run, whatever its outcome
    pub run_once: bool,
}

impl ScheduleOptions {
    pub fn every(ms: u64) -> Self {
        Self {
            interval: Some(ms),
            ..Self::default()
        }
    }

    pub fn cron(expr: &str) -> Self {
        Self {
            cron: Some(expr.to_string()),
            ..Self::default()
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }
}

/// Bookkeeping for one scheduled callback
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledTask {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<u64>,
    pub enabled: bool,
    pub run_once: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub run_count: u64,
    pub error_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStats {
    pub total: usize,
    pub enabled: usize,
    pub running: bool,
    pub runs: u64,
    pub errors: u64,
}

#[derive(Debug, Clone, Copy)]
enum Timing {
    Interval(Duration),
    Cron(CronSchedule),
}

impl Timing {
    fn next_run(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Timing::Interval(period) => {
                now + chrono::Duration::from_std(*period).unwrap_or_else(|_| chrono::Duration::zero())
            }
            Timing::Cron(schedule) => schedule.next_after(now),
        }
    }
}

struct Slot {
    task: ScheduledTask,
    timing: Timing,
    execute: ScheduledFn,
    /// Armed when present; dropping it stops the timer loop
    cancel: Option<watch::Sender<bool>>,
    immediate_pending: bool,
}

struct Inner {
    tasks: Mutex<HashMap<String, Slot>>,
    running: AtomicBool,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run one task and update its bookkeeping. `None` for unknown ids,
    /// otherwise whether the timer loop should keep going.
    async fn run_task(&self, id: &str, from_timer: bool) -> Option<bool> {
        let execute = {
            let tasks = self.lock();
            let slot = tasks.get(id)?;
            if from_timer && (!slot.task.enabled || slot.cancel.is_none()) {
                return Some(false);
            }
            slot.execute.clone()
        };

        let started = Utc::now();
        let outcome = AssertUnwindSafe(execute()).catch_unwind().await;

        let mut tasks = self.lock();
        let slot = tasks.get_mut(id)?;
        let task = &mut slot.task;
        task.last_run = Some(started);
        match outcome {
            Ok(Ok(())) => {
                task.run_count += 1;
                debug!(task_id = %id, name = %task.name, runs = task.run_count, "Scheduled task ran");
            }
            Ok(Err(e)) => {
                task.error_count += 1;
                task.last_error = Some(format!("{:#}", e));
                warn!(task_id = %id, name = %task.name, error = %e, "Scheduled task failed");
            }
            Err(_) => {
                task.error_count += 1;
                task.last_error = Some("task panicked".to_string());
                warn!(task_id = %id, name = %task.name, "Scheduled task panicked");
            }
        }

        if task.run_once {
            task.enabled = false;
            task.next_run = None;
            slot.cancel = None;
            info!(task_id = %id, name = %task.name, "Run-once task disabled");
            return Some(false);
        }
        task.next_run = Some(slot.timing.next_run(Utc::now()));
        Some(true)
    }
}

/// Timer-driven recurring invocation; cheap to clone
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                tasks: Mutex::new(HashMap::new()),
                running: AtomicBool::new(false),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Register a callback. Exactly one of `interval` and `cron` is required;
    /// the task is armed right away if the scheduler is running.
    pub fn schedule(&self, execute: ScheduledFn, options: ScheduleOptions) -> Result<ScheduledTask> {
        let timing = match (options.interval, options.cron.as_deref()) {
            (Some(_), Some(_)) => {
                return Err(TradeflowError::InvalidConfig(
                    "schedule takes either an interval or a cron expression, not both".to_string(),
                ))
            }
            (None, None) => {
                return Err(TradeflowError::InvalidConfig(
                    "schedule requires an interval or a cron expression".to_string(),
                ))
            }
            (Some(0), None) => {
                return Err(TradeflowError::InvalidConfig("interval must be positive".to_string()))
            }
            (Some(ms), None) => Timing::Interval(Duration::from_millis(ms)),
            (None, Some(expr)) => Timing::Cron(expr.parse()?),
        };

        let id = Uuid::new_v4().to_string();
        let task = ScheduledTask {
            name: options.name.unwrap_or_else(|| format!("task-{}", &id[..8])),
            id: id.clone(),
            cron: options.cron,
            interval: options.interval,
            enabled: true,
            run_once: options.run_once,
            last_run: None,
            next_run: Some(timing.next_run(Utc::now())),
            run_count: 0,
            error_count: 0,
            last_error: None,
        };
        debug!(task_id = %id, name = %task.name, "Scheduled task registered");

        let mut tasks = self.inner.lock();
        let slot = tasks.entry(id.clone()).or_insert(Slot {
            task: task.clone(),
            timing,
            execute,
            cancel: None,
            immediate_pending: options.immediate,
        });
        if self.is_running() {
            self.arm(&id, slot);
        }
        Ok(task)
    }

    fn arm(&self, id: &str, slot: &mut Slot) {
        let (tx, rx) = watch::channel(false);
        slot.cancel = Some(tx);
        let immediate = std::mem::take(&mut slot.immediate_pending);
        let inner = self.inner.clone();
        let id = id.to_string();
        let timing = slot.timing;
        let armed_at = Instant::now();
        let armed_wall = Utc::now();
        tokio::spawn(async move {
            ticker(inner, id, timing, immediate, armed_at, armed_wall, rx).await;
        });
    }

    /// Arm every enabled task
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut tasks = self.inner.lock();
        for (id, slot) in tasks.iter_mut() {
            if slot.task.enabled && slot.cancel.is_none() {
                self.arm(id, slot);
            }
        }
        info!(tasks = tasks.len(), "Scheduler started");
    }

    /// Disarm every task; runs in progress finish normally
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let mut tasks = self.inner.lock();
        for slot in tasks.values_mut() {
            slot.cancel = None;
        }
        info!("Scheduler stopped");
    }

    /// Run a task now, outside its cadence. False for unknown ids.
    pub async fn run_now(&self, id: &str) -> bool {
        self.inner.run_task(id, false).await.is_some()
    }

    pub fn enable(&self, id: &str) -> bool {
        let mut tasks = self.inner.lock();
        let Some(slot) = tasks.get_mut(id) else {
            return false;
        };
        slot.task.enabled = true;
        slot.task.next_run = Some(slot.timing.next_run(Utc::now()));
        if self.is_running() && slot.cancel.is_none() {
            self.arm(id, slot);
        }
        true
    }

    pub fn disable(&self, id: &str) -> bool {
        let mut tasks = self.inner.lock();
        let Some(slot) = tasks.get_mut(id) else {
            return false;
        };
        slot.task.enabled = false;
        slot.task.next_run = None;
        slot.cancel = None;
        true
    }

    pub fn remove(&self, id: &str) -> bool {
        self.inner.lock().remove(id).is_some()
    }

    pub fn get(&self, id: &str) -> Option<ScheduledTask> {
        self.inner.lock().get(id).map(|s| s.task.clone())
    }

    pub fn list(&self) -> Vec<ScheduledTask> {
        let mut tasks: Vec<ScheduledTask> = self.inner.lock().values().map(|s| s.task.clone()).collect();
        tasks.sort_by(|a, b| a.name.cmp(&b.name));
        tasks
    }

    pub fn stats(&self) -> SchedulerStats {
        let tasks = self.inner.lock();
        SchedulerStats {
            total: tasks.len(),
            enabled: tasks.values().filter(|s| s.task.enabled).count(),
            running: self.is_running(),
            runs: tasks.values().map(|s| s.task.run_count).sum(),
            errors: tasks.values().map(|s| s.task.error_count).sum(),
        }
    }
}

/// Timer loop for one armed task. Cron deadlines are computed on the wall
/// clock and mapped onto the runtime clock relative to when the task was armed.
async fn ticker(
    inner: Arc<Inner>,
    id: String,
    timing: Timing,
    immediate: bool,
    armed_at: Instant,
    armed_wall: DateTime<Utc>,
    mut cancel: watch::Receiver<bool>,
) {
    if immediate && inner.run_task(&id, true).await != Some(true) {
        return;
    }

    match timing {
        Timing::Interval(period) => {
            let mut ticks = tokio::time::interval_at(armed_at + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.changed() => break,
                    _ = ticks.tick() => {}
                }
                if inner.run_task(&id, true).await != Some(true) {
                    break;
                }
            }
        }
        Timing::Cron(schedule) => loop {
            let elapsed = chrono::Duration::from_std(armed_at.elapsed()).unwrap_or_else(|_| chrono::Duration::zero());
            let next = schedule.next_after(armed_wall + elapsed);
            let wait = (next - armed_wall).to_std().unwrap_or_default();
            tokio::select! {
                biased;
                _ = cancel.changed() => break,
                _ = tokio::time::sleep_until(armed_at + wait) => {}
            }
            if inner.run_task(&id, true).await != Some(true) {
                break;
            }
        },
    }
    debug!(task_id = %id, "Timer loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting(counter: &Arc<AtomicUsize>) -> ScheduledFn {
        let counter = counter.clone();
        job(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    fn failing() -> ScheduledFn {
        job(|| async { Err(anyhow::anyhow!("exchange unavailable")) })
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    async fn advance(ms: u64) {
        tokio::time::advance(Duration::from_millis(ms)).await;
        settle().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_counts_runs() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let task = scheduler.schedule(counting(&counter), ScheduleOptions::every(100)).unwrap();

        scheduler.start();
        settle().await;
        for _ in 0..3 {
            advance(100).await;
        }

        let task = scheduler.get(&task.id).unwrap();
        assert_eq!(task.run_count, 3);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert!(task.last_run.is_some());
        assert!(task.next_run.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cron_fires_within_step() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let task = scheduler
            .schedule(counting(&counter), ScheduleOptions::cron("*/5 * * * *"))
            .unwrap();

        scheduler.start();
        settle().await;
        advance(5 * 60 * 1000).await;

        assert!(scheduler.get(&task.id).unwrap().run_count >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_once_disables_itself_even_on_failure() {
        let scheduler = Scheduler::new();
        let options = ScheduleOptions {
            run_once: true,
            ..ScheduleOptions::every(100)
        };
        let task = scheduler.schedule(failing(), options).unwrap();

        scheduler.start();
        settle().await;
        advance(100).await;
        advance(100).await;

        let task = scheduler.get(&task.id).unwrap();
        assert!(!task.enabled);
        assert_eq!(task.error_count, 1);
        assert_eq!(task.run_count, 0);
        assert_eq!(task.last_error.as_deref(), Some("exchange unavailable"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_do_not_disable() {
        let scheduler = Scheduler::new();
        let task = scheduler.schedule(failing(), ScheduleOptions::every(50)).unwrap();

        scheduler.start();
        settle().await;
        advance(50).await;
        advance(50).await;

        let task = scheduler.get(&task.id).unwrap();
        assert!(task.enabled);
        assert_eq!(task.error_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dormant_until_started_and_stop_disarms() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler.schedule(counting(&counter), ScheduleOptions::every(100)).unwrap();

        advance(300).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        scheduler.start();
        settle().await;
        advance(100).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        scheduler.stop();
        advance(300).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(!scheduler.stats().running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_and_run_now() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let options = ScheduleOptions {
            immediate: true,
            ..ScheduleOptions::every(1000)
        };
        scheduler.start();
        let task = scheduler.schedule(counting(&counter), options).unwrap();
        settle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        assert!(scheduler.run_now(&task.id).await);
        assert_eq!(scheduler.get(&task.id).unwrap().run_count, 2);
        assert!(!scheduler.run_now("missing").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enable_disable_remove() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let task = scheduler.schedule(counting(&counter), ScheduleOptions::every(100)).unwrap();
        scheduler.start();
        settle().await;

        assert!(scheduler.disable(&task.id));
        advance(200).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        assert!(scheduler.enable(&task.id));
        settle().await;
        advance(100).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        assert!(scheduler.remove(&task.id));
        assert!(!scheduler.remove(&task.id));
        assert!(!scheduler.enable("missing"));
        assert!(!scheduler.disable("missing"));
        assert_eq!(scheduler.stats().total, 0);
    }

    #[test]
    fn test_schedule_requires_exactly_one_timing() {
        let scheduler = Scheduler::new();
        let noop = job(|| async { Ok(()) });

        assert!(matches!(
            scheduler.schedule(noop.clone(), ScheduleOptions::default()),
            Err(TradeflowError::InvalidConfig(_))
        ));
        let both = ScheduleOptions {
            interval: Some(10),
            ..ScheduleOptions::cron("@hourly")
        };
        assert!(scheduler.schedule(noop.clone(), both).is_err());
        assert!(matches!(
            scheduler.schedule(noop, ScheduleOptions::cron("0 9 * * 1")),
            Err(TradeflowError::Cron(_))
        ));
    }
}
