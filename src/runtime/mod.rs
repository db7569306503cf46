//! Runtime: cron parsing, the scheduler, the task manager and the engine
//! that drives active orders with them.

pub mod cron;
mod engine;
pub mod scheduler;
pub mod task_manager;

pub use cron::CronSchedule;
pub use engine::{OrchestratorContext, RuntimeEngine, RuntimeStats};
pub use scheduler::{job, ScheduleOptions, ScheduledFn, ScheduledTask, Scheduler, SchedulerStats};
pub use task_manager::{Task, TaskManager, TaskOptions, TaskStats, TaskStatus};
