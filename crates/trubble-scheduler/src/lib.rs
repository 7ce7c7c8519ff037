//! Trubble Scheduler - Recurring job execution
//!
//! A single loop owns the job table and decides when each job fires
//! (`interval` plus a random splay). Firings run on a bounded worker pool, a
//! job never overlaps with its own previous firing, and results are handed to
//! the job's returner with optional retry.

pub mod job;
pub mod scheduler;
pub mod timing;

pub use job::{FunctionRegistry, JobFunction, ScheduleJob};
pub use scheduler::{Scheduler, SchedulerSettings, ShutdownReport};
pub use timing::{jitter, next_fire};
