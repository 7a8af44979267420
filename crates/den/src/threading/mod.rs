//! Background execution primitives.

pub mod scheduled_task;
pub mod worker;

pub use scheduled_task::{ScheduledTask, TaskCallback, TaskRunArgs, TaskState};
pub use worker::{WorkerControl, WorkerThread};
