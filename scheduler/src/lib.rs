//! Task scheduler (spec.md §4.D).

pub mod dispatch;
pub mod tick;

pub use dispatch::{next_step, Step};
pub use tick::{Dispatched, Scheduler, SchedulerCommand};
