//! Task and event persistence (spec.md §3/§4.A/§4.B): a global events
//! database plus one SQLite database per event, pooled with refcounted
//! open handles.

pub mod artifacts;
pub mod error;
pub mod global;
pub mod logs;
pub mod metrics;
pub mod pool;
pub mod schema;
pub mod store;
pub mod tasks;

pub use error::{TaskDbError, TaskDbResult};
pub use global::GlobalDb;
pub use logs::LogBuffer;
pub use pool::{EventDbHandle, EventDbPool};
pub use store::{derive_event_state, TaskStore};
pub use tasks::{NewTask, TaskUpdate};
