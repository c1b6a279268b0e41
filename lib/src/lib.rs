//! Shared types for the Sai continuous-integration core: the data model
//! (§3), platform matching, id/nonce helpers, and the config file shape
//! loaded by both the server and builder daemons.

pub mod config;
pub mod external;
pub mod ids;
pub mod model;
pub mod platform;

pub use ids::{gen_event_uuid, gen_nonce, task_uuid_to_event_uuid, validate_event_uuid, validate_task_uuid};
pub use model::{
    ArtifactRow, BuildMetricRow, BuilderRegistration, EventState, EventUuid, LogChannel, LogRow,
    SaiState, TaskRow, TaskUuid,
};
pub use platform::Platform;
