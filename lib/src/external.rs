//! Interface boundaries for the collaborators spec.md §1 deliberately
//! keeps out of scope: the git-hook HTTP receiver, the JWT login flow,
//! browser UI rendering, the web→server JSON pass-through, OS-specific
//! suspend/WOL plumbing, and the `.sai.json` hook-notification parser.
//!
//! These traits capture the shape a real implementation plugs into; they
//! carry no logic of their own.

use crate::model::{EventRow, TaskRow};

/// Produces `(EventRow, Vec<TaskRow>)` from whatever upstream trigger a
/// deployment wires up (a git post-receive hook, a polling webhook
/// relay, ...). The core only consumes the result via
/// `sai_taskdb::ingest::ingest_event`.
pub trait EventSource {
    type Error;

    fn next_event(&mut self) -> Result<Option<(EventRow, Vec<TaskRow>)>, Self::Error>;
}

/// Authenticates an inbound web-bridge or browser connection. The core
/// never inspects credentials itself — everywhere a connection is
/// accepted, an `AuthGate` impl decides first.
pub trait AuthGate {
    type Identity;
    type Error;

    fn authenticate(&self, bearer_token: &str) -> Result<Self::Identity, Self::Error>;
}

/// Suspends or wakes a builder host. Backed by OS/ACPI/Wake-on-LAN
/// specifics that the `power` daemon owns.
pub trait PowerControl {
    type Error;

    fn suspend(&self, builder_name: &str) -> Result<(), Self::Error>;
    fn wake(&self, builder_name: &str) -> Result<(), Self::Error>;
}
