//! Builder registry and resource lease manager (spec.md §4.C/§4.G).

pub mod builders;
pub mod error;
pub mod leases;

pub use builders::{BuilderRegistry, BuilderState, InflightEntry};
pub use error::{RegistryError, RegistryResult};
pub use leases::{LeaseOutcome, ResourceLeaseManager};
