//! SOM/EOM-preserving message framer and wire schema (spec.md §4.F/§6).

pub mod buflist;
pub mod schema;

pub use buflist::{OutboundBuflist, SomEom, BACKPRESSURE_CEILING, DEFAULT_CHUNK_SIZE};
