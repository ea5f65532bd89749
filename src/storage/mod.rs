//! Storage traits and the in-memory reference backends.
//!
//! The audit store and entity sink are external collaborators; the core only
//! depends on the traits defined here.

mod memory;
mod traits;

pub use memory::{InMemoryAuditStore, InMemoryEntitySink};
pub use traits::{AuditStore, EntitySink, StorageError};
