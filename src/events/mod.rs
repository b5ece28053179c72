//! Durable session and event storage

pub mod store;
pub mod types;

pub use store::EventStore;
pub use types::{EventRecord, PendingPermission, SessionFilter, SessionRecord, SessionStatus};
