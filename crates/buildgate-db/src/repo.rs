//! Backend implementations.

pub mod lease;
pub mod queue;
pub mod storage;

pub use lease::PgLeaseStore;
pub use queue::PgQueueTransport;
pub use storage::{BlobKind, PgStorageService};
