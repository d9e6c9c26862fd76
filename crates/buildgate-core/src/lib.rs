//! Core domain types and traits for the BuildGate build coordinator.
//!
//! This crate contains:
//! - Deferral records and their ordering/dedup pass
//! - Build events and lock types
//! - Queue, lease and storage transport traits
//! - The retry/backoff helper shared by every remote call
//! - In-memory transports for tests and local runs

pub mod clock;
pub mod deferral;
pub mod error;
pub mod event;
pub mod lock;
pub mod memory;
pub mod queue;
pub mod retry;
pub mod storage;

pub use clock::{Clock, ManualClock, SystemClock};
pub use deferral::Deferral;
pub use error::{Error, Result};
pub use event::UserBuildEvent;
pub use lock::{LeaseStore, Lock, ResourceKey};
pub use retry::{Backoff, ConstantBackoff, ExponentialBackoff, NoBackoff, Retry, Retryable};
