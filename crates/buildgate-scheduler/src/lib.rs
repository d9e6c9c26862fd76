//! Build coordination for BuildGate.
//!
//! Per-branch build locks with lease preemption, a durable deferral queue
//! for builds that find their branch busy, and the periodic resubmission
//! that feeds parked builds back to a dispatcher over a bounded relay.

pub mod coordinator;
pub mod deferral;
pub mod driver;
pub mod gate;
pub mod lock;
pub mod relay;

pub use coordinator::Coordinator;
pub use deferral::{DeferralService, QueueDeferralService};
pub use driver::ResubmitDriver;
pub use gate::{Admission, BuildGate, BuildLauncher};
pub use lock::{DistributedLockService, LeaseLockService};
pub use relay::{Dispatcher, RelayConsumer};
