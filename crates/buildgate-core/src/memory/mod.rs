//! In-memory transports.
//!
//! Deterministic stand-ins for the durable queue, the lease store and build
//! storage. Time comes from an injected [`Clock`](crate::Clock), and each fake
//! can be told to fail its next few calls with a transport error so retry
//! behaviour can be exercised.

mod lease;
mod queue;
mod storage;

pub use lease::MemoryLeaseStore;
pub use queue::MemoryQueue;
pub use storage::MemoryStorage;

use std::sync::{Mutex, MutexGuard};

/// A poisoned fake is still usable; the data is plain.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Consume one injected failure, if any are pending.
fn take_failure(pending: &mut u32, operation: &str) -> crate::Result<()> {
    if *pending > 0 {
        *pending -= 1;
        return Err(crate::Error::Transport(format!(
            "injected failure during {operation}"
        )));
    }
    Ok(())
}
