//! Error types for BuildGate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The backing queue or lease store could not be reached, or answered with
    /// a service-level failure.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("already locked: {0}")]
    AlreadyLocked(String),

    #[error("malformed record: {0}")]
    MalformedRecord(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("relay closed")]
    RelayClosed,
}

impl Error {
    /// Only transport failures are worth another attempt. The rest are
    /// decisions, not accidents.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transport(_))
    }

    pub fn is_already_locked(&self) -> bool {
        matches!(self, Error::AlreadyLocked(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transport_is_transient() {
        assert!(Error::Transport("timeout".to_string()).is_transient());
        assert!(!Error::AlreadyLocked("a/b/c".to_string()).is_transient());
        assert!(!Error::MalformedRecord("unixtime".to_string()).is_transient());
        assert!(!Error::RelayClosed.is_transient());
    }
}
