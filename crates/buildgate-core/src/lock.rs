//! Distributed lock types and the lease store abstraction.

use async_trait::async_trait;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{Result, UserBuildEvent};

/// Name of a lockable resource, conventionally `team/project/branch`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct ResourceKey(String);

impl ResourceKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&UserBuildEvent> for ResourceKey {
    fn from(event: &UserBuildEvent) -> Self {
        Self(event.hash())
    }
}

impl AsRef<str> for ResourceKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// An exclusive claim on a resource. Anyone may take it over once it is
/// older than the lock TTL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    pub resource_key: ResourceKey,
    /// Unix seconds.
    pub created: i64,
}

impl Lock {
    pub fn expires(&self, ttl: Duration) -> i64 {
        self.created.saturating_add(ttl.as_secs() as i64)
    }

    pub fn is_expired(&self, now: i64, ttl: Duration) -> bool {
        now >= self.expires(ttl)
    }
}

/// Trait for lease store backends. Every write must be atomic at the store.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Create the lock unless one exists. Returns whether it was created.
    async fn create_if_absent(&self, key: &ResourceKey, created: i64) -> Result<bool>;

    /// Current lock for the key, if any.
    async fn get(&self, key: &ResourceKey) -> Result<Option<Lock>>;

    /// Replace the lock only if its `created` still equals `expected_created`.
    /// Returns whether the swap happened.
    async fn replace_if(
        &self,
        key: &ResourceKey,
        expected_created: i64,
        created: i64,
    ) -> Result<bool>;

    /// Remove the lock. Removing a missing lock succeeds.
    async fn delete(&self, key: &ResourceKey) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_expiry_boundary() {
        let lock = Lock {
            resource_key: ResourceKey::new("team/lib/master"),
            created: 1_000,
        };
        let ttl = Duration::from_secs(60);
        assert_eq!(lock.expires(ttl), 1_060);
        assert!(!lock.is_expired(1_059, ttl));
        assert!(lock.is_expired(1_060, ttl));
    }

    #[test]
    fn test_resource_key_from_event() {
        let event = UserBuildEvent::new("team", "lib", vec!["master".to_string()]);
        let key = ResourceKey::from(&event);
        assert_eq!(key.to_string(), "team/lib/master");
    }
}
