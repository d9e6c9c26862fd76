use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use super::{lock, take_failure};
use crate::{LeaseStore, Lock, ResourceKey, Result};

/// In-memory lease store. Each call holds the map lock for its whole
/// read-modify-write, which is what makes create and swap atomic.
#[derive(Default)]
pub struct MemoryLeaseStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    locks: HashMap<ResourceKey, Lock>,
    failures: u32,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` calls fail with a transport error.
    pub fn fail_next(&self, n: u32) {
        lock(&self.inner).failures = n;
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn create_if_absent(&self, key: &ResourceKey, created: i64) -> Result<bool> {
        let mut inner = lock(&self.inner);
        take_failure(&mut inner.failures, "create_if_absent")?;
        if inner.locks.contains_key(key) {
            return Ok(false);
        }
        inner.locks.insert(
            key.clone(),
            Lock {
                resource_key: key.clone(),
                created,
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &ResourceKey) -> Result<Option<Lock>> {
        let mut inner = lock(&self.inner);
        take_failure(&mut inner.failures, "get")?;
        Ok(inner.locks.get(key).cloned())
    }

    async fn replace_if(
        &self,
        key: &ResourceKey,
        expected_created: i64,
        created: i64,
    ) -> Result<bool> {
        let mut inner = lock(&self.inner);
        take_failure(&mut inner.failures, "replace_if")?;
        match inner.locks.get_mut(key) {
            Some(existing) if existing.created == expected_created => {
                existing.created = created;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, key: &ResourceKey) -> Result<()> {
        let mut inner = lock(&self.inner);
        take_failure(&mut inner.failures, "delete")?;
        inner.locks.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_if_absent_once() {
        let store = MemoryLeaseStore::new();
        let key = ResourceKey::new("team/lib/master");
        assert!(store.create_if_absent(&key, 10).await.unwrap());
        assert!(!store.create_if_absent(&key, 20).await.unwrap());
        assert_eq!(store.get(&key).await.unwrap().unwrap().created, 10);
    }

    #[tokio::test]
    async fn test_replace_if_compares_created() {
        let store = MemoryLeaseStore::new();
        let key = ResourceKey::new("team/lib/master");
        store.create_if_absent(&key, 10).await.unwrap();

        assert!(!store.replace_if(&key, 9, 50).await.unwrap());
        assert!(store.replace_if(&key, 10, 50).await.unwrap());
        assert!(!store.replace_if(&key, 10, 60).await.unwrap());
        assert_eq!(store.get(&key).await.unwrap().unwrap().created, 50);
    }

    #[tokio::test]
    async fn test_replace_missing_lock_fails() {
        let store = MemoryLeaseStore::new();
        let key = ResourceKey::new("team/lib/master");
        assert!(!store.replace_if(&key, 0, 1).await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = MemoryLeaseStore::new();
        let key = ResourceKey::new("team/lib/master");
        store.create_if_absent(&key, 10).await.unwrap();
        store.delete(&key).await.unwrap();
        store.delete(&key).await.unwrap();
        assert!(store.get(&key).await.unwrap().is_none());
    }
}
