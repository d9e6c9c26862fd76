//! Build locks on PostgreSQL.
//!
//! Each operation is a single statement, so atomicity comes from the row
//! lock PostgreSQL takes on `build_locks.resource_key`.

use async_trait::async_trait;
use buildgate_core::{LeaseStore, Lock, ResourceKey};
use sqlx::PgPool;

use crate::DbResult;

#[derive(Debug, sqlx::FromRow)]
struct LockRow {
    resource_key: String,
    created: i64,
}

/// PostgreSQL implementation of LeaseStore.
pub struct PgLeaseStore {
    pool: PgPool,
}

impl PgLeaseStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert(&self, key: &ResourceKey, created: i64) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO build_locks (resource_key, created)
            VALUES ($1, $2)
            ON CONFLICT (resource_key) DO NOTHING
            "#,
        )
        .bind(key.as_str())
        .bind(created)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn fetch(&self, key: &ResourceKey) -> DbResult<Option<Lock>> {
        let row = sqlx::query_as::<_, LockRow>(
            "SELECT resource_key, created FROM build_locks WHERE resource_key = $1",
        )
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| Lock {
            resource_key: ResourceKey::new(r.resource_key),
            created: r.created,
        }))
    }

    async fn swap(&self, key: &ResourceKey, expected_created: i64, created: i64) -> DbResult<bool> {
        let result = sqlx::query(
            "UPDATE build_locks SET created = $3 WHERE resource_key = $1 AND created = $2",
        )
        .bind(key.as_str())
        .bind(expected_created)
        .bind(created)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn remove(&self, key: &ResourceKey) -> DbResult<()> {
        sqlx::query("DELETE FROM build_locks WHERE resource_key = $1")
            .bind(key.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl LeaseStore for PgLeaseStore {
    async fn create_if_absent(
        &self,
        key: &ResourceKey,
        created: i64,
    ) -> buildgate_core::Result<bool> {
        Ok(self.insert(key, created).await?)
    }

    async fn get(&self, key: &ResourceKey) -> buildgate_core::Result<Option<Lock>> {
        Ok(self.fetch(key).await?)
    }

    async fn replace_if(
        &self,
        key: &ResourceKey,
        expected_created: i64,
        created: i64,
    ) -> buildgate_core::Result<bool> {
        Ok(self.swap(key, expected_created, created).await?)
    }

    async fn delete(&self, key: &ResourceKey) -> buildgate_core::Result<()> {
        Ok(self.remove(key).await?)
    }
}
