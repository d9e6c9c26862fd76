//! Build history and blobs on PostgreSQL.

use async_trait::async_trait;
use buildgate_core::Retry;
use buildgate_core::storage::{Build, Project, StorageService};
use bytes::Bytes;
use sqlx::PgPool;
use tracing::warn;

use crate::{DbError, DbResult};

/// Kind of blob stored per build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobKind {
    Artifacts,
    Console,
}

impl BlobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlobKind::Artifacts => "artifacts",
            BlobKind::Console => "console",
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct BuildRow {
    id: String,
    project_key: String,
    branch: String,
    result: i32,
    duration: i64,
    build_start_time: i64,
}

impl From<BuildRow> for Build {
    fn from(row: BuildRow) -> Self {
        Build {
            id: row.id,
            project_key: row.project_key,
            branch: row.branch,
            result: row.result,
            duration: row.duration.max(0) as u64,
            unix_time: row.build_start_time.max(0) as u64,
        }
    }
}

/// PostgreSQL implementation of StorageService. Reads are retried.
pub struct PgStorageService {
    pool: PgPool,
    retry: Retry,
}

impl PgStorageService {
    pub fn new(pool: PgPool, retry: Retry) -> Self {
        Self { pool, retry }
    }

    /// Record a finished build.
    pub async fn record_build(&self, build: &Build) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO builds (id, project_key, branch, result, duration, build_start_time)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE
                SET result = EXCLUDED.result, duration = EXCLUDED.duration
            "#,
        )
        .bind(&build.id)
        .bind(&build.project_key)
        .bind(&build.branch)
        .bind(build.result)
        .bind(to_i64(build.duration, "duration")?)
        .bind(to_i64(build.unix_time, "unix time")?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Store a blob for a build, replacing any previous one of the same kind.
    pub async fn put_blob(&self, build_id: &str, kind: BlobKind, data: &[u8]) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO build_blobs (build_id, kind, data)
            VALUES ($1, $2, $3)
            ON CONFLICT (build_id, kind) DO UPDATE SET data = EXCLUDED.data
            "#,
        )
        .bind(build_id)
        .bind(kind.as_str())
        .bind(data)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn query_builds(
        &self,
        project: &Project,
        since: u64,
        limit: u64,
    ) -> DbResult<Vec<Build>> {
        let rows = sqlx::query_as::<_, BuildRow>(
            r#"
            SELECT id, project_key, branch, result, duration, build_start_time
            FROM builds
            WHERE project_key = $1 AND build_start_time > $2
            ORDER BY build_start_time DESC
            LIMIT $3
            "#,
        )
        .bind(project.key())
        .bind(to_i64(since, "since")?)
        .bind(to_i64(limit, "limit")?)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Build::from).collect())
    }

    async fn blob(&self, build_id: &str, kind: BlobKind) -> DbResult<Bytes> {
        let data: Option<Vec<u8>> =
            sqlx::query_scalar("SELECT data FROM build_blobs WHERE build_id = $1 AND kind = $2")
                .bind(build_id)
                .bind(kind.as_str())
                .fetch_optional(&self.pool)
                .await?;
        data.map(Bytes::from).ok_or_else(|| {
            DbError::NotFound(format!("{} for build {}", kind.as_str(), build_id))
        })
    }

    async fn blob_with_retry(
        &self,
        build_id: &str,
        kind: BlobKind,
    ) -> buildgate_core::Result<Bytes> {
        self.retry
            .run(|| async move {
                Ok::<_, buildgate_core::Error>(self.blob(build_id, kind).await?)
            })
            .await
            .inspect_err(|e| {
                warn!(build_id = %build_id, kind = kind.as_str(), error = %e, "Failed to read blob")
            })
    }
}

fn to_i64(value: u64, field: &str) -> DbResult<i64> {
    i64::try_from(value)
        .map_err(|_| DbError::InvalidInput(format!("{} {} is too large", field, value)))
}

#[async_trait]
impl StorageService for PgStorageService {
    async fn builds_by_project(
        &self,
        project: &Project,
        since: u64,
        limit: u64,
    ) -> buildgate_core::Result<Vec<Build>> {
        self.retry
            .run(|| async move {
                Ok::<_, buildgate_core::Error>(self.query_builds(project, since, limit).await?)
            })
            .await
    }

    async fn artifacts(&self, build_id: &str) -> buildgate_core::Result<Bytes> {
        self.blob_with_retry(build_id, BlobKind::Artifacts).await
    }

    async fn console_log(&self, build_id: &str) -> buildgate_core::Result<Bytes> {
        self.blob_with_retry(build_id, BlobKind::Console).await
    }
}
