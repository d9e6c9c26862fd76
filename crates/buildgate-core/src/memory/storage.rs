use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Mutex;

use super::lock;
use crate::storage::{Build, Project, StorageService};
use crate::{Error, Result};

/// In-memory build history and blob storage.
#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    builds: Vec<Build>,
    artifacts: HashMap<String, Bytes>,
    console_logs: HashMap<String, Bytes>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_build(&self, build: Build) {
        lock(&self.inner).builds.push(build);
    }

    pub fn put_artifacts(&self, build_id: impl Into<String>, data: Bytes) {
        lock(&self.inner).artifacts.insert(build_id.into(), data);
    }

    pub fn put_console_log(&self, build_id: impl Into<String>, data: Bytes) {
        lock(&self.inner).console_logs.insert(build_id.into(), data);
    }
}

#[async_trait]
impl StorageService for MemoryStorage {
    async fn builds_by_project(
        &self,
        project: &Project,
        since: u64,
        limit: u64,
    ) -> Result<Vec<Build>> {
        let key = project.key();
        let inner = lock(&self.inner);
        let mut builds: Vec<Build> = inner
            .builds
            .iter()
            .filter(|b| b.project_key == key && b.unix_time > since)
            .cloned()
            .collect();
        builds.sort_by(|a, b| b.unix_time.cmp(&a.unix_time));
        builds.truncate(limit as usize);
        Ok(builds)
    }

    async fn artifacts(&self, build_id: &str) -> Result<Bytes> {
        lock(&self.inner)
            .artifacts
            .get(build_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("artifacts for build {}", build_id)))
    }

    async fn console_log(&self, build_id: &str) -> Result<Bytes> {
        lock(&self.inner)
            .console_logs
            .get(build_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("console log for build {}", build_id)))
    }
}
