//! Build history and artifact storage abstraction.
//!
//! The coordinator itself never reads storage; the trait lives here so the
//! surrounding API code and the backends agree on one contract.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::Result;

/// A buildable project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub team: String,
    pub project: String,
}

impl Project {
    pub fn new(team: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            team: team.into(),
            project: project.into(),
        }
    }

    /// `team/project`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.team, self.project)
    }
}

/// One recorded build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Build {
    pub id: String,
    pub project_key: String,
    pub branch: String,
    /// Exit status of the build container.
    pub result: i32,
    /// Seconds.
    pub duration: u64,
    /// Build start, unix seconds.
    pub unix_time: u64,
}

/// Trait for build metadata and blob storage backends.
#[async_trait]
pub trait StorageService: Send + Sync {
    /// Builds of a project that started after `since`, newest first, at most
    /// `limit` of them.
    async fn builds_by_project(&self, project: &Project, since: u64, limit: u64)
    -> Result<Vec<Build>>;

    /// Gzipped tar of the build's artifacts.
    async fn artifacts(&self, build_id: &str) -> Result<Bytes>;

    /// Gzipped console log of the build.
    async fn console_log(&self, build_id: &str) -> Result<Bytes>;
}
