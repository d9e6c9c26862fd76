//! Inbound build events.

use serde::{Deserialize, Serialize};

use crate::{Deferral, Error, Result};

/// A user or webhook request to build one or more refs of a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserBuildEvent {
    pub team: String,
    pub project: String,
    pub refs: Vec<String>,
}

impl UserBuildEvent {
    pub fn new(team: impl Into<String>, project: impl Into<String>, refs: Vec<String>) -> Self {
        Self {
            team: team.into(),
            project: project.into(),
            refs,
        }
    }

    /// `team/project`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.team, self.project)
    }

    /// Refs joined by ",", as recorded in a deferral's branch.
    pub fn branch(&self) -> String {
        self.refs.join(",")
    }

    /// Lock resource key: `team/project/<branch>`.
    pub fn hash(&self) -> String {
        format!("{}/{}", self.key(), self.branch())
    }

    /// Rebuild the event a deferral was recorded for. The deferral's branch
    /// holds the event's refs joined by ",".
    pub fn from_deferral(deferral: &Deferral) -> Result<Self> {
        let (team, project) = deferral.project_key.split_once('/').ok_or_else(|| {
            Error::InvalidInput(format!(
                "project key '{}' is not of the form team/project",
                deferral.project_key
            ))
        })?;

        let refs = deferral.branch.split(',').map(str::to_string).collect();
        Ok(Self::new(team, project, refs))
    }
}
