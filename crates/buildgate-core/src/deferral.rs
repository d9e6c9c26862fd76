//! Deferred build triggers.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::queue::{MessageAttribute, MessageAttributes, OutgoingMessage, ReceivedMessage};
use crate::{Error, Result};

pub const ATTR_PROJECT_KEY: &str = "projectkey";
pub const ATTR_BRANCH: &str = "branch";
pub const ATTR_BUILD_ID: &str = "buildid";
pub const ATTR_UNIX_TIME: &str = "unixtime";

/// A build trigger that could not proceed and waits for its resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deferral {
    /// `team/project`.
    pub project_key: String,
    pub branch: String,
    /// Caller-supplied idempotency token, also the queue dedup token.
    pub build_id: String,
    /// Creation time, seconds since the epoch.
    pub unix_time: i64,
}

impl Deferral {
    pub fn new(
        project_key: impl Into<String>,
        branch: impl Into<String>,
        build_id: impl Into<String>,
        unix_time: i64,
    ) -> Self {
        Self {
            project_key: project_key.into(),
            branch: branch.into(),
            build_id: build_id.into(),
            unix_time,
        }
    }

    /// Identity used by the adjacent dedup pass: `project_key/branch`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.project_key, self.branch)
    }

    /// Encode as a queue message, deduplicated on the build id.
    pub fn to_message(&self, delay: Option<Duration>) -> OutgoingMessage {
        let mut attributes = MessageAttributes::new();
        attributes.insert(
            ATTR_PROJECT_KEY.to_string(),
            MessageAttribute::string(&self.project_key),
        );
        attributes.insert(ATTR_BRANCH.to_string(), MessageAttribute::string(&self.branch));
        attributes.insert(
            ATTR_BUILD_ID.to_string(),
            MessageAttribute::string(&self.build_id),
        );
        attributes.insert(
            ATTR_UNIX_TIME.to_string(),
            MessageAttribute::number(self.unix_time),
        );

        OutgoingMessage {
            attributes,
            deduplication_id: Some(self.build_id.clone()),
            delay,
        }
    }

    /// Decode a received queue message.
    pub fn from_message(message: &ReceivedMessage) -> Result<Self> {
        let attr = |name: &str| {
            message
                .attributes
                .get(name)
                .map(|a| a.value.clone())
                .ok_or_else(|| {
                    Error::MalformedRecord(format!(
                        "message {} has no '{}' attribute",
                        message.message_id, name
                    ))
                })
        };

        let raw_time = attr(ATTR_UNIX_TIME)?;
        let unix_time = raw_time.trim().parse::<i64>().map_err(|e| {
            Error::MalformedRecord(format!(
                "message {}: cannot parse unix time '{}': {}",
                message.message_id, raw_time, e
            ))
        })?;

        Ok(Self {
            project_key: attr(ATTR_PROJECT_KEY)?,
            branch: attr(ATTR_BRANCH)?,
            build_id: attr(ATTR_BUILD_ID)?,
            unix_time,
        })
    }
}

/// Order deferrals oldest first, then drop any deferral whose key equals the
/// key of the deferral kept just before it.
///
/// Only neighbours collapse: `[(a,1), (b,3), (a,5)]` survives intact. The sort
/// is stable, so deferrals sharing a timestamp keep their arrival order.
pub fn sort_and_dedup(mut deferrals: Vec<Deferral>) -> Vec<Deferral> {
    deferrals.sort_by_key(|d| d.unix_time);
    deferrals.dedup_by(|current, kept| current.key() == kept.key());
    deferrals
}
