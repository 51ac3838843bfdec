use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Opaque JSON document: object, array, string, number, bool or null.
pub type Document = serde_json::Value;

fn empty_object() -> Document {
    Document::Object(Default::default())
}

/// One persisted agent/team/workflow session.
///
/// Timestamps are `None` when the caller leaves them unset; records returned
/// by a store always carry both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default = "empty_object")]
    pub metadata: Document,
    #[serde(default = "empty_object")]
    pub state: Document,
    #[serde(default = "empty_object")]
    pub agent_data: Document,
    #[serde(default)]
    pub runs: Vec<Document>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<Document>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl SessionRecord {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            agent_id: None,
            team_id: None,
            workflow_id: None,
            user_id: None,
            name: None,
            metadata: empty_object(),
            state: empty_object(),
            agent_data: empty_object(),
            runs: Vec::new(),
            summary: None,
            created_at: None,
            updated_at: None,
        }
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_team(mut self, team_id: impl Into<String>) -> Self {
        self.team_id = Some(team_id.into());
        self
    }

    pub fn with_workflow(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_updated_at(mut self, updated_at: DateTime<Utc>) -> Self {
        self.updated_at = Some(updated_at);
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    pub fn push_run(&mut self, run: Document) {
        self.runs.push(run);
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        if self.session_id.is_empty() {
            return Err(StoreError::InvalidRecord(
                "session_id cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// True when every column except `updated_at` matches. Used to check
    /// idempotent re-upserts.
    pub fn same_content(&self, other: &SessionRecord) -> bool {
        self.session_id == other.session_id
            && self.agent_id == other.agent_id
            && self.team_id == other.team_id
            && self.workflow_id == other.workflow_id
            && self.user_id == other.user_id
            && self.name == other.name
            && self.metadata == other.metadata
            && self.state == other.state
            && self.agent_data == other.agent_data
            && self.runs == other.runs
            && self.summary == other.summary
            && self.created_at == other.created_at
    }
}
