use chrono::{DateTime, Utc};
use sqlx::types::Json;

use crate::error::StoreError;
use crate::models::{Document, SessionRecord, WindowStamp};

/// Column list shared by every SELECT/INSERT, in table order.
pub(crate) const COLUMNS: &str = "session_id, agent_id, team_id, workflow_id, user_id, name, \
     metadata, state, agent_data, runs, summary, created_at, updated_at";

/// Columns overwritten from the incoming row on conflict.
pub(crate) const MUTABLE_COLUMNS: [&str; 10] = [
    "agent_id",
    "team_id",
    "workflow_id",
    "user_id",
    "name",
    "metadata",
    "state",
    "agent_data",
    "runs",
    "summary",
];

/// `col = excluded.col, ...` for the mutable columns.
pub(crate) fn overwrite_clause() -> String {
    MUTABLE_COLUMNS
        .iter()
        .map(|c| format!("{c} = EXCLUDED.{c}"))
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct SessionRow {
    session_id: String,
    agent_id: Option<String>,
    team_id: Option<String>,
    workflow_id: Option<String>,
    user_id: Option<String>,
    name: Option<String>,
    metadata: Option<Json<Document>>,
    state: Option<Json<Document>>,
    agent_data: Option<Json<Document>>,
    runs: Option<Json<Document>>,
    summary: Option<Json<Document>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

fn object_or_empty(doc: Option<Json<Document>>) -> Document {
    doc.map(|Json(v)| v)
        .unwrap_or_else(|| Document::Object(Default::default()))
}

impl SessionRow {
    pub(crate) fn into_record(self) -> Result<SessionRecord, StoreError> {
        let runs = match self.runs.map(|Json(v)| v) {
            None | Some(Document::Null) => Vec::new(),
            Some(Document::Array(runs)) => runs,
            Some(other) => {
                return Err(StoreError::Decode(format!(
                    "runs for session {} is not an array: {}",
                    self.session_id, other
                )))
            }
        };

        Ok(SessionRecord {
            agent_id: self.agent_id,
            team_id: self.team_id,
            workflow_id: self.workflow_id,
            user_id: self.user_id,
            name: self.name,
            metadata: object_or_empty(self.metadata),
            state: object_or_empty(self.state),
            agent_data: object_or_empty(self.agent_data),
            runs,
            summary: self.summary.map(|Json(v)| v),
            created_at: Some(self.created_at),
            updated_at: Some(self.updated_at),
            session_id: self.session_id,
        })
    }
}

/// A record flattened for staging, with documents already serialized.
///
/// `ord` is the record's position in the window; merges keep the last
/// occurrence of a duplicated `session_id`.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct StagedRow {
    pub ord: i64,
    pub session_id: String,
    pub agent_id: Option<String>,
    pub team_id: Option<String>,
    pub workflow_id: Option<String>,
    pub user_id: Option<String>,
    pub name: Option<String>,
    pub metadata: String,
    pub state: String,
    pub agent_data: String,
    pub runs: String,
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StagedRow {
    pub(crate) fn encode(
        ord: usize,
        record: &SessionRecord,
        stamp: &WindowStamp,
    ) -> Result<Self, StoreError> {
        let stamps = stamp.staged(record);
        Ok(Self {
            ord: ord as i64,
            session_id: record.session_id.clone(),
            agent_id: record.agent_id.clone(),
            team_id: record.team_id.clone(),
            workflow_id: record.workflow_id.clone(),
            user_id: record.user_id.clone(),
            name: record.name.clone(),
            metadata: serde_json::to_string(&record.metadata)?,
            state: serde_json::to_string(&record.state)?,
            agent_data: serde_json::to_string(&record.agent_data)?,
            runs: serde_json::to_string(&record.runs)?,
            summary: record
                .summary
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            created_at: stamps.created_at,
            updated_at: stamps.updated_at,
        })
    }

    pub(crate) fn encode_all(
        rows: &[SessionRecord],
        stamp: &WindowStamp,
    ) -> Result<Vec<Self>, StoreError> {
        rows.iter()
            .enumerate()
            .map(|(ord, record)| Self::encode(ord, record, stamp))
            .collect()
    }
}
