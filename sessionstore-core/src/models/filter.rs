use std::collections::{BTreeMap, HashMap};

use super::session::SessionRecord;

/// Columns that `list` may filter on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FilterField {
    AgentId,
    UserId,
    TeamId,
    WorkflowId,
    SessionId,
}

impl FilterField {
    pub const ALL: [FilterField; 5] = [
        FilterField::AgentId,
        FilterField::UserId,
        FilterField::TeamId,
        FilterField::WorkflowId,
        FilterField::SessionId,
    ];

    pub fn column(self) -> &'static str {
        match self {
            FilterField::AgentId => "agent_id",
            FilterField::UserId => "user_id",
            FilterField::TeamId => "team_id",
            FilterField::WorkflowId => "workflow_id",
            FilterField::SessionId => "session_id",
        }
    }

    pub fn from_column(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.column() == name)
    }

    fn value_of(self, record: &SessionRecord) -> Option<&str> {
        match self {
            FilterField::AgentId => record.agent_id.as_deref(),
            FilterField::UserId => record.user_id.as_deref(),
            FilterField::TeamId => record.team_id.as_deref(),
            FilterField::WorkflowId => record.workflow_id.as_deref(),
            FilterField::SessionId => Some(record.session_id.as_str()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    Ascending,
    #[default]
    Descending,
}

impl SortOrder {
    pub fn sql(self) -> &'static str {
        match self {
            SortOrder::Ascending => "ASC",
            SortOrder::Descending => "DESC",
        }
    }
}

/// Equality filters over the indexable owner columns, ordered by `updated_at`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilter {
    conditions: BTreeMap<FilterField, String>,
    pub order: SortOrder,
    pub limit: Option<u32>,
}

impl ListFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn by_agent(agent_id: impl Into<String>) -> Self {
        Self::new().with(FilterField::AgentId, agent_id)
    }

    pub fn by_user(user_id: impl Into<String>) -> Self {
        Self::new().with(FilterField::UserId, user_id)
    }

    /// Empty values are ignored, matching the behaviour of an absent key.
    pub fn with(mut self, field: FilterField, value: impl Into<String>) -> Self {
        let value = value.into();
        if value.is_empty() {
            self.conditions.remove(&field);
        } else {
            self.conditions.insert(field, value);
        }
        self
    }

    /// Build from loosely-typed `column -> value` pairs. Keys outside the
    /// allow-list are dropped.
    pub fn from_map(filters: &HashMap<String, String>) -> Self {
        filters.iter().fold(Self::new(), |acc, (key, value)| {
            match FilterField::from_column(key) {
                Some(field) => acc.with(field, value.clone()),
                None => {
                    tracing::debug!(key = %key, "Ignoring non-indexable list filter");
                    acc
                }
            }
        })
    }

    pub fn ascending(mut self) -> Self {
        self.order = SortOrder::Ascending;
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn conditions(&self) -> impl Iterator<Item = (FilterField, &str)> {
        self.conditions.iter().map(|(f, v)| (*f, v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn matches(&self, record: &SessionRecord) -> bool {
        self.conditions
            .iter()
            .all(|(field, value)| field.value_of(record) == Some(value.as_str()))
    }
}
