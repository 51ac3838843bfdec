use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),

    #[error("Invalid session record: {0}")]
    InvalidRecord(String),

    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(sqlx::Error),

    #[error("Operation timed out after {millis}ms")]
    Timeout { millis: u64 },

    #[error("Encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Commit failed: {0}")]
    Commit(sqlx::Error),

    #[error("Operation cancelled")]
    Cancelled,
}

impl StoreError {
    /// Whether the bulk engine may shrink and retry the window that produced
    /// this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::Database(_) | StoreError::Timeout { .. } | StoreError::Commit(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            // A column that cannot be decoded is a data problem, not a transient one.
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                StoreError::Decode(err.to_string())
            }
            other => StoreError::Database(other),
        }
    }
}
