//! Timestamp rules shared by every backend.
//!
//! - First insert: `created_at` and `updated_at` are the caller's values, or
//!   the write time when unset.
//! - Update: `created_at` is never touched. `updated_at` becomes the write
//!   time, or in preserve mode the caller's value (falling back to the stored
//!   `created_at` when the caller left it unset).
//! - Bulk staging: in preserve mode the staged `updated_at` is the caller's
//!   value (or the write time); otherwise it is always the write time.
//!
//! SQL backends express the same rules in their upsert statements; the
//! in-memory backend calls these functions directly.

use chrono::{DateTime, Utc};

use super::session::SessionRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stamps {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Write-time context for one window of a bulk upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowStamp {
    pub write_time: DateTime<Utc>,
    pub preserve_updated_at: bool,
}

impl WindowStamp {
    pub fn now(preserve_updated_at: bool) -> Self {
        Self {
            write_time: Utc::now(),
            preserve_updated_at,
        }
    }

    pub fn staged(&self, record: &SessionRecord) -> Stamps {
        Stamps {
            created_at: record.created_at.unwrap_or(self.write_time),
            updated_at: if self.preserve_updated_at {
                record.updated_at.unwrap_or(self.write_time)
            } else {
                self.write_time
            },
        }
    }
}

pub fn insert_stamps(record: &SessionRecord, now: DateTime<Utc>) -> Stamps {
    Stamps {
        created_at: record.created_at.unwrap_or(now),
        updated_at: record.updated_at.unwrap_or(now),
    }
}

pub fn update_stamps(
    existing_created_at: DateTime<Utc>,
    record: &SessionRecord,
    preserve_updated_at: bool,
    now: DateTime<Utc>,
) -> Stamps {
    let updated_at = if preserve_updated_at {
        record.updated_at.unwrap_or(existing_created_at)
    } else {
        now
    };
    Stamps {
        created_at: existing_created_at,
        updated_at,
    }
}

/// `updated_at` for a bulk merge that hits an existing row.
pub fn merged_update_stamps(existing_created_at: DateTime<Utc>, staged: Stamps) -> Stamps {
    Stamps {
        created_at: existing_created_at,
        updated_at: staged.updated_at,
    }
}
