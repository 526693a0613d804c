use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

pub type Guid = String;

static NEXT_INTERNAL_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    #[default]
    Active,
    Deleted,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Active => "ACTIVE",
            Status::Deleted => "DELETED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ACTIVE" => Some(Status::Active),
            "DELETED" => Some(Status::Deleted),
            _ => None,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn generate_guid() -> Guid {
    Uuid::new_v4().to_string()
}

/// Temporary guid for entities that have not been persisted yet. Always negative.
pub fn next_internal_guid() -> Guid {
    format!("-{}", NEXT_INTERNAL_ID.fetch_add(1, Ordering::Relaxed))
}

/// Guids starting with '-' are placeholders assigned by the caller, not by the repository
pub fn is_assigned_guid(guid: &str) -> bool {
    !guid.is_empty() && !guid.starts_with('-')
}

pub fn to_epoch_millis(time: &DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

pub fn from_epoch_millis(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}
