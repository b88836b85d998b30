use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Cached snapshot of one table (or one owner's slice of it).
///
/// Records are held as JSON values so one store can carry every table's
/// record shape; they are decoded into the table's record type on a hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub data: Vec<Value>,
    pub last_updated: DateTime<Utc>,
    pub is_stale: bool,
}

/// Freshness classification of a key, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Missing,
    Fresh,
    /// Past the refresh threshold but still within `max_age`; served as a hit.
    Aging,
    Stale,
    Expired,
}

impl EntryStatus {
    pub fn label(&self) -> &'static str {
        match self {
            EntryStatus::Missing => "missing",
            EntryStatus::Fresh => "fresh",
            EntryStatus::Aging => "aging",
            EntryStatus::Stale => "stale",
            EntryStatus::Expired => "expired",
        }
    }

    pub fn needs_reload(&self) -> bool {
        matches!(
            self,
            EntryStatus::Missing | EntryStatus::Stale | EntryStatus::Expired
        )
    }
}

impl CacheEntry {
    pub fn new(data: Vec<Value>, now: DateTime<Utc>) -> Self {
        Self {
            data,
            last_updated: now,
            is_stale: false,
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.last_updated
    }

    /// A hit requires `!is_stale` and an age strictly below `max_age`.
    pub fn is_servable(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        !self.is_stale && self.age(now) < max_age
    }

    pub fn status(&self, now: DateTime<Utc>, max_age: Duration, refresh: Duration) -> EntryStatus {
        if self.is_stale {
            EntryStatus::Stale
        } else if self.age(now) >= max_age {
            EntryStatus::Expired
        } else if self.age(now) >= refresh {
            EntryStatus::Aging
        } else {
            EntryStatus::Fresh
        }
    }

    pub fn age_display(&self, now: DateTime<Utc>) -> String {
        let minutes = self.age(now).num_minutes();
        if minutes < 1 {
            // Also covers clock skew (negative ages)
            "just now".to_string()
        } else if minutes < 60 {
            format!("{}m ago", minutes)
        } else if minutes < 1440 {
            let hours = minutes / 60;
            if minutes % 60 >= 30 {
                format!("{}h ago", hours + 1)
            } else {
                format!("{}h ago", hours)
            }
        } else {
            let days = minutes / 1440;
            if (minutes % 1440) / 60 >= 12 {
                format!("{}d ago", days + 1)
            } else {
                format!("{}d ago", days)
            }
        }
    }
}
