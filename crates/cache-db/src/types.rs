use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Cache record row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct CacheRecord {
    pub id: i64,
    /// Lowercased cache key
    #[sqlx(rename = "cache_key")]
    pub key: String,
    pub version: String,
    /// Declared size until committed, then the stored byte count
    pub size: Option<i64>,
    pub complete: bool,
    /// Unix seconds
    pub created_at: i64,
    /// Unix seconds, refreshed on upload and download
    pub used_at: i64,
}

/// Parameters for reserving a new cache record
#[derive(Debug, Clone)]
pub struct NewCacheParams {
    pub key: String,
    pub version: String,
    pub size: Option<i64>,
    pub now: i64,
}

/// Complete records sharing a (key, version) pair, oldest first
#[derive(Debug, Clone)]
pub struct CacheGroup {
    pub key: String,
    pub version: String,
    pub records: Vec<CacheRecord>,
}

/// Aggregate record counts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordStats {
    pub complete: i64,
    pub incomplete: i64,
    pub total_size: i64,
}

/// Condition under which retention may delete a record. Cutoffs are unix
/// seconds; a record qualifies when its timestamp is strictly before them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eviction {
    /// Reservation never committed and idle since the cutoff
    Incomplete { used_before: i64 },
    /// Any record idle since the cutoff
    Unused { used_before: i64 },
    /// Any record created before the cutoff
    Expired { created_before: i64 },
    /// Complete record with a newer complete sibling of the same key and
    /// version, idle since the cutoff
    Superseded { used_before: i64 },
}

impl Eviction {
    /// Policy name used in logs
    pub fn policy(&self) -> &'static str {
        match self {
            Eviction::Incomplete { .. } => "incomplete",
            Eviction::Unused { .. } => "unused",
            Eviction::Expired { .. } => "expired",
            Eviction::Superseded { .. } => "duplicate",
        }
    }
}
