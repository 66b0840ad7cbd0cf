//! Wire types for the cache protocol and health endpoint

use cache_db::RecordStats;
use serde::{Deserialize, Serialize};

use crate::promote::PromotionStats;
use crate::retention::SweepStats;

/// Query string of `GET /cache`
#[derive(Debug, Default, Deserialize)]
pub struct FindQuery {
    /// Comma-separated restore keys, most specific first
    #[serde(default)]
    pub keys: String,
    #[serde(default)]
    pub version: String,
}

impl FindQuery {
    /// Lowercased keys in order, with empty entries dropped
    pub fn key_list(&self) -> Vec<String> {
        self.keys
            .split(',')
            .map(str::to_lowercase)
            .filter(|k| !k.is_empty())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheHitResponse {
    pub result: &'static str,
    pub archive_location: String,
    pub cache_key: String,
}

impl CacheHitResponse {
    pub fn hit(archive_location: String, cache_key: String) -> Self {
        Self {
            result: "hit",
            archive_location,
            cache_key,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReserveRequest {
    pub key: String,
    pub version: String,
    #[serde(default)]
    pub cache_size: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReserveResponse {
    pub cache_id: i64,
}

#[derive(Debug, Default, Deserialize)]
pub struct CommitRequest {
    #[serde(default)]
    pub size: Option<i64>,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub records: RecordStats,
    pub promotion: PromotionStats,
    pub retention: Option<SweepStats>,
    pub sweep_running: bool,
}
