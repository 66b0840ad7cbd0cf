use std::sync::Arc;

use blob_store::BlobStore;
use cache_db::SqlitePool;
use chrono::{DateTime, Utc};
use nexus_client::NexusClient;

use crate::promote::Promoter;
use crate::retention::{Retention, RetentionPolicy};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub blobs: Arc<BlobStore>,
    /// Remote tier, when configured
    pub remote: Option<Arc<NexusClient>>,
    pub promoter: Arc<Promoter>,
    pub retention: Arc<Retention>,
    /// Base URL for archive locations, without trailing slash
    pub external_url: String,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        pool: SqlitePool,
        blobs: Arc<BlobStore>,
        remote: Option<Arc<NexusClient>>,
        external_url: String,
        policy: RetentionPolicy,
    ) -> Self {
        Self {
            retention: Arc::new(Retention::new(pool.clone(), blobs.clone(), policy)),
            promoter: Arc::new(Promoter::new(remote.clone())),
            pool,
            blobs,
            remote,
            external_url,
            started_at: Utc::now(),
        }
    }
}
