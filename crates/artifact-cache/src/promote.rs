//! Asynchronous promotion of committed caches to the remote tier

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use nexus_client::NexusClient;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Promotion counters reported by `/health`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PromotionStats {
    pub enabled: bool,
    pub succeeded: u64,
    pub failed: u64,
}

pub struct Promoter {
    remote: Option<Arc<NexusClient>>,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

impl Promoter {
    pub fn new(remote: Option<Arc<NexusClient>>) -> Self {
        Self {
            remote,
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Upload the blob at `path` in the background. The commit that calls
    /// this never waits for or observes the outcome.
    pub fn promote(
        self: &Arc<Self>,
        key: String,
        version: String,
        path: PathBuf,
    ) -> Option<JoinHandle<()>> {
        let remote = self.remote.clone()?;
        let this = Arc::clone(self);

        Some(tokio::spawn(async move {
            match remote.put_cache(&key, &version, &path).await {
                Ok(()) => {
                    this.succeeded.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %key, version = %version, "Promoted cache to remote tier");
                }
                Err(e) => {
                    this.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(key = %key, version = %version, error = %e, "Failed to promote cache to remote tier");
                }
            }
        }))
    }

    pub fn stats(&self) -> PromotionStats {
        PromotionStats {
            enabled: self.remote.is_some(),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}
