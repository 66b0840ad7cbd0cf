//! Artifact cache server
//!
//! Implements the CI artifact cache protocol: clients reserve an entry,
//! upload it in ranged chunks, commit it, and later resolve restore keys to
//! a download URL. Committed entries are optionally promoted to a Nexus
//! raw repository, which is also consulted first on lookup.

mod config;
mod error;
mod promote;
mod retention;
mod routes;
mod server;
mod state;
mod types;

use std::sync::Arc;

use blob_store::BlobStore;
use nexus_client::NexusClient;
use tokio::fs;
use tracing::info;
use tracing_subscriber::{prelude::*, EnvFilter};

use crate::config::Config;
use crate::error::Result;
use crate::retention::RetentionPolicy;
use crate::server::start_server;
use crate::state::AppState;

/// Metadata database file inside the cache directory
const DB_FILE: &str = "caches.db";

/// Blob directory inside the cache directory
const BLOB_DIR: &str = "cache";

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = EnvFilter::from_default_env().add_directive("artifact_cache=info".parse()?);

    // Use JSON format for GCP Cloud Logging when LOG_FORMAT=json
    if std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false)
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    };

    let config = Config::from_env();
    info!(
        port = config.port,
        cache_dir = ?config.cache_dir,
        external_url = %config.external_url,
        remote = config.nexus.is_some(),
        "Starting artifact cache"
    );

    fs::create_dir_all(&config.cache_dir).await?;

    let pool = cache_db::connect(&config.cache_dir.join(DB_FILE)).await?;
    cache_db::migrate(&pool).await?;
    info!("Database migrations complete");

    let blobs = Arc::new(BlobStore::new(config.cache_dir.join(BLOB_DIR)));
    blobs.init().await?;

    let remote = match &config.nexus {
        Some(nexus) => {
            let client =
                NexusClient::with_timeout(&nexus.store_endpoint, nexus.credentials(), nexus.timeout)?;
            info!(
                endpoint = %client.location().endpoint,
                repository = %client.location().repository,
                "Remote tier enabled"
            );
            Some(Arc::new(client))
        }
        None => {
            info!("NEXUS_STORE_ENDPOINT not set, remote tier disabled");
            None
        }
    };

    let state = AppState::new(
        pool,
        blobs,
        remote,
        config.external_url.clone(),
        RetentionPolicy::default(),
    );

    // Sweep once at startup instead of waiting for the first request
    state.retention.trigger();

    start_server(state, config.port, config.max_body_size).await?;
    Ok(())
}
