//! Lookup and download

use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use cache_db::caches as db;
use tracing::{debug, warn};

use super::{now, parse_id};
use crate::error::AppError;
use crate::server::URL_BASE;
use crate::state::AppState;
use crate::types::{CacheHitResponse, FindQuery};

/// Resolve a restore-key list, remote tier first
pub async fn find(
    State(state): State<AppState>,
    Query(query): Query<FindQuery>,
) -> Result<Response, AppError> {
    let keys = query.key_list();
    if keys.is_empty() {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }

    if let Some(remote) = &state.remote {
        match remote.find_cache(&keys, &query.version).await {
            Ok(Some(hit)) => {
                return Ok(
                    Json(CacheHitResponse::hit(hit.archive_location, hit.cache_key))
                        .into_response(),
                );
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Remote cache lookup failed, using local tier"),
        }
    }

    let Some(record) = db::find_by_keys(&state.pool, &keys, &query.version).await? else {
        debug!(keys = ?keys, version = %query.version, "Cache miss");
        return Ok(StatusCode::NO_CONTENT.into_response());
    };

    if !state.blobs.exists(record.id).await? {
        warn!(id = record.id, key = %record.key, "Cache record has no blob, deleting");
        if let Err(e) = db::delete(&state.pool, record.id).await {
            warn!(id = record.id, error = %e, "Failed to delete orphaned cache record");
        }
        return Ok(StatusCode::NO_CONTENT.into_response());
    }

    let archive_location = format!(
        "{}{}/artifacts/{}",
        state.external_url, URL_BASE, record.id
    );
    debug!(id = record.id, key = %record.key, "Cache hit");
    Ok(Json(CacheHitResponse::hit(archive_location, record.key)).into_response())
}

/// Stream a committed blob, honouring range requests
pub async fn fetch(
    State(state): State<AppState>,
    Path(id): Path<String>,
    request: Request,
) -> Result<Response, AppError> {
    let id = parse_id(&id)?;
    if let Err(e) = db::touch(&state.pool, id, now()).await {
        warn!(id, error = %e, "Failed to refresh cache usage");
    }
    Ok(state.blobs.serve(id, request).await)
}
