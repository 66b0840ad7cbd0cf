//! Reservation, chunk upload and commit

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::header::CONTENT_RANGE;
use axum::http::HeaderMap;
use axum::response::Json;
use cache_db::{caches as db, CacheRecord, NewCacheParams};
use serde_json::{json, Value};
use tracing::{info, warn};

use super::{load_pending, now, parse_id};
use crate::error::AppError;
use crate::state::AppState;
use crate::types::{CommitRequest, ReserveRequest, ReserveResponse};

pub async fn reserve(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<ReserveResponse>, AppError> {
    let request: ReserveRequest = serde_json::from_slice(&body)
        .map_err(|e| AppError::BadRequest(format!("invalid reserve request: {}", e)))?;

    let record = db::insert(
        &state.pool,
        &NewCacheParams {
            key: request.key.to_lowercase(),
            version: request.version,
            size: request.cache_size.filter(|size| *size > 0),
            now: now(),
        },
    )
    .await?;

    info!(id = record.id, key = %record.key, version = %record.version, "Reserved cache");
    Ok(Json(ReserveResponse {
        cache_id: record.id,
    }))
}

pub async fn upload(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    let id = parse_id(&id)?;
    let record = load_pending(&state, id).await?;

    let range = headers
        .get(CONTENT_RANGE)
        .ok_or_else(|| AppError::BadRequest("missing Content-Range header".to_string()))?
        .to_str()
        .map_err(|_| AppError::BadRequest("invalid Content-Range header".to_string()))?;
    let (start, end) = parse_content_range(range)?;

    let expected = (end - start).saturating_add(1);
    if body.len() as u64 != expected {
        return Err(AppError::BadRequest(format!(
            "Content-Range covers {} bytes but body has {}",
            expected,
            body.len()
        )));
    }

    state.blobs.write(record.id, start, &body).await?;
    db::touch(&state.pool, record.id, now()).await?;
    Ok(Json(json!({})))
}

pub async fn commit(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    let id = parse_id(&id)?;
    let request: CommitRequest = if body.is_empty() {
        CommitRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| AppError::BadRequest(format!("invalid commit request: {}", e)))?
    };

    let record = load_pending(&state, id).await?;
    let declared = request
        .size
        .or(record.size)
        .and_then(|size| u64::try_from(size).ok());

    let size = complete_upload(&state, &record, declared).await?;

    info!(id, key = %record.key, version = %record.version, size, "Committed cache");
    state
        .promoter
        .promote(record.key, record.version, state.blobs.path(id));
    Ok(Json(json!({})))
}

/// Assemble the blob of a pending record and mark the record complete,
/// returning the stored size.
pub(crate) async fn complete_upload(
    state: &AppState,
    record: &CacheRecord,
    declared: Option<u64>,
) -> Result<i64, AppError> {
    let id = record.id;
    let size = state.blobs.finalize(id, declared).await?;
    let size = i64::try_from(size)
        .map_err(|_| AppError::Internal(format!("cache {}: size {} out of range", id, size)))?;

    if db::mark_complete(&state.pool, id, size).await? {
        return Ok(size);
    }

    // Lost a race with another commit, or the record was swept meanwhile
    match db::get(&state.pool, id).await? {
        Some(current) => Err(AppError::AlreadyComplete {
            id,
            key: current.key,
        }),
        None => {
            if let Err(e) = state.blobs.remove(id).await {
                warn!(id, error = %e, "Failed to remove blob of swept reservation");
            }
            Err(AppError::NotReserved(id))
        }
    }
}

/// Accepted for protocol compatibility; retention handles eviction
pub async fn clean() -> Json<Value> {
    Json(json!({}))
}

/// Parse `bytes <start>-<end>/<total>` into an inclusive byte range.
/// The total is ignored and may be `*`.
pub(crate) fn parse_content_range(value: &str) -> Result<(u64, u64), AppError> {
    let invalid = || AppError::BadRequest(format!("invalid Content-Range: {:?}", value));

    let trimmed = value.trim();
    let trimmed = trimmed.strip_prefix("bytes ").unwrap_or(trimmed);
    let range = trimmed.split_once('/').map_or(trimmed, |(range, _)| range);
    let (start, end) = range.split_once('-').ok_or_else(invalid)?;

    let start: u64 = start.trim().parse().map_err(|_| invalid())?;
    let end: u64 = end.trim().parse().map_err(|_| invalid())?;
    if end < start {
        return Err(invalid());
    }
    Ok((start, end))
}
