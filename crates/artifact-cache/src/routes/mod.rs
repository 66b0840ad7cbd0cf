pub mod artifacts;
pub mod caches;

use cache_db::{caches as db, CacheRecord};
use chrono::Utc;

use crate::error::AppError;
use crate::state::AppState;

pub(crate) fn now() -> i64 {
    Utc::now().timestamp()
}

/// Parse a cache id path segment
pub(crate) fn parse_id(raw: &str) -> Result<i64, AppError> {
    raw.parse()
        .map_err(|_| AppError::BadRequest(format!("invalid cache id: {:?}", raw)))
}

/// Load a reservation that can still accept chunks or a commit
pub(crate) async fn load_pending(state: &AppState, id: i64) -> Result<CacheRecord, AppError> {
    match db::get(&state.pool, id).await? {
        None => Err(AppError::NotReserved(id)),
        Some(record) if record.complete => Err(AppError::AlreadyComplete {
            id,
            key: record.key,
        }),
        Some(record) => Ok(record),
    }
}
