use crate::types::{CacheGroup, CacheRecord, Eviction, NewCacheParams, RecordStats};
use regex::Regex;
use sqlx::SqlitePool;
use tracing::debug;

const COLUMNS: &str = "id, cache_key, version, size, complete, created_at, used_at";

/// Get a record by id
pub async fn get(pool: &SqlitePool, id: i64) -> Result<Option<CacheRecord>, sqlx::Error> {
    sqlx::query_as::<_, CacheRecord>(&format!("SELECT {COLUMNS} FROM caches WHERE id = ?"))
        .bind(id)
        .fetch_optional(pool)
        .await
}

/// Reserve a new, incomplete record and return it with its assigned id
pub async fn insert(pool: &SqlitePool, p: &NewCacheParams) -> Result<CacheRecord, sqlx::Error> {
    sqlx::query_as::<_, CacheRecord>(&format!(
        r#"
        INSERT INTO caches (cache_key, version, size, complete, created_at, used_at)
        VALUES (?, ?, ?, 0, ?, ?)
        RETURNING {COLUMNS}
        "#
    ))
    .bind(&p.key)
    .bind(&p.version)
    .bind(p.size)
    .bind(p.now)
    .bind(p.now)
    .fetch_one(pool)
    .await
}

/// Write a full record, creating or replacing the row with its id
pub async fn upsert(pool: &SqlitePool, record: &CacheRecord) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO caches (id, cache_key, version, size, complete, created_at, used_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (id) DO UPDATE SET
            cache_key = excluded.cache_key,
            version = excluded.version,
            size = excluded.size,
            complete = excluded.complete,
            created_at = excluded.created_at,
            used_at = excluded.used_at
        "#,
    )
    .bind(record.id)
    .bind(&record.key)
    .bind(&record.version)
    .bind(record.size)
    .bind(record.complete)
    .bind(record.created_at)
    .bind(record.used_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Refresh `used_at`. Never moves it backwards. Returns false if the record
/// does not exist.
pub async fn touch(pool: &SqlitePool, id: i64, now: i64) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("UPDATE caches SET used_at = MAX(used_at, ?) WHERE id = ?")
        .bind(now)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Mark a record complete with its stored size.
///
/// Only an incomplete record is updated; false means the record is missing
/// or another commit already completed it.
pub async fn mark_complete(pool: &SqlitePool, id: i64, size: i64) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("UPDATE caches SET complete = 1, size = ? WHERE id = ? AND complete = 0")
        .bind(size)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() == 1)
}

/// Delete a record by id, returning whether it existed
pub async fn delete(pool: &SqlitePool, id: i64) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM caches WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// SQL condition and cutoff for an eviction rule, evaluated against the
/// `caches` row being deleted
fn eviction_condition(rule: Eviction) -> (&'static str, i64) {
    match rule {
        Eviction::Incomplete { used_before } => ("complete = 0 AND used_at < ?", used_before),
        Eviction::Unused { used_before } => ("used_at < ?", used_before),
        Eviction::Expired { created_before } => ("created_at < ?", created_before),
        Eviction::Superseded { used_before } => (
            r#"complete = 1 AND used_at < ? AND EXISTS (
                SELECT 1 FROM caches AS newer
                WHERE newer.cache_key = caches.cache_key
                  AND newer.version = caches.version
                  AND newer.complete = 1
                  AND (newer.created_at > caches.created_at
                       OR (newer.created_at = caches.created_at AND newer.id > caches.id))
            )"#,
            used_before,
        ),
    }
}

/// Whether the record with `id` currently satisfies `rule`
pub async fn eviction_applies(
    pool: &SqlitePool,
    id: i64,
    rule: Eviction,
) -> Result<bool, sqlx::Error> {
    let (condition, cutoff) = eviction_condition(rule);
    let row: Option<(i64,)> = sqlx::query_as(&format!(
        "SELECT id FROM caches WHERE id = ? AND {condition}"
    ))
    .bind(id)
    .bind(cutoff)
    .fetch_optional(pool)
    .await?;
    Ok(row.is_some())
}

/// Delete the record with `id` only if it still satisfies `rule`
pub async fn delete_if(pool: &SqlitePool, id: i64, rule: Eviction) -> Result<bool, sqlx::Error> {
    let (condition, cutoff) = eviction_condition(rule);
    let result = sqlx::query(&format!("DELETE FROM caches WHERE id = ? AND {condition}"))
        .bind(id)
        .bind(cutoff)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Resolve a restore-key list to the newest matching complete record.
///
/// Each key is tried in order, first as an exact key and then as a key
/// prefix; the first key producing any match wins and later keys are not
/// consulted.
pub async fn find_by_keys(
    pool: &SqlitePool,
    keys: &[String],
    version: &str,
) -> Result<Option<CacheRecord>, sqlx::Error> {
    let mut tx = pool.begin().await?;

    for key in keys {
        let exact = sqlx::query_as::<_, CacheRecord>(&format!(
            r#"
            SELECT {COLUMNS} FROM caches
            WHERE cache_key = ? AND version = ? AND complete = 1
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#
        ))
        .bind(key)
        .bind(version)
        .fetch_optional(&mut *tx)
        .await?;

        if exact.is_some() {
            tx.commit().await?;
            return Ok(exact);
        }

        let pattern = match prefix_pattern(key) {
            Ok(re) => re,
            Err(e) => {
                debug!(key = %key, error = %e, "Skipping unusable key prefix");
                continue;
            }
        };

        // Keys with this prefix sort within [prefix, prefix + U+10FFFF)
        let newest = sqlx::query_as::<_, CacheRecord>(&format!(
            r#"
            SELECT {COLUMNS} FROM caches
            WHERE version = ? AND complete = 1
              AND cache_key >= ? AND cache_key < ?
              AND substr(cache_key, 1, length(?)) = ?
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#
        ))
        .bind(version)
        .bind(key)
        .bind(format!("{}{}", key, char::MAX))
        .bind(key)
        .bind(key)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(found) = newest.filter(|r| pattern.is_match(&r.key)) {
            tx.commit().await?;
            return Ok(Some(found));
        }
    }

    tx.commit().await?;
    Ok(None)
}

fn prefix_pattern(prefix: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("^{}", regex::escape(prefix)))
}

/// Incomplete records not used since `cutoff`
pub async fn incomplete_used_before(
    pool: &SqlitePool,
    cutoff: i64,
) -> Result<Vec<CacheRecord>, sqlx::Error> {
    sqlx::query_as::<_, CacheRecord>(&format!(
        "SELECT {COLUMNS} FROM caches WHERE used_at < ? AND complete = 0 ORDER BY id"
    ))
    .bind(cutoff)
    .fetch_all(pool)
    .await
}

/// Records (complete or not) not used since `cutoff`
pub async fn used_before(pool: &SqlitePool, cutoff: i64) -> Result<Vec<CacheRecord>, sqlx::Error> {
    sqlx::query_as::<_, CacheRecord>(&format!(
        "SELECT {COLUMNS} FROM caches WHERE used_at < ? ORDER BY id"
    ))
    .bind(cutoff)
    .fetch_all(pool)
    .await
}

/// Records created before `cutoff`
pub async fn created_before(
    pool: &SqlitePool,
    cutoff: i64,
) -> Result<Vec<CacheRecord>, sqlx::Error> {
    sqlx::query_as::<_, CacheRecord>(&format!(
        "SELECT {COLUMNS} FROM caches WHERE created_at < ? ORDER BY id"
    ))
    .bind(cutoff)
    .fetch_all(pool)
    .await
}

/// Complete records grouped by (key, version), each group oldest first
pub async fn group_by_key_version(pool: &SqlitePool) -> Result<Vec<CacheGroup>, sqlx::Error> {
    let rows = sqlx::query_as::<_, CacheRecord>(&format!(
        r#"
        SELECT {COLUMNS} FROM caches
        WHERE complete = 1
        ORDER BY cache_key, version, created_at, id
        "#
    ))
    .fetch_all(pool)
    .await?;

    let mut groups: Vec<CacheGroup> = Vec::new();
    for row in rows {
        match groups.last_mut() {
            Some(group) if group.key == row.key && group.version == row.version => {
                group.records.push(row);
            }
            _ => groups.push(CacheGroup {
                key: row.key.clone(),
                version: row.version.clone(),
                records: vec![row],
            }),
        }
    }
    Ok(groups)
}

/// Record counts and committed bytes
pub async fn stats(pool: &SqlitePool) -> Result<RecordStats, sqlx::Error> {
    let (complete, incomplete, total_size): (i64, i64, i64) = sqlx::query_as(
        r#"
        SELECT
            COALESCE(SUM(complete), 0),
            COALESCE(SUM(1 - complete), 0),
            COALESCE(SUM(CASE WHEN complete = 1 THEN COALESCE(size, 0) ELSE 0 END), 0)
        FROM caches
        "#,
    )
    .fetch_one(pool)
    .await?;

    Ok(RecordStats {
        complete,
        incomplete,
        total_size,
    })
}
