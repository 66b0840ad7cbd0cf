//! Background retention sweeps
//!
//! A sweep applies four policies in order: abandoned reservations, records
//! nobody used for a while, records past their maximum age, and superseded
//! duplicates of the same key and version. Sweeps are throttled and never
//! overlap; requests only ever *trigger* one.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use blob_store::BlobStore;
use cache_db::{caches, CacheRecord, Eviction, SqlitePool};
use chrono::Utc;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const MINUTE: i64 = 60;
const HOUR: i64 = 60 * MINUTE;
const DAY: i64 = 24 * HOUR;

/// Retention windows, in seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Reservations not touched for this long are abandoned
    pub incomplete_timeout: i64,
    /// Records not used for this long are evicted
    pub unused_timeout: i64,
    /// Records older than this are evicted regardless of use
    pub max_age: i64,
    /// Duplicates used within this window survive the collapse
    pub duplicate_grace: i64,
    /// Minimum spacing between sweeps
    pub interval: i64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            incomplete_timeout: 5 * MINUTE,
            unused_timeout: 7 * DAY,
            max_age: 30 * DAY,
            duplicate_grace: 5 * MINUTE,
            interval: HOUR,
        }
    }
}

/// Outcome of a single sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepStats {
    pub ran_at: i64,
    pub incomplete: usize,
    pub unused: usize,
    pub expired: usize,
    pub duplicates: usize,
    pub failures: usize,
}

impl SweepStats {
    pub fn deleted(&self) -> usize {
        self.incomplete + self.unused + self.expired + self.duplicates
    }
}

pub struct Retention {
    pool: SqlitePool,
    blobs: Arc<BlobStore>,
    policy: RetentionPolicy,
    running: AtomicBool,
    last_started: AtomicI64,
    last_stats: RwLock<Option<SweepStats>>,
}

/// Clears the running flag when a sweep ends, including by panic
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Retention {
    pub fn new(pool: SqlitePool, blobs: Arc<BlobStore>, policy: RetentionPolicy) -> Self {
        Self {
            pool,
            blobs,
            policy,
            running: AtomicBool::new(false),
            last_started: AtomicI64::new(i64::MIN),
            last_stats: RwLock::new(None),
        }
    }

    /// Start a background sweep unless one is running or the last one
    /// started less than `interval` ago. Returns whether a sweep was started.
    pub fn trigger(self: &Arc<Self>) -> bool {
        let now = Utc::now().timestamp();
        if !self.is_due(now) {
            return false;
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        // Another sweep may have finished between the check and the swap
        if !self.is_due(now) {
            self.running.store(false, Ordering::Release);
            return false;
        }
        self.last_started.store(now, Ordering::Release);

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let _guard = RunningGuard(&this.running);
            let stats = this.sweep(now).await;
            *this.last_stats.write().await = Some(stats);
        });
        true
    }

    fn is_due(&self, now: i64) -> bool {
        let last = self.last_started.load(Ordering::Acquire);
        now.saturating_sub(last) >= self.policy.interval
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stats of the most recently finished sweep
    pub async fn last_stats(&self) -> Option<SweepStats> {
        self.last_stats.read().await.clone()
    }

    /// Apply every policy once, as of `now`. Failures on individual records
    /// are logged and counted; they never abort the sweep.
    pub async fn sweep(&self, now: i64) -> SweepStats {
        let mut stats = SweepStats {
            ran_at: now,
            ..Default::default()
        };
        debug!(now, "Starting retention sweep");

        let rule = Eviction::Incomplete {
            used_before: now - self.policy.incomplete_timeout,
        };
        match caches::incomplete_used_before(&self.pool, now - self.policy.incomplete_timeout).await
        {
            Ok(records) => stats.incomplete = self.evict(records, rule, &mut stats.failures).await,
            Err(e) => self.scan_failed(rule, e, &mut stats.failures),
        }

        let rule = Eviction::Unused {
            used_before: now - self.policy.unused_timeout,
        };
        match caches::used_before(&self.pool, now - self.policy.unused_timeout).await {
            Ok(records) => stats.unused = self.evict(records, rule, &mut stats.failures).await,
            Err(e) => self.scan_failed(rule, e, &mut stats.failures),
        }

        let rule = Eviction::Expired {
            created_before: now - self.policy.max_age,
        };
        match caches::created_before(&self.pool, now - self.policy.max_age).await {
            Ok(records) => stats.expired = self.evict(records, rule, &mut stats.failures).await,
            Err(e) => self.scan_failed(rule, e, &mut stats.failures),
        }

        let rule = Eviction::Superseded {
            used_before: now - self.policy.duplicate_grace,
        };
        match caches::group_by_key_version(&self.pool).await {
            Ok(groups) => {
                let superseded = groups
                    .into_iter()
                    .flat_map(|group| superseded(group.records, now, self.policy.duplicate_grace))
                    .collect();
                stats.duplicates = self.evict(superseded, rule, &mut stats.failures).await
            }
            Err(e) => self.scan_failed(rule, e, &mut stats.failures),
        }

        if stats.deleted() > 0 || stats.failures > 0 {
            info!(
                incomplete = stats.incomplete,
                unused = stats.unused,
                expired = stats.expired,
                duplicates = stats.duplicates,
                failures = stats.failures,
                "Retention sweep finished"
            );
        } else {
            debug!("Retention sweep found nothing to delete");
        }
        stats
    }

    fn scan_failed(&self, rule: Eviction, err: sqlx::Error, failures: &mut usize) {
        *failures += 1;
        warn!(policy = rule.policy(), error = %err, "Failed to scan cache records");
    }

    /// Delete blob then record for each scanned entry that still satisfies
    /// `rule`. Records may have been committed or used since the scan, so the
    /// rule is checked again before the blob goes and once more by the delete
    /// itself. A record whose blob could not be removed is kept so the next
    /// sweep retries it.
    async fn evict(&self, records: Vec<CacheRecord>, rule: Eviction, failures: &mut usize) -> usize {
        let policy = rule.policy();
        let mut deleted = 0;
        for record in records {
            match caches::eviction_applies(&self.pool, record.id, rule).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(id = record.id, policy, "Cache changed since scan, keeping");
                    continue;
                }
                Err(e) => {
                    *failures += 1;
                    warn!(id = record.id, policy, error = %e, "Failed to recheck cache record");
                    continue;
                }
            }
            if let Err(e) = self.blobs.remove(record.id).await {
                *failures += 1;
                warn!(id = record.id, policy, error = %e, "Failed to remove cache blob");
                continue;
            }
            match caches::delete_if(&self.pool, record.id, rule).await {
                Ok(true) => {
                    deleted += 1;
                    info!(
                        id = record.id,
                        key = %record.key,
                        version = %record.version,
                        policy,
                        "Deleted cache"
                    );
                }
                Ok(false) => {
                    // Lookups drop records whose blob is gone
                    warn!(
                        id = record.id,
                        policy,
                        "Cache changed during eviction after its blob was removed"
                    );
                }
                Err(e) => {
                    *failures += 1;
                    warn!(id = record.id, policy, error = %e, "Failed to delete cache record");
                }
            }
        }
        deleted
    }
}

/// Every record of an oldest-first group except the newest, minus those
/// used within the grace window (inclusive).
fn superseded(mut records: Vec<CacheRecord>, now: i64, grace: i64) -> Vec<CacheRecord> {
    if records.len() < 2 {
        return Vec::new();
    }
    records.pop();
    records
        .into_iter()
        .filter(|r| now - r.used_at > grace)
        .collect()
}
