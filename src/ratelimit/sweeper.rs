//! Opportunistic garbage collection of window records.
//!
//! There is no background task. The limiter calls [`Sweeper::sweep`] after
//! accepting an attempt, and the sweep performs two passes over the store:
//! records untouched for longer than `max_age` are removed, then the oldest
//! remaining records are evicted until at most `max_records` are left. The
//! age pass also clears leftovers of interrupted writes older than `max_age`.
//!
//! Every failure here is logged and swallowed.

use std::time::{Duration, SystemTime};

use serde::Serialize;
use tracing::{debug, warn};

use super::store::{StoredEntry, WindowStore};

/// Default age after which a record is discarded (14 days).
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(14 * 24 * 60 * 60);
/// Default cap on the number of stored records.
pub const DEFAULT_MAX_RECORDS: usize = 1000;

/// Counts from a single sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Records seen during enumeration
    pub scanned: usize,
    /// Records removed for exceeding the age threshold
    pub expired: usize,
    /// Records removed to satisfy the count cap
    pub evicted: usize,
    /// Leftovers of interrupted writes removed by the age pass
    pub incomplete: usize,
    /// Enumerate or delete operations that failed
    pub failures: usize,
}

impl SweepReport {
    /// Total entries removed.
    pub fn removed(&self) -> usize {
        self.expired + self.evicted + self.incomplete
    }
}

/// Bounds the size and age of a [`WindowStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sweeper {
    max_age: Duration,
    max_records: usize,
}

impl Default for Sweeper {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_AGE, DEFAULT_MAX_RECORDS)
    }
}

impl Sweeper {
    pub fn new(max_age: Duration, max_records: usize) -> Self {
        Self {
            max_age,
            max_records,
        }
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    pub fn max_records(&self) -> usize {
        self.max_records
    }

    /// Run both maintenance passes against `store` as of `now`.
    pub async fn sweep(&self, store: &dyn WindowStore, now: SystemTime) -> SweepReport {
        let mut report = SweepReport::default();

        let entries = match store.enumerate().await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "Failed to enumerate window records, skipping sweep");
                report.failures += 1;
                return report;
            }
        };
        report.scanned = entries.len();

        let cutoff = now.checked_sub(self.max_age);
        let (stale, mut live): (Vec<StoredEntry>, Vec<StoredEntry>) = entries
            .into_iter()
            .partition(|entry| cutoff.is_some_and(|cutoff| entry.modified < cutoff));

        for entry in &stale {
            if self.remove(store, entry, &mut report).await {
                report.expired += 1;
            }
        }

        if let Some(cutoff) = cutoff {
            match store.purge_incomplete(cutoff).await {
                Ok(purged) => report.incomplete = purged,
                Err(e) => {
                    warn!(error = %e, "Failed to purge incomplete writes");
                    report.failures += 1;
                }
            }
        }

        if live.len() > self.max_records {
            live.sort_by(|a, b| {
                a.modified
                    .cmp(&b.modified)
                    .then_with(|| a.fingerprint.cmp(&b.fingerprint))
            });

            let excess = live.len() - self.max_records;
            for entry in &live[..excess] {
                if self.remove(store, entry, &mut report).await {
                    report.evicted += 1;
                }
            }
        }

        if report.removed() > 0 || report.failures > 0 {
            debug!(
                scanned = report.scanned,
                expired = report.expired,
                evicted = report.evicted,
                incomplete = report.incomplete,
                failures = report.failures,
                "Swept window records"
            );
        }

        report
    }

    /// Delete one record, recording a failure instead of propagating it.
    async fn remove(
        &self,
        store: &dyn WindowStore,
        entry: &StoredEntry,
        report: &mut SweepReport,
    ) -> bool {
        match store.delete(&entry.fingerprint).await {
            Ok(removed) => removed,
            Err(e) => {
                warn!(fingerprint = %entry.fingerprint, error = %e, "Failed to delete window record");
                report.failures += 1;
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{FloodgateError, Result};
    use crate::ratelimit::{Fingerprint, Identity, MemoryStore};
    use async_trait::async_trait;

    const DAY: u64 = 24 * 60 * 60;

    fn fp(n: usize) -> Fingerprint {
        Fingerprint::new("sweep", &Identity::new(format!("client-{}", n), "agent"))
    }

    fn at(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    const NOW: u64 = 1_700_000_000;

    #[tokio::test]
    async fn test_age_sweep_removes_stale_records() {
        let store = MemoryStore::new();
        store.insert_with_modified(fp(1), vec![1], at(NOW - 15 * DAY));
        store.insert_with_modified(fp(2), vec![2], at(NOW - 13 * DAY));
        store.insert_with_modified(fp(3), vec![3], at(NOW - 60));

        let report = Sweeper::default().sweep(&store, at(NOW)).await;

        assert_eq!(report.scanned, 3);
        assert_eq!(report.expired, 1);
        assert_eq!(report.evicted, 0);
        assert!(!store.contains(&fp(1)));
        assert!(store.contains(&fp(2)));
        assert!(store.contains(&fp(3)));
    }

    #[tokio::test]
    async fn test_count_cap_evicts_oldest() {
        let store = MemoryStore::new();
        // 1200 young records, record i modified i seconds after the base.
        let base = NOW - DAY;
        for i in 0..1200 {
            store.insert_with_modified(fp(i), vec![1], at(base + i as u64));
        }

        let report = Sweeper::default().sweep(&store, at(NOW)).await;

        assert_eq!(report.expired, 0);
        assert_eq!(report.evicted, 200);
        assert_eq!(store.len(), 1000);
        for i in 0..200 {
            assert!(!store.contains(&fp(i)), "record {} should be evicted", i);
        }
        for i in 200..1200 {
            assert!(store.contains(&fp(i)), "record {} should survive", i);
        }
    }

    #[tokio::test]
    async fn test_count_cap_applies_after_age_sweep() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store.insert_with_modified(fp(i), vec![1], at(NOW - 30 * DAY));
        }
        for i in 5..8 {
            store.insert_with_modified(fp(i), vec![1], at(NOW - 100 + i as u64));
        }

        let report = Sweeper::new(DEFAULT_MAX_AGE, 2).sweep(&store, at(NOW)).await;

        assert_eq!(report.expired, 5);
        assert_eq!(report.evicted, 1);
        assert!(!store.contains(&fp(5)));
        assert!(store.contains(&fp(6)));
        assert!(store.contains(&fp(7)));
    }

    #[tokio::test]
    async fn test_sweep_within_limits_is_noop() {
        let store = MemoryStore::new();
        store.insert_with_modified(fp(1), vec![1], at(NOW));

        let report = Sweeper::default().sweep(&store, at(NOW)).await;

        assert_eq!(report, SweepReport { scanned: 1, ..Default::default() });
    }

    #[tokio::test]
    async fn test_now_before_max_age_expires_nothing() {
        let store = MemoryStore::new();
        store.insert_with_modified(fp(1), vec![1], SystemTime::UNIX_EPOCH);

        let report = Sweeper::default().sweep(&store, at(60)).await;

        assert_eq!(report.expired, 0);
        assert!(store.contains(&fp(1)));
    }

    struct BrokenStore;

    #[async_trait]
    impl WindowStore for BrokenStore {
        async fn load(&self, _: &Fingerprint) -> Result<Vec<i64>> {
            Ok(Vec::new())
        }

        async fn save(&self, _: &Fingerprint, _: &[i64]) -> Result<()> {
            Ok(())
        }

        async fn enumerate(&self) -> Result<Vec<StoredEntry>> {
            Ok(vec![StoredEntry {
                fingerprint: fp(1),
                modified: SystemTime::UNIX_EPOCH,
            }])
        }

        async fn delete(&self, _: &Fingerprint) -> Result<bool> {
            Err(FloodgateError::Storage("read-only".to_string()))
        }
    }

    #[tokio::test]
    async fn test_delete_failures_are_counted_not_raised() {
        let report = Sweeper::default().sweep(&BrokenStore, at(NOW)).await;

        assert_eq!(report.scanned, 1);
        assert_eq!(report.expired, 0);
        assert_eq!(report.failures, 1);
    }
}
