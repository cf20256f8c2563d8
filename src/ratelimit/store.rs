//! Window store trait for abstracting over persistence backends.

use std::time::SystemTime;

use async_trait::async_trait;

use super::fingerprint::Fingerprint;
use crate::error::Result;

/// A record listed by [`WindowStore::enumerate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    /// The fingerprint the record belongs to
    pub fingerprint: Fingerprint,
    /// Storage-level last modification time
    pub modified: SystemTime,
}

/// Durable per-fingerprint storage for attempt timestamps.
///
/// Implementations only need atomic overwrite per key: a reader sees either
/// the previous complete record or the new complete record. Nothing is
/// assumed about ordering across keys, so a networked key/value store is as
/// valid a backend as a local directory.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Load the stored timestamps for a fingerprint.
    ///
    /// A missing record is not an error and yields an empty list.
    async fn load(&self, fingerprint: &Fingerprint) -> Result<Vec<i64>>;

    /// Replace the stored timestamps for a fingerprint.
    async fn save(&self, fingerprint: &Fingerprint, timestamps: &[i64]) -> Result<()>;

    /// List every stored record with its modification time.
    async fn enumerate(&self) -> Result<Vec<StoredEntry>>;

    /// Remove a record. Returns `false` if there was nothing to remove.
    async fn delete(&self, fingerprint: &Fingerprint) -> Result<bool>;

    /// Remove leftovers of writes that never completed, if the backend can
    /// produce any, last modified before `older_than`. Returns how many were
    /// removed.
    async fn purge_incomplete(&self, _older_than: SystemTime) -> Result<usize> {
        Ok(0)
    }
}
