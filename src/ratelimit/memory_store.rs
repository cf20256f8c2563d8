//! In-process window store.

use std::collections::HashMap;
use std::time::SystemTime;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::fingerprint::Fingerprint;
use super::store::{StoredEntry, WindowStore};
use crate::error::Result;

#[derive(Debug, Clone)]
struct Record {
    timestamps: Vec<i64>,
    modified: SystemTime,
}

/// A [`WindowStore`] kept in memory.
///
/// History only lives as long as the process. Useful for tests and for
/// embedding the limiter in a long-running single-process server.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<Fingerprint, Record>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a record with an explicit modification time.
    pub fn insert_with_modified(
        &self,
        fingerprint: Fingerprint,
        timestamps: Vec<i64>,
        modified: SystemTime,
    ) {
        self.records.write().insert(
            fingerprint,
            Record {
                timestamps,
                modified,
            },
        );
    }

    /// Get the number of stored records.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Check whether a record exists for the fingerprint.
    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.records.read().contains_key(fingerprint)
    }
}

#[async_trait]
impl WindowStore for MemoryStore {
    async fn load(&self, fingerprint: &Fingerprint) -> Result<Vec<i64>> {
        Ok(self
            .records
            .read()
            .get(fingerprint)
            .map(|r| r.timestamps.clone())
            .unwrap_or_default())
    }

    async fn save(&self, fingerprint: &Fingerprint, timestamps: &[i64]) -> Result<()> {
        self.insert_with_modified(fingerprint.clone(), timestamps.to_vec(), SystemTime::now());
        Ok(())
    }

    async fn enumerate(&self) -> Result<Vec<StoredEntry>> {
        Ok(self
            .records
            .read()
            .iter()
            .map(|(fingerprint, record)| StoredEntry {
                fingerprint: fingerprint.clone(),
                modified: record.modified,
            })
            .collect())
    }

    async fn delete(&self, fingerprint: &Fingerprint) -> Result<bool> {
        Ok(self.records.write().remove(fingerprint).is_some())
    }
}
