//! Directory-backed window store.
//!
//! Each fingerprint owns one file named `<prefix><fingerprint>` holding a JSON
//! array of timestamps. Writes land in a uniquely named hidden temp file in the
//! same directory and are renamed over the target, so a concurrent reader sees
//! either the old or the new record and never a partial one.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::fingerprint::{Fingerprint, DEFAULT_KEY_PREFIX};
use super::store::{StoredEntry, WindowStore};
use crate::error::Result;

/// A [`WindowStore`] persisting one file per fingerprint.
#[derive(Debug, Clone)]
pub struct FileStore {
    /// Directory holding the record files
    dir: PathBuf,
    /// Prefix for record file names
    prefix: String,
}

impl FileStore {
    /// Create a store in `dir` with the default `ratelimit_` prefix.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_prefix(dir, DEFAULT_KEY_PREFIX)
    }

    /// Create a store in `dir` with a custom file name prefix.
    pub fn with_prefix(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the record file for a fingerprint.
    pub fn record_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.dir.join(fingerprint.storage_key(&self.prefix))
    }

    fn temp_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.dir.join(format!(
            ".{}.{}.tmp",
            fingerprint.storage_key(&self.prefix),
            Uuid::new_v4().simple()
        ))
    }

    /// Whether `name` is a temp file this store's `save` would create.
    fn is_temp_name(&self, name: &str) -> bool {
        name.strip_prefix('.')
            .and_then(|rest| rest.strip_prefix(self.prefix.as_str()))
            .is_some_and(|rest| rest.ends_with(".tmp"))
    }

    async fn write_temp(path: &Path, contents: &[u8]) -> std::io::Result<()> {
        let mut file = tokio::fs::File::create(path).await?;
        file.write_all(contents).await?;
        file.sync_data().await?;
        Ok(())
    }
}

#[async_trait]
impl WindowStore for FileStore {
    async fn load(&self, fingerprint: &Fingerprint) -> Result<Vec<i64>> {
        let path = self.record_path(fingerprint);

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let timestamps: Vec<i64> = serde_json::from_slice(&bytes)?;
        trace!(path = %path.display(), count = timestamps.len(), "Loaded window record");
        Ok(timestamps)
    }

    async fn save(&self, fingerprint: &Fingerprint, timestamps: &[i64]) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let contents = serde_json::to_vec(timestamps)?;
        let temp = self.temp_path(fingerprint);
        let path = self.record_path(fingerprint);

        let written = match Self::write_temp(&temp, &contents).await {
            Ok(()) => tokio::fs::rename(&temp, &path).await,
            Err(e) => Err(e),
        };

        if let Err(e) = written {
            // Best effort: the temp file may not exist if creation failed.
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e.into());
        }

        trace!(path = %path.display(), count = timestamps.len(), "Saved window record");
        Ok(())
    }

    async fn enumerate(&self) -> Result<Vec<StoredEntry>> {
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            let Some(fingerprint) = name
                .to_str()
                .and_then(|n| Fingerprint::from_storage_key(n, &self.prefix))
            else {
                continue;
            };

            // A record deleted between listing and stat is simply skipped.
            let modified = match entry.metadata().await.and_then(|m| m.modified()) {
                Ok(modified) => modified,
                Err(e) => {
                    debug!(fingerprint = %fingerprint, error = %e, "Skipping unreadable record");
                    continue;
                }
            };

            entries.push(StoredEntry {
                fingerprint,
                modified,
            });
        }

        Ok(entries)
    }

    async fn delete(&self, fingerprint: &Fingerprint) -> Result<bool> {
        match tokio::fs::remove_file(self.record_path(fingerprint)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn purge_incomplete(&self, older_than: SystemTime) -> Result<usize> {
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            if !name.to_str().is_some_and(|n| self.is_temp_name(n)) {
                continue;
            }

            let stale = entry
                .metadata()
                .await
                .and_then(|m| m.modified())
                .is_ok_and(|modified| modified < older_than);
            if !stale {
                continue;
            }

            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %entry.path().display(), error = %e, "Failed to remove temp file");
                }
            }
        }

        if removed > 0 {
            debug!(dir = %self.dir.display(), removed, "Removed incomplete writes");
        }
        Ok(removed)
    }
}
