//! On-disk cache with one JSON record per key.

use async_trait::async_trait;
use md5::{Digest, Md5};
use serde_json::Value;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{debug, warn};

use super::{unix_now, CacheEntry, CacheError, CacheStats, ResponseCache};
use crate::config::CacheConfig;

const RECORD_EXTENSION: &str = "json";
const TEMP_EXTENSION: &str = "tmp";

enum Record {
    Missing,
    Corrupt,
    Found(CacheEntry, u64),
}

/// Cache that stores each entry as `<dir>/<md5(key)>.json`.
///
/// Writes go to a uniquely named temporary sibling that is renamed into
/// place, so concurrent readers see either the old record or the new one.
#[derive(Debug, Clone)]
pub struct FileCache {
    dir: PathBuf,
    default_ttl: Option<Duration>,
}

impl FileCache {
    /// Creates a cache rooted at `dir`. The directory is created on first write.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, default_ttl: Option<Duration>) -> Self {
        Self {
            dir: dir.into(),
            default_ttl,
        }
    }

    /// Creates a cache from configuration.
    #[must_use]
    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.dir.clone(), config.default_ttl())
    }

    /// Returns the cache directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the record path for `key`.
    #[must_use]
    pub fn record_path(&self, key: &str) -> PathBuf {
        let digest = Md5::digest(key.as_bytes());
        self.dir
            .join(format!("{}.{RECORD_EXTENSION}", hex::encode(digest)))
    }

    async fn read_record(path: &Path) -> Record {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Record::Missing,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "Unreadable cache record");
                return Record::Corrupt;
            }
        };
        match serde_json::from_slice::<CacheEntry>(&bytes) {
            Ok(entry) => Record::Found(entry, bytes.len() as u64),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "Corrupted cache record");
                Record::Corrupt
            }
        }
    }

    async fn remove_record(path: &Path) -> Result<(), CacheError> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(CacheError::Remove {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    async fn discard(path: &Path) {
        if let Err(err) = Self::remove_record(path).await {
            warn!(error = %err, "Could not discard dead cache record");
        }
    }

    async fn record_paths(&self) -> Result<Vec<PathBuf>, CacheError> {
        let mut reader = match fs::read_dir(&self.dir).await {
            Ok(reader) => reader,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(CacheError::Directory {
                    path: self.dir.clone(),
                    source,
                })
            }
        };

        let mut paths = Vec::new();
        loop {
            match reader.next_entry().await {
                Ok(Some(entry)) => {
                    let path = entry.path();
                    let ext = path.extension().and_then(|ext| ext.to_str());
                    if ext == Some(RECORD_EXTENSION) {
                        paths.push(path);
                    }
                }
                Ok(None) => break,
                Err(source) => {
                    return Err(CacheError::Directory {
                        path: self.dir.clone(),
                        source,
                    })
                }
            }
        }
        Ok(paths)
    }
}

#[async_trait]
impl ResponseCache for FileCache {
    async fn get(&self, key: &str) -> Option<Value> {
        let path = self.record_path(key);
        match Self::read_record(&path).await {
            Record::Missing => None,
            Record::Corrupt => {
                Self::discard(&path).await;
                None
            }
            Record::Found(entry, _) if entry.key != key => {
                debug!(key, stored = %entry.key, "Cache record belongs to another key");
                None
            }
            Record::Found(entry, _) if !entry.is_live() => {
                debug!(key, "Cache entry expired");
                Self::discard(&path).await;
                None
            }
            Record::Found(entry, _) => Some(entry.value),
        }
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), CacheError> {
        let entry = CacheEntry::new(key, value, ttl.or(self.default_ttl));
        let bytes = serde_json::to_vec(&entry).map_err(|source| CacheError::Encode {
            key: key.to_string(),
            source,
        })?;

        fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| CacheError::Directory {
                path: self.dir.clone(),
                source,
            })?;

        let path = self.record_path(key);
        let temp = path.with_extension(format!("{}.{TEMP_EXTENSION}", uuid::Uuid::new_v4().simple()));

        if let Err(source) = fs::write(&temp, &bytes).await {
            let _ = fs::remove_file(&temp).await;
            return Err(CacheError::Write { path: temp, source });
        }
        if let Err(source) = fs::rename(&temp, &path).await {
            let _ = fs::remove_file(&temp).await;
            return Err(CacheError::Write { path, source });
        }
        Ok(())
    }

    async fn clear(&self, key: Option<&str>) -> Result<(), CacheError> {
        match key {
            Some(key) => Self::remove_record(&self.record_path(key)).await,
            None => {
                for path in self.record_paths().await? {
                    Self::remove_record(&path).await?;
                }
                Ok(())
            }
        }
    }

    async fn get_stats(&self) -> Result<CacheStats, CacheError> {
        let paths = self.record_paths().await?;
        let now = unix_now();
        let mut stats = CacheStats {
            total_entries: paths.len(),
            ..CacheStats::default()
        };

        // Corrupted records count as expired.
        for path in paths {
            match Self::read_record(&path).await {
                Record::Missing => {}
                Record::Found(entry, size) if entry.is_live_at(now) => {
                    stats.active_entries += 1;
                    stats.size_bytes += size;
                }
                Record::Found(..) | Record::Corrupt => {
                    stats.expired_entries += 1;
                    Self::remove_record(&path).await?;
                }
            }
        }
        Ok(stats)
    }
}
