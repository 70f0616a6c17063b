//! On-disk cache of converted camera recordings.
//!
//! `get_or_convert` is called concurrently by dashboard requests. A hit only
//! touches the in-memory index; a miss goes through the per-key conversion
//! lock so a given source is converted once, while different sources
//! convert in parallel. Outputs are written under a temporary name and
//! renamed into place, so a partially written file is never served.

use crate::conversion_lock::{Acquired, ConversionLocks};
use crate::error::{MediaError, Result};
use crate::media_path::{MediaIdentifier, MediaRoot};
use crate::transcoder::Transcoder;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::fs;
use tracing::{debug, error, info, instrument, warn};

const OUTPUT_EXT: &str = ".mp4";
const PARTIAL_EXT: &str = ".partial.mp4";

/// One converted file in the cache directory.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    /// Canonical source path; unknown for entries recovered at startup
    pub source: Option<PathBuf>,
    pub output: PathBuf,
    pub size_bytes: u64,
    pub last_access: DateTime<Utc>,
    /// Monotonic access order, breaks timestamp ties
    access_seq: u64,
}

/// Cache statistics.
#[derive(Debug, Default, Clone, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: u64,
    pub max_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub conversions: u64,
    pub failed_conversions: u64,
    pub evictions: u64,
}

#[derive(Debug, Default)]
struct CacheIndex {
    entries: HashMap<String, CacheEntry>,
    total_bytes: u64,
    access_clock: u64,
    stats: CacheStats,
}

impl CacheIndex {
    fn next_seq(&mut self) -> u64 {
        self.access_clock += 1;
        self.access_clock
    }

    fn insert(&mut self, mut entry: CacheEntry) {
        entry.access_seq = self.next_seq();
        self.total_bytes += entry.size_bytes;
        if let Some(old) = self.entries.insert(entry.key.clone(), entry) {
            self.total_bytes -= old.size_bytes;
        }
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.total_bytes -= entry.size_bytes;
        Some(entry)
    }
}

/// LRU cache of converted recordings with single-flight conversion.
pub struct VideoCacheManager<T: Transcoder> {
    root: MediaRoot,
    cache_dir: PathBuf,
    max_bytes: u64,
    transcoder: T,
    locks: ConversionLocks,
    index: Mutex<CacheIndex>,
}

impl<T: Transcoder> VideoCacheManager<T> {
    pub fn new(root: MediaRoot, cache_dir: impl Into<PathBuf>, max_bytes: u64, transcoder: T) -> Self {
        Self {
            root,
            cache_dir: cache_dir.into(),
            max_bytes,
            transcoder,
            locks: ConversionLocks::new(),
            index: Mutex::new(CacheIndex::default()),
        }
    }

    /// Return the converted output for `relative`, converting on a miss.
    #[instrument(skip(self))]
    pub async fn get_or_convert(&self, relative: &str) -> Result<PathBuf> {
        let source = self.resolve_source(relative).await?;
        let key = cache_key(&source).await?;
        let mut retried = false;

        loop {
            if let Some(output) = self.hit(&key).await {
                return Ok(output);
            }

            match self.locks.acquire(&key) {
                Acquired::Owner(guard) => {
                    let result = self.convert(&key, &source).await;
                    drop(guard);
                    return result;
                }
                Acquired::Waiter(handle) => {
                    debug!(key = %key, "Waiting for in-flight conversion");
                    handle.wait().await;

                    if let Some(output) = self.hit(&key).await {
                        return Ok(output);
                    }
                    // The owner failed; try once more, then give up.
                    if retried {
                        return Err(MediaError::ConversionFailed {
                            path: source,
                            reason: "conversion failed in another request".to_string(),
                        });
                    }
                    retried = true;
                }
            }
        }
    }

    /// Return the cached output for `relative` without converting.
    pub async fn lookup(&self, relative: &str) -> Result<Option<PathBuf>> {
        let source = self.resolve_source(relative).await?;
        let key = cache_key(&source).await?;
        Ok(self.hit(&key).await)
    }

    /// Rebuild the index from the cache directory.
    ///
    /// Leftover partial outputs are deleted, files are registered oldest
    /// first so modification time stands in for last access, then the byte
    /// budget is enforced. Returns the number of entries registered.
    pub async fn load_existing(&self) -> Result<usize> {
        fs::create_dir_all(&self.cache_dir).await?;

        let mut found = Vec::new();
        let mut dir = fs::read_dir(&self.cache_dir).await?;
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            let name = item.file_name().to_string_lossy().into_owned();

            if name.ends_with(PARTIAL_EXT) {
                match fs::remove_file(&path).await {
                    Ok(()) => info!(path = %path.display(), "Removed partial output"),
                    Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove partial output"),
                }
                continue;
            }

            let Some(key) = name.strip_suffix(OUTPUT_EXT) else {
                continue;
            };
            let meta = item.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            let modified: DateTime<Utc> = meta.modified().map(Into::into).unwrap_or_else(|_| Utc::now());
            found.push((modified, key.to_string(), path, meta.len()));
        }

        found.sort_by(|a, b| a.0.cmp(&b.0));
        let count = found.len();
        {
            let mut index = self.index.lock();
            for (modified, key, output, size_bytes) in found {
                index.insert(CacheEntry {
                    key,
                    source: None,
                    output,
                    size_bytes,
                    last_access: modified,
                    access_seq: 0,
                });
            }
        }

        info!(
            entries = count,
            total_bytes = self.index.lock().total_bytes,
            "Loaded existing cache entries"
        );
        self.evict().await;
        Ok(count)
    }

    /// Enforce the byte budget. Returns the number of entries evicted.
    ///
    /// Entries are dropped in least-recently-used order, skipping keys with
    /// a conversion in flight. A failed deletion is logged and the sweep
    /// continues.
    pub async fn evict(&self) -> usize {
        let victims: Vec<CacheEntry> = {
            let mut index = self.index.lock();
            if index.total_bytes <= self.max_bytes {
                return 0;
            }

            let mut candidates: Vec<(u64, String)> = index
                .entries
                .values()
                .filter(|e| !self.locks.is_locked(&e.key))
                .map(|e| (e.access_seq, e.key.clone()))
                .collect();
            candidates.sort();

            let mut victims = Vec::new();
            for (_, key) in candidates {
                if index.total_bytes <= self.max_bytes {
                    break;
                }
                if let Some(entry) = index.remove(&key) {
                    victims.push(entry);
                }
            }
            index.stats.evictions += victims.len() as u64;
            victims
        };

        for entry in &victims {
            match fs::remove_file(&entry.output).await {
                Ok(()) => info!(
                    key = %entry.key,
                    size_bytes = entry.size_bytes,
                    "Evicted cached video"
                ),
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    debug!(key = %entry.key, "Evicted entry was already gone")
                }
                Err(e) => warn!(
                    key = %entry.key,
                    path = %entry.output.display(),
                    error = %e,
                    "Failed to delete evicted video"
                ),
            }
        }

        victims.len()
    }

    /// Get current cache statistics.
    pub fn stats(&self) -> CacheStats {
        let index = self.index.lock();
        CacheStats {
            entries: index.entries.len(),
            total_bytes: index.total_bytes,
            max_bytes: self.max_bytes,
            ..index.stats.clone()
        }
    }

    /// Path of the final output for `key`.
    pub fn output_path(&self, key: &str) -> PathBuf {
        self.cache_dir.join(format!("{}{}", key, OUTPUT_EXT))
    }

    fn partial_path(&self, key: &str) -> PathBuf {
        self.cache_dir.join(format!("{}{}", key, PARTIAL_EXT))
    }

    async fn resolve_source(&self, relative: &str) -> Result<PathBuf> {
        // Traversal is reported as such even when the identifier is malformed.
        let joined = self.root.join(relative)?;
        MediaIdentifier::parse(relative)?;

        match self.root.resolve(relative) {
            Err(MediaError::SourceNotFound(id)) => {
                self.forget_source(&joined).await;
                Err(MediaError::SourceNotFound(id))
            }
            other => other,
        }
    }

    /// Drop entries whose source file has disappeared.
    async fn forget_source(&self, source: &Path) {
        let removed: Vec<CacheEntry> = {
            let mut index = self.index.lock();
            let keys: Vec<String> = index
                .entries
                .values()
                .filter(|e| e.source.as_deref() == Some(source) && !self.locks.is_locked(&e.key))
                .map(|e| e.key.clone())
                .collect();
            keys.iter().filter_map(|k| index.remove(k)).collect()
        };

        for entry in removed {
            info!(key = %entry.key, source = %source.display(), "Source vanished, dropping cached video");
            if let Err(e) = fs::remove_file(&entry.output).await {
                if e.kind() != ErrorKind::NotFound {
                    warn!(path = %entry.output.display(), error = %e, "Failed to delete cached video");
                }
            }
        }
    }

    /// Look up `key`, touching the entry if its file is still on disk.
    async fn hit(&self, key: &str) -> Option<PathBuf> {
        let output = {
            let mut index = self.index.lock();
            match index.entries.get(key) {
                Some(entry) => entry.output.clone(),
                None => {
                    index.stats.misses += 1;
                    return None;
                }
            }
        };

        let present = fs::metadata(&output).await.map(|m| m.is_file()).unwrap_or(false);

        {
            let mut guard = self.index.lock();
            let index = &mut *guard;
            if !present {
                if !self.locks.is_locked(key) {
                    index.remove(key);
                }
                index.stats.misses += 1;
                warn!(key = %key, path = %output.display(), "Cached video vanished from disk");
                return None;
            }

            let seq = index.next_seq();
            let entry = index.entries.get_mut(key)?;
            entry.last_access = Utc::now();
            entry.access_seq = seq;
            index.stats.hits += 1;
        }

        // The file's mtime carries the access order across restarts.
        touch(&output).await;
        debug!(key = %key, path = %output.display(), "Cache hit");
        Some(output)
    }

    /// Convert `source` as owner of `key` and publish the result.
    async fn convert(&self, key: &str, source: &Path) -> Result<PathBuf> {
        // Another owner may have published while we were acquiring.
        if let Some(output) = self.hit(key).await {
            return Ok(output);
        }

        fs::create_dir_all(&self.cache_dir).await?;
        let output = self.output_path(key);
        let partial = self.partial_path(key);

        info!(source = %source.display(), output = %output.display(), "Converting video");
        let started = Instant::now();

        if let Err(e) = self.transcoder.transcode(source, &partial).await {
            self.index.lock().stats.failed_conversions += 1;
            remove_partial(&partial).await;
            error!(source = %source.display(), error = %e, "Conversion failed");
            return Err(MediaError::ConversionFailed {
                path: source.to_path_buf(),
                reason: e.to_string(),
            });
        }

        let size_bytes = match fs::metadata(&partial).await {
            Ok(meta) => meta.len(),
            Err(e) => {
                self.index.lock().stats.failed_conversions += 1;
                return Err(MediaError::ConversionFailed {
                    path: source.to_path_buf(),
                    reason: format!("output missing: {}", e),
                });
            }
        };

        if let Err(e) = fs::rename(&partial, &output).await {
            remove_partial(&partial).await;
            return Err(MediaError::Io(e));
        }

        {
            let mut index = self.index.lock();
            index.insert(CacheEntry {
                key: key.to_string(),
                source: Some(source.to_path_buf()),
                output: output.clone(),
                size_bytes,
                last_access: Utc::now(),
                access_seq: 0,
            });
            index.stats.conversions += 1;
        }

        info!(
            output = %output.display(),
            size_kb = size_bytes / 1024,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Conversion complete"
        );

        self.evict().await;
        Ok(output)
    }
}

/// Set `path`'s modification time to now.
async fn touch(path: &Path) {
    let target = path.to_path_buf();
    let result = tokio::task::spawn_blocking(move || {
        std::fs::OpenOptions::new()
            .write(true)
            .open(&target)?
            .set_modified(SystemTime::now())
    })
    .await;

    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(path = %path.display(), error = %e, "Failed to touch cached video"),
        Err(e) => warn!(path = %path.display(), error = %e, "Touch task failed"),
    }
}

async fn remove_partial(partial: &Path) {
    if let Err(e) = fs::remove_file(partial).await {
        if e.kind() != ErrorKind::NotFound {
            warn!(path = %partial.display(), error = %e, "Failed to remove partial output");
        }
    }
}

/// Stable key for a source file: its canonical path plus size and mtime,
/// so a file replaced in place gets a fresh conversion.
async fn cache_key(source: &Path) -> Result<String> {
    let meta = fs::metadata(source).await?;
    let modified = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos())
        .unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(source.to_string_lossy().as_bytes());
    hasher.update(b"\0");
    hasher.update(meta.len().to_le_bytes());
    hasher.update(modified.to_le_bytes());
    let digest = hasher.finalize();

    Ok(hex::encode(&digest[..16]))
}
