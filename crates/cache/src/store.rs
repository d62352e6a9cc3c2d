//! The on-disk store.
//!
//! Layout: `<root>/objects/<sha256>` holds verified assets,
//! `<root>/tmp/` holds in-progress downloads (cleared on startup).
//! Downloads land in `tmp` and are renamed into `objects` only after
//! hash verification, so a crash never leaves a half-written asset
//! under a valid key.
//!
//! Locking: a cache-wide mutex guards the index (entries, sizes,
//! ref-counts) and is never held across I/O or awaits; a per-key async
//! mutex serializes all `ensure` calls for one key, which is what
//! coalesces concurrent downloads.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use shepherd_core::backoff::{Backoff, BackoffPolicy};
use shepherd_core::hashing::sha256_file;
use shepherd_core::job::AssetRef;

use crate::fetcher::AssetFetcher;

/// Cache tuning, derived from the worker configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub root: PathBuf,
    pub max_bytes: u64,
    /// Fetch attempts per asset before the requesting job fails.
    pub download_attempts: u32,
    pub backoff: BackoffPolicy,
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The downloaded bytes did not match the expected digest twice in
    /// a row. Fails the requesting job only.
    #[error("Asset {key} failed hash verification twice")]
    HashMismatch { key: String },

    #[error("Asset download failed: {0}")]
    Download(String),

    #[error("Cache I/O error: {0}")]
    Io(#[from] std::io::Error),
}

struct CacheEntry {
    path: PathBuf,
    size: u64,
    last_used: SystemTime,
    /// Jobs currently holding this asset. Non-zero entries are never
    /// evicted.
    ref_count: u32,
}

#[derive(Default)]
struct CacheIndex {
    entries: HashMap<String, CacheEntry>,
    key_locks: HashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

/// Content-addressed, size-bounded, LRU-evicted asset store.
pub struct AssetCache {
    config: CacheConfig,
    fetcher: Arc<dyn AssetFetcher>,
    index: Mutex<CacheIndex>,
}

impl AssetCache {
    /// Open (or create) the cache directory and re-index any assets that
    /// survived a previous run.
    pub fn open(config: CacheConfig, fetcher: Arc<dyn AssetFetcher>) -> Result<Self, CacheError> {
        let objects = config.root.join("objects");
        let tmp = config.root.join("tmp");
        std::fs::create_dir_all(&objects)?;

        // Interrupted downloads from a previous run are garbage.
        let _ = std::fs::remove_dir_all(&tmp);
        std::fs::create_dir_all(&tmp)?;

        let mut entries = HashMap::new();
        for dir_entry in std::fs::read_dir(&objects)? {
            let dir_entry = dir_entry?;
            let metadata = dir_entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            let key = dir_entry.file_name().to_string_lossy().into_owned();
            entries.insert(
                key,
                CacheEntry {
                    path: dir_entry.path(),
                    size: metadata.len(),
                    last_used: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                    ref_count: 0,
                },
            );
        }

        if !entries.is_empty() {
            tracing::info!(
                assets = entries.len(),
                "Re-indexed asset cache from previous run"
            );
        }

        Ok(Self {
            config,
            fetcher,
            index: Mutex::new(CacheIndex {
                entries,
                key_locks: HashMap::new(),
            }),
        })
    }

    /// Return a verified local path for `asset`, downloading it if
    /// needed, and pin it until [`release`](Self::release) is called.
    ///
    /// Concurrent calls for the same key block behind a single download
    /// and all receive its result.
    pub async fn ensure(&self, asset: &AssetRef) -> Result<PathBuf, CacheError> {
        let key = asset.sha256.to_ascii_lowercase();
        let key_lock = self.key_lock(&key);
        let _guard = key_lock.lock().await;

        if let Some(path) = self.lookup(&key) {
            match self.hash_of(&path).await {
                Ok(digest) if digest == key => {
                    self.pin(&key);
                    return Ok(path);
                }
                Ok(_) => {
                    tracing::warn!(key = %key, "Cached asset failed verification, purging");
                }
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Cached asset unreadable, purging");
                }
            }
            self.remove_entry(&key);
        }

        let path = self.download_verified(asset, &key).await?;
        self.evict_to_budget();
        Ok(path)
    }

    /// Unpin an asset once the job using it is done.
    pub fn release(&self, sha256: &str) {
        let key = sha256.to_ascii_lowercase();
        let mut index = self.index.lock().expect("cache index poisoned");
        if let Some(entry) = index.entries.get_mut(&key) {
            entry.ref_count = entry.ref_count.saturating_sub(1);
        }
    }

    /// Total bytes currently stored.
    pub fn total_bytes(&self) -> u64 {
        let index = self.index.lock().expect("cache index poisoned");
        index.entries.values().map(|e| e.size).sum()
    }

    /// Whether a key is present (test and observability helper).
    pub fn contains(&self, sha256: &str) -> bool {
        let index = self.index.lock().expect("cache index poisoned");
        index.entries.contains_key(&sha256.to_ascii_lowercase())
    }

    // ---- private helpers ----

    fn key_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut index = self.index.lock().expect("cache index poisoned");
        index
            .key_locks
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    fn lookup(&self, key: &str) -> Option<PathBuf> {
        let index = self.index.lock().expect("cache index poisoned");
        index.entries.get(key).map(|e| e.path.clone())
    }

    fn pin(&self, key: &str) {
        let mut index = self.index.lock().expect("cache index poisoned");
        if let Some(entry) = index.entries.get_mut(key) {
            entry.last_used = SystemTime::now();
            entry.ref_count += 1;
        }
    }

    fn remove_entry(&self, key: &str) {
        let path = {
            let mut index = self.index.lock().expect("cache index poisoned");
            index.entries.remove(key).map(|e| e.path)
        };
        if let Some(path) = path {
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::warn!(path = %path.display(), error = %e, "Failed to remove cached asset");
            }
        }
    }

    async fn hash_of(&self, path: &Path) -> Result<String, CacheError> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || sha256_file(&path))
            .await
            .map_err(|e| CacheError::Download(format!("hash task failed: {e}")))?
            .map_err(CacheError::Io)
    }

    /// Download into tmp, verify, and install under `objects/<key>`.
    ///
    /// Transient fetch errors retry with backoff up to the configured
    /// attempt budget; a hash mismatch retries the download exactly
    /// once.
    async fn download_verified(&self, asset: &AssetRef, key: &str) -> Result<PathBuf, CacheError> {
        let mut backoff = Backoff::new(self.config.backoff.clone());
        let mut fetch_attempts = 0u32;
        let mut mismatch_retried = false;

        loop {
            let tmp = self
                .config
                .root
                .join("tmp")
                .join(uuid::Uuid::new_v4().to_string());

            fetch_attempts += 1;
            match self.fetcher.fetch(&asset.asset_id, &tmp).await {
                Ok(()) => {
                    if self.hash_of(&tmp).await? == key {
                        return self.install(&tmp, key);
                    }

                    let _ = std::fs::remove_file(&tmp);
                    if mismatch_retried {
                        return Err(CacheError::HashMismatch { key: key.to_string() });
                    }
                    mismatch_retried = true;
                    tracing::warn!(
                        asset_id = %asset.asset_id,
                        "Downloaded asset failed verification, retrying once"
                    );
                }
                Err(e) => {
                    let _ = std::fs::remove_file(&tmp);
                    if !e.transient || fetch_attempts >= self.config.download_attempts {
                        return Err(CacheError::Download(e.to_string()));
                    }
                    let delay = backoff.next();
                    tracing::warn!(
                        asset_id = %asset.asset_id,
                        attempt = fetch_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Asset download failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn install(&self, tmp: &Path, key: &str) -> Result<PathBuf, CacheError> {
        let dest = self.config.root.join("objects").join(key);
        let size = std::fs::metadata(tmp)?.len();
        std::fs::rename(tmp, &dest)?;

        // Renderer binaries are launched straight out of the cache.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&dest, std::fs::Permissions::from_mode(0o755))?;
        }

        let mut index = self.index.lock().expect("cache index poisoned");
        index.entries.insert(
            key.to_string(),
            CacheEntry {
                path: dest.clone(),
                size,
                last_used: SystemTime::now(),
                ref_count: 1,
            },
        );
        Ok(dest)
    }

    /// Remove least-recently-used unpinned entries until the store fits
    /// the budget. If only pinned entries remain the overshoot is
    /// tolerated; a running job is never blocked for space. Victims are
    /// chosen under the index lock, their files deleted after it drops.
    fn evict_to_budget(&self) {
        let victims = {
            let mut index = self.index.lock().expect("cache index poisoned");
            let mut total: u64 = index.entries.values().map(|e| e.size).sum();
            if total <= self.config.max_bytes {
                return;
            }

            let mut candidates: Vec<(String, SystemTime)> = index
                .entries
                .iter()
                .filter(|(_, e)| e.ref_count == 0)
                .map(|(key, e)| (key.clone(), e.last_used))
                .collect();
            candidates.sort_by_key(|(_, last_used)| *last_used);

            let mut victims = Vec::new();
            for (key, _) in candidates {
                if total <= self.config.max_bytes {
                    break;
                }
                if let Some(entry) = index.entries.remove(&key) {
                    tracing::debug!(key = %key, size = entry.size, "Evicting cached asset");
                    total -= entry.size;
                    victims.push(entry.path);
                }
            }

            if total > self.config.max_bytes {
                tracing::warn!(
                    total_bytes = total,
                    budget = self.config.max_bytes,
                    "Cache over budget but every entry is in use"
                );
            }
            victims
        };

        for path in victims {
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Failed to remove evicted asset"
                );
            }
        }
    }
}
