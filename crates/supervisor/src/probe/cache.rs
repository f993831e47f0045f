//! Read-through probe cache persisted as JSON.
//!
//! Entries are keyed by path and dropped as soon as the file disappears,
//! changes size, or the stored record no longer matches the [`Probe`] schema.
//! Writes go to a sibling temp file that is renamed over the cache.

use super::{FfprobeProber, Probe, ProbeError, Prober};
use log::{debug, info, warn};
use rmbloat_config::ProbeConfig;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::Semaphore;

/// Error type for cache persistence.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Default)]
struct CacheState {
    entries: BTreeMap<String, Value>,
    dirty: usize,
}

/// Probe cache shared by the scanner, the selector and job finishing.
pub struct ProbeCache<P: Prober = FfprobeProber> {
    path: PathBuf,
    prober: Arc<P>,
    flush_every: usize,
    state: Mutex<CacheState>,
}

fn key_of(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Next anomaly value when `requested` is recorded over `current`.
///
/// Any `Er*` request escalates: nothing becomes `Er1`, `ErN` becomes
/// `Er(N+1)` up to `Er9`. Other values replace the current one as given.
pub fn escalate_anomaly(current: Option<&str>, requested: &str) -> String {
    if !requested.starts_with("Er") {
        return requested.to_string();
    }
    let level = current
        .and_then(|a| a.strip_prefix("Er"))
        .and_then(|n| n.parse::<u8>().ok())
        .filter(|n| (1..=9).contains(n));
    match level {
        Some(n) => format!("Er{}", (n + 1).min(9)),
        None => "Er1".to_string(),
    }
}

impl ProbeCache<FfprobeProber> {
    /// Cache at the configured location, probing with ffprobe
    pub fn from_config(config: &ProbeConfig) -> Self {
        Self::load(config.cache_path(), FfprobeProber::new()).with_flush_every(config.flush_every)
    }
}

impl<P: Prober + 'static> ProbeCache<P> {
    /// Open the cache file, starting empty if it is missing or unreadable.
    ///
    /// Stale entries are purged immediately.
    pub fn load(path: impl Into<PathBuf>, prober: P) -> Self {
        let path = path.into();
        let entries = match fs::read(&path) {
            Ok(bytes) => {
                serde_json::from_slice::<BTreeMap<String, Value>>(&bytes).unwrap_or_else(|e| {
                    warn!("cannot parse probe cache {}: {}; starting fresh", path.display(), e);
                    BTreeMap::new()
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                warn!("cannot read probe cache {}: {}; starting fresh", path.display(), e);
                BTreeMap::new()
            }
        };

        let mut state = CacheState { entries, dirty: 0 };
        let keys: Vec<String> = state.entries.keys().cloned().collect();
        for key in keys {
            valid_entry(&mut state, &key);
        }
        debug!(
            "probe cache {} loaded with {} entries ({} purged)",
            path.display(),
            state.entries.len(),
            state.dirty
        );

        Self {
            path,
            prober: Arc::new(prober),
            flush_every: 100,
            state: Mutex::new(state),
        }
    }

    /// Flush automatically once this many entries are dirty
    pub fn with_flush_every(mut self, flush_every: usize) -> Self {
        self.flush_every = flush_every.max(1);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cached probe for `path` if still valid; never runs the prober.
    pub fn lookup(&self, path: &Path) -> Option<Probe> {
        valid_entry(&mut self.lock(), &key_of(path))
    }

    /// Cached probe, or a fresh one that is then cached.
    pub fn get(&self, path: &Path) -> Result<Probe, ProbeError> {
        if let Some(probe) = self.lookup(path) {
            return Ok(probe);
        }
        debug!("probe cache miss for {}", path.display());
        let probe = self.prober.probe(path)?;
        self.insert(path, &probe);
        Ok(probe)
    }

    /// Record an anomaly on an existing entry and flush right away.
    ///
    /// Returns the updated probe, or `None` if the file has no valid entry.
    pub fn set_anomaly(&self, path: &Path, anomaly: &str) -> Option<Probe> {
        let key = key_of(path);
        let mut state = self.lock();
        let mut probe = valid_entry(&mut state, &key)?;

        let next = escalate_anomaly(probe.anomaly.as_deref(), anomaly);
        if probe.anomaly.as_deref() != Some(next.as_str()) {
            info!("{}: anomaly {}", path.display(), next);
            probe.anomaly = Some(next);
            match serde_json::to_value(&probe) {
                Ok(value) => {
                    state.entries.insert(key, value);
                    state.dirty += 1;
                }
                Err(e) => warn!("cannot encode probe for {}: {}", path.display(), e),
            }
            if let Err(e) = self.flush(&mut state) {
                warn!("cannot write probe cache {}: {}", self.path.display(), e);
            }
        }
        Some(probe)
    }

    /// Write the cache if anything changed since the last write.
    pub fn store(&self) -> Result<(), CacheError> {
        let mut state = self.lock();
        self.flush(&mut state)
    }

    /// Probe many files, answering from the cache where possible.
    ///
    /// Misses are probed on blocking threads, at most `workers` at once.
    /// Files that fail to probe are logged and left out of the result.
    pub async fn batch_get_or_probe(
        &self,
        paths: &[PathBuf],
        workers: usize,
    ) -> BTreeMap<PathBuf, Probe> {
        let mut results = BTreeMap::new();
        let mut misses = Vec::new();
        for path in paths {
            match self.lookup(path) {
                Some(probe) => {
                    results.insert(path.clone(), probe);
                }
                None => misses.push(path.clone()),
            }
        }
        if misses.is_empty() {
            return results;
        }

        info!(
            "probing {} files with {} workers",
            misses.len(),
            workers.max(1)
        );
        let semaphore = Arc::new(Semaphore::new(workers.max(1)));
        let mut handles = Vec::with_capacity(misses.len());
        for path in misses {
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            let prober = Arc::clone(&self.prober);
            let target = path.clone();
            let handle = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                prober.probe(&target)
            });
            handles.push((path, handle));
        }

        for (path, handle) in handles {
            match handle.await {
                Ok(Ok(probe)) => {
                    self.insert(&path, &probe);
                    results.insert(path, probe);
                }
                Ok(Err(e)) => warn!("probe failed for {}: {}", path.display(), e),
                Err(e) => warn!("probe task for {} did not finish: {}", path.display(), e),
            }
        }

        if let Err(e) = self.store() {
            warn!("cannot write probe cache {}: {}", self.path.display(), e);
        }
        results
    }

    fn insert(&self, path: &Path, probe: &Probe) {
        let value = match serde_json::to_value(probe) {
            Ok(value) => value,
            Err(e) => {
                warn!("cannot encode probe for {}: {}", path.display(), e);
                return;
            }
        };
        let mut state = self.lock();
        state.entries.insert(key_of(path), value);
        state.dirty += 1;
        if state.dirty >= self.flush_every {
            if let Err(e) = self.flush(&mut state) {
                warn!("cannot write probe cache {}: {}", self.path.display(), e);
            }
        }
    }

    fn flush(&self, state: &mut CacheState) -> Result<(), CacheError> {
        if state.dirty == 0 {
            return Ok(());
        }

        let mut temp = self.path.as_os_str().to_owned();
        temp.push(".tmp");
        let temp = PathBuf::from(temp);

        let written = serde_json::to_vec_pretty(&state.entries)
            .map_err(CacheError::from)
            .and_then(|bytes| fs::write(&temp, bytes).map_err(CacheError::from))
            .and_then(|()| fs::rename(&temp, &self.path).map_err(CacheError::from));
        if written.is_err() && temp.exists() {
            let _ = fs::remove_file(&temp);
        }
        written?;

        debug!("wrote {} probe entries to {}", state.entries.len(), self.path.display());
        state.dirty = 0;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        // A panic while holding the lock leaves only plain data behind.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Valid probe for `key`, purging the entry when it is stale.
fn valid_entry(state: &mut CacheState, key: &str) -> Option<Probe> {
    let current_size = match fs::metadata(key) {
        Ok(meta) => meta.len(),
        Err(_) => {
            if state.entries.remove(key).is_some() {
                state.dirty += 1;
            }
            return None;
        }
    };

    let value = state.entries.get(key)?;
    match serde_json::from_value::<Probe>(value.clone()) {
        Ok(probe) if probe.size_bytes == current_size => Some(probe),
        _ => {
            state.entries.remove(key);
            state.dirty += 1;
            None
        }
    }
}
