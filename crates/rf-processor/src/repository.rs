//! Default repository implementations.
//!
//! In-memory variants back the processors out of the box; the file-backed
//! idempotent repository gives durable dedup across restarts.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use rf_core::{
    AggregationRepository, Exchange, IdempotentRepository, Result, RouteflowError,
};

/// In-memory aggregation repository with per-key locks.
pub struct InMemoryAggregationRepository {
    groups: DashMap<String, Exchange>,
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl InMemoryAggregationRepository {
    pub fn new() -> Self {
        Self {
            groups: DashMap::new(),
            locks: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

impl Default for InMemoryAggregationRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AggregationRepository for InMemoryAggregationRepository {
    async fn get(&self, key: &str) -> Result<Option<Exchange>> {
        Ok(self.groups.get(key).map(|e| e.value().clone()))
    }

    async fn add(&self, key: &str, exchange: Exchange) -> Result<Option<Exchange>> {
        Ok(self.groups.insert(key.to_string(), exchange))
    }

    async fn remove(&self, key: &str) -> Result<Option<Exchange>> {
        Ok(self.groups.remove(key).map(|(_, e)| e))
    }

    async fn confirm(&self, key: &str) -> Result<()> {
        // Nothing to recover for an in-memory store; drop the key's lock
        // entry so idle keys do not accumulate.
        self.locks.remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.groups.iter().map(|e| e.key().clone()).collect())
    }

    fn lock_for(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

/// Entry state inside the idempotent stores: tentative until confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MarkState {
    Tentative,
    Confirmed,
}

/// In-memory bounded idempotent repository.
///
/// Insertion order doubles as eviction order: once over capacity the oldest
/// confirmed entry is dropped first (tentative marks belong to in-flight
/// exchanges and are only evicted when nothing confirmed remains).
pub struct InMemoryIdempotentRepository {
    entries: Mutex<IndexMap<String, MarkState>>,
    capacity: usize,
}

impl InMemoryIdempotentRepository {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(IndexMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn evict_overflow(entries: &mut IndexMap<String, MarkState>, capacity: usize) {
        while entries.len() > capacity {
            let victim = entries
                .iter()
                .position(|(_, state)| *state == MarkState::Confirmed)
                .unwrap_or(0);
            let (key, _) = entries
                .shift_remove_index(victim)
                .expect("non-empty map has an entry at a valid index");
            debug!(key = %key, "Evicted idempotent entry over capacity");
        }
    }
}

#[async_trait]
impl IdempotentRepository for InMemoryIdempotentRepository {
    async fn add(&self, key: &str) -> Result<bool> {
        let mut entries = self.entries.lock();
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.to_string(), MarkState::Tentative);
        Self::evict_overflow(&mut entries, self.capacity);
        Ok(true)
    }

    async fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.entries.lock().contains_key(key))
    }

    async fn confirm(&self, key: &str) -> Result<bool> {
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(state) => {
                *state = MarkState::Confirmed;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        Ok(self.entries.lock().shift_remove(key).is_some())
    }
}

const DEFAULT_MAX_FILE_SIZE: u64 = 1024 * 1000;

/// File-backed idempotent repository: a first-level in-memory cache plus an
/// append-only file of confirmed keys, reloaded at startup.
///
/// Only confirmed keys reach the file; tentative marks live in memory so a
/// crash before confirm never persists an unprocessed key. When the file
/// outgrows `max_file_size` it is truncated and rewritten from the cache.
pub struct FileIdempotentRepository {
    path: PathBuf,
    max_file_size: u64,
    entries: Mutex<IndexMap<String, MarkState>>,
}

impl FileIdempotentRepository {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_max_file_size(path, DEFAULT_MAX_FILE_SIZE)
    }

    pub fn with_max_file_size(path: impl AsRef<Path>, max_file_size: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut entries = IndexMap::new();

        if path.exists() {
            let file = File::open(&path).map_err(Self::io_error)?;
            for line in BufReader::new(file).lines() {
                let line = line.map_err(Self::io_error)?;
                if !line.is_empty() {
                    entries.insert(line, MarkState::Confirmed);
                }
            }
            debug!(path = %path.display(), keys = entries.len(), "Loaded idempotent store");
        }

        Ok(Self {
            path,
            max_file_size,
            entries: Mutex::new(entries),
        })
    }

    fn io_error(e: std::io::Error) -> RouteflowError {
        RouteflowError::Repository(e.to_string())
    }

    fn append_key(&self, key: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(Self::io_error)?;
        writeln!(file, "{key}").map_err(Self::io_error)?;

        let size = file.metadata().map_err(Self::io_error)?.len();
        if size > self.max_file_size {
            warn!(
                path = %self.path.display(),
                size = size,
                max = self.max_file_size,
                "Idempotent store over size limit, rewriting"
            );
            self.rewrite()?;
        }
        Ok(())
    }

    /// Rewrite the file from the cache's confirmed entries. Must not be
    /// called with the entries lock held.
    fn rewrite(&self) -> Result<()> {
        let entries = self.entries.lock();
        let mut file = File::create(&self.path).map_err(Self::io_error)?;
        for (key, state) in entries.iter() {
            if *state == MarkState::Confirmed {
                writeln!(file, "{key}").map_err(Self::io_error)?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl IdempotentRepository for FileIdempotentRepository {
    async fn add(&self, key: &str) -> Result<bool> {
        let mut entries = self.entries.lock();
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.to_string(), MarkState::Tentative);
        Ok(true)
    }

    async fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.entries.lock().contains_key(key))
    }

    async fn confirm(&self, key: &str) -> Result<bool> {
        let known = {
            let mut entries = self.entries.lock();
            match entries.get_mut(key) {
                Some(state) => {
                    *state = MarkState::Confirmed;
                    true
                }
                None => false,
            }
        };
        if known {
            self.append_key(key)?;
        }
        Ok(known)
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        let was_confirmed = {
            let mut entries = self.entries.lock();
            match entries.shift_remove(key) {
                Some(state) => state == MarkState::Confirmed,
                None => return Ok(false),
            }
        };
        if was_confirmed {
            self.rewrite()?;
        }
        Ok(true)
    }
}
