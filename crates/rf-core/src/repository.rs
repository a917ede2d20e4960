use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::exchange::Exchange;

/// Pluggable store for aggregation groups, keyed by correlation key.
///
/// The default implementation is in-memory; a durable backing store makes
/// aggregation survive a process restart. Per-key read-modify-write must be
/// effectively atomic: callers take the key's lock from `lock_for` around
/// get/add/remove so concurrent arrivals for the same correlation key never
/// lose updates.
#[async_trait]
pub trait AggregationRepository: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Exchange>>;

    /// Store the aggregated exchange for `key`, returning the previous value.
    async fn add(&self, key: &str, exchange: Exchange) -> Result<Option<Exchange>>;

    /// Remove and return the group for `key`, typically on completion.
    async fn remove(&self, key: &str) -> Result<Option<Exchange>>;

    /// Acknowledge that the emitted exchange completed downstream; durable
    /// stores may discard recovery state here.
    async fn confirm(&self, key: &str) -> Result<()>;

    async fn keys(&self) -> Result<Vec<String>>;

    /// Per-key lock giving single-writer-per-key discipline.
    fn lock_for(&self, key: &str) -> Arc<tokio::sync::Mutex<()>>;
}

/// Pluggable dedup store with two-phase semantics.
///
/// `add` is a tentative mark; `confirm` commits it once downstream processing
/// succeeded; `remove` rolls the mark back after a downstream failure so the
/// message is not permanently marked as seen before it was actually handled.
#[async_trait]
pub trait IdempotentRepository: Send + Sync {
    /// Tentatively mark `key`. Returns false when the key is already present
    /// (duplicate).
    async fn add(&self, key: &str) -> Result<bool>;

    async fn contains(&self, key: &str) -> Result<bool>;

    /// Commit the tentative mark. Returns false if the key was not present.
    async fn confirm(&self, key: &str) -> Result<bool>;

    /// Roll back a tentative mark. Returns false if the key was not present.
    async fn remove(&self, key: &str) -> Result<bool>;
}
