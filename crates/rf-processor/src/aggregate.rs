//! Aggregator - merges exchanges sharing a correlation key.
//!
//! Each incoming exchange is merged into its group by the configured
//! AggregationStrategy under the group's per-key lock; a group is emitted
//! downstream when a completion condition fires. Timeouts are enforced by a
//! background sweep task, not only on arrival.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use rf_core::{
    propkeys, AggregationRepository, Exchange, Expression, Predicate, Processor, Result,
    RouteflowError,
};

use crate::repository::InMemoryAggregationRepository;
use crate::util::eval_key;

/// Merges the accumulated group exchange with a newly arrived one.
///
/// Called exactly once per input exchange. A raised error leaves the group
/// unmodified; the failing exchange is reported through the standard
/// error-handler path alone.
pub trait AggregationStrategy: Send + Sync {
    fn aggregate(&self, old: Option<Exchange>, new: Exchange) -> Result<Exchange>;
}

impl<F> AggregationStrategy for F
where
    F: Fn(Option<Exchange>, Exchange) -> Result<Exchange> + Send + Sync,
{
    fn aggregate(&self, old: Option<Exchange>, new: Exchange) -> Result<Exchange> {
        self(old, new)
    }
}

/// Aggregator configuration. At least one completion condition must be set;
/// this is validated at construction (route-start time).
pub struct AggregateConfig {
    pub correlation: Expression,
    pub completion_size: Option<usize>,
    pub completion_timeout: Option<Duration>,
    pub completion_predicate: Option<Predicate>,
    /// How often the background sweep checks for timed-out groups.
    pub sweep_interval: Duration,
}

impl AggregateConfig {
    pub fn new(correlation: Expression) -> Self {
        Self {
            correlation,
            completion_size: None,
            completion_timeout: None,
            completion_predicate: None,
            sweep_interval: Duration::from_millis(1000),
        }
    }

    pub fn completion_size(mut self, size: usize) -> Self {
        self.completion_size = Some(size);
        self
    }

    pub fn completion_timeout(mut self, timeout: Duration) -> Self {
        self.completion_timeout = Some(timeout);
        self
    }

    pub fn completion_predicate(mut self, predicate: Predicate) -> Self {
        self.completion_predicate = Some(predicate);
        self
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

struct AggregateInner {
    config: AggregateConfig,
    strategy: Arc<dyn AggregationStrategy>,
    repository: Arc<dyn AggregationRepository>,
    child: Arc<dyn Processor>,
    /// Last-update instants per group, consulted by the timeout sweep.
    last_updated: DashMap<String, Instant>,
    shutdown_tx: broadcast::Sender<()>,
}

/// The aggregator processor.
pub struct AggregateProcessor {
    inner: Arc<AggregateInner>,
    sweep_started: AtomicBool,
}

impl AggregateProcessor {
    pub fn new(
        config: AggregateConfig,
        strategy: Arc<dyn AggregationStrategy>,
        child: Arc<dyn Processor>,
    ) -> Result<Self> {
        Self::with_repository(
            config,
            strategy,
            Arc::new(InMemoryAggregationRepository::new()),
            child,
        )
    }

    pub fn with_repository(
        config: AggregateConfig,
        strategy: Arc<dyn AggregationStrategy>,
        repository: Arc<dyn AggregationRepository>,
        child: Arc<dyn Processor>,
    ) -> Result<Self> {
        if config.completion_size.is_none()
            && config.completion_timeout.is_none()
            && config.completion_predicate.is_none()
        {
            return Err(RouteflowError::Configuration(
                "aggregator requires at least one completion condition".to_string(),
            ));
        }
        if config.completion_size == Some(0) {
            return Err(RouteflowError::Configuration(
                "aggregator completion size must be at least 1".to_string(),
            ));
        }
        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            inner: Arc::new(AggregateInner {
                config,
                strategy,
                repository,
                child,
                last_updated: DashMap::new(),
                shutdown_tx,
            }),
            sweep_started: AtomicBool::new(false),
        })
    }

    /// Explicit external completion signal for a group.
    /// Returns false when no group exists for the key.
    pub async fn force_complete(&self, key: &str) -> Result<bool> {
        let lock = self.inner.repository.lock_for(key);
        let _guard = lock.lock().await;
        match self.inner.repository.remove(key).await? {
            Some(group) => {
                self.inner.last_updated.remove(key);
                AggregateInner::emit(&self.inner, key, group, "force").await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl AggregateInner {
    /// First matching completion condition, in priority order.
    fn completed_by(&self, group: &Exchange, size: usize, forced: bool) -> Result<Option<&'static str>> {
        if let Some(predicate) = &self.config.completion_predicate {
            if predicate(group)? {
                return Ok(Some("predicate"));
            }
        }
        if let Some(threshold) = self.config.completion_size {
            if size >= threshold {
                return Ok(Some("size"));
            }
        }
        // Timeout is checked by the background sweep.
        if forced {
            return Ok(Some("force"));
        }
        Ok(None)
    }

    async fn emit(
        inner: &Arc<AggregateInner>,
        key: &str,
        mut group: Exchange,
        completed_by: &'static str,
    ) -> Result<()> {
        group.set_property(propkeys::AGGREGATED_COMPLETED_BY, completed_by);
        debug!(
            correlation_key = %key,
            completed_by = completed_by,
            exchange_id = %group.id,
            "Aggregation group completed"
        );
        inner.child.process(&mut group).await?;
        inner.repository.confirm(key).await?;
        Ok(())
    }

    async fn sweep_timed_out(inner: &Arc<AggregateInner>) {
        let timeout = match inner.config.completion_timeout {
            Some(t) => t,
            None => return,
        };

        let expired: Vec<String> = inner
            .last_updated
            .iter()
            .filter(|e| e.value().elapsed() >= timeout)
            .map(|e| e.key().clone())
            .collect();

        for key in expired {
            let lock = inner.repository.lock_for(&key);
            let _guard = lock.lock().await;

            // Re-check under the lock: the group may have completed or been
            // refreshed since the snapshot.
            let still_expired = inner
                .last_updated
                .get(&key)
                .map(|e| e.value().elapsed() >= timeout)
                .unwrap_or(false);
            if !still_expired {
                continue;
            }

            match inner.repository.remove(&key).await {
                Ok(Some(group)) => {
                    inner.last_updated.remove(&key);
                    if let Err(e) = Self::emit(inner, &key, group, "timeout").await {
                        error!(
                            correlation_key = %key,
                            error = %e,
                            "Failed to emit timed-out aggregation group"
                        );
                    }
                }
                Ok(None) => {
                    inner.last_updated.remove(&key);
                }
                Err(e) => {
                    warn!(correlation_key = %key, error = %e, "Repository error during sweep");
                }
            }
        }
    }
}

#[async_trait]
impl Processor for AggregateProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        let inner = &self.inner;
        let key = eval_key(&inner.config.correlation, exchange, "correlation expression")?;
        let forced = exchange
            .property_as::<bool>(propkeys::AGGREGATION_COMPLETE_GROUP)
            .unwrap_or(false);

        let lock = inner.repository.lock_for(&key);
        let _guard = lock.lock().await;

        let old = inner.repository.get(&key).await?;
        let size = old
            .as_ref()
            .and_then(|g| g.property_as::<i64>(propkeys::AGGREGATED_SIZE))
            .unwrap_or(0) as usize
            + 1;

        // Strategy failure leaves the stored group untouched; only this
        // exchange fails.
        let mut group = inner.strategy.aggregate(old, exchange.clone())?;
        group.set_property(propkeys::AGGREGATED_SIZE, size as i64);
        group.set_property(propkeys::CORRELATION_KEY, key.clone());

        match inner.completed_by(&group, size, forced)? {
            Some(completed_by) => {
                inner.repository.remove(&key).await?;
                inner.last_updated.remove(&key);
                AggregateInner::emit(inner, &key, group, completed_by).await?;
            }
            None => {
                inner.repository.add(&key, group).await?;
                inner.last_updated.insert(key, Instant::now());
            }
        }
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        self.inner.child.start().await?;

        if self.inner.config.completion_timeout.is_some()
            && !self.sweep_started.swap(true, Ordering::SeqCst)
        {
            let inner = self.inner.clone();
            let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
            let interval = self.inner.config.sweep_interval;

            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            AggregateInner::sweep_timed_out(&inner).await;
                        }
                        _ = shutdown_rx.recv() => {
                            debug!("Aggregation timeout sweep shutting down");
                            break;
                        }
                    }
                }
            });
            info!(
                sweep_interval = ?self.inner.config.sweep_interval,
                "Started aggregation timeout sweep"
            );
        }
        Ok(())
    }

    async fn stop(&self) {
        let _ = self.inner.shutdown_tx.send(());
        self.sweep_started.store(false, Ordering::SeqCst);
        self.inner.child.stop().await;
    }

    fn name(&self) -> &str {
        "aggregate"
    }
}
