//! Resequencer - restores a defined order among out-of-order arrivals.
//!
//! Batch mode collects a window, sorts it, and emits it in order. Stream mode
//! emits each element as soon as its direct predecessor has been delivered,
//! or once its per-element timeout elapses, bounding latency when a gap never
//! fills. Stream mode needs the comparator's predecessor/successor adjacency
//! primitives, not just ordering, to tell a gap from the next element.

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use rf_core::{Exchange, Expression, Processor, Result, RouteflowError};

/// Ordering and adjacency over exchanges.
pub trait SequenceComparator: Send + Sync {
    /// Reject exchanges with no usable sequence element. Called once on
    /// arrival so `compare` can assume valid inputs.
    fn validate(&self, exchange: &Exchange) -> Result<()>;

    fn compare(&self, a: &Exchange, b: &Exchange) -> CmpOrdering;

    /// True when `a` is the immediate predecessor of `b`.
    fn predecessor(&self, a: &Exchange, b: &Exchange) -> bool;

    /// True when `a` is the immediate successor of `b`.
    fn successor(&self, a: &Exchange, b: &Exchange) -> bool;

    /// True when `exchange` starts its sequence (has no possible
    /// predecessor), letting stream mode release it without waiting for a
    /// timeout. Comparators without start-of-sequence knowledge keep the
    /// default.
    fn is_first(&self, _exchange: &Exchange) -> bool {
        false
    }
}

/// Comparator over an integer sequence element with "n-1" adjacency.
pub struct NumericSequenceComparator {
    expression: Expression,
    start: Option<i64>,
}

impl NumericSequenceComparator {
    pub fn new(expression: Expression) -> Self {
        Self {
            expression,
            start: None,
        }
    }

    /// Declare the first sequence number, enabling immediate release of the
    /// sequence's first element in stream mode.
    pub fn with_start(expression: Expression, start: i64) -> Self {
        Self {
            expression,
            start: Some(start),
        }
    }

    fn sequence_of(&self, exchange: &Exchange) -> Option<i64> {
        let value = (self.expression)(exchange).ok().flatten()?;
        if let Some(n) = value.get::<i64>() {
            return Some(n);
        }
        value.get::<String>().and_then(|s| s.trim().parse().ok())
    }
}

impl SequenceComparator for NumericSequenceComparator {
    fn validate(&self, exchange: &Exchange) -> Result<()> {
        self.sequence_of(exchange).map(|_| ()).ok_or_else(|| {
            RouteflowError::permanent("exchange has no numeric sequence element")
        })
    }

    fn compare(&self, a: &Exchange, b: &Exchange) -> CmpOrdering {
        self.sequence_of(a)
            .unwrap_or(i64::MAX)
            .cmp(&self.sequence_of(b).unwrap_or(i64::MAX))
    }

    fn predecessor(&self, a: &Exchange, b: &Exchange) -> bool {
        match (self.sequence_of(a), self.sequence_of(b)) {
            (Some(a), Some(b)) => a == b - 1,
            _ => false,
        }
    }

    fn successor(&self, a: &Exchange, b: &Exchange) -> bool {
        match (self.sequence_of(a), self.sequence_of(b)) {
            (Some(a), Some(b)) => a == b + 1,
            _ => false,
        }
    }

    fn is_first(&self, exchange: &Exchange) -> bool {
        match (self.sequence_of(exchange), self.start) {
            (Some(n), Some(start)) => n == start,
            _ => false,
        }
    }
}

/// Resequencing mode selector used by route definitions.
#[derive(Debug, Clone, Copy)]
pub enum ResequenceMode {
    Batch {
        size: usize,
        timeout: Duration,
    },
    Stream {
        timeout: Duration,
    },
}

struct PendingElement {
    exchange: Exchange,
    arrived: Instant,
}

#[derive(Default)]
struct StreamState {
    /// Sorted by the comparator, lowest first.
    pending: Vec<PendingElement>,
    last_delivered: Option<Exchange>,
}

struct StreamInner {
    comparator: Arc<dyn SequenceComparator>,
    timeout: Duration,
    sweep_interval: Duration,
    child: Arc<dyn Processor>,
    state: Mutex<StreamState>,
    /// Serializes downstream dispatch so emissions never interleave.
    dispatch: tokio::sync::Mutex<()>,
    shutdown_tx: broadcast::Sender<()>,
}

impl StreamInner {
    /// Pop the head element if it is deliverable. The caller must hold the
    /// dispatch lock; removal happens under the state mutex, so a concurrent
    /// timeout sweep and arrival can never both emit the same element.
    fn pop_deliverable(&self) -> Option<Exchange> {
        let mut state = self.state.lock();
        let head = state.pending.first()?;

        let deliverable = match &state.last_delivered {
            None => {
                self.comparator.is_first(&head.exchange)
                    || head.arrived.elapsed() >= self.timeout
            }
            Some(last) => {
                self.comparator.successor(&head.exchange, last)
                    || self.comparator.compare(&head.exchange, last) == CmpOrdering::Less
                    || head.arrived.elapsed() >= self.timeout
            }
        };

        if !deliverable {
            return None;
        }
        let element = state.pending.remove(0);
        state.last_delivered = Some(element.exchange.clone());
        Some(element.exchange)
    }

    async fn drain(self: &Arc<Self>) -> Result<()> {
        loop {
            let _dispatch = self.dispatch.lock().await;
            let mut exchange = match self.pop_deliverable() {
                Some(e) => e,
                None => return Ok(()),
            };
            debug!(exchange_id = %exchange.id, "Resequencer delivering element");
            self.child.process(&mut exchange).await?;
        }
    }
}

/// Stream-mode resequencer.
pub struct StreamResequencer {
    inner: Arc<StreamInner>,
    sweep_started: AtomicBool,
}

impl StreamResequencer {
    pub fn new(
        comparator: Arc<dyn SequenceComparator>,
        timeout: Duration,
        child: Arc<dyn Processor>,
    ) -> Self {
        let sweep_interval = (timeout / 4).max(Duration::from_millis(10));
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            inner: Arc::new(StreamInner {
                comparator,
                timeout,
                sweep_interval,
                child,
                state: Mutex::new(StreamState::default()),
                dispatch: tokio::sync::Mutex::new(()),
                shutdown_tx,
            }),
            sweep_started: AtomicBool::new(false),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().pending.len()
    }
}

#[async_trait]
impl Processor for StreamResequencer {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        self.inner.comparator.validate(exchange)?;

        {
            let mut state = self.inner.state.lock();
            let position = state
                .pending
                .binary_search_by(|p| {
                    self.inner.comparator.compare(&p.exchange, exchange)
                })
                .unwrap_or_else(|i| i);
            state.pending.insert(
                position,
                PendingElement {
                    exchange: exchange.clone(),
                    arrived: Instant::now(),
                },
            );
        }

        self.inner.drain().await
    }

    async fn start(&self) -> Result<()> {
        self.inner.child.start().await?;

        if !self.sweep_started.swap(true, Ordering::SeqCst) {
            let inner = self.inner.clone();
            let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
            let interval = self.inner.sweep_interval;

            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if let Err(e) = inner.drain().await {
                                error!(error = %e, "Resequencer timeout delivery failed");
                            }
                        }
                        _ = shutdown_rx.recv() => {
                            debug!("Resequencer sweep shutting down");
                            break;
                        }
                    }
                }
            });
            info!(
                timeout = ?self.inner.timeout,
                sweep_interval = ?self.inner.sweep_interval,
                "Started stream resequencer sweep"
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
        "resequence-stream"
    }
}

struct BatchState {
    pending: Vec<Exchange>,
    opened_at: Option<Instant>,
}

struct BatchInner {
    comparator: Arc<dyn SequenceComparator>,
    size: usize,
    timeout: Duration,
    sweep_interval: Duration,
    child: Arc<dyn Processor>,
    state: Mutex<BatchState>,
    dispatch: tokio::sync::Mutex<()>,
    shutdown_tx: broadcast::Sender<()>,
}

impl BatchInner {
    fn take_batch(&self) -> Vec<Exchange> {
        let mut state = self.state.lock();
        state.opened_at = None;
        std::mem::take(&mut state.pending)
    }

    async fn flush(self: &Arc<Self>, mut batch: Vec<Exchange>) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        batch.sort_by(|a, b| self.comparator.compare(a, b));
        let _dispatch = self.dispatch.lock().await;
        debug!(size = batch.len(), "Resequencer flushing batch");
        for mut exchange in batch {
            self.child.process(&mut exchange).await?;
        }
        Ok(())
    }
}

/// Batch-mode resequencer: sort-and-emit windows bounded by size and time.
pub struct BatchResequencer {
    inner: Arc<BatchInner>,
    sweep_started: AtomicBool,
}

impl BatchResequencer {
    pub fn new(
        comparator: Arc<dyn SequenceComparator>,
        size: usize,
        timeout: Duration,
        child: Arc<dyn Processor>,
    ) -> Result<Self> {
        if size == 0 {
            return Err(RouteflowError::Configuration(
                "batch resequencer size must be at least 1".to_string(),
            ));
        }
        let sweep_interval = (timeout / 4).max(Duration::from_millis(10));
        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            inner: Arc::new(BatchInner {
                comparator,
                size,
                timeout,
                sweep_interval,
                child,
                state: Mutex::new(BatchState {
                    pending: Vec::new(),
                    opened_at: None,
                }),
                dispatch: tokio::sync::Mutex::new(()),
                shutdown_tx,
            }),
            sweep_started: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Processor for BatchResequencer {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        self.inner.comparator.validate(exchange)?;

        let full_batch = {
            let mut state = self.inner.state.lock();
            if state.pending.is_empty() {
                state.opened_at = Some(Instant::now());
            }
            state.pending.push(exchange.clone());
            if state.pending.len() >= self.inner.size {
                state.opened_at = None;
                Some(std::mem::take(&mut state.pending))
            } else {
                None
            }
        };

        if let Some(batch) = full_batch {
            self.inner.flush(batch).await?;
        }
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        self.inner.child.start().await?;

        if !self.sweep_started.swap(true, Ordering::SeqCst) {
            let inner = self.inner.clone();
            let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
            let interval = self.inner.sweep_interval;

            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let timed_out = {
                                let state = inner.state.lock();
                                state
                                    .opened_at
                                    .map(|t| t.elapsed() >= inner.timeout)
                                    .unwrap_or(false)
                            };
                            if timed_out {
                                let batch = inner.take_batch();
                                if let Err(e) = inner.flush(batch).await {
                                    error!(error = %e, "Resequencer batch flush failed");
                                }
                            }
                        }
                        _ = shutdown_rx.recv() => {
                            debug!("Batch resequencer sweep shutting down");
                            break;
                        }
                    }
                }
            });
        }
        Ok(())
    }

    async fn stop(&self) {
        let _ = self.inner.shutdown_tx.send(());
        self.sweep_started.store(false, Ordering::SeqCst);
        // Flush whatever is buffered rather than dropping it.
        let batch = self.inner.take_batch();
        if let Err(e) = self.inner.flush(batch).await {
            error!(error = %e, "Resequencer final flush failed");
        }
        self.inner.child.stop().await;
    }

    fn name(&self) -> &str {
        "resequence-batch"
    }
}
