//! In-process endpoints: direct (synchronous in-memory hand-off), mock
//! (assertion sink for tests), and log.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tracing::{debug, info};

use rf_core::{
    Consumer, Endpoint, Exchange, Processor, Producer, Result, RouteflowError,
};

/// Shared side of a direct endpoint: the consumer's processor, when one is
/// attached and started.
struct DirectState {
    uri: String,
    processor: RwLock<Option<Arc<dyn Processor>>>,
    active: AtomicBool,
}

/// Synchronous in-memory endpoint. A producer invokes the attached
/// consumer's processor inline on the caller's task.
pub struct DirectEndpoint {
    state: Arc<DirectState>,
}

impl DirectEndpoint {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            state: Arc::new(DirectState {
                uri: uri.into(),
                processor: RwLock::new(None),
                active: AtomicBool::new(false),
            }),
        }
    }
}

impl Endpoint for DirectEndpoint {
    fn uri(&self) -> &str {
        &self.state.uri
    }

    fn create_producer(&self) -> Result<Arc<dyn Producer>> {
        Ok(Arc::new(DirectProducer {
            state: self.state.clone(),
        }))
    }

    fn create_consumer(&self, processor: Arc<dyn Processor>) -> Result<Arc<dyn Consumer>> {
        *self.state.processor.write() = Some(processor);
        Ok(Arc::new(DirectConsumer {
            state: self.state.clone(),
        }))
    }
}

struct DirectProducer {
    state: Arc<DirectState>,
}

#[async_trait]
impl Producer for DirectProducer {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        if !self.state.active.load(Ordering::SeqCst) {
            // Transient: a consumer may attach later; the error handler may
            // retry the send.
            return Err(RouteflowError::transient(format!(
                "no active consumer on '{}'",
                self.state.uri
            )));
        }
        let processor = self.state.processor.read().clone();
        match processor {
            Some(processor) => processor.process(exchange).await,
            None => Err(RouteflowError::transient(format!(
                "no active consumer on '{}'",
                self.state.uri
            ))),
        }
    }
}

struct DirectConsumer {
    state: Arc<DirectState>,
}

#[async_trait]
impl Consumer for DirectConsumer {
    async fn start(&self) -> Result<()> {
        self.state.active.store(true, Ordering::SeqCst);
        debug!(uri = %self.state.uri, "Direct consumer started");
        Ok(())
    }

    async fn stop(&self) {
        self.state.active.store(false, Ordering::SeqCst);
        debug!(uri = %self.state.uri, "Direct consumer stopped");
    }
}

struct MockState {
    uri: String,
    received: Mutex<Vec<Exchange>>,
    notify: Notify,
}

/// Terminal endpoint recording everything sent to it, for assertions.
pub struct MockEndpoint {
    state: Arc<MockState>,
}

impl MockEndpoint {
    pub fn new(uri: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(MockState {
                uri: uri.into(),
                received: Mutex::new(Vec::new()),
                notify: Notify::new(),
            }),
        })
    }

    pub fn received(&self) -> Vec<Exchange> {
        self.state.received.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.state.received.lock().len()
    }

    pub fn reset(&self) {
        self.state.received.lock().clear();
    }

    /// Wait until at least `expected` exchanges arrived.
    pub async fn await_count(&self, expected: usize, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.count() >= expected {
                return Ok(());
            }
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or_else(|| {
                    RouteflowError::transient(format!(
                        "timed out waiting for {expected} exchanges on '{}', got {}",
                        self.state.uri,
                        self.count()
                    ))
                })?;
            let _ = tokio::time::timeout(remaining, self.state.notify.notified()).await;
        }
    }
}

impl Endpoint for MockEndpoint {
    fn uri(&self) -> &str {
        &self.state.uri
    }

    fn create_producer(&self) -> Result<Arc<dyn Producer>> {
        Ok(Arc::new(MockProducer {
            state: self.state.clone(),
        }))
    }

    fn create_consumer(&self, _processor: Arc<dyn Processor>) -> Result<Arc<dyn Consumer>> {
        Err(RouteflowError::Configuration(format!(
            "mock endpoint '{}' cannot consume",
            self.state.uri
        )))
    }
}

struct MockProducer {
    state: Arc<MockState>,
}

#[async_trait]
impl Producer for MockProducer {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        self.state.received.lock().push(exchange.clone());
        self.state.notify.notify_waiters();
        Ok(())
    }
}

/// Terminal endpoint that logs each exchange at info level.
pub struct LogEndpoint {
    uri: String,
}

impl LogEndpoint {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }
}

impl Endpoint for LogEndpoint {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn create_producer(&self) -> Result<Arc<dyn Producer>> {
        Ok(Arc::new(LogProducer {
            uri: self.uri.clone(),
        }))
    }

    fn create_consumer(&self, _processor: Arc<dyn Processor>) -> Result<Arc<dyn Consumer>> {
        Err(RouteflowError::Configuration(format!(
            "log endpoint '{}' cannot consume",
            self.uri
        )))
    }
}

struct LogProducer {
    uri: String,
}

#[async_trait]
impl Producer for LogProducer {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        let body_type = exchange
            .current()
            .body()
            .map(|v| v.type_name())
            .unwrap_or("<none>");
        info!(
            uri = %self.uri,
            exchange_id = %exchange.id,
            body_type = body_type,
            "Exchange received"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl Processor for Echo {
        async fn process(&self, _exchange: &mut Exchange) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn direct_send_fails_without_started_consumer() {
        let endpoint = DirectEndpoint::new("direct:orphan");
        let producer = endpoint.create_producer().unwrap();

        let mut exchange = Exchange::with_body("x");
        let err = producer.process(&mut exchange).await.unwrap_err();
        assert!(err.is_retryable());

        let consumer = endpoint.create_consumer(Arc::new(Echo)).unwrap();
        consumer.start().await.unwrap();
        producer.process(&mut exchange).await.unwrap();

        consumer.stop().await;
        assert!(producer.process(&mut exchange).await.is_err());
    }

    #[tokio::test]
    async fn mock_records_and_awaits() {
        let mock = MockEndpoint::new("mock:out");
        let producer = mock.create_producer().unwrap();

        let mut exchange = Exchange::with_body("hello");
        producer.process(&mut exchange).await.unwrap();

        mock.await_count(1, Duration::from_millis(100)).await.unwrap();
        assert_eq!(mock.count(), 1);
        assert!(mock
            .await_count(2, Duration::from_millis(50))
            .await
            .is_err());
    }
}
