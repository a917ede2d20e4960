//! The routing context: owns endpoints, converters, route lifecycles, and
//! the in-flight gauge used for graceful shutdown.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use rf_core::{
    Consumer, Endpoint, EndpointRegistry, Exchange, Processor, Result, RouteflowError,
    TypeConverterRegistry,
};

use crate::model::RouteDefinition;
use crate::reifier::{CustomReifyFn, Reifier};
use crate::template::ProducerTemplate;

const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_CONCURRENT_CONSUMERS: usize = 16;

/// A started route.
struct Route {
    id: String,
    from: String,
    root: Arc<dyn Processor>,
    consumer: Arc<dyn Consumer>,
}

/// Owns routes and the registries they resolve against.
///
/// Shutdown is two-phase: consumers stop first so no new exchanges enter,
/// then the context waits for the in-flight gauge to drain before stopping
/// the processor graphs (which may hold buffered state worth flushing).
pub struct RouteflowContext {
    endpoints: Arc<EndpointRegistry>,
    converters: Arc<TypeConverterRegistry>,
    reifier: Reifier,
    definitions: Mutex<Vec<RouteDefinition>>,
    routes: Mutex<Vec<Route>>,
    inflight: Arc<AtomicUsize>,
    accepting: Arc<AtomicBool>,
    shutdown_timeout: Duration,
    concurrent_consumers: usize,
}

impl RouteflowContext {
    pub fn new() -> Self {
        Self {
            endpoints: Arc::new(EndpointRegistry::new()),
            converters: Arc::new(TypeConverterRegistry::with_defaults()),
            reifier: Reifier::new(),
            definitions: Mutex::new(Vec::new()),
            routes: Mutex::new(Vec::new()),
            inflight: Arc::new(AtomicUsize::new(0)),
            accepting: Arc::new(AtomicBool::new(false)),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            concurrent_consumers: DEFAULT_CONCURRENT_CONSUMERS,
        }
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Per-route bound on concurrently processed exchanges.
    pub fn concurrent_consumers(mut self, permits: usize) -> Self {
        self.concurrent_consumers = permits.max(1);
        self
    }

    pub fn endpoints(&self) -> &EndpointRegistry {
        &self.endpoints
    }

    pub fn converters(&self) -> &TypeConverterRegistry {
        &self.converters
    }

    pub fn register_endpoint(&self, endpoint: Arc<dyn Endpoint>) {
        self.endpoints.register(endpoint);
    }

    pub fn register_custom_step(&self, kind: impl Into<String>, reify: CustomReifyFn) {
        self.reifier.register_custom(kind, reify);
    }

    pub fn add_route(&self, definition: RouteDefinition) {
        self.definitions.lock().push(definition);
    }

    pub fn producer_template(&self) -> ProducerTemplate {
        ProducerTemplate::new(self.endpoints.clone(), self.converters.clone())
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight.load(Ordering::SeqCst)
    }

    /// Reify and start every added route. All configuration errors surface
    /// here; no route starts partially.
    pub async fn start(&self) -> Result<()> {
        let definitions = std::mem::take(&mut *self.definitions.lock());

        let mut pending = Vec::with_capacity(definitions.len());
        for definition in &definitions {
            let root = self.reifier.reify(definition, &self.endpoints)?;
            let guarded: Arc<dyn Processor> = Arc::new(InflightProcessor {
                inner: root,
                inflight: self.inflight.clone(),
                accepting: self.accepting.clone(),
                permits: Semaphore::new(self.concurrent_consumers),
            });
            let consumer = self
                .endpoints
                .resolve(&definition.from)?
                .create_consumer(guarded.clone())?;
            pending.push((definition, guarded, consumer));
        }

        self.accepting.store(true, Ordering::SeqCst);

        let mut started = Vec::with_capacity(pending.len());
        for (definition, root, consumer) in pending {
            root.start().await?;
            consumer.start().await?;
            info!(route_id = %definition.id, from = %definition.from, "Route started");
            started.push(Route {
                id: definition.id.clone(),
                from: definition.from.clone(),
                root,
                consumer,
            });
        }
        self.routes.lock().extend(started);
        Ok(())
    }

    /// Stop consumers, drain in-flight exchanges, then stop the processors.
    pub async fn stop(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        let routes = std::mem::take(&mut *self.routes.lock());

        for route in &routes {
            route.consumer.stop().await;
            info!(route_id = %route.id, from = %route.from, "Route consumer stopped");
        }

        let deadline = Instant::now() + self.shutdown_timeout;
        loop {
            let remaining = self.inflight.load(Ordering::SeqCst);
            if remaining == 0 {
                break;
            }
            if Instant::now() >= deadline {
                warn!(
                    inflight = remaining,
                    timeout = ?self.shutdown_timeout,
                    "Shutdown timeout reached with exchanges still in flight"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        for route in &routes {
            route.root.stop().await;
        }
        info!(routes = routes.len(), "Context stopped");
    }
}

impl Default for RouteflowContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounds route concurrency, tracks in-flight exchanges, and refuses new
/// ones once shutdown began.
struct InflightProcessor {
    inner: Arc<dyn Processor>,
    inflight: Arc<AtomicUsize>,
    accepting: Arc<AtomicBool>,
    permits: Semaphore,
}

#[async_trait]
impl Processor for InflightProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(RouteflowError::ShutdownInProgress);
        }
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| RouteflowError::ShutdownInProgress)?;
        self.inflight.fetch_add(1, Ordering::SeqCst);
        let result = self.inner.process(exchange).await;
        self.inflight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn start(&self) -> Result<()> {
        self.inner.start().await
    }

    async fn stop(&self) {
        self.inner.stop().await;
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}
