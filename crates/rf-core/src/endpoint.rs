use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{Result, RouteflowError};
use crate::exchange::Exchange;
use crate::processor::Processor;

/// Completion callback handed to an asynchronous producer.
///
/// Exactly one of {completion, detected drop} must occur per exchange per
/// producer. A second `complete` call is rejected and logged; dropping the
/// token without completing surfaces to the awaiting engine as
/// [`RouteflowError::NoCompletion`]. The engine relies on this to never lose
/// or double-finish an in-flight exchange.
pub struct CompletionToken {
    exchange_id: String,
    tx: Mutex<Option<oneshot::Sender<Result<Exchange>>>>,
}

impl CompletionToken {
    /// Create a token and the receiver the engine awaits on.
    pub fn new(exchange_id: impl Into<String>) -> (Self, oneshot::Receiver<Result<Exchange>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                exchange_id: exchange_id.into(),
                tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    /// Signal completion from whatever thread the asynchronous work finished
    /// on. Returns false if the token was already completed.
    pub fn complete(&self, result: Result<Exchange>) -> bool {
        let tx = self.tx.lock().take();
        match tx {
            Some(tx) => {
                if tx.send(result).is_err() {
                    // Engine gave up waiting (shutdown force-fail); nothing to do.
                    debug!(
                        exchange_id = %self.exchange_id,
                        "Completion receiver dropped before completion"
                    );
                }
                true
            }
            None => {
                warn!(
                    exchange_id = %self.exchange_id,
                    "Duplicate completion ignored"
                );
                false
            }
        }
    }

    pub fn is_completed(&self) -> bool {
        self.tx.lock().is_none()
    }

    pub fn exchange_id(&self) -> &str {
        &self.exchange_id
    }
}

/// Await the engine side of a completion token, mapping a dropped token to
/// [`RouteflowError::NoCompletion`].
pub async fn await_completion(
    rx: oneshot::Receiver<Result<Exchange>>,
) -> Result<Exchange> {
    match rx.await {
        Ok(result) => result,
        Err(_) => Err(RouteflowError::NoCompletion),
    }
}

/// Sends exchanges into an external system.
///
/// Implementations provide the await-based `process`; the callback form
/// `process_async` defaults to bridging through a spawned task and may be
/// overridden by producers with a native completion callback (the two-outcome
/// contract: the token is completed exactly once, from any thread).
#[async_trait]
pub trait Producer: Send + Sync {
    async fn process(&self, exchange: &mut Exchange) -> Result<()>;

    fn process_async(self: Arc<Self>, mut exchange: Exchange, token: CompletionToken)
    where
        Self: 'static,
    {
        tokio::spawn(async move {
            match self.process(&mut exchange).await {
                Ok(()) => token.complete(Ok(exchange)),
                Err(e) => token.complete(Err(e)),
            };
        });
    }
}

/// Lifecycle-managed source of exchanges. A consumer invokes the processor it
/// was created with for each inbound unit of work, wrapped in an Exchange
/// created via the owning endpoint.
#[async_trait]
pub trait Consumer: Send + Sync {
    async fn start(&self) -> Result<()>;
    async fn stop(&self);
}

/// The transport boundary: a named destination that can create producers and
/// consumers.
pub trait Endpoint: Send + Sync {
    fn uri(&self) -> &str;
    fn create_producer(&self) -> Result<Arc<dyn Producer>>;
    fn create_consumer(&self, processor: Arc<dyn Processor>) -> Result<Arc<dyn Consumer>>;
    fn is_singleton(&self) -> bool {
        true
    }
}

/// Uri-keyed endpoint lookup. Resolution failure is a configuration error
/// surfaced at route-start time, never at message time.
pub struct EndpointRegistry {
    endpoints: DashMap<String, Arc<dyn Endpoint>>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self {
            endpoints: DashMap::new(),
        }
    }

    pub fn register(&self, endpoint: Arc<dyn Endpoint>) {
        self.endpoints.insert(endpoint.uri().to_string(), endpoint);
    }

    pub fn resolve(&self, uri: &str) -> Result<Arc<dyn Endpoint>> {
        self.endpoints
            .get(uri)
            .map(|e| e.value().clone())
            .ok_or_else(|| {
                RouteflowError::Configuration(format!("no endpoint registered for uri '{uri}'"))
            })
    }

    pub fn uris(&self) -> Vec<String> {
        self.endpoints.iter().map(|e| e.key().clone()).collect()
    }
}

impl Default for EndpointRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplicate_completion_is_rejected() {
        let (token, rx) = CompletionToken::new("ex-1");

        assert!(token.complete(Ok(Exchange::with_body("first"))));
        assert!(!token.complete(Ok(Exchange::with_body("second"))));
        assert!(token.is_completed());

        let exchange = await_completion(rx).await.unwrap();
        let body = exchange.current().body().unwrap().get::<String>().unwrap();
        assert_eq!(body, "first");
    }

    #[tokio::test]
    async fn dropped_token_surfaces_as_no_completion() {
        let (token, rx) = CompletionToken::new("ex-2");
        drop(token);

        let err = await_completion(rx).await.unwrap_err();
        assert!(matches!(err, RouteflowError::NoCompletion));
    }

    #[tokio::test]
    async fn completion_from_another_thread() {
        let (token, rx) = CompletionToken::new("ex-3");
        let token = Arc::new(token);

        let t = token.clone();
        std::thread::spawn(move || {
            t.complete(Ok(Exchange::with_body("done")));
        });

        let exchange = await_completion(rx).await.unwrap();
        assert_eq!(
            exchange.current().body().unwrap().get::<String>().as_deref(),
            Some("done")
        );
    }
}
