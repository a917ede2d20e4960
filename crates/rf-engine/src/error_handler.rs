//! Redelivery error handler with dead-lettering and per-exception overrides.
//!
//! Failures surface as an exception on the exchange (or an error from the
//! wrapped processor); the handler owns the retry loop so the consumer that
//! fed the route only ever sees the final outcome.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::{debug, error, info, warn};

use rf_core::endpoint::await_completion;
use rf_core::{
    propkeys, CompletionToken, Exchange, Processor, Producer, Result, RouteflowError,
};

/// When and how often a failed exchange is redelivered.
#[derive(Debug, Clone)]
pub struct RedeliveryPolicy {
    pub maximum_redeliveries: u32,
    pub redelivery_delay: Duration,
    pub backoff_multiplier: f64,
    pub maximum_redelivery_delay: Duration,
    pub use_jitter: bool,
    /// Which errors may be redelivered at all. Non-retryable errors skip the
    /// retry loop and go straight to the exhausted path.
    pub retryable: fn(&RouteflowError) -> bool,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            maximum_redeliveries: 0,
            redelivery_delay: Duration::from_millis(1000),
            backoff_multiplier: 1.0,
            maximum_redelivery_delay: Duration::from_secs(60),
            use_jitter: false,
            retryable: RouteflowError::is_retryable,
        }
    }
}

impl RedeliveryPolicy {
    pub fn maximum_redeliveries(mut self, max: u32) -> Self {
        self.maximum_redeliveries = max;
        self
    }

    pub fn redelivery_delay(mut self, delay: Duration) -> Self {
        self.redelivery_delay = delay;
        self
    }

    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn maximum_redelivery_delay(mut self, max: Duration) -> Self {
        self.maximum_redelivery_delay = max;
        self
    }

    pub fn use_jitter(mut self, jitter: bool) -> Self {
        self.use_jitter = jitter;
        self
    }

    pub fn retryable(mut self, retryable: fn(&RouteflowError) -> bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Whether another redelivery is allowed after `counter` attempts.
    pub fn should_redeliver(&self, counter: u32, maximum: u32) -> bool {
        counter < maximum
    }

    /// Delay before redelivery attempt `counter` (1-based), with exponential
    /// backoff capped at the maximum and optional jitter.
    pub fn delay_for(&self, counter: u32) -> Duration {
        let exponent = counter.saturating_sub(1).min(32);
        let factor = self.backoff_multiplier.max(1.0).powi(exponent as i32);
        let base = self.redelivery_delay.as_millis() as f64 * factor;
        let capped = base.min(self.maximum_redelivery_delay.as_millis() as f64);
        let jittered = if self.use_jitter {
            capped * rand::thread_rng().gen_range(0.75..=1.25)
        } else {
            capped
        };
        Duration::from_millis(jittered as u64)
    }
}

/// A reified onException clause: an error matcher plus its handling override.
pub struct OnExceptionClause {
    pub matches: Arc<dyn Fn(&RouteflowError) -> bool + Send + Sync>,
    pub handled: bool,
    pub maximum_redeliveries: Option<u32>,
    pub steps: Option<Arc<dyn Processor>>,
}

/// Wraps the route pipeline with the redelivery loop.
pub struct RedeliveryErrorHandler {
    inner: Arc<dyn Processor>,
    policy: RedeliveryPolicy,
    dead_letter: Option<(String, Arc<dyn Producer>)>,
    on_exceptions: Vec<OnExceptionClause>,
}

impl RedeliveryErrorHandler {
    pub fn new(
        inner: Arc<dyn Processor>,
        policy: RedeliveryPolicy,
        dead_letter: Option<(String, Arc<dyn Producer>)>,
        on_exceptions: Vec<OnExceptionClause>,
    ) -> Self {
        Self {
            inner,
            policy,
            dead_letter,
            on_exceptions,
        }
    }

    fn clause_for(&self, error: &RouteflowError) -> Option<&OnExceptionClause> {
        self.on_exceptions.iter().find(|c| (c.matches)(error))
    }

    /// Send a copy of the failed exchange, exception attached, to the dead
    /// letter endpoint. The original exchange is then considered handled.
    async fn dead_letter(
        &self,
        exchange: &mut Exchange,
        error: RouteflowError,
    ) -> Result<()> {
        let (uri, producer) = match &self.dead_letter {
            Some(dl) => dl,
            None => {
                exchange.set_exception(error.clone());
                return Err(error);
            }
        };

        exchange.set_property(propkeys::FAILURE_ENDPOINT, uri.clone());
        exchange.set_property(
            propkeys::FAILURE_REDELIVERY_COUNTER,
            exchange.redelivery_counter as i64,
        );
        exchange.set_property(propkeys::FAILURE_PROCESSOR, self.inner.name().to_string());

        let mut dead = exchange.clone();
        dead.set_exception(error.clone());

        let (token, rx) = CompletionToken::new(dead.id.clone());
        producer.clone().process_async(dead, token);
        match await_completion(rx).await {
            Ok(_) => {
                warn!(
                    exchange_id = %exchange.id,
                    dead_letter = %uri,
                    error = %error,
                    redeliveries = exchange.redelivery_counter,
                    "Exchange moved to dead letter endpoint"
                );
                exchange.failure_handled = true;
                Ok(())
            }
            Err(dl_error) => {
                error!(
                    exchange_id = %exchange.id,
                    dead_letter = %uri,
                    error = %dl_error,
                    "Dead letter delivery failed"
                );
                exchange.set_exception(error);
                Err(RouteflowError::DeadLetterFailed(dl_error.to_string()))
            }
        }
    }
}

#[async_trait]
impl Processor for RedeliveryErrorHandler {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        loop {
            let error = match self.inner.process(exchange).await {
                Ok(()) => match exchange.take_exception() {
                    None => return Ok(()),
                    Some(e) => e,
                },
                Err(e) => {
                    exchange.take_exception();
                    e
                }
            };

            let clause = self.clause_for(&error);
            let maximum = clause
                .and_then(|c| c.maximum_redeliveries)
                .unwrap_or(self.policy.maximum_redeliveries);

            if (self.policy.retryable)(&error)
                && self
                    .policy
                    .should_redeliver(exchange.redelivery_counter, maximum)
            {
                exchange.redelivery_counter += 1;
                let delay = self.policy.delay_for(exchange.redelivery_counter);
                debug!(
                    exchange_id = %exchange.id,
                    attempt = exchange.redelivery_counter,
                    max = maximum,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Redelivering exchange"
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            // Redeliveries exhausted (or none allowed).
            if let Some(clause) = clause {
                if clause.handled {
                    if let Some(steps) = &clause.steps {
                        exchange.set_exception(error.clone());
                        steps.process(exchange).await?;
                        exchange.take_exception();
                    }
                    info!(
                        exchange_id = %exchange.id,
                        error = %error,
                        "Exception handled by onException clause"
                    );
                    exchange.failure_handled = true;
                    return Ok(());
                }
            }

            return self.dead_letter(exchange, error).await;
        }
    }

    async fn start(&self) -> Result<()> {
        self.inner.start().await
    }

    async fn stop(&self) {
        self.inner.stop().await;
    }

    fn name(&self) -> &str {
        "error-handler"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails every invocation with a permanent error.
    struct PermanentFailure {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Processor for PermanentFailure {
        async fn process(&self, _exchange: &mut Exchange) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(RouteflowError::permanent("malformed payload"))
        }
    }

    #[tokio::test]
    async fn permanent_error_is_never_redelivered() {
        let child = Arc::new(PermanentFailure {
            calls: AtomicUsize::new(0),
        });
        let handler = RedeliveryErrorHandler::new(
            child.clone(),
            RedeliveryPolicy::default()
                .maximum_redeliveries(3)
                .redelivery_delay(Duration::from_millis(1)),
            None,
            Vec::new(),
        );

        let mut exchange = Exchange::with_body("x");
        let err = handler.process(&mut exchange).await.unwrap_err();

        assert!(!err.is_retryable());
        // One attempt, no retries: permanent errors skip the redelivery loop.
        assert_eq!(child.calls.load(Ordering::SeqCst), 1);
        assert_eq!(exchange.redelivery_counter, 0);
    }

    #[tokio::test]
    async fn custom_retryable_classification_overrides_default() {
        let child = Arc::new(PermanentFailure {
            calls: AtomicUsize::new(0),
        });
        let handler = RedeliveryErrorHandler::new(
            child.clone(),
            RedeliveryPolicy::default()
                .maximum_redeliveries(2)
                .redelivery_delay(Duration::from_millis(1))
                .retryable(|_| true),
            None,
            Vec::new(),
        );

        let mut exchange = Exchange::with_body("x");
        assert!(handler.process(&mut exchange).await.is_err());

        assert_eq!(child.calls.load(Ordering::SeqCst), 3);
        assert_eq!(exchange.redelivery_counter, 2);
    }

    #[test]
    fn backoff_caps_at_maximum_delay() {
        let policy = RedeliveryPolicy::default()
            .redelivery_delay(Duration::from_millis(100))
            .backoff_multiplier(10.0)
            .maximum_redelivery_delay(Duration::from_millis(500));

        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(500));
        assert_eq!(policy.delay_for(5), Duration::from_millis(500));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RedeliveryPolicy::default()
            .redelivery_delay(Duration::from_millis(100))
            .use_jitter(true);

        for _ in 0..100 {
            let delay = policy.delay_for(1);
            assert!(delay >= Duration::from_millis(75));
            assert!(delay <= Duration::from_millis(125));
        }
    }

    #[test]
    fn should_redeliver_respects_counter() {
        let policy = RedeliveryPolicy::default();
        assert!(policy.should_redeliver(0, 3));
        assert!(policy.should_redeliver(2, 3));
        assert!(!policy.should_redeliver(3, 3));
        assert!(!policy.should_redeliver(0, 0));
    }
}
