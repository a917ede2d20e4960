//! Idempotent consumer - dedup filter based on a message identity key.
//!
//! Two-phase repository discipline: the key is tentatively marked before
//! processing (eager mode) and only confirmed once downstream processing
//! completes, so a failure rolls the mark back and the message is not lost to
//! premature dedup commit.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use rf_core::{
    propkeys, Exchange, Expression, IdempotentRepository, Processor, Result,
};

use crate::util::eval_key;

/// Idempotent consumer configuration.
pub struct IdempotentConfig {
    pub expression: Expression,
    /// Tentatively mark before processing (default). Non-eager marks only
    /// after successful processing, narrowing the dedup window.
    pub eager: bool,
    /// Suppress duplicates entirely (default). When false, duplicates
    /// continue downstream with the duplicate property set.
    pub skip_duplicate: bool,
}

impl IdempotentConfig {
    pub fn new(expression: Expression) -> Self {
        Self {
            expression,
            eager: true,
            skip_duplicate: true,
        }
    }

    pub fn eager(mut self, eager: bool) -> Self {
        self.eager = eager;
        self
    }

    pub fn skip_duplicate(mut self, skip: bool) -> Self {
        self.skip_duplicate = skip;
        self
    }
}

/// Dedup filter wrapping a child processor.
pub struct IdempotentConsumer {
    config: IdempotentConfig,
    repository: Arc<dyn IdempotentRepository>,
    child: Arc<dyn Processor>,
}

impl IdempotentConsumer {
    pub fn new(
        config: IdempotentConfig,
        repository: Arc<dyn IdempotentRepository>,
        child: Arc<dyn Processor>,
    ) -> Self {
        Self {
            config,
            repository,
            child,
        }
    }

    /// Repository-failure policy: fail-open. A repository outage treats the
    /// exchange as not-a-duplicate so delivery stays at-least-once; the
    /// two-phase bookkeeping is skipped for that exchange.
    async fn tentative_add(&self, key: &str) -> (bool, bool) {
        match self.repository.add(key).await {
            Ok(fresh) => (fresh, true),
            Err(e) => {
                warn!(
                    key = %key,
                    error = %e,
                    "Idempotent repository unavailable, failing open"
                );
                (true, false)
            }
        }
    }
}

#[async_trait]
impl Processor for IdempotentConsumer {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        let key = eval_key(&self.config.expression, exchange, "message id expression")?;

        let (fresh, repo_available) = if self.config.eager {
            self.tentative_add(&key).await
        } else {
            match self.repository.contains(&key).await {
                Ok(seen) => (!seen, true),
                Err(e) => {
                    warn!(
                        key = %key,
                        error = %e,
                        "Idempotent repository unavailable, failing open"
                    );
                    (true, false)
                }
            }
        };

        if !fresh {
            exchange.set_property(propkeys::DUPLICATE_MESSAGE, true);
            if self.config.skip_duplicate {
                debug!(key = %key, exchange_id = %exchange.id, "Duplicate message suppressed");
                return Ok(());
            }
            // Duplicate continues downstream, marked; nothing to confirm.
            return self.child.process(exchange).await;
        }

        match self.child.process(exchange).await {
            Ok(()) => {
                if repo_available {
                    if self.config.eager {
                        if let Err(e) = self.repository.confirm(&key).await {
                            warn!(key = %key, error = %e, "Failed to confirm idempotent key");
                        }
                    } else {
                        // Non-eager: mark and commit only after success.
                        match self.repository.add(&key).await {
                            Ok(_) => {
                                if let Err(e) = self.repository.confirm(&key).await {
                                    warn!(key = %key, error = %e, "Failed to confirm idempotent key");
                                }
                            }
                            Err(e) => {
                                warn!(key = %key, error = %e, "Failed to mark idempotent key");
                            }
                        }
                    }
                }
                Ok(())
            }
            Err(error) => {
                // Roll back the tentative mark so the key is not permanently
                // confirmed for a message that was never processed.
                if repo_available && self.config.eager {
                    if let Err(e) = self.repository.remove(&key).await {
                        warn!(key = %key, error = %e, "Failed to roll back idempotent key");
                    }
                }
                Err(error)
            }
        }
    }

    async fn start(&self) -> Result<()> {
        self.child.start().await
    }

    async fn stop(&self) {
        self.child.stop().await;
    }

    fn name(&self) -> &str {
        "idempotent-consumer"
    }
}
