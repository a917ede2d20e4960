use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::exchange::Exchange;
use crate::value::Value;

/// The basic unit of route execution: transforms or routes an Exchange.
///
/// Processing within one Exchange is strictly sequential: the engine awaits
/// each processor before advancing. `start`/`stop` are lifecycle hooks for
/// processors holding cross-exchange state (background sweeps, buffers);
/// stateless processors use the no-op defaults.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, exchange: &mut Exchange) -> Result<()>;

    /// Started when the owning route starts, before any exchange flows.
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    /// Stopped when the owning route stops, after in-flight exchanges drain.
    async fn stop(&self) {}

    /// Display name used in logs and failure-context properties.
    fn name(&self) -> &str {
        "processor"
    }
}

/// Evaluates a per-exchange value, e.g. a correlation key or sequence number.
pub type Expression = Arc<dyn Fn(&Exchange) -> Result<Option<Value>> + Send + Sync>;

/// Evaluates a per-exchange condition.
pub type Predicate = Arc<dyn Fn(&Exchange) -> Result<bool> + Send + Sync>;

/// Expression reading a header from the current message.
pub fn header_expression(name: impl Into<String>) -> Expression {
    let name = name.into();
    Arc::new(move |exchange| Ok(exchange.current().headers.get(&name).cloned()))
}

/// Expression returning the current message body.
pub fn body_expression() -> Expression {
    Arc::new(|exchange| Ok(exchange.current().body().cloned()))
}

/// Expression returning a constant.
pub fn constant_expression(value: impl Into<Value>) -> Expression {
    let value = value.into();
    Arc::new(move |_| Ok(Some(value.clone())))
}
