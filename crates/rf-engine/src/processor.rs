//! Engine processors: the pipeline, endpoint sends, and content-based
//! routing primitives reified from step definitions.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use rf_core::endpoint::await_completion;
use rf_core::{
    propkeys, CompletionToken, Exchange, Expression, Predicate, Processor, Producer, Result,
    Value,
};

/// Produces the fragments a split step fans out over.
pub type SplitExpression = Arc<dyn Fn(&Exchange) -> Result<Vec<Value>> + Send + Sync>;

/// Split expression over a string body: one fragment per delimiter-separated
/// token.
pub fn tokenize_expression(delimiter: &str) -> SplitExpression {
    let delimiter = delimiter.to_string();
    Arc::new(move |exchange: &Exchange| {
        let body = match exchange.current().body() {
            Some(value) => value.get::<String>().unwrap_or_default(),
            None => String::new(),
        };
        Ok(body
            .split(&delimiter)
            .filter(|t| !t.is_empty())
            .map(Value::from)
            .collect())
    })
}

/// Runs steps in order against one exchange at a time.
///
/// After each step the out message (if any) is promoted to be the next
/// step's in message. A step error or a stop marker short-circuits the
/// remaining steps.
pub struct Pipeline {
    name: String,
    steps: Vec<Arc<dyn Processor>>,
}

impl Pipeline {
    pub fn new(name: impl Into<String>, steps: Vec<Arc<dyn Processor>>) -> Self {
        Self {
            name: name.into(),
            steps,
        }
    }
}

#[async_trait]
impl Processor for Pipeline {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        for step in &self.steps {
            step.process(exchange).await?;
            exchange.promote_out();
            if exchange.is_failed() {
                break;
            }
            if exchange
                .property_as::<bool>(propkeys::ROUTE_STOP)
                .unwrap_or(false)
            {
                debug!(exchange_id = %exchange.id, "Exchange stopped, skipping remaining steps");
                break;
            }
        }
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        for step in &self.steps {
            step.start().await?;
        }
        Ok(())
    }

    async fn stop(&self) {
        // Stop in reverse so downstream steps outlive their feeders.
        for step in self.steps.iter().rev() {
            step.stop().await;
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Sends the exchange to a producer through the completion-token bridge and
/// waits for the outcome, so producers that finish on another thread still
/// hand the exchange back to the route's task.
pub struct SendProcessor {
    uri: String,
    producer: Arc<dyn Producer>,
}

impl SendProcessor {
    pub fn new(uri: impl Into<String>, producer: Arc<dyn Producer>) -> Self {
        Self {
            uri: uri.into(),
            producer,
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }
}

#[async_trait]
impl Processor for SendProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        let (token, rx) = CompletionToken::new(exchange.id.clone());
        self.producer
            .clone()
            .process_async(exchange.clone(), token);
        *exchange = await_completion(rx).await?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.uri
    }
}

pub struct FilterProcessor {
    predicate: Predicate,
    child: Arc<dyn Processor>,
}

impl FilterProcessor {
    pub fn new(predicate: Predicate, child: Arc<dyn Processor>) -> Self {
        Self { predicate, child }
    }
}

#[async_trait]
impl Processor for FilterProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        if (self.predicate)(exchange)? {
            self.child.process(exchange).await
        } else {
            debug!(exchange_id = %exchange.id, "Filter predicate false, exchange filtered out");
            Ok(())
        }
    }

    async fn start(&self) -> Result<()> {
        self.child.start().await
    }

    async fn stop(&self) {
        self.child.stop().await;
    }

    fn name(&self) -> &str {
        "filter"
    }
}

/// First matching branch wins.
pub struct ChoiceProcessor {
    branches: Vec<(Predicate, Arc<dyn Processor>)>,
    otherwise: Option<Arc<dyn Processor>>,
}

impl ChoiceProcessor {
    pub fn new(
        branches: Vec<(Predicate, Arc<dyn Processor>)>,
        otherwise: Option<Arc<dyn Processor>>,
    ) -> Self {
        Self {
            branches,
            otherwise,
        }
    }
}

#[async_trait]
impl Processor for ChoiceProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        for (predicate, branch) in &self.branches {
            if predicate(exchange)? {
                return branch.process(exchange).await;
            }
        }
        match &self.otherwise {
            Some(branch) => branch.process(exchange).await,
            None => {
                debug!(exchange_id = %exchange.id, "No choice branch matched");
                Ok(())
            }
        }
    }

    async fn start(&self) -> Result<()> {
        for (_, branch) in &self.branches {
            branch.start().await?;
        }
        if let Some(branch) = &self.otherwise {
            branch.start().await?;
        }
        Ok(())
    }

    async fn stop(&self) {
        for (_, branch) in &self.branches {
            branch.stop().await;
        }
        if let Some(branch) = &self.otherwise {
            branch.stop().await;
        }
    }

    fn name(&self) -> &str {
        "choice"
    }
}

/// Fans one exchange out into per-fragment child exchanges, processed
/// sequentially. A fragment failure aborts the remaining fragments.
pub struct SplitProcessor {
    expression: SplitExpression,
    child: Arc<dyn Processor>,
}

impl SplitProcessor {
    pub fn new(expression: SplitExpression, child: Arc<dyn Processor>) -> Self {
        Self { expression, child }
    }
}

#[async_trait]
impl Processor for SplitProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        let fragments = (self.expression)(exchange)?;
        let total = fragments.len();
        debug!(exchange_id = %exchange.id, fragments = total, "Splitting exchange");

        for (index, fragment) in fragments.into_iter().enumerate() {
            let mut part = exchange.clone();
            part.in_message_mut().set_body(fragment);
            part.set_property("routeflow.splitIndex", index as i64);
            part.set_property("routeflow.splitSize", total as i64);
            self.child.process(&mut part).await?;
        }
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        self.child.start().await
    }

    async fn stop(&self) {
        self.child.stop().await;
    }

    fn name(&self) -> &str {
        "split"
    }
}

pub struct SetBodyProcessor {
    expression: Expression,
}

impl SetBodyProcessor {
    pub fn new(expression: Expression) -> Self {
        Self { expression }
    }
}

#[async_trait]
impl Processor for SetBodyProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        match (self.expression)(exchange)? {
            Some(value) => exchange.current_mut().set_body(value),
            None => exchange.current_mut().clear_body(),
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "set-body"
    }
}

pub struct SetHeaderProcessor {
    header: String,
    expression: Expression,
}

impl SetHeaderProcessor {
    pub fn new(header: impl Into<String>, expression: Expression) -> Self {
        Self {
            header: header.into(),
            expression,
        }
    }
}

#[async_trait]
impl Processor for SetHeaderProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        match (self.expression)(exchange)? {
            Some(value) => exchange.current_mut().headers.set(self.header.clone(), value),
            None => {
                exchange.current_mut().headers.remove(&self.header);
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "set-header"
    }
}

pub struct LogProcessor {
    message: String,
}

impl LogProcessor {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
impl Processor for LogProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        let body_type = exchange
            .current()
            .body()
            .map(|v| v.type_name())
            .unwrap_or("<none>");
        info!(
            exchange_id = %exchange.id,
            body_type = body_type,
            "{}", self.message
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}

/// Marks the exchange stopped; the enclosing pipeline skips what follows.
pub struct StopProcessor;

#[async_trait]
impl Processor for StopProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        exchange.set_property(propkeys::ROUTE_STOP, true);
        Ok(())
    }

    fn name(&self) -> &str {
        "stop"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rf_core::processor::{constant_expression, header_expression};
    use rf_core::Message;

    struct BodyTag(&'static str);

    #[async_trait]
    impl Processor for BodyTag {
        async fn process(&self, exchange: &mut Exchange) -> Result<()> {
            let body: String = exchange
                .current()
                .body()
                .and_then(|v| v.get())
                .unwrap_or_default();
            let mut out = exchange.current().clone();
            out.set_body(format!("{body}{}", self.0));
            exchange.set_out_message(out);
            Ok(())
        }
    }

    #[tokio::test]
    async fn pipeline_promotes_out_between_steps() {
        let pipeline = Pipeline::new(
            "test",
            vec![Arc::new(BodyTag("-a")) as Arc<dyn Processor>, Arc::new(BodyTag("-b"))],
        );

        let mut exchange = Exchange::with_body("x");
        pipeline.process(&mut exchange).await.unwrap();

        assert_eq!(
            exchange.in_message().body().unwrap().get::<String>().as_deref(),
            Some("x-a-b")
        );
    }

    #[tokio::test]
    async fn stop_short_circuits_pipeline() {
        let pipeline = Pipeline::new(
            "test",
            vec![
                Arc::new(StopProcessor) as Arc<dyn Processor>,
                Arc::new(BodyTag("-never")),
            ],
        );

        let mut exchange = Exchange::with_body("x");
        pipeline.process(&mut exchange).await.unwrap();

        assert_eq!(
            exchange.current().body().unwrap().get::<String>().as_deref(),
            Some("x")
        );
    }

    #[tokio::test]
    async fn set_header_and_body() {
        let pipeline = Pipeline::new(
            "test",
            vec![
                Arc::new(SetHeaderProcessor::new("kind", constant_expression("widget")))
                    as Arc<dyn Processor>,
                Arc::new(SetBodyProcessor::new(header_expression("kind"))),
            ],
        );

        let mut exchange = Exchange::new(Message::with_body("ignored"));
        pipeline.process(&mut exchange).await.unwrap();

        assert_eq!(
            exchange.current().body().unwrap().get::<String>().as_deref(),
            Some("widget")
        );
    }

    #[tokio::test]
    async fn tokenize_splits_string_body() {
        let expression = tokenize_expression(",");
        let exchange = Exchange::with_body("a,b,c");
        let fragments = expression(&exchange).unwrap();
        let parts: Vec<String> = fragments.iter().map(|v| v.get::<String>().unwrap()).collect();
        assert_eq!(parts, vec!["a", "b", "c"]);
    }
}
