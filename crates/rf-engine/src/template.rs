//! Client-side entry point for sending exchanges into endpoints without a
//! route of one's own.

use std::sync::Arc;

use rf_core::endpoint::await_completion;
use rf_core::{
    CompletionToken, EndpointRegistry, Exchange, ExchangePattern, Result,
    TypeConverterRegistry, Value,
};

/// Sends bodies and exchanges to endpoints by uri.
pub struct ProducerTemplate {
    endpoints: Arc<EndpointRegistry>,
    converters: Arc<TypeConverterRegistry>,
}

impl ProducerTemplate {
    pub fn new(
        endpoints: Arc<EndpointRegistry>,
        converters: Arc<TypeConverterRegistry>,
    ) -> Self {
        Self {
            endpoints,
            converters,
        }
    }

    /// Send an exchange to the endpoint and wait for the outcome.
    pub async fn send(&self, uri: &str, exchange: Exchange) -> Result<Exchange> {
        let producer = self.endpoints.resolve(uri)?.create_producer()?;
        let (token, rx) = CompletionToken::new(exchange.id.clone());
        producer.process_async(exchange, token);
        await_completion(rx).await
    }

    /// Fire-and-forget send of a plain body.
    pub async fn send_body(&self, uri: &str, body: impl Into<Value>) -> Result<Exchange> {
        self.send(uri, Exchange::with_body(body)).await
    }

    /// Request/reply: send a body and convert the reply body to `T`.
    pub async fn request_body<T>(&self, uri: &str, body: impl Into<Value>) -> Result<T>
    where
        T: std::any::Any + Clone + Send + Sync,
    {
        let mut exchange = Exchange::with_body(body);
        exchange.pattern = ExchangePattern::InOut;
        let reply = self.send(uri, exchange).await?;
        reply.current().body_as::<T>(&self.converters)
    }
}
