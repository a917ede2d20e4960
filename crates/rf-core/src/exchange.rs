use std::collections::HashMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::RouteflowError;
use crate::message::Message;
use crate::value::Value;

/// Message exchange pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangePattern {
    /// Fire-and-forget; no reply expected.
    InOnly,
    /// Request/reply; the out message becomes the reply.
    InOut,
}

/// The unit of work flowing through a route.
///
/// An Exchange is owned exclusively by the task processing it until it reaches
/// a terminal processor; concurrent exchanges never share one. Failures
/// propagate by setting the exception slot, never by unwinding across an
/// async boundary.
#[derive(Debug, Clone)]
pub struct Exchange {
    pub id: String,
    pub pattern: ExchangePattern,
    in_message: Message,
    out_message: Option<Message>,
    properties: HashMap<String, Value>,
    exception: Option<RouteflowError>,
    /// Number of redelivery attempts performed by the error handler.
    pub redelivery_counter: u32,
    /// Set once a failure was fully handled (dead-lettered or onException).
    pub failure_handled: bool,
    /// Uri of the endpoint this exchange originated from, when known.
    pub from_endpoint: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Exchange {
    pub fn new(in_message: Message) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            pattern: ExchangePattern::InOnly,
            in_message,
            out_message: None,
            properties: HashMap::new(),
            exception: None,
            redelivery_counter: 0,
            failure_handled: false,
            from_endpoint: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_body(body: impl Into<Value>) -> Self {
        Self::new(Message::with_body(body))
    }

    pub fn in_message(&self) -> &Message {
        &self.in_message
    }

    pub fn in_message_mut(&mut self) -> &mut Message {
        &mut self.in_message
    }

    pub fn out_message(&self) -> Option<&Message> {
        self.out_message.as_ref()
    }

    pub fn set_out_message(&mut self, message: Message) {
        self.out_message = Some(message);
    }

    /// The current message: the out message when one was produced, otherwise
    /// the in message.
    pub fn current(&self) -> &Message {
        self.out_message.as_ref().unwrap_or(&self.in_message)
    }

    pub fn current_mut(&mut self) -> &mut Message {
        self.out_message.as_mut().unwrap_or(&mut self.in_message)
    }

    /// Promote the out message (if any) to be the in message for the next
    /// processing step.
    pub fn promote_out(&mut self) {
        if let Some(out) = self.out_message.take() {
            self.in_message = out;
        }
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.properties.insert(key.into(), value.into());
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    pub fn property_as<T: std::any::Any + Clone>(&self, key: &str) -> Option<T> {
        self.properties.get(key).and_then(|v| v.get::<T>())
    }

    pub fn remove_property(&mut self, key: &str) -> Option<Value> {
        self.properties.remove(key)
    }

    pub fn set_exception(&mut self, error: RouteflowError) {
        self.exception = Some(error);
    }

    pub fn exception(&self) -> Option<&RouteflowError> {
        self.exception.as_ref()
    }

    pub fn take_exception(&mut self) -> Option<RouteflowError> {
        self.exception.take()
    }

    pub fn is_failed(&self) -> bool {
        self.exception.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_message_becomes_current() {
        let mut exchange = Exchange::with_body("in");
        assert_eq!(exchange.current().body().unwrap().get::<String>().as_deref(), Some("in"));

        exchange.set_out_message(Message::with_body("out"));
        assert_eq!(exchange.current().body().unwrap().get::<String>().as_deref(), Some("out"));

        exchange.promote_out();
        assert!(exchange.out_message().is_none());
        assert_eq!(exchange.in_message().body().unwrap().get::<String>().as_deref(), Some("out"));
    }

    #[test]
    fn exception_slot() {
        let mut exchange = Exchange::with_body(1i64);
        assert!(!exchange.is_failed());

        exchange.set_exception(RouteflowError::transient("boom"));
        assert!(exchange.is_failed());

        let err = exchange.take_exception().unwrap();
        assert!(err.is_retryable());
        assert!(!exchange.is_failed());
    }
}
