use std::collections::HashMap;

use uuid::Uuid;

use crate::converter::TypeConverterRegistry;
use crate::error::{Result, RouteflowError};
use crate::value::Value;

/// String-keyed header map with case-insensitive lookup.
///
/// Keys are normalized to lowercase for lookup; the original casing of the
/// last write is retained for iteration. Last write wins.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: HashMap<String, (String, Value)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        self.entries
            .insert(name.to_ascii_lowercase(), (name, value.into()));
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries
            .get(&name.to_ascii_lowercase())
            .map(|(_, v)| v)
    }

    /// Typed read with an exact downcast.
    pub fn get_as<T: std::any::Any + Clone>(&self, name: &str) -> Option<T> {
        self.get(name).and_then(|v| v.get::<T>())
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.entries
            .remove(&name.to_ascii_lowercase())
            .map(|(_, v)| v)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&name.to_ascii_lowercase())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.values().map(|(name, v)| (name.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A message carried by an Exchange: a dynamically typed body plus headers.
///
/// The body type is interpreted lazily: readers request a target type via
/// [`Message::body_as`] and conversion happens at read time through the
/// converter registry, never at write time.
#[derive(Debug, Clone)]
pub struct Message {
    pub message_id: String,
    pub headers: Headers,
    body: Option<Value>,
}

impl Message {
    pub fn new() -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            headers: Headers::new(),
            body: None,
        }
    }

    pub fn with_body(body: impl Into<Value>) -> Self {
        let mut msg = Self::new();
        msg.body = Some(body.into());
        msg
    }

    pub fn set_body(&mut self, body: impl Into<Value>) {
        self.body = Some(body.into());
    }

    pub fn clear_body(&mut self) {
        self.body = None;
    }

    pub fn body(&self) -> Option<&Value> {
        self.body.as_ref()
    }

    /// Read the body as `T`, converting through the registry when the stored
    /// type differs. An inconvertible body is a processing exception for the
    /// exchange, not a silent `None`.
    pub fn body_as<T: std::any::Any + Clone + Send + Sync>(
        &self,
        converters: &TypeConverterRegistry,
    ) -> Result<T> {
        let body = self.body.as_ref().ok_or_else(|| {
            RouteflowError::permanent("message has no body")
        })?;
        if let Some(v) = body.get::<T>() {
            return Ok(v);
        }
        match converters.convert_value::<T>(body)? {
            Some(v) => Ok(v),
            None => Err(RouteflowError::Conversion(
                crate::converter::ConversionError::not_convertible(
                    body.type_name(),
                    std::any::type_name::<T>(),
                ),
            )),
        }
    }
}

impl Default for Message {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_are_case_insensitive_last_write_wins() {
        let mut headers = Headers::new();
        headers.set("Content-Type", "text/plain");
        headers.set("content-type", "application/json");

        assert_eq!(headers.len(), 1);
        assert_eq!(
            headers.get_as::<String>("CONTENT-TYPE").as_deref(),
            Some("application/json")
        );
    }

    #[test]
    fn body_as_converts_on_read() {
        let converters = TypeConverterRegistry::with_defaults();
        let msg = Message::with_body("123");

        let n: i64 = msg.body_as(&converters).unwrap();
        assert_eq!(n, 123);
    }

    #[test]
    fn body_as_reports_missing_body() {
        let converters = TypeConverterRegistry::with_defaults();
        let msg = Message::new();

        assert!(msg.body_as::<String>(&converters).is_err());
    }
}
