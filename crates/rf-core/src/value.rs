use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

/// A dynamically typed value carried in message bodies, headers, and exchange
/// properties.
///
/// Values are cheap to clone (the payload is behind an `Arc`) so exchanges can
/// be snapshotted for aggregation repositories and dead-letter channels
/// without copying payloads. Readers that need a concrete type go through
/// [`Value::get`] for an exact downcast, or through the type converter
/// registry for a lazy conversion.
#[derive(Clone)]
pub struct Value {
    inner: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl Value {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            inner: Arc::new(value),
            type_name: std::any::type_name::<T>(),
        }
    }

    pub fn from_arc<T: Any + Send + Sync>(value: Arc<T>) -> Self {
        Self {
            inner: value,
            type_name: std::any::type_name::<T>(),
        }
    }

    /// Exact-type read. Returns `None` when the stored type differs; use the
    /// converter registry when a conversion is acceptable.
    pub fn get<T: Any + Clone>(&self) -> Option<T> {
        self.inner.downcast_ref::<T>().cloned()
    }

    pub fn get_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }

    pub fn is<T: Any>(&self) -> bool {
        self.inner.as_ref().type_id() == TypeId::of::<T>()
    }

    pub fn type_id(&self) -> TypeId {
        self.inner.as_ref().type_id()
    }

    /// Diagnostic name of the stored type, as captured at construction.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self.inner.as_ref()
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Value<{}>", self.type_name)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::new(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::new(s)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::new(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::new(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::new(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::new(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_downcast() {
        let v = Value::new(42i64);
        assert_eq!(v.get::<i64>(), Some(42));
        assert_eq!(v.get::<String>(), None);
        assert!(v.is::<i64>());
    }

    #[test]
    fn clone_shares_payload() {
        let v = Value::new("payload".to_string());
        let w = v.clone();
        assert_eq!(w.get::<String>().as_deref(), Some("payload"));
    }
}
