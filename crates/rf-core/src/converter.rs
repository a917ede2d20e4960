use std::any::{Any, TypeId};
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::value::Value;

/// Failure modes of a type conversion.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConversionError {
    #[error("no type converter available from {from} to {to}")]
    NotConvertible { from: String, to: String },

    #[error("type conversion from {from} to {to} failed: {message}")]
    Failed {
        from: String,
        to: String,
        message: String,
    },
}

impl ConversionError {
    pub fn not_convertible(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::NotConvertible { from: from.into(), to: to.into() }
    }

    pub fn failed(
        from: impl Into<String>,
        to: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Failed {
            from: from.into(),
            to: to.into(),
            message: message.into(),
        }
    }
}

type ConverterFn =
    Arc<dyn Fn(&TypeConverterRegistry, &Value) -> Result<Value, ConversionError> + Send + Sync>;

type FallbackFn = Arc<
    dyn Fn(&TypeConverterRegistry, TypeId, &Value) -> Result<Option<Value>, ConversionError>
        + Send
        + Sync,
>;

/// On-demand, extensible conversion between value representations.
///
/// Lookups are indexed by `(from TypeId, to TypeId)`. A primary miss walks an
/// ordered fallback chain; a full miss is cached as a negative result so
/// repeated failing lookups short-circuit. The registry is shared
/// process-wide, read-heavy state: additions from dynamically loaded modules
/// publish safely to concurrent readers through the sharded maps, and each
/// registration invalidates the negative cache.
pub struct TypeConverterRegistry {
    index: DashMap<(TypeId, TypeId), ConverterFn>,
    misses: DashSet<(TypeId, TypeId)>,
    fallbacks: RwLock<Vec<FallbackFn>>,
}

impl TypeConverterRegistry {
    pub fn new() -> Self {
        Self {
            index: DashMap::new(),
            misses: DashSet::new(),
            fallbacks: RwLock::new(Vec::new()),
        }
    }

    /// Registry preloaded with the stock scalar conversions and the
    /// via-String bridge fallback.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register_defaults();
        registry
    }

    /// Register a converter from `F` to `T`. Replaces any existing converter
    /// for the pair and invalidates the negative cache.
    pub fn register<F, T, C>(&self, convert: C)
    where
        F: Any + Send + Sync,
        T: Any + Send + Sync,
        C: Fn(&F) -> Result<T, ConversionError> + Send + Sync + 'static,
    {
        let from_name = std::any::type_name::<F>();
        let to_name = std::any::type_name::<T>();
        let f: ConverterFn = Arc::new(move |_registry, value| {
            let input = value.get_ref::<F>().ok_or_else(|| {
                ConversionError::failed(from_name, to_name, "unexpected source type")
            })?;
            convert(input).map(Value::new)
        });
        self.index
            .insert((TypeId::of::<F>(), TypeId::of::<T>()), f);
        self.misses.clear();
        trace!(from = from_name, to = to_name, "Registered type converter");
    }

    /// Append a fallback converter consulted, in order, on primary misses.
    pub fn register_fallback<C>(&self, fallback: C)
    where
        C: Fn(&TypeConverterRegistry, TypeId, &Value) -> Result<Option<Value>, ConversionError>
            + Send
            + Sync
            + 'static,
    {
        self.fallbacks.write().push(Arc::new(fallback));
        self.misses.clear();
    }

    /// Convert `value` to `T`.
    ///
    /// `Ok(Some(v))` on success, `Ok(None)` when no converter exists for the
    /// pair, `Err` when a converter was found but raised.
    pub fn convert_value<T: Any + Clone + Send + Sync>(
        &self,
        value: &Value,
    ) -> Result<Option<T>, ConversionError> {
        if let Some(v) = value.get::<T>() {
            return Ok(Some(v));
        }
        match self.convert_dyn(TypeId::of::<T>(), value)? {
            Some(out) => Ok(out.get::<T>()),
            None => Ok(None),
        }
    }

    /// Convenience form for plain values.
    pub fn convert_from<F, T>(&self, value: F) -> Result<Option<T>, ConversionError>
    where
        F: Any + Send + Sync,
        T: Any + Clone + Send + Sync,
    {
        self.convert_value(&Value::new(value))
    }

    fn convert_dyn(&self, to: TypeId, value: &Value) -> Result<Option<Value>, ConversionError> {
        let from = value.type_id();
        if from == to {
            return Ok(Some(value.clone()));
        }

        let key = (from, to);
        if self.misses.contains(&key) {
            trace!(from = value.type_name(), "Negative-cache hit for conversion");
            return Ok(None);
        }

        if let Some(converter) = self.index.get(&key).map(|e| e.value().clone()) {
            return converter(self, value).map(Some);
        }

        let fallbacks: Vec<FallbackFn> = self.fallbacks.read().clone();
        for fallback in fallbacks {
            if let Some(out) = fallback(self, to, value)? {
                return Ok(Some(out));
            }
        }

        debug!(
            from = value.type_name(),
            "No converter found, caching negative result"
        );
        self.misses.insert(key);
        Ok(None)
    }

    fn primary(&self, from: TypeId, to: TypeId) -> Option<ConverterFn> {
        self.index.get(&(from, to)).map(|e| e.value().clone())
    }

    #[cfg(test)]
    fn miss_count(&self) -> usize {
        self.misses.len()
    }

    fn register_defaults(&self) {
        self.register::<String, i64, _>(|s| {
            s.trim().parse::<i64>().map_err(|e| {
                ConversionError::failed("String", "i64", e.to_string())
            })
        });
        self.register::<String, f64, _>(|s| {
            s.trim().parse::<f64>().map_err(|e| {
                ConversionError::failed("String", "f64", e.to_string())
            })
        });
        self.register::<String, bool, _>(|s| {
            s.trim().parse::<bool>().map_err(|e| {
                ConversionError::failed("String", "bool", e.to_string())
            })
        });
        self.register::<i64, String, _>(|v| Ok(v.to_string()));
        self.register::<f64, String, _>(|v| Ok(v.to_string()));
        self.register::<bool, String, _>(|v| Ok(v.to_string()));
        self.register::<i64, f64, _>(|v| Ok(*v as f64));
        self.register::<f64, i64, _>(|v| Ok(*v as i64));
        self.register::<String, Vec<u8>, _>(|s| Ok(s.as_bytes().to_vec()));
        self.register::<Vec<u8>, String, _>(|b| {
            String::from_utf8(b.clone()).map_err(|e| {
                ConversionError::failed("Vec<u8>", "String", e.to_string())
            })
        });
        self.register::<serde_json::Value, String, _>(|v| Ok(v.to_string()));
        self.register::<String, serde_json::Value, _>(|s| {
            serde_json::from_str(s).map_err(|e| {
                ConversionError::failed("String", "serde_json::Value", e.to_string())
            })
        });

        // Via-String bridge: compose (from -> String) with (String -> to)
        // when no direct converter exists for the pair.
        self.register_fallback(|registry, to, value| {
            let string_id = TypeId::of::<String>();
            if to == string_id || value.type_id() == string_id {
                return Ok(None);
            }
            let to_string = match registry.primary(value.type_id(), string_id) {
                Some(f) => f,
                None => return Ok(None),
            };
            let from_string = match registry.primary(string_id, to) {
                Some(f) => f,
                None => return Ok(None),
            };
            let bridged = to_string(registry, value)?;
            from_string(registry, &bridged).map(Some)
        });
    }
}

impl Default for TypeConverterRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_registered_pairs() {
        let registry = TypeConverterRegistry::with_defaults();

        let s: String = registry.convert_from(42i64).unwrap().unwrap();
        let n: i64 = registry.convert_from(s).unwrap().unwrap();
        assert_eq!(n, 42);

        let bytes: Vec<u8> = registry
            .convert_from("hello".to_string())
            .unwrap()
            .unwrap();
        let text: String = registry.convert_from(bytes).unwrap().unwrap();
        assert_eq!(text, "hello");

        let json: serde_json::Value = registry
            .convert_from(r#"{"a":1}"#.to_string())
            .unwrap()
            .unwrap();
        let text: String = registry.convert_from(json.clone()).unwrap().unwrap();
        let back: serde_json::Value = registry.convert_from(text).unwrap().unwrap();
        assert_eq!(back, json);
    }

    #[test]
    fn converter_failure_raises() {
        let registry = TypeConverterRegistry::with_defaults();

        let result: Result<Option<i64>, _> =
            registry.convert_from("not a number".to_string());
        assert!(matches!(result, Err(ConversionError::Failed { .. })));
    }

    #[test]
    fn misses_are_cached_negatively() {
        let registry = TypeConverterRegistry::with_defaults();

        struct Opaque;
        let value = Value::new(Opaque);

        assert!(registry.convert_value::<i64>(&value).unwrap().is_none());
        assert_eq!(registry.miss_count(), 1);

        // Second lookup hits the cache and stays a miss.
        assert!(registry.convert_value::<i64>(&value).unwrap().is_none());
        assert_eq!(registry.miss_count(), 1);
    }

    #[test]
    fn registration_invalidates_negative_cache() {
        let registry = TypeConverterRegistry::with_defaults();

        #[derive(Clone)]
        struct Celsius(f64);

        let value = Value::new(Celsius(21.5));
        assert!(registry.convert_value::<f64>(&value).unwrap().is_none());
        assert!(registry.miss_count() > 0);

        registry.register::<Celsius, f64, _>(|c| Ok(c.0));
        let degrees: f64 = registry.convert_value(&value).unwrap().unwrap();
        assert_eq!(degrees, 21.5);
    }

    #[test]
    fn via_string_bridge_fallback() {
        let registry = TypeConverterRegistry::with_defaults();

        // No direct f64 -> Vec<u8> converter; bridged via String.
        let bytes: Vec<u8> = registry.convert_from(1.5f64).unwrap().unwrap();
        assert_eq!(bytes, b"1.5".to_vec());
    }
}
