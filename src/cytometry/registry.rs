//! Cytometer registry.
//!
//! Configuration-driven polymorphism: string identifiers map to factory
//! functions returning boxed [`Cytometer`] implementations. New variants
//! register without modifying the engine.

use crate::core::config::CytometerConfig;
use crate::core::error::{ConfigError, ConfigResult};
use crate::cytometry::Cytometer;
use indexmap::IndexMap;
use std::sync::Arc;

/// Factory function for creating cytometer instances from constructor
/// parameters.
pub type CytometerFactory =
    Arc<dyn Fn(&serde_json::Value) -> ConfigResult<Box<dyn Cytometer>> + Send + Sync>;

/// Registry of all available cytometer types.
pub struct CytometerRegistry {
    factories: IndexMap<String, CytometerFactory>,
}

impl CytometerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        CytometerRegistry {
            factories: IndexMap::new(),
        }
    }

    /// Create a registry pre-populated with the built-in cytometers.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::cytometry::builtin::register_all(&mut registry);
        registry
    }

    /// Register a cytometer type.
    pub fn register<F>(&mut self, id: impl Into<String>, factory: F)
    where
        F: Fn(&serde_json::Value) -> ConfigResult<Box<dyn Cytometer>> + Send + Sync + 'static,
    {
        self.factories.insert(id.into(), Arc::new(factory));
    }

    /// Instantiate the cytometer selected by a configuration.
    pub fn create(&self, config: &CytometerConfig) -> ConfigResult<Box<dyn Cytometer>> {
        let factory = self
            .factories
            .get(&config.type_name)
            .ok_or_else(|| ConfigError::UnknownCytometer(config.type_name.clone()))?;
        factory(&config.params)
    }

    /// Check if a cytometer type is registered.
    pub fn contains(&self, id: &str) -> bool {
        self.factories.contains_key(id)
    }

    /// All registered type identifiers.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Number of registered types.
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl Default for CytometerRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_registered() {
        let registry = CytometerRegistry::with_builtins();
        assert!(registry.contains("threshold"));
        assert!(registry.contains("spheroid"));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_unknown_type_rejected() {
        let registry = CytometerRegistry::with_builtins();
        let config = CytometerConfig {
            type_name: "deep_magic".into(),
            params: serde_json::Value::Null,
            features: Default::default(),
        };
        assert!(matches!(
            registry.create(&config),
            Err(ConfigError::UnknownCytometer(_))
        ));
    }

    #[test]
    fn test_create_threshold() {
        let registry = CytometerRegistry::with_builtins();
        let config = CytometerConfig {
            type_name: "threshold".into(),
            params: serde_json::json!({"nuclei_channel": "DAPI", "min_area": 9}),
            features: Default::default(),
        };
        let cytometer = registry.create(&config).unwrap();
        assert_eq!(cytometer.name(), "threshold");
        assert_eq!(cytometer.segmentation_channels(), vec!["DAPI".to_string()]);
    }
}
