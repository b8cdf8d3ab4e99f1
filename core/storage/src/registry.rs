//! Provider registry for dynamic provider resolution.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use stowage_common::{Error, GatewayConfig, Result};

use crate::local::LocalProvider;
use crate::memory::MemoryProvider;
use crate::provider::Provider;
use crate::readonly::ReadOnlyProvider;

/// Factory function type for creating providers from their settings.
pub type ProviderFactory = Box<dyn Fn(Value) -> Result<Arc<dyn Provider>> + Send + Sync>;

/// Registry for storage provider factories.
///
/// Resolves adapters by name from a JSON settings value, so callers never
/// name a concrete adapter type.
pub struct ProviderRegistry {
    factories: HashMap<String, ProviderFactory>,
}

impl ProviderRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a provider factory.
    ///
    /// # Errors
    /// - Returns error if name is already registered
    pub fn register(&mut self, name: impl Into<String>, factory: ProviderFactory) -> Result<()> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(Error::InvalidInput(format!(
                "Provider '{}' is already registered",
                name
            )));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Resolve a provider by name and settings.
    ///
    /// Settings carrying `"read_only": true` get the provider wrapped in a
    /// [`ReadOnlyProvider`].
    ///
    /// # Errors
    /// - Provider not registered
    /// - Settings invalid for the provider
    pub fn resolve(&self, name: &str, settings: Value) -> Result<Arc<dyn Provider>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("Provider '{}' is not registered", name)))?;

        let read_only = settings
            .get("read_only")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let provider = factory(settings)?;
        debug!(provider = name, read_only, "Resolved provider");

        if read_only {
            Ok(Arc::new(ReadOnlyProvider::new(provider)))
        } else {
            Ok(provider)
        }
    }

    /// Registered provider names, sorted.
    pub fn providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has_provider(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a registry with the reference adapters, configured from `config`.
///
/// - `memory`: optional `"name"`
/// - `local`: required `"root"`, optional `"name"`
pub fn create_default_registry(config: &GatewayConfig) -> Result<ProviderRegistry> {
    let mut registry = ProviderRegistry::new();

    let memory_config = config.clone();
    registry.register(
        "memory",
        Box::new(move |settings| {
            let mut provider = MemoryProvider::with_config(&memory_config);
            if let Some(name) = settings.get("name").and_then(Value::as_str) {
                provider = provider.named(name);
            }
            Ok(Arc::new(provider))
        }),
    )?;

    let local_config = config.clone();
    registry.register(
        "local",
        Box::new(move |settings| {
            let root = settings
                .get("root")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    Error::InvalidInput("Local provider requires 'root' path".to_string())
                })?;
            let mut provider = LocalProvider::with_config(root, &local_config)?;
            if let Some(name) = settings.get("name").and_then(Value::as_str) {
                provider = provider.named(name);
            }
            Ok(Arc::new(provider))
        }),
    )?;

    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_register_and_resolve() {
        let mut registry = ProviderRegistry::new();

        registry
            .register("test", Box::new(|_| Ok(Arc::new(MemoryProvider::new()))))
            .unwrap();

        let provider = registry.resolve("test", Value::Null).unwrap();
        assert_eq!(provider.name(), "memory");
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = ProviderRegistry::new();

        registry
            .register("test", Box::new(|_| Ok(Arc::new(MemoryProvider::new()))))
            .unwrap();

        let result = registry.register("test", Box::new(|_| Ok(Arc::new(MemoryProvider::new()))));
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_resolve_unknown_provider() {
        let registry = ProviderRegistry::new();
        assert!(matches!(
            registry.resolve("s3", Value::Null),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_default_registry() {
        let registry = create_default_registry(&GatewayConfig::default()).unwrap();
        assert_eq!(registry.providers(), vec!["local", "memory"]);

        let temp = TempDir::new().unwrap();
        let local = registry
            .resolve("local", json!({ "root": temp.path(), "name": "home" }))
            .unwrap();
        assert_eq!(local.name(), "home");
        assert!(local.capabilities().writable);

        assert!(registry.resolve("local", json!({})).is_err());
    }

    #[test]
    fn test_read_only_setting_wraps_provider() {
        let registry = create_default_registry(&GatewayConfig::default()).unwrap();
        let provider = registry
            .resolve("memory", json!({ "read_only": true }))
            .unwrap();
        assert!(!provider.capabilities().writable);
    }
}
