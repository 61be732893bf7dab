//! Capability registry for name-addressed dispatch.
//!
//! The registry is filled before a run starts and only read afterward. It is
//! shared between concurrent pipelines behind an `Arc`, which makes the
//! read-only phase a property of the type rather than a convention.

use crate::config::RelayConfig;
use relay_proto::{Capability, Error, FINAL, ROUTER, Result, Route};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// A registered capability plus its routing defaults.
#[derive(Clone)]
pub struct RegistryEntry {
    name: String,
    capability: Arc<dyn Capability>,
    default_next_hop: Option<Route>,
    timeout: Option<Duration>,
}

impl RegistryEntry {
    pub fn new(name: impl Into<String>, capability: Arc<dyn Capability>) -> Self {
        Self {
            name: name.into(),
            capability,
            default_next_hop: None,
            timeout: None,
        }
    }

    /// Sets the receiver used when the capability does not choose one.
    pub fn with_next_hop(mut self, receiver: impl Into<String>) -> Self {
        self.default_next_hop = Some(Route::to(receiver));
        self
    }

    /// Overrides the run-wide capability timeout for this entry.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capability(&self) -> &Arc<dyn Capability> {
        &self.capability
    }

    pub fn default_next_hop(&self) -> Option<&Route> {
        self.default_next_hop.as_ref()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

impl fmt::Debug for RegistryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryEntry")
            .field("name", &self.name)
            .field("default_next_hop", &self.default_next_hop)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Name to capability lookup table.
#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    entries: HashMap<String, RegistryEntry>,
}

impl CapabilityRegistry {
    /// Creates a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry from configuration and the capabilities that
    /// implement its stages.
    ///
    /// Stage settings (`next`, `timeout_ms`) are attached to the capability of
    /// the same name. Capabilities without a `stages` entry are registered
    /// with no defaults.
    pub fn from_config<I, S>(config: &RelayConfig, capabilities: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, Arc<dyn Capability>)>,
        S: Into<String>,
    {
        let mut registry = Self::new();

        for (name, capability) in capabilities {
            let name = name.into();
            let mut entry = RegistryEntry::new(name.clone(), capability);
            if let Some(stage) = config.stages.get(&name) {
                if let Some(next) = &stage.next {
                    entry = entry.with_next_hop(next.clone());
                }
                if let Some(timeout) = stage.timeout() {
                    entry = entry.with_timeout(timeout);
                }
            }
            registry.register_entry(entry)?;
        }

        Ok(registry)
    }

    /// Registers a capability with no routing defaults.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        capability: Arc<dyn Capability>,
    ) -> Result<()> {
        self.register_entry(RegistryEntry::new(name, capability))
    }

    /// Registers a fully described entry.
    ///
    /// Fails with [`Error::DuplicateName`] if the name is taken and with
    /// [`Error::ReservedName`] for the sentinel, the router's own name, or an
    /// empty name.
    pub fn register_entry(&mut self, entry: RegistryEntry) -> Result<()> {
        let name = entry.name.as_str();
        if name.trim().is_empty() || name == FINAL || name == ROUTER {
            return Err(Error::ReservedName(entry.name));
        }
        if self.entries.contains_key(name) {
            return Err(Error::DuplicateName(entry.name));
        }

        debug!(
            capability = %name,
            next_hop = ?entry.default_next_hop.as_ref().map(Route::receiver),
            "Registered capability"
        );
        self.entries.insert(entry.name.clone(), entry);
        Ok(())
    }

    /// Resolves a receiver name.
    pub fn resolve(&self, name: &str) -> Result<&RegistryEntry> {
        self.entries
            .get(name)
            .ok_or_else(|| Error::UnknownReceiver(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Returns all registered names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Returns the number of registered capabilities.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no capabilities are registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_proto::{CapabilityOutput, FnCapability};
    use serde_json::Value;

    fn echo() -> Arc<dyn Capability> {
        Arc::new(FnCapability::new(|payload: &Value| {
            Ok(CapabilityOutput::new(payload.clone()))
        }))
    }

    #[test]
    fn test_register_and_resolve() {
        let mut registry = CapabilityRegistry::new();
        registry.register("Intake", echo()).unwrap();
        registry
            .register_entry(RegistryEntry::new("Transform", echo()).with_next_hop("Final"))
            .unwrap();

        assert_eq!(registry.len(), 2);
        assert!(registry.resolve("Intake").unwrap().default_next_hop().is_none());
        assert_eq!(
            registry.resolve("Transform").unwrap().default_next_hop(),
            Some(&Route::Terminate)
        );
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut registry = CapabilityRegistry::new();
        registry.register("Intake", echo()).unwrap();

        let err = registry.register("Intake", echo()).unwrap_err();
        assert_eq!(err, Error::DuplicateName("Intake".to_string()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_reserved_names_rejected() {
        let mut registry = CapabilityRegistry::new();
        assert!(matches!(registry.register("Final", echo()), Err(Error::ReservedName(_))));
        assert!(matches!(registry.register("Router", echo()), Err(Error::ReservedName(_))));
        assert!(matches!(registry.register("", echo()), Err(Error::ReservedName(_))));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unknown_receiver() {
        let registry = CapabilityRegistry::new();
        let err = registry.resolve("Ghost").unwrap_err();
        assert_eq!(err, Error::UnknownReceiver("Ghost".to_string()));
    }

    #[test]
    fn test_from_config_applies_stage_defaults() {
        let yaml = r#"
stages:
  Intake:
    next: Transform
    timeout_ms: 200
"#;
        let config = RelayConfig::from_yaml(yaml).unwrap();
        let registry = CapabilityRegistry::from_config(
            &config,
            [("Intake", echo()), ("Transform", echo())],
        )
        .unwrap();

        let intake = registry.resolve("Intake").unwrap();
        assert_eq!(intake.default_next_hop(), Some(&Route::to("Transform")));
        assert_eq!(intake.timeout(), Some(Duration::from_millis(200)));

        let transform = registry.resolve("Transform").unwrap();
        assert!(transform.default_next_hop().is_none());
        assert!(transform.timeout().is_none());
    }

    #[test]
    fn test_from_config_duplicate_fails() {
        let config = RelayConfig::default();
        let result = CapabilityRegistry::from_config(&config, [("Intake", echo()), ("Intake", echo())]);
        assert!(matches!(result, Err(Error::DuplicateName(name)) if name == "Intake"));
    }
}
