//! Adapter routing by runtime name

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::adapter::RuntimeAdapter;
use crate::error::JobError;
use crate::spec::ContainerJobSpec;

/// Registry of runtime adapters with a designated default.
///
/// The router selects on the spec's explicit `runtime` field only; it never
/// inspects the rest of the spec. The first registered adapter becomes the
/// default until `set_default` overrides it.
#[derive(Default)]
pub struct AdapterRouter {
    adapters: RwLock<HashMap<String, Arc<dyn RuntimeAdapter>>>,
    default_name: RwLock<Option<String>>,
}

impl AdapterRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its own name.
    pub fn register(&self, adapter: Arc<dyn RuntimeAdapter>) {
        let name = adapter.name().to_string();
        self.adapters.write().insert(name.clone(), adapter);

        let mut default = self.default_name.write();
        if default.is_none() {
            *default = Some(name.clone());
        }
        info!(runtime = %name, "registered runtime adapter");
    }

    /// Make a registered adapter the default.
    pub fn set_default(&self, name: &str) -> Result<(), JobError> {
        if !self.adapters.read().contains_key(name) {
            return Err(JobError::not_found(
                name,
                format!("runtime not registered: {name}"),
            ));
        }
        *self.default_name.write() = Some(name.to_string());
        Ok(())
    }

    pub fn default_name(&self) -> Option<String> {
        self.default_name.read().clone()
    }

    /// Fetch an adapter by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn RuntimeAdapter>> {
        self.adapters.read().get(name).cloned()
    }

    /// Select the adapter for a spec: its explicit `runtime` field, or the
    /// default when absent.
    pub fn resolve(&self, spec: &ContainerJobSpec) -> Result<Arc<dyn RuntimeAdapter>, JobError> {
        match spec.runtime.as_deref() {
            Some(name) => self.get(name).ok_or_else(|| {
                JobError::not_found(name, format!("runtime not registered: {name}"))
            }),
            None => {
                let default = self.default_name.read().clone().ok_or_else(|| {
                    JobError::validation("router", "no runtime adapters registered")
                })?;
                self.get(&default).ok_or_else(|| {
                    JobError::not_found(&default, format!("runtime not registered: {default}"))
                })
            }
        }
    }

    /// Registered runtime names, sorted.
    pub fn list_runtimes(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapters.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// All registered adapters.
    pub fn all(&self) -> Vec<Arc<dyn RuntimeAdapter>> {
        self.adapters.read().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stub::StubAdapter;

    #[test]
    fn test_first_registered_is_default() {
        let router = AdapterRouter::new();
        router.register(Arc::new(StubAdapter::auto_succeed()));
        assert_eq!(router.default_name().as_deref(), Some("stub"));
    }

    #[test]
    fn test_resolve_explicit_runtime() {
        let router = AdapterRouter::new();
        router.register(Arc::new(StubAdapter::auto_succeed()));

        let spec = crate::spec::ContainerJobSpec::new("j", "alpine").with_runtime("stub");
        assert_eq!(router.resolve(&spec).unwrap().name(), "stub");

        let missing = crate::spec::ContainerJobSpec::new("j", "alpine").with_runtime("k8s");
        let err = match router.resolve(&missing) {
            Ok(_) => panic!("expected error"),
            Err(e) => e,
        };
        assert_eq!(err.category, crate::error::ErrorCategory::NotFound);
    }

    #[test]
    fn test_resolve_without_adapters_fails() {
        let router = AdapterRouter::new();
        let spec = crate::spec::ContainerJobSpec::new("j", "alpine");
        assert!(router.resolve(&spec).is_err());
    }

    #[test]
    fn test_set_default_unknown() {
        let router = AdapterRouter::new();
        assert!(router.set_default("nope").is_err());
    }
}
