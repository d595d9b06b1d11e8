//! Service registry - typed services plugins expose to each other

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tessera_plugin_api::ServiceLocator;

use crate::error::HostError;

/// Name-keyed registry of shared services.
///
/// Values are `Arc<dyn Any>`; consumers downcast to the concrete type they
/// expect. Registration is first-wins: re-registering a taken name fails so
/// one plugin cannot silently shadow another's service.
#[derive(Default)]
pub struct ServiceRegistry {
    services: RwLock<HashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl ServiceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service under a name
    pub fn register(
        &self,
        name: impl Into<String>,
        service: Arc<dyn Any + Send + Sync>,
    ) -> Result<(), HostError> {
        let name = name.into();
        let mut services = self.services.write().expect("service registry poisoned");
        if services.contains_key(&name) {
            return Err(HostError::InvalidInput(format!(
                "service '{name}' is already registered"
            )));
        }
        services.insert(name, service);
        Ok(())
    }

    /// Remove a service. Returns true if it existed.
    pub fn unregister(&self, name: &str) -> bool {
        self.services
            .write()
            .expect("service registry poisoned")
            .remove(name)
            .is_some()
    }

    /// Fetch a service and downcast it to the expected type
    pub fn get_as<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.services
            .read()
            .expect("service registry poisoned")
            .get(name)
            .cloned()
            .and_then(|s| s.downcast::<T>().ok())
    }

    /// Names of all registered services
    pub fn list(&self) -> Vec<String> {
        self.services
            .read()
            .expect("service registry poisoned")
            .keys()
            .cloned()
            .collect()
    }
}

impl ServiceLocator for ServiceRegistry {
    fn get(&self, name: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.services
            .read()
            .expect("service registry poisoned")
            .get(name)
            .cloned()
    }
}
