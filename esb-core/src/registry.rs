//! Service registry (logical name -> endpoint)

use crate::{types::ServiceRegistryEntry, Error, Result};
use dashmap::DashMap;
use tracing::{debug, info};

/// In-memory service registry
#[derive(Default)]
pub struct ServiceRegistry {
    services: DashMap<String, ServiceRegistryEntry>,
}

impl ServiceRegistry {
    /// Create empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry keyed by its service name (last write wins)
    pub fn register(&self, entry: ServiceRegistryEntry) -> Result<bool> {
        if entry.service_name.trim().is_empty() {
            return Err(Error::InvalidArgument(
                "service name must not be empty".to_string(),
            ));
        }

        info!(
            "Registering service {} at {} ({})",
            entry.service_name, entry.endpoint_url, entry.service_type
        );
        self.services.insert(entry.service_name.clone(), entry);
        Ok(true)
    }

    /// Exact, case-sensitive lookup
    pub fn discover(&self, service_name: &str) -> Option<ServiceRegistryEntry> {
        let entry = self.services.get(service_name).map(|e| e.clone());
        if entry.is_none() {
            debug!("Service {} not found in registry", service_name);
        }
        entry
    }

    /// Remove a service
    pub fn deregister(&self, service_name: &str) -> bool {
        let removed = self.services.remove(service_name).is_some();
        if removed {
            info!("Deregistered service {}", service_name);
        }
        removed
    }

    /// Toggle a service's active flag; false if unknown
    pub fn set_active(&self, service_name: &str, is_active: bool) -> bool {
        match self.services.get_mut(service_name) {
            Some(mut entry) => {
                info!("Service {} active={}", service_name, is_active);
                entry.is_active = is_active;
                true
            }
            None => false,
        }
    }

    /// All entries sorted by service name
    pub fn list(&self) -> Vec<ServiceRegistryEntry> {
        let mut entries: Vec<_> = self.services.iter().map(|e| e.value().clone()).collect();
        entries.sort_by(|a, b| a.service_name.cmp(&b.service_name));
        entries
    }

    /// Number of registered services
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// True when nothing is registered
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
