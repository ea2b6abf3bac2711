//! Record of the services a server exposes.

use std::collections::BTreeSet;
use std::sync::{PoisonError, RwLock};

/// Collects fully-qualified service names (`package.Service`) as handlers
/// are built. Reflection-style services read it to list what is served.
#[derive(Debug, Default)]
pub struct Registrar {
    services: RwLock<BTreeSet<String>>,
}

impl Registrar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registered service names, sorted.
    pub fn service_names(&self) -> Vec<String> {
        self.services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn is_registered(&self, service: &str) -> bool {
        self.services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(service)
    }

    pub(crate) fn register(&self, service: &str) {
        if service.is_empty() {
            return;
        }
        self.services
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(service.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_names_sorted_and_deduplicated() {
        let registrar = Registrar::new();
        registrar.register("acme.ping.v1.PingService");
        registrar.register("acme.health.v1.Health");
        registrar.register("acme.ping.v1.PingService");
        registrar.register("");
        assert_eq!(
            registrar.service_names(),
            vec!["acme.health.v1.Health", "acme.ping.v1.PingService"]
        );
        assert!(registrar.is_registered("acme.health.v1.Health"));
        assert!(!registrar.is_registered("acme.health.v1"));
    }
}
