use crate::config::FactoryParams;
use crate::transport::errors::{Result, TransportError};
use crate::transport::factory::ConnectionFactory;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

/// Owns the mapping from logical factory name (or host:port identity) to
/// connection factory. Populated once at transport initialization from the
/// declared parameter sets; grows lazily when an outbound send names a
/// broker no declared factory covers.
#[derive(Default)]
pub struct ConnectionFactoryRegistry {
    factories: Mutex<HashMap<String, Arc<ConnectionFactory>>>,
}

impl ConnectionFactoryRegistry {
    pub fn new() -> Self {
        ConnectionFactoryRegistry::default()
    }

    /// Build the registry from the declared factory parameter sets.
    pub fn from_config(declared: &[FactoryParams]) -> Result<Self> {
        let registry = ConnectionFactoryRegistry::new();
        for params in declared {
            let name = params.name.clone().ok_or_else(|| {
                TransportError::Config(format!(
                    "declared connection factory for host {} has no name",
                    params.host
                ))
            })?;
            let factory = Arc::new(ConnectionFactory::new(params.clone())?);
            info!(factory = %name, broker = %factory.broker_key(), "registered connection factory");
            registry.insert(name, factory)?;
        }
        Ok(registry)
    }

    pub fn get(&self, name: &str) -> Option<Arc<ConnectionFactory>> {
        self.lock().get(name).cloned()
    }

    /// Resolve a factory for ad-hoc connection parameters, keyed by
    /// host:port. An existing entry for the same broker is reused so no
    /// two entries ever represent the same live connection; otherwise a
    /// new factory is created and registered. Safe under concurrent
    /// first use.
    pub fn get_or_create(&self, params: FactoryParams) -> Result<Arc<ConnectionFactory>> {
        params.validate()?;
        let key = params.broker_key();

        let mut factories = self.lock();
        if let Some(factory) = factories.get(&key) {
            return Ok(factory.clone());
        }
        // A declared factory may already point at this broker under its
        // logical name
        if let Some(factory) = factories.values().find(|f| f.broker_key() == key) {
            return Ok(factory.clone());
        }

        debug!(broker = %key, "creating ad-hoc connection factory");
        let factory = Arc::new(ConnectionFactory::new(params)?);
        factories.insert(key, factory.clone());
        Ok(factory)
    }

    /// Snapshot of every registered factory, for shutdown teardown.
    pub fn all(&self) -> Vec<Arc<ConnectionFactory>> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn insert(&self, name: String, factory: Arc<ConnectionFactory>) -> Result<()> {
        let mut factories = self.lock();
        if factories.contains_key(&name) {
            return Err(TransportError::Config(format!(
                "duplicate connection factory name '{}'",
                name
            )));
        }
        factories.insert(name, factory);
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<ConnectionFactory>>> {
        self.factories.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(name: Option<&str>, host: &str, port: u16) -> FactoryParams {
        FactoryParams {
            name: name.map(str::to_string),
            host: host.to_string(),
            port,
            username: "guest".to_string(),
            password: "guest".to_string(),
            vhost: "/".to_string(),
        }
    }

    #[test]
    fn test_same_broker_resolves_to_same_factory() {
        let registry = ConnectionFactoryRegistry::new();
        let first = registry
            .get_or_create(params(None, "broker.local", 5672))
            .unwrap();
        let second = registry
            .get_or_create(params(None, "broker.local", 5672))
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let other = registry
            .get_or_create(params(None, "broker.local", 5673))
            .unwrap();
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_declared_factory_is_reused_for_matching_broker() {
        let registry =
            ConnectionFactoryRegistry::from_config(&[params(Some("default"), "broker.local", 5672)])
                .unwrap();
        let declared = registry.get("default").unwrap();
        let resolved = registry
            .get_or_create(params(None, "broker.local", 5672))
            .unwrap();
        assert!(Arc::ptr_eq(&declared, &resolved));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_missing_host_is_raised_immediately() {
        let registry = ConnectionFactoryRegistry::new();
        match registry.get_or_create(params(None, "", 5672)) {
            Err(TransportError::Config(_)) => {}
            other => panic!("expected a configuration error, got {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_declared_names_rejected() {
        let declared = [
            params(Some("default"), "a.local", 5672),
            params(Some("default"), "b.local", 5672),
        ];
        assert!(ConnectionFactoryRegistry::from_config(&declared).is_err());
    }

    #[test]
    fn test_unknown_name_is_not_found() {
        let registry = ConnectionFactoryRegistry::new();
        assert!(registry.get("nope").is_none());
    }
}
