use crate::config::{FactoryParams, ServiceParams};
use crate::transport::errors::{Result, TransportError};
use std::collections::HashMap;

/// Scheme prefix of a transport target address.
pub const SCHEME: &str = "rabbitmq://";

// Recognized query keys
pub const QUEUE_NAME: &str = "rabbitmq.queue.name";
pub const QUEUE_DURABLE: &str = "rabbitmq.queue.durable";
pub const EXCHANGE_NAME: &str = "rabbitmq.exchange.name";
pub const EXCHANGE_TYPE: &str = "rabbitmq.exchange.type";
pub const EXCHANGE_DURABLE: &str = "rabbitmq.exchange.durable";
pub const ROUTING_KEY: &str = "rabbitmq.queue.routing.key";
pub const CONTENT_TYPE: &str = "rabbitmq.content.type";
pub const DELIVERY_MODE: &str = "rabbitmq.delivery.mode";
pub const FACTORY_NAME: &str = "rabbitmq.connection.factory";
pub const SERVER_HOST: &str = "rabbitmq.server.host.name";
pub const SERVER_PORT: &str = "rabbitmq.server.port";
pub const SERVER_USER: &str = "rabbitmq.server.user.name";
pub const SERVER_PASSWORD: &str = "rabbitmq.server.password";
pub const SERVER_VHOST: &str = "rabbitmq.server.virtual.host";

/// A parsed outbound target: `rabbitmq://<queue>?<key>=<value>&...`.
/// The address either names a declared connection factory or carries the
/// broker connection parameters inline.
#[derive(Debug, Clone)]
pub struct TargetAddress {
    queue: String,
    properties: HashMap<String, String>,
}

impl TargetAddress {
    /// Parse a target address. A malformed scheme prefix is a fatal
    /// configuration error raised at construction.
    pub fn parse(address: &str) -> Result<Self> {
        let rest = address.strip_prefix(SCHEME).ok_or_else(|| {
            TransportError::Config(format!(
                "malformed target address '{}', expected prefix '{}'",
                address, SCHEME
            ))
        })?;

        let (queue, query) = match rest.split_once('?') {
            Some((queue, query)) => (queue, query),
            None => (rest, ""),
        };

        let mut properties = HashMap::new();
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                TransportError::Config(format!(
                    "malformed parameter '{}' in target address '{}'",
                    pair, address
                ))
            })?;
            properties.insert(key.to_string(), value.to_string());
        }

        Ok(TargetAddress {
            queue: queue.to_string(),
            properties,
        })
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// The declared factory this address names, if any.
    pub fn factory_name(&self) -> Option<&str> {
        self.property(FACTORY_NAME)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.property(CONTENT_TYPE)
    }

    /// The queue to publish to: explicit property, else the address path.
    pub fn queue_name(&self) -> Result<String> {
        match self.property(QUEUE_NAME) {
            Some(queue) if !queue.is_empty() => Ok(queue.to_string()),
            _ if !self.queue.is_empty() => Ok(self.queue.clone()),
            _ => Err(TransportError::Config(
                "target address does not name a queue".to_string(),
            )),
        }
    }

    /// Extract inline connection parameters for ad-hoc factory creation.
    /// A missing host name is a fatal configuration error.
    pub fn connection_params(&self) -> Result<FactoryParams> {
        let host = self.property(SERVER_HOST).unwrap_or_default().to_string();
        if host.trim().is_empty() {
            return Err(TransportError::Config(format!(
                "target address names no connection factory and no broker host ({})",
                SERVER_HOST
            )));
        }

        let port = match self.property(SERVER_PORT) {
            Some(raw) => raw.parse::<u16>().map_err(|_| {
                TransportError::Config(format!("invalid broker port '{}' in target address", raw))
            })?,
            None => 5672,
        };

        let params = FactoryParams {
            name: None,
            host,
            port,
            username: self.property(SERVER_USER).unwrap_or("guest").to_string(),
            password: self.property(SERVER_PASSWORD).unwrap_or("guest").to_string(),
            vhost: self.property(SERVER_VHOST).unwrap_or("/").to_string(),
        };
        params.validate()?;
        Ok(params)
    }

    /// Project the address onto the per-service parameter shape so the
    /// send path declares the exact topology the listening side declares.
    pub fn to_service_params(&self) -> Result<ServiceParams> {
        let queue = self.queue_name()?;

        let mut params = ServiceParams::new(&queue, "");
        params.queue_name = Some(queue);
        params.exchange_name = self
            .property(EXCHANGE_NAME)
            .filter(|e| !e.is_empty())
            .map(str::to_string);
        if let Some(kind) = self.property(EXCHANGE_TYPE) {
            params.exchange_type = kind.to_string();
        }
        params.exchange_durable = self.bool_property(EXCHANGE_DURABLE, true)?;
        params.queue_durable = self.bool_property(QUEUE_DURABLE, true)?;
        params.routing_key = self.property(ROUTING_KEY).map(str::to_string);
        if let Some(raw) = self.property(DELIVERY_MODE) {
            params.delivery_mode = raw.parse::<u8>().map_err(|_| {
                TransportError::Config(format!("invalid delivery mode '{}' in target address", raw))
            })?;
        }
        Ok(params)
    }

    fn bool_property(&self, key: &str, default: bool) -> Result<bool> {
        match self.property(key) {
            None => Ok(default),
            Some("true") => Ok(true),
            Some("false") => Ok(false),
            Some(other) => Err(TransportError::Config(format!(
                "invalid boolean '{}' for {} in target address",
                other, key
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_queue_only() {
        let target = TargetAddress::parse("rabbitmq://orders.in").unwrap();
        assert_eq!(target.queue_name().unwrap(), "orders.in");
        assert!(target.factory_name().is_none());
    }

    #[test]
    fn test_parse_with_properties() {
        let target = TargetAddress::parse(
            "rabbitmq://orders.in?rabbitmq.exchange.name=orders.exchange\
             &rabbitmq.queue.routing.key=orders.created\
             &rabbitmq.connection.factory=default",
        )
        .unwrap();
        assert_eq!(target.queue_name().unwrap(), "orders.in");
        assert_eq!(target.property(EXCHANGE_NAME), Some("orders.exchange"));
        assert_eq!(target.property(ROUTING_KEY), Some("orders.created"));
        assert_eq!(target.factory_name(), Some("default"));
    }

    #[test]
    fn test_malformed_prefix_is_fatal() {
        match TargetAddress::parse("amqp://orders.in") {
            Err(TransportError::Config(_)) => {}
            other => panic!("expected a configuration error, got {:?}", other),
        }
    }

    #[test]
    fn test_malformed_parameter_is_fatal() {
        assert!(TargetAddress::parse("rabbitmq://orders.in?noequals").is_err());
    }

    #[test]
    fn test_connection_params_require_host() {
        let target = TargetAddress::parse("rabbitmq://orders.in").unwrap();
        assert!(target.connection_params().is_err());

        let target = TargetAddress::parse(
            "rabbitmq://orders.in?rabbitmq.server.host.name=broker.local&rabbitmq.server.port=5673",
        )
        .unwrap();
        let params = target.connection_params().unwrap();
        assert_eq!(params.host, "broker.local");
        assert_eq!(params.port, 5673);
        assert_eq!(params.username, "guest");
        assert_eq!(params.broker_key(), "broker.local:5673");
    }

    #[test]
    fn test_invalid_port_is_fatal() {
        let target = TargetAddress::parse(
            "rabbitmq://orders.in?rabbitmq.server.host.name=broker.local&rabbitmq.server.port=x",
        )
        .unwrap();
        assert!(target.connection_params().is_err());
    }

    #[test]
    fn test_to_service_params_mirrors_listener_topology() {
        let target = TargetAddress::parse(
            "rabbitmq://orders.in?rabbitmq.exchange.name=orders.exchange\
             &rabbitmq.exchange.type=topic&rabbitmq.queue.durable=false",
        )
        .unwrap();
        let params = target.to_service_params().unwrap();
        assert_eq!(params.effective_queue_name(), "orders.in");
        assert_eq!(params.exchange_name.as_deref(), Some("orders.exchange"));
        assert_eq!(params.exchange_type, "topic");
        assert!(!params.queue_durable);
        assert!(params.exchange_durable);
        // routing key defaults to the queue name
        assert_eq!(params.effective_routing_key("orders.in"), "orders.in");
    }

    #[test]
    fn test_queue_property_overrides_path() {
        let target =
            TargetAddress::parse("rabbitmq://ignored?rabbitmq.queue.name=orders.in").unwrap();
        assert_eq!(target.queue_name().unwrap(), "orders.in");
    }
}
