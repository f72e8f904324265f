use crate::message::RabbitMessage;
use crate::transport::address::TargetAddress;
use crate::transport::errors::{Result, TransportError};
use crate::transport::factory::ConnectionFactory;
use crate::transport::registry::ConnectionFactoryRegistry;
use crate::transport::topology::declare_topology;
use lapin::options::BasicPublishOptions;
use std::sync::Arc;
use tracing::{info, warn};

/// The outbound side of the transport: resolve a factory from the target
/// address, publish once over a short-lived channel, close the channel.
/// No retry lives here; the calling engine owns retry policy.
pub struct RabbitSender {
    registry: Arc<ConnectionFactoryRegistry>,
}

impl RabbitSender {
    pub fn new(registry: Arc<ConnectionFactoryRegistry>) -> Self {
        RabbitSender { registry }
    }

    pub async fn send(&self, message: &RabbitMessage, target: &TargetAddress) -> Result<()> {
        let factory = self.resolve_factory(target)?;
        let params = target.to_service_params()?;

        let connection = factory.shared_connection().await?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| TransportError::Channel(e.to_string()))?;

        // both sides must agree on topology, so the send path declares the
        // same queue/exchange/binding the listener declares
        let queue = declare_topology(&channel, &params).await?;
        let (exchange, routing_key) = match params.exchange_name.as_deref() {
            Some(exchange) => (exchange.to_string(), params.effective_routing_key(&queue)),
            None => (String::new(), queue.clone()),
        };

        let mut properties = message
            .to_basic_properties()
            .with_delivery_mode(params.delivery_mode);
        if message.content_type.is_none() {
            if let Some(content_type) = target.content_type() {
                properties = properties.with_content_type(content_type.into());
            }
        }

        channel
            .basic_publish(
                &exchange,
                &routing_key,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))?;

        info!(
            factory = %factory.name(),
            exchange = %exchange,
            routing_key = %routing_key,
            "published message"
        );

        // one channel per publish; close it right away
        if let Err(e) = channel.close(0, "send complete").await {
            warn!(error = %e, "failed to close send channel");
        }
        Ok(())
    }

    fn resolve_factory(&self, target: &TargetAddress) -> Result<Arc<ConnectionFactory>> {
        if let Some(name) = target.factory_name() {
            return self.registry.get(name).ok_or_else(|| {
                TransportError::Config(format!(
                    "target address references unknown connection factory '{}'",
                    name
                ))
            });
        }
        self.registry.get_or_create(target.connection_params()?)
    }
}
