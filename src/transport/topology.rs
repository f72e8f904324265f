use crate::config::ServiceParams;
use crate::transport::errors::{Result, TransportError};
use lapin::options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::Channel;
use tracing::debug;

/// Declare the queue, optional exchange and binding for one service. Both
/// the listening and the sending side go through here so the two sides
/// always agree on topology. Returns the declared queue name.
pub(crate) async fn declare_topology(channel: &Channel, params: &ServiceParams) -> Result<String> {
    let queue = params.effective_queue_name();

    channel
        .queue_declare(
            &queue,
            QueueDeclareOptions {
                durable: params.queue_durable,
                exclusive: params.queue_exclusive,
                auto_delete: params.queue_auto_delete,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| TransportError::Channel(format!("failed to declare queue {}: {}", queue, e)))?;

    if let Some(exchange) = params.exchange_name.as_deref() {
        channel
            .exchange_declare(
                exchange,
                params.exchange_kind(),
                ExchangeDeclareOptions {
                    durable: params.exchange_durable,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                TransportError::Channel(format!("failed to declare exchange {}: {}", exchange, e))
            })?;

        let routing_key = params.effective_routing_key(&queue);
        channel
            .queue_bind(
                &queue,
                exchange,
                &routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                TransportError::Channel(format!(
                    "failed to bind queue {} to exchange {}: {}",
                    queue, exchange, e
                ))
            })?;
        debug!(queue = %queue, exchange = %exchange, routing_key = %routing_key, "topology declared");
    } else {
        debug!(queue = %queue, "queue declared");
    }

    Ok(queue)
}
