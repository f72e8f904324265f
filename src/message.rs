use amq_protocol_types::{AMQPValue, FieldTable, ShortString};
use async_trait::async_trait;
use lapin::message::Delivery;
use lapin::BasicProperties;
use std::collections::HashMap;
use uuid::Uuid;

/// Header carrying the application-level action/command string.
pub const ACTION_HEADER: &str = "x-message-action";

/// One inbound or outbound broker message: delivery metadata, headers and
/// an opaque body. Built fresh per poll iteration on the listening side,
/// consumed and discarded after dispatch.
#[derive(Debug, Clone, Default)]
pub struct RabbitMessage {
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    /// Application-defined action/command, carried in [`ACTION_HEADER`].
    pub action: Option<String>,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    /// Broker-assigned tag used to ack/nack; only set on inbound messages.
    pub delivery_tag: Option<u64>,
}

impl RabbitMessage {
    pub fn new(body: Vec<u8>) -> Self {
        RabbitMessage {
            body,
            ..RabbitMessage::default()
        }
    }

    /// Build a message from a broker delivery: envelope, properties and headers.
    pub fn from_delivery(delivery: &Delivery) -> Self {
        let props = &delivery.properties;
        let headers = props
            .headers()
            .as_ref()
            .map(headers_from_table)
            .unwrap_or_default();
        let action = headers.get(ACTION_HEADER).cloned();

        RabbitMessage {
            message_id: props.message_id().as_ref().map(|s| s.as_str().to_string()),
            correlation_id: props.correlation_id().as_ref().map(|s| s.as_str().to_string()),
            reply_to: props.reply_to().as_ref().map(|s| s.as_str().to_string()),
            content_type: props.content_type().as_ref().map(|s| s.as_str().to_string()),
            content_encoding: props.content_encoding().as_ref().map(|s| s.as_str().to_string()),
            action,
            headers,
            body: delivery.data.clone(),
            delivery_tag: Some(delivery.delivery_tag),
        }
    }

    /// Build broker message properties for the send path. A message id is
    /// generated when the caller did not set one.
    pub fn to_basic_properties(&self) -> BasicProperties {
        let message_id = self
            .message_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut table = FieldTable::default();
        for (key, value) in &self.headers {
            table.insert(
                ShortString::from(key.clone()),
                AMQPValue::LongString(value.clone().into()),
            );
        }
        if let Some(action) = &self.action {
            table.insert(
                ShortString::from(ACTION_HEADER),
                AMQPValue::LongString(action.clone().into()),
            );
        }

        let mut props = BasicProperties::default()
            .with_message_id(message_id.into())
            .with_headers(table)
            .with_timestamp(chrono::Utc::now().timestamp() as u64);

        if let Some(content_type) = &self.content_type {
            props = props.with_content_type(content_type.clone().into());
        }
        if let Some(content_encoding) = &self.content_encoding {
            props = props.with_content_encoding(content_encoding.clone().into());
        }
        if let Some(correlation_id) = &self.correlation_id {
            props = props.with_correlation_id(correlation_id.clone().into());
        }
        if let Some(reply_to) = &self.reply_to {
            props = props.with_reply_to(reply_to.clone().into());
        }

        props
    }
}

/// Flatten a broker header table into a string map. Only string-typed
/// values are carried over; other AMQP types are skipped.
fn headers_from_table(table: &FieldTable) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    for (key, value) in table.inner() {
        match value {
            AMQPValue::LongString(s) => {
                headers.insert(
                    key.as_str().to_string(),
                    String::from_utf8_lossy(s.as_bytes()).into_owned(),
                );
            }
            AMQPValue::ShortString(s) => {
                headers.insert(key.as_str().to_string(), s.as_str().to_string());
            }
            _ => {}
        }
    }
    headers
}

/// Contract between the transport core and the hosting engine. Called at
/// most once per delivery per attempt, synchronously from the polling
/// task's own execution context; the returned flag drives ack-vs-rollback.
#[async_trait]
pub trait MessageDispatcher: Send + Sync {
    async fn on_message(&self, message: RabbitMessage) -> bool;
}
