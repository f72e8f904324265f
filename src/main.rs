use async_trait::async_trait;
use rabbit_transport::config::{self, FactoryParams, TransportConfig};
use rabbit_transport::message::{MessageDispatcher, RabbitMessage};
use rabbit_transport::transport::RabbitTransport;
use std::error::Error;
use std::sync::Arc;
use tracing::{info, warn};

/// Demo dispatcher: logs each delivery and accepts it.
struct LoggingDispatcher;

#[async_trait]
impl MessageDispatcher for LoggingDispatcher {
    async fn on_message(&self, message: RabbitMessage) -> bool {
        info!(
            message_id = ?message.message_id,
            action = ?message.action,
            bytes = message.body.len(),
            "received message"
        );
        true
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Setup tracing for logging
    tracing_subscriber::fmt::init();

    // Load environment variables from .env file if present
    dotenv::dotenv().ok();

    let config = match config::load_config() {
        Ok(config) => config,
        Err(e) => {
            warn!("no usable configuration file ({e}), using a local default");
            TransportConfig {
                factories: vec![FactoryParams {
                    name: Some("default".to_string()),
                    host: "localhost".to_string(),
                    port: 5672,
                    username: "guest".to_string(),
                    password: "guest".to_string(),
                    vhost: "/".to_string(),
                }],
                services: Vec::new(),
            }
        }
    };

    let transport = RabbitTransport::new(&config)?;
    for service in &config.services {
        transport.deploy_service(service.clone(), Arc::new(LoggingDispatcher))?;
        info!(service = %service.service_name, "deployed");
    }

    info!("transport running, press Ctrl+C to exit");
    tokio::signal::ctrl_c().await?;

    info!("shutting down");
    transport.shutdown().await?;

    Ok(())
}
