use crate::config::FactoryParams;
use crate::transport::errors::{Result, TransportError};
use lapin::{Connection, ConnectionProperties};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Wraps one broker's connection parameters and produces connections for
/// the two sides of the transport: fresh caller-owned connections for
/// listener tasks, and a memoized shared connection for the send path.
#[derive(Debug)]
pub struct ConnectionFactory {
    name: String,
    params: FactoryParams,
    shared: Mutex<Option<Arc<Connection>>>,
}

impl ConnectionFactory {
    /// Connection-parameter validation fails fast here; a factory is never
    /// constructed around an unusable parameter set.
    pub fn new(params: FactoryParams) -> Result<Self> {
        params.validate()?;
        let name = params
            .name
            .clone()
            .unwrap_or_else(|| params.broker_key());
        Ok(ConnectionFactory {
            name,
            params,
            shared: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &FactoryParams {
        &self.params
    }

    /// host:port identity of the broker this factory points at.
    pub fn broker_key(&self) -> String {
        self.params.broker_key()
    }

    /// Open a fresh connection owned by the caller. Listener tasks use
    /// this so each task has its own connection, not shared with siblings.
    /// The factory does not retry; the caller owns the retry policy.
    pub async fn create_connection(&self) -> Result<Connection> {
        debug!(factory = %self.name, host = %self.params.host, port = self.params.port,
            "opening broker connection");
        let connection =
            Connection::connect(&self.params.amqp_uri(), ConnectionProperties::default())
                .await
                .map_err(|e| {
                    TransportError::Connection(format!(
                        "failed to connect to {} as factory '{}': {}",
                        self.params.broker_key(),
                        self.name,
                        e
                    ))
                })?;
        Ok(connection)
    }

    /// The create-once shared connection used by sender-side channels.
    /// Subsequent calls return the cached connection; it is re-established
    /// only if the broker dropped it in the meantime.
    pub async fn shared_connection(&self) -> Result<Arc<Connection>> {
        let mut guard = self.shared.lock().await;
        if let Some(connection) = guard.as_ref() {
            if connection.status().connected() {
                return Ok(connection.clone());
            }
            warn!(factory = %self.name, "shared broker connection lost, re-establishing");
        } else {
            info!(factory = %self.name, "opening shared broker connection");
        }

        let connection = Arc::new(self.create_connection().await?);
        *guard = Some(connection.clone());
        Ok(connection)
    }

    /// Tear down the shared connection; only called on process shutdown.
    pub async fn close(&self) -> Result<()> {
        if let Some(connection) = self.shared.lock().await.take() {
            info!(factory = %self.name, "closing shared broker connection");
            connection
                .close(0, "transport shutdown")
                .await
                .map_err(|e| TransportError::Connection(e.to_string()))?;
        }
        Ok(())
    }
}
