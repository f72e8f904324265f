pub mod address;
pub mod endpoint;
pub mod errors;
pub mod factory;
pub mod listener;
pub mod pool;
pub mod registry;
pub mod sender;
pub mod task_manager;
mod topology;

// Re-export specific items to simplify imports elsewhere
pub use address::TargetAddress;
pub use endpoint::ServiceEndpoint;
pub use factory::ConnectionFactory;
pub use listener::ListenerTask;
pub use pool::{WorkerPool, DEFAULT_POOL_SIZE};
pub use registry::ConnectionFactoryRegistry;
pub use sender::RabbitSender;
pub use task_manager::{ManagerState, ServiceTaskManager};

use crate::config::{ServiceParams, TransportConfig};
use crate::message::MessageDispatcher;
use crate::transport::errors::{Result, TransportError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{info, warn};

/// Shared transport machinery handed to constructors instead of living in
/// process-wide statics: the factory registry and the listener worker pool.
#[derive(Clone)]
pub struct TransportContext {
    pub registry: Arc<ConnectionFactoryRegistry>,
    pub pool: Arc<WorkerPool>,
}

/// The transport front: owns the context and the deployed endpoints.
pub struct RabbitTransport {
    context: TransportContext,
    endpoints: Mutex<HashMap<String, Arc<ServiceEndpoint>>>,
}

impl RabbitTransport {
    pub fn new(config: &TransportConfig) -> Result<Self> {
        RabbitTransport::with_pool_size(config, DEFAULT_POOL_SIZE)
    }

    pub fn with_pool_size(config: &TransportConfig, pool_size: usize) -> Result<Self> {
        let registry = ConnectionFactoryRegistry::from_config(&config.factories)?;
        Ok(RabbitTransport {
            context: TransportContext {
                registry: Arc::new(registry),
                pool: Arc::new(WorkerPool::new(pool_size)),
            },
            endpoints: Mutex::new(HashMap::new()),
        })
    }

    pub fn context(&self) -> &TransportContext {
        &self.context
    }

    pub fn sender(&self) -> RabbitSender {
        RabbitSender::new(self.context.registry.clone())
    }

    /// Deploy a service: create its endpoint and start listening.
    pub fn deploy_service(
        &self,
        params: ServiceParams,
        dispatcher: Arc<dyn MessageDispatcher>,
    ) -> Result<Arc<ServiceEndpoint>> {
        let service_name = params.service_name.clone();
        {
            let endpoints = self.endpoints_guard();
            if endpoints.contains_key(&service_name) {
                return Err(TransportError::Config(format!(
                    "service '{}' is already deployed",
                    service_name
                )));
            }
        }

        let endpoint = Arc::new(ServiceEndpoint::deploy(&self.context, params, dispatcher)?);
        endpoint.start()?;
        self.endpoints_guard()
            .insert(service_name, endpoint.clone());
        Ok(endpoint)
    }

    pub fn endpoint(&self, service_name: &str) -> Option<Arc<ServiceEndpoint>> {
        self.endpoints_guard().get(service_name).cloned()
    }

    pub fn deployed_services(&self) -> Vec<String> {
        self.endpoints_guard().keys().cloned().collect()
    }

    pub async fn undeploy_service(&self, service_name: &str) -> Result<()> {
        let endpoint = self.endpoints_guard().remove(service_name);
        match endpoint {
            Some(endpoint) => endpoint.undeploy().await,
            None => {
                warn!(service = %service_name, "undeploy for a service that is not deployed");
                Ok(())
            }
        }
    }

    /// Undeploy every service and tear down the shared connections.
    pub async fn shutdown(&self) -> Result<()> {
        info!("shutting down transport");
        let endpoints: Vec<Arc<ServiceEndpoint>> =
            self.endpoints_guard().drain().map(|(_, e)| e).collect();
        for endpoint in endpoints {
            endpoint.undeploy().await?;
        }
        for factory in self.context.registry.all() {
            if let Err(e) = factory.close().await {
                warn!(factory = %factory.name(), error = %e, "error closing connection factory");
            }
        }
        info!("transport shut down");
        Ok(())
    }

    fn endpoints_guard(&self) -> MutexGuard<'_, HashMap<String, Arc<ServiceEndpoint>>> {
        self.endpoints.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
