use crate::config::ServiceParams;
use crate::message::MessageDispatcher;
use crate::transport::errors::{Result, TransportError};
use crate::transport::factory::ConnectionFactory;
use crate::transport::task_manager::{ManagerState, ServiceTaskManager};
use crate::transport::TransportContext;
use std::sync::Arc;
use tracing::info;

/// Binds one logical service to one connection factory and owns the
/// per-service task manager. Created when the service is deployed,
/// destroyed on undeploy.
pub struct ServiceEndpoint {
    service_name: String,
    factory: Arc<ConnectionFactory>,
    task_manager: Arc<ServiceTaskManager>,
}

impl ServiceEndpoint {
    pub fn deploy(
        context: &TransportContext,
        params: ServiceParams,
        dispatcher: Arc<dyn MessageDispatcher>,
    ) -> Result<Self> {
        let factory = context
            .registry
            .get(&params.connection_factory)
            .ok_or_else(|| {
                TransportError::Config(format!(
                    "service '{}' references unknown connection factory '{}'",
                    params.service_name, params.connection_factory
                ))
            })?;

        let service_name = params.service_name.clone();
        let task_manager =
            ServiceTaskManager::new(params, factory.clone(), context.pool.clone(), dispatcher);

        info!(service = %service_name, factory = %factory.name(), "service endpoint deployed");
        Ok(ServiceEndpoint {
            service_name,
            factory,
            task_manager,
        })
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn factory(&self) -> &Arc<ConnectionFactory> {
        &self.factory
    }

    pub fn task_manager(&self) -> &Arc<ServiceTaskManager> {
        &self.task_manager
    }

    pub fn state(&self) -> ManagerState {
        self.task_manager.state()
    }

    pub fn start(&self) -> Result<()> {
        self.task_manager.start()
    }

    pub async fn undeploy(&self) -> Result<()> {
        info!(service = %self.service_name, "service endpoint undeploying");
        self.task_manager.stop().await
    }
}
