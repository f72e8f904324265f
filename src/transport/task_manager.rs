use crate::config::ServiceParams;
use crate::message::MessageDispatcher;
use crate::transport::errors::Result;
use crate::transport::factory::ConnectionFactory;
use crate::transport::listener::ListenerTask;
use crate::transport::pool::WorkerPool;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long `stop()` waits for signalled listener tasks to drain.
const SHUTDOWN_WAIT: Duration = Duration::from_secs(10);

/// Aggregate state of a service's listener tasks. Transitions are
/// monotonic per start/stop cycle; `Failure` is sticky.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ManagerState {
    Stopped,
    Started,
    Paused,
    ShuttingDown,
    Failure,
}

/// Supervises the polling tasks of one service: start/stop/pause/resume,
/// the running-task list, and the aggregate task counters.
pub struct ServiceTaskManager {
    service_name: String,
    params: ServiceParams,
    factory: Arc<ConnectionFactory>,
    pool: Arc<WorkerPool>,
    dispatcher: Arc<dyn MessageDispatcher>,
    state: Mutex<ManagerState>,
    tasks: Mutex<Vec<Arc<ListenerTask>>>,
    active_tasks: AtomicUsize,
    failed_tasks: AtomicUsize,
}

impl ServiceTaskManager {
    pub fn new(
        params: ServiceParams,
        factory: Arc<ConnectionFactory>,
        pool: Arc<WorkerPool>,
        dispatcher: Arc<dyn MessageDispatcher>,
    ) -> Arc<Self> {
        Arc::new(ServiceTaskManager {
            service_name: params.service_name.clone(),
            params,
            factory,
            pool,
            dispatcher,
            state: Mutex::new(ManagerState::Stopped),
            tasks: Mutex::new(Vec::new()),
            active_tasks: AtomicUsize::new(0),
            failed_tasks: AtomicUsize::new(0),
        })
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn state(&self) -> ManagerState {
        *self.state_guard()
    }

    /// Advisory count of tasks currently inside their run body.
    pub fn active_task_count(&self) -> usize {
        self.active_tasks.load(Ordering::SeqCst)
    }

    /// Tasks currently registered in the running-task list.
    pub fn running_task_count(&self) -> usize {
        self.tasks_guard().len()
    }

    pub fn failed_task_count(&self) -> usize {
        self.failed_tasks.load(Ordering::SeqCst)
    }

    /// Launch one listener task on the worker pool. Only valid from
    /// `Stopped`; calling `start()` on a manager that is already running
    /// is a guarded no-op so repeated calls cannot stack extra tasks.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state_guard();
            if *state != ManagerState::Stopped {
                warn!(
                    service = %self.service_name,
                    state = ?*state,
                    "start ignored, task manager is not stopped"
                );
                return Ok(());
            }
            *state = ManagerState::Started;
        }

        let task = ListenerTask::new(self.clone());
        self.tasks_guard().push(task.clone());
        let handle = tokio::spawn(task.clone().run());
        task.set_join(handle);

        info!(service = %self.service_name, "service task manager started");
        Ok(())
    }

    /// Signal every running task to shut down and wait for them to drain.
    /// Valid from any state; a manager already in `Failure` stays there.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state_guard();
            match *state {
                ManagerState::Stopped => {
                    debug!(service = %self.service_name, "stop on an already stopped task manager");
                }
                ManagerState::Failure => {
                    warn!(service = %self.service_name, "stopping a failed task manager");
                }
                _ => *state = ManagerState::ShuttingDown,
            }
        }

        let tasks: Vec<Arc<ListenerTask>> = self.tasks_guard().clone();
        for task in &tasks {
            task.request_shutdown().await;
        }

        let joins: Vec<JoinHandle<()>> = tasks.iter().filter_map(|t| t.take_join()).collect();
        if !joins.is_empty()
            && tokio::time::timeout(SHUTDOWN_WAIT, futures::future::join_all(joins))
                .await
                .is_err()
        {
            warn!(
                service = %self.service_name,
                "listener tasks did not exit within {:?}",
                SHUTDOWN_WAIT
            );
        }

        {
            let mut state = self.state_guard();
            if *state != ManagerState::Failure {
                *state = ManagerState::Stopped;
            }
        }
        info!(service = %self.service_name, "service task manager stopped");
        Ok(())
    }

    /// Suspend consumption without closing any connection. Tasks check the
    /// pause flag between poll iterations.
    pub fn pause(&self) -> Result<()> {
        {
            let mut state = self.state_guard();
            if *state != ManagerState::Started {
                warn!(
                    service = %self.service_name,
                    state = ?*state,
                    "pause ignored, task manager is not started"
                );
                return Ok(());
            }
            *state = ManagerState::Paused;
        }
        for task in self.tasks_guard().iter() {
            task.set_paused(true);
        }
        info!(service = %self.service_name, "service task manager paused");
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        {
            let mut state = self.state_guard();
            if *state != ManagerState::Paused {
                warn!(
                    service = %self.service_name,
                    state = ?*state,
                    "resume ignored, task manager is not paused"
                );
                return Ok(());
            }
            *state = ManagerState::Started;
        }
        for task in self.tasks_guard().iter() {
            task.set_paused(false);
        }
        info!(service = %self.service_name, "service task manager resumed");
        Ok(())
    }

    pub(crate) fn params(&self) -> &ServiceParams {
        &self.params
    }

    pub(crate) fn factory(&self) -> &ConnectionFactory {
        &self.factory
    }

    pub(crate) fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub(crate) fn dispatcher(&self) -> &dyn MessageDispatcher {
        self.dispatcher.as_ref()
    }

    pub(crate) fn on_task_started(&self) {
        self.active_tasks.fetch_add(1, Ordering::SeqCst);
    }

    /// Called exactly once by each task on its way out, on every exit
    /// path. A task's fatal broker error escalates to manager `Failure`
    /// only when no tasks remain running and the manager was not already
    /// shutting down.
    pub(crate) fn on_task_exited(&self, task: &Arc<ListenerTask>, failed: bool) {
        self.active_tasks.fetch_sub(1, Ordering::SeqCst);
        self.tasks_guard().retain(|t| !Arc::ptr_eq(t, task));

        if !failed {
            return;
        }
        self.failed_tasks.fetch_add(1, Ordering::SeqCst);

        if self.tasks_guard().is_empty() {
            let mut state = self.state_guard();
            if matches!(*state, ManagerState::Started | ManagerState::Paused) {
                error!(
                    service = %self.service_name,
                    "all listener tasks failed, marking service task manager as failed"
                );
                *state = ManagerState::Failure;
            }
        }
    }

    fn state_guard(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn tasks_guard(&self) -> MutexGuard<'_, Vec<Arc<ListenerTask>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FactoryParams;
    use crate::message::RabbitMessage;
    use async_trait::async_trait;

    struct NullDispatcher;

    #[async_trait]
    impl MessageDispatcher for NullDispatcher {
        async fn on_message(&self, _message: RabbitMessage) -> bool {
            true
        }
    }

    fn manager() -> Arc<ServiceTaskManager> {
        let factory = Arc::new(
            ConnectionFactory::new(FactoryParams {
                name: Some("default".to_string()),
                host: "localhost".to_string(),
                port: 5672,
                username: "guest".to_string(),
                password: "guest".to_string(),
                vhost: "/".to_string(),
            })
            .unwrap(),
        );
        ServiceTaskManager::new(
            ServiceParams::new("OrderService", "default"),
            factory,
            Arc::new(WorkerPool::new(2)),
            Arc::new(NullDispatcher),
        )
    }

    #[tokio::test]
    async fn test_start_only_from_stopped() {
        let manager = manager();
        assert_eq!(manager.state(), ManagerState::Stopped);

        manager.start().unwrap();
        assert_eq!(manager.state(), ManagerState::Started);
        assert_eq!(manager.running_task_count(), 1);

        // a second start must not stack another task
        manager.start().unwrap();
        assert_eq!(manager.running_task_count(), 1);

        manager.stop().await.unwrap();
        assert_eq!(manager.state(), ManagerState::Stopped);
        assert_eq!(manager.running_task_count(), 0);
        assert_eq!(manager.active_task_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let manager = manager();
        manager.start().unwrap();

        manager.stop().await.unwrap();
        let state_after_first = manager.state();
        manager.stop().await.unwrap();

        assert_eq!(manager.state(), state_after_first);
        assert_eq!(manager.state(), ManagerState::Stopped);
        assert_eq!(manager.running_task_count(), 0);
        assert_eq!(manager.active_task_count(), 0);
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let manager = manager();

        // pause before start is a guarded no-op
        manager.pause().unwrap();
        assert_eq!(manager.state(), ManagerState::Stopped);

        manager.start().unwrap();
        manager.pause().unwrap();
        assert_eq!(manager.state(), ManagerState::Paused);

        manager.resume().unwrap();
        assert_eq!(manager.state(), ManagerState::Started);

        manager.stop().await.unwrap();
        assert_eq!(manager.state(), ManagerState::Stopped);
    }

    #[tokio::test]
    async fn test_last_task_failure_escalates_to_manager() {
        let manager = manager();
        *manager.state_guard() = ManagerState::Started;

        let task = ListenerTask::new(manager.clone());
        manager.tasks_guard().push(task.clone());
        manager.on_task_started();

        manager.on_task_exited(&task, true);
        assert_eq!(manager.state(), ManagerState::Failure);
        assert_eq!(manager.failed_task_count(), 1);
        assert_eq!(manager.running_task_count(), 0);

        // failure is sticky through stop()
        manager.stop().await.unwrap();
        assert_eq!(manager.state(), ManagerState::Failure);
    }

    #[tokio::test]
    async fn test_task_failure_with_survivors_stays_started() {
        let manager = manager();
        *manager.state_guard() = ManagerState::Started;

        let failing = ListenerTask::new(manager.clone());
        let surviving = ListenerTask::new(manager.clone());
        manager.tasks_guard().push(failing.clone());
        manager.tasks_guard().push(surviving.clone());
        manager.on_task_started();
        manager.on_task_started();

        manager.on_task_exited(&failing, true);
        assert_eq!(manager.state(), ManagerState::Started);
        assert_eq!(manager.running_task_count(), 1);
        assert_eq!(manager.failed_task_count(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_during_shutdown_does_not_fail_manager() {
        let manager = manager();
        *manager.state_guard() = ManagerState::ShuttingDown;

        let task = ListenerTask::new(manager.clone());
        manager.tasks_guard().push(task.clone());
        manager.on_task_started();

        manager.on_task_exited(&task, true);
        assert_eq!(manager.state(), ManagerState::ShuttingDown);
    }
}
