use crate::message::RabbitMessage;
use crate::transport::errors::{Result, TransportError};
use crate::transport::task_manager::ServiceTaskManager;
use crate::transport::topology::declare_topology;
use futures_lite::StreamExt;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicQosOptions};
use lapin::types::FieldTable;
use lapin::Channel;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const STATE_CREATED: u8 = 0;
const STATE_STARTED: u8 = 1;
const STATE_SHUTTING_DOWN: u8 = 2;
const STATE_STOPPED: u8 = 3;

const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(100);
const RETRY_PAUSE_MS: u64 = 500;

/// One polling loop: owns its connection and channel (not shared with
/// sibling tasks), consumes deliveries transactionally and hands each to
/// the dispatch callback. Self-removes from the manager's task list on
/// exit, whatever the exit path.
pub struct ListenerTask {
    manager: Arc<ServiceTaskManager>,
    state: AtomicU8,
    /// True right after a poll returned no message.
    idle: AtomicBool,
    connected: AtomicBool,
    paused: AtomicBool,
    /// The task's own connection, parked here so `request_shutdown()` can
    /// force-close it and unblock the delivery wait.
    connection: AsyncMutex<Option<lapin::Connection>>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl ListenerTask {
    pub(crate) fn new(manager: Arc<ServiceTaskManager>) -> Arc<Self> {
        Arc::new(ListenerTask {
            manager,
            state: AtomicU8::new(STATE_CREATED),
            idle: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            connection: AsyncMutex::new(None),
            join: Mutex::new(None),
        })
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self.state.load(Ordering::SeqCst),
            STATE_CREATED | STATE_STARTED
        )
    }

    pub fn is_idle(&self) -> bool {
        self.idle.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub(crate) fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    pub(crate) fn set_join(&self, handle: JoinHandle<()>) {
        *self.join_guard() = Some(handle);
    }

    pub(crate) fn take_join(&self) -> Option<JoinHandle<()>> {
        self.join_guard().take()
    }

    /// Ask the task to stop polling. Closing the connection is what
    /// unblocks a task stuck in the delivery wait; there is no separate
    /// cancellation primitive.
    pub async fn request_shutdown(&self) {
        let _ = self
            .state
            .compare_exchange(
                STATE_CREATED,
                STATE_SHUTTING_DOWN,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .or_else(|_| {
                self.state.compare_exchange(
                    STATE_STARTED,
                    STATE_SHUTTING_DOWN,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
            });

        if let Some(connection) = self.connection.lock().await.take() {
            debug!(service = %self.manager.service_name(), "force-closing listener connection");
            if let Err(e) = connection.close(0, "listener shutdown requested").await {
                warn!(
                    service = %self.manager.service_name(),
                    error = %e,
                    "error while force-closing listener connection"
                );
            }
        }
    }

    /// The task body submitted to the worker pool. Holds one pool slot for
    /// the task's whole lifetime and runs the guaranteed teardown exactly
    /// once on every exit path.
    pub(crate) async fn run(self: Arc<Self>) {
        let service = self.manager.service_name().to_string();
        self.manager.on_task_started();

        let result = async {
            let _slot = self.manager.pool().acquire_slot().await?;
            self.poll_loop().await
        }
        .await;

        let failed = match result {
            Ok(()) => {
                info!(service = %service, "listener task exiting");
                false
            }
            Err(e) => {
                error!(service = %service, error = %e, "listener task terminated by broker failure");
                true
            }
        };

        if let Some(connection) = self.connection.lock().await.take() {
            if let Err(e) = connection.close(0, "listener shutdown").await {
                debug!(service = %service, error = %e, "error closing listener connection");
            }
        }
        self.connected.store(false, Ordering::SeqCst);
        self.state.store(STATE_STOPPED, Ordering::SeqCst);
        self.manager.on_task_exited(&self, failed);
    }

    async fn poll_loop(&self) -> Result<()> {
        // shutdown may have been requested before the task ever ran
        if self
            .state
            .compare_exchange(
                STATE_CREATED,
                STATE_STARTED,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return Ok(());
        }

        let params = self.manager.params();
        let service = params.service_name.as_str();

        let connection = self.manager.factory().create_connection().await?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| TransportError::Channel(e.to_string()))?;

        {
            let mut slot = self.connection.lock().await;
            if !self.is_active() {
                drop(slot);
                if let Err(e) = connection.close(0, "shutdown before consume").await {
                    debug!(service = %service, error = %e, "error closing unused connection");
                }
                return Ok(());
            }
            *slot = Some(connection);
        }
        self.connected.store(true, Ordering::SeqCst);

        let queue = declare_topology(&channel, params).await?;
        if params.prefetch_count > 0 {
            channel
                .basic_qos(params.prefetch_count, BasicQosOptions::default())
                .await
                .map_err(|e| TransportError::Channel(format!("failed to set prefetch: {}", e)))?;
        }

        let consumer_tag = params
            .consumer_tag
            .clone()
            .unwrap_or_else(|| format!("consumer-{}", Uuid::new_v4()));
        let mut consumer = channel
            .basic_consume(
                &queue,
                &consumer_tag,
                BasicConsumeOptions {
                    no_ack: params.auto_ack,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::Consume(e.to_string()))?;

        info!(
            service = %service,
            queue = %queue,
            consumer_tag = %consumer_tag,
            "listener task consuming"
        );

        let transactional = !params.auto_ack;

        while self.is_active() {
            if self.paused.load(Ordering::SeqCst) {
                tokio::time::sleep(PAUSE_POLL_INTERVAL).await;
                continue;
            }

            if transactional {
                // a failed transaction begin abandons this iteration, it
                // does not kill the task
                if let Err(e) = channel.tx_select().await {
                    warn!(service = %service, error = %e, "failed to open broker transaction");
                    retry_pause().await;
                    continue;
                }
            }

            match consumer.next().await {
                Some(Ok(delivery)) => {
                    self.idle.store(false, Ordering::SeqCst);
                    self.handle_delivery(&channel, delivery, transactional).await;
                }
                Some(Err(e)) => {
                    self.idle.store(true, Ordering::SeqCst);
                    if !self.is_active() {
                        break;
                    }
                    if !channel.status().connected() {
                        return Err(TransportError::Consume(format!(
                            "consumer channel lost: {}",
                            e
                        )));
                    }
                    // an interrupted wait is "no message this iteration"
                    warn!(service = %service, error = %e, "interrupted while waiting for a delivery");
                }
                None => {
                    self.idle.store(true, Ordering::SeqCst);
                    if !self.is_active() {
                        break;
                    }
                    return Err(TransportError::Consume(
                        "broker closed the consumer stream".to_string(),
                    ));
                }
            }
        }

        Ok(())
    }

    /// Dispatch one delivery and settle its transaction. The dispatcher is
    /// invoked synchronously in this task's context; the next delivery is
    /// not awaited until the outcome here is final.
    async fn handle_delivery(&self, channel: &Channel, delivery: Delivery, transactional: bool) {
        let delivery_tag = delivery.delivery_tag;
        let message = RabbitMessage::from_delivery(&delivery);
        debug!(delivery_tag, "dispatching delivery");

        let accepted = self.manager.dispatcher().on_message(message).await;

        if !transactional {
            if !accepted {
                warn!(
                    delivery_tag,
                    "dispatch failed for an auto-ack delivery, the broker will not redeliver"
                );
            }
            return;
        }

        if accepted {
            if let Err(e) = self.ack_and_commit(channel, delivery_tag).await {
                error!(delivery_tag, error = %e, "failed to acknowledge delivery, rolling back");
                self.rollback(channel, delivery_tag).await;
            }
        } else {
            warn!(delivery_tag, "dispatch rejected delivery, rolling back for redelivery");
            self.rollback(channel, delivery_tag).await;
        }
    }

    async fn ack_and_commit(&self, channel: &Channel, delivery_tag: u64) -> Result<()> {
        channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| TransportError::Ack(e.to_string()))?;
        channel
            .tx_commit()
            .await
            .map_err(|e| TransportError::Ack(format!("commit failed: {}", e)))?;
        debug!(delivery_tag, "delivery acknowledged and committed");
        Ok(())
    }

    async fn rollback(&self, channel: &Channel, delivery_tag: u64) {
        if let Err(e) = channel.tx_rollback().await {
            error!(delivery_tag, error = %e, "failed to roll back broker transaction");
        }
    }

    fn join_guard(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.join.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn retry_pause() {
    // jittered so parallel tasks spread their retries
    let pause = (rand::random::<f64>() * 0.5 + 0.75) * RETRY_PAUSE_MS as f64;
    tokio::time::sleep(Duration::from_millis(pause as u64)).await;
}
