//! Event bus over an Iggy server.
//!
//! The exchange is a single Iggy stream (`EVENT_STREAM`); each routing key is
//! a single-partition topic inside it, created on first use. Each binding is
//! a named Iggy consumer that polls one message at a time and stores its
//! offset only after the handler acknowledged the message.
//!
//! The exchange is transient. Topics keep events for `EVENT_RETENTION_SECS`
//! only, and a binding with no stored offset starts after the newest message
//! instead of replaying the topic. Events published while nothing was bound
//! are not delivered to later bindings.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use iggy::prelude::*;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use super::connection::LinkState;
use super::helpers::{backoff_delay, consumer_name, to_identifier};
use super::{DeliveryPolicy, EventBus, MessageHandler, Outcome, deliver};
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::metrics;

/// Partitions are 0-indexed; every topic has exactly one.
const PARTITION_ID: u32 = 0;
const TOPIC_PARTITIONS: u32 = 1;

/// Iggy-backed [`EventBus`].
///
/// Cheap to clone; clones share the connection and the consumer tasks.
#[derive(Clone)]
pub struct IggyEventBus {
    inner: Arc<Inner>,
}

struct Inner {
    /// `None` until the first successful connect
    client: RwLock<Option<IggyClient>>,
    connection_string: String,
    stream: String,
    stream_id: Identifier,
    service: String,
    operation_timeout: Duration,
    max_reconnect_attempts: u32,
    reconnect_base_delay: Duration,
    reconnect_max_delay: Duration,
    poll_interval: Duration,
    retention: Duration,
    policy: DeliveryPolicy,
    link: LinkState,
    /// Topics known to exist on the current connection
    topics: Mutex<HashSet<String>>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

/// One routing key bound to one handler.
struct Binding {
    routing_key: String,
    topic_id: Identifier,
    consumer: Consumer,
    handler: Arc<dyn MessageHandler>,
}

impl IggyEventBus {
    /// Create the bus without connecting. The first publish or consumer poll
    /// establishes the connection.
    pub fn new(config: &Config) -> AppResult<Self> {
        let stream_id = to_identifier(&config.event_stream, "stream")?;

        Ok(Self {
            inner: Arc::new(Inner {
                client: RwLock::new(None),
                connection_string: config.iggy_connection_string.clone(),
                stream: config.event_stream.clone(),
                stream_id,
                service: config.consumer_name.clone(),
                operation_timeout: config.operation_timeout,
                max_reconnect_attempts: config.max_reconnect_attempts,
                reconnect_base_delay: config.reconnect_base_delay,
                reconnect_max_delay: config.reconnect_max_delay,
                poll_interval: config.event_poll_interval,
                retention: config.event_retention,
                policy: DeliveryPolicy::from_config(config),
                link: LinkState::new(),
                topics: Mutex::new(HashSet::new()),
                tracker: TaskTracker::new(),
                cancel: CancellationToken::new(),
            }),
        })
    }

    // =========================================================================
    // Connection Management
    // =========================================================================

    /// Connect unless already connected. Concurrent callers share one attempt.
    #[instrument(skip(self))]
    pub async fn ensure_connected(&self) -> AppResult<()> {
        let link = &self.inner.link;
        if link.is_connected() {
            return Ok(());
        }

        let Some(guard) = link.begin_connecting() else {
            link.wait_settled().await;
            return if link.is_connected() {
                Ok(())
            } else {
                Err(AppError::Broker(
                    "Connection attempt by another task failed".to_string(),
                ))
            };
        };

        let client = self.connect_once().await?;
        *self.inner.client.write().await = Some(client);
        self.inner.topics.lock().await.clear();
        guard.succeeded();

        info!(stream = %self.inner.stream, "Connected to Iggy server");
        Ok(())
    }

    async fn connect_once(&self) -> AppResult<IggyClient> {
        let client = IggyClient::from_connection_string(&self.inner.connection_string)
            .map_err(|e| AppError::ConfigError(format!("Invalid Iggy connection string: {e}")))?;

        timeout(self.inner.operation_timeout, client.connect())
            .await
            .map_err(|_| AppError::OperationTimeout("connect".to_string()))?
            .map_err(|e| AppError::Broker(e.to_string()))?;

        Ok(client)
    }

    /// Drop the current connection and reconnect with exponential backoff.
    ///
    /// Gives up after `MAX_RECONNECT_ATTEMPTS` consecutive failures (0 = never).
    async fn reconnect(&self) -> AppResult<()> {
        self.inner.link.mark_disconnected();

        loop {
            let attempt = self.inner.link.next_attempt();
            let max_attempts = self.inner.max_reconnect_attempts;
            if max_attempts > 0 && attempt > max_attempts {
                error!(max_attempts, "Maximum reconnection attempts exceeded");
                return Err(AppError::Broker(format!(
                    "Failed to reconnect after {max_attempts} attempts"
                )));
            }

            let delay = backoff_delay(
                attempt,
                self.inner.reconnect_base_delay,
                self.inner.reconnect_max_delay,
            );
            warn!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting to Iggy server");
            metrics::record_reconnect_attempt();
            sleep(delay).await;

            match self.ensure_connected().await {
                Ok(()) => {
                    info!(attempt, "Reconnected to Iggy server");
                    return Ok(());
                }
                Err(e) => warn!(attempt, error = %e, "Reconnection attempt failed"),
            }
        }
    }

    /// Run `operation` against a live connection, bounded by the operation
    /// timeout. A connection-level failure triggers one reconnect and retry.
    async fn with_connection<F, Fut, T>(&self, operation: F) -> AppResult<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = AppResult<T>>,
    {
        self.ensure_connected().await?;

        match self.bounded(operation()).await {
            Err(e) if e.is_connection_error() => {
                warn!(error = %e, "Broker operation failed, reconnecting");
                self.reconnect().await?;
                self.bounded(operation()).await
            }
            result => result,
        }
    }

    async fn bounded<T>(
        &self,
        operation: impl std::future::Future<Output = AppResult<T>>,
    ) -> AppResult<T> {
        timeout(self.inner.operation_timeout, operation)
            .await
            .map_err(|_| {
                AppError::OperationTimeout(format!(
                    "Broker operation timed out after {:?}",
                    self.inner.operation_timeout
                ))
            })?
    }

    // =========================================================================
    // Topology
    // =========================================================================

    /// Make sure the stream and the topic for `routing_key` exist.
    ///
    /// Creation races with other services are tolerated by re-reading after a
    /// failed create.
    async fn ensure_topic(&self, client: &IggyClient, routing_key: &str) -> AppResult<()> {
        if self.inner.topics.lock().await.contains(routing_key) {
            return Ok(());
        }

        let stream_id = &self.inner.stream_id;
        if !matches!(client.get_stream(stream_id).await, Ok(Some(_))) {
            info!(stream = %self.inner.stream, "Creating stream");
            if let Err(e) = client.create_stream(&self.inner.stream).await
                && !matches!(client.get_stream(stream_id).await, Ok(Some(_)))
            {
                return Err(AppError::Broker(format!("Failed to create stream: {e}")));
            }
        }

        let topic_id = to_identifier(routing_key, "topic")?;
        if !matches!(client.get_topic(stream_id, &topic_id).await, Ok(Some(_))) {
            info!(stream = %self.inner.stream, topic = routing_key, "Creating topic");
            if let Err(e) = client
                .create_topic(
                    stream_id,
                    routing_key,
                    TOPIC_PARTITIONS,
                    Default::default(),
                    None,
                    IggyExpiry::ExpireDuration(IggyDuration::from(self.inner.retention)),
                    MaxTopicSize::Unlimited,
                )
                .await
                && !matches!(client.get_topic(stream_id, &topic_id).await, Ok(Some(_)))
            {
                return Err(AppError::Broker(format!("Failed to create topic: {e}")));
            }
        }

        self.inner.topics.lock().await.insert(routing_key.to_string());
        Ok(())
    }

    // =========================================================================
    // Consumer loop
    // =========================================================================

    /// Store the current tail as the offset of a binding that has none yet.
    async fn position_at_tail(&self, binding: &Binding) -> AppResult<()> {
        self.ensure_connected().await?;

        self.bounded(async {
            let guard = self.inner.client.read().await;
            let client = connected(&guard)?;
            self.ensure_topic(client, &binding.routing_key).await?;

            let stored = client
                .get_consumer_offset(
                    &binding.consumer,
                    &self.inner.stream_id,
                    &binding.topic_id,
                    Some(PARTITION_ID),
                )
                .await
                .map_err(|e| AppError::Broker(e.to_string()))?;
            if let Some(stored) = stored {
                debug!(
                    routing_key = %binding.routing_key,
                    offset = stored.stored_offset,
                    "Resuming binding from stored offset"
                );
                return Ok(());
            }

            let topic = client
                .get_topic(&self.inner.stream_id, &binding.topic_id)
                .await
                .map_err(|e| AppError::Broker(e.to_string()))?
                .ok_or_else(|| {
                    AppError::Broker(format!("Topic {} not found", binding.routing_key))
                })?;
            let Some(partition) = topic.partitions.first() else {
                return Ok(());
            };
            if partition.messages_count == 0 {
                return Ok(());
            }

            client
                .store_consumer_offset(
                    &binding.consumer,
                    &self.inner.stream_id,
                    &binding.topic_id,
                    Some(PARTITION_ID),
                    partition.current_offset,
                )
                .await
                .map_err(|e| AppError::Broker(e.to_string()))?;

            info!(
                routing_key = %binding.routing_key,
                skipped = partition.messages_count,
                "New binding starts after the newest event"
            );
            Ok(())
        })
        .await
    }

    /// Next message for `binding`, positioning it first if it is new.
    async fn next_message(
        &self,
        binding: &Binding,
        positioned: &mut bool,
    ) -> AppResult<Option<(u64, Vec<u8>)>> {
        if !*positioned {
            self.position_at_tail(binding).await?;
            *positioned = true;
        }
        self.poll_one(binding).await
    }

    async fn poll_one(&self, binding: &Binding) -> AppResult<Option<(u64, Vec<u8>)>> {
        self.ensure_connected().await?;

        self.bounded(async {
            let guard = self.inner.client.read().await;
            let client = connected(&guard)?;
            self.ensure_topic(client, &binding.routing_key).await?;

            let polled = client
                .poll_messages(
                    &self.inner.stream_id,
                    &binding.topic_id,
                    Some(PARTITION_ID),
                    &binding.consumer,
                    &PollingStrategy::next(),
                    1,
                    false,
                )
                .await
                .map_err(|e| AppError::Broker(e.to_string()))?;

            Ok(polled
                .messages
                .into_iter()
                .next()
                .map(|msg| (msg.header.offset, msg.payload.to_vec())))
        })
        .await
    }

    async fn commit(&self, binding: &Binding, offset: u64) -> AppResult<()> {
        self.bounded(async {
            let guard = self.inner.client.read().await;
            let client = connected(&guard)?;
            client
                .store_consumer_offset(
                    &binding.consumer,
                    &self.inner.stream_id,
                    &binding.topic_id,
                    Some(PARTITION_ID),
                    offset,
                )
                .await
                .map_err(|e| AppError::Broker(e.to_string()))
        })
        .await
    }

    async fn run_binding(&self, binding: Binding) {
        let cancel = self.inner.cancel.clone();
        let policy = self.inner.policy;
        // Deliveries of the message at `current_offset`
        let mut current_offset: Option<u64> = None;
        let mut attempt = 0u32;
        let mut positioned = false;

        loop {
            let polled = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                polled = self.next_message(&binding, &mut positioned) => polled,
            };

            let pause = match polled {
                Ok(Some((offset, payload))) => {
                    if current_offset != Some(offset) {
                        current_offset = Some(offset);
                        attempt = 0;
                    }
                    attempt += 1;

                    // Not raced against cancellation: an in-flight handler finishes
                    let outcome = deliver(
                        binding.handler.as_ref(),
                        &binding.routing_key,
                        &payload,
                        attempt,
                        &policy,
                    )
                    .await;

                    match outcome {
                        Outcome::Ack => {
                            if let Err(e) = self.commit(&binding, offset).await {
                                warn!(
                                    routing_key = %binding.routing_key,
                                    offset,
                                    error = %e,
                                    "Offset commit failed, message will be redelivered"
                                );
                            }
                            None
                        }
                        Outcome::Retry => Some(policy.retry_delay),
                    }
                }
                Ok(None) => Some(self.inner.poll_interval),
                Err(e) if e.is_connection_error() => {
                    warn!(routing_key = %binding.routing_key, error = %e, "Consumer lost broker connection");
                    let reconnected = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        result = self.reconnect() => result,
                    };
                    reconnected.err().map(|_| self.inner.reconnect_max_delay)
                }
                Err(e) => {
                    warn!(routing_key = %binding.routing_key, error = %e, "Consumer poll failed");
                    Some(self.inner.poll_interval)
                }
            };

            if let Some(pause) = pause {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = sleep(pause) => {}
                }
            }
        }

        debug!(routing_key = %binding.routing_key, "Consumer loop shutting down");
    }
}

fn connected(client: &Option<IggyClient>) -> AppResult<&IggyClient> {
    client
        .as_ref()
        .ok_or_else(|| AppError::Broker("Not connected".to_string()))
}

#[async_trait]
impl EventBus for IggyEventBus {
    #[instrument(skip(self, payload), fields(payload_size = payload.len()))]
    async fn publish(&self, routing_key: &str, payload: String) -> AppResult<()> {
        let topic_id = &to_identifier(routing_key, "topic")?;
        let payload = payload.as_str();

        self.with_connection(|| async {
            let guard = self.inner.client.read().await;
            let client = connected(&guard)?;
            self.ensure_topic(client, routing_key).await?;

            let message = IggyMessage::from_str(payload)
                .map_err(|e| AppError::Internal(format!("Failed to build message: {e}")))?;
            let mut messages = vec![message];

            client
                .send_messages(
                    &self.inner.stream_id,
                    topic_id,
                    &Partitioning::balanced(),
                    &mut messages,
                )
                .await
                .map_err(|e| AppError::Broker(e.to_string()))
        })
        .await
    }

    async fn consume(&self, routing_key: &str, handler: Arc<dyn MessageHandler>) -> AppResult<()> {
        let name = consumer_name(&self.inner.service, routing_key);
        let binding = Binding {
            routing_key: routing_key.to_string(),
            topic_id: to_identifier(routing_key, "topic")?,
            consumer: Consumer::new(to_identifier(&name, "consumer")?),
            handler,
        };

        info!(routing_key, consumer = %name, "Binding consumer");
        let bus = self.clone();
        self.inner.tracker.spawn(async move {
            bus.run_binding(binding).await;
        });

        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.link.is_connected()
    }

    async fn shutdown(&self) {
        info!("Stopping event bus consumers");
        self.inner.cancel.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        info!("All event bus consumers have stopped");
    }
}
