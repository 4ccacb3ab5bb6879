//! Publish/consume interface over a topic exchange.
//!
//! Every service announces domain events with [`publish_event`] and reacts to
//! them by registering an [`EventHandler`] with [`subscribe`]. Delivery is
//! at-least-once: a message is acknowledged only after its handler returns
//! `Ok`, so handlers must tolerate duplicates.
//!
//! # Implementations
//!
//! - [`IggyEventBus`] - one Iggy stream acting as the exchange, one topic per
//!   routing key, one named consumer per binding
//! - [`InMemoryEventBus`] - channel-backed exchange for tests and single-process runs
//!
//! # Delivery loop
//!
//! ```text
//! poll 1 ──▶ decode ──▶ handler (bounded by timeout)
//!                │             │
//!         undecodable      Ok ─┴─▶ commit offset
//!          ──▶ commit      Err ──▶ retry later (no commit)
//!                          Err × max_attempts ──▶ log + commit
//! ```

mod connection;
mod helpers;
mod iggy_bus;
mod memory;

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, warn};

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::DomainEvent;

pub use self::connection::{LinkPhase, LinkState};
pub use self::iggy_bus::IggyEventBus;
pub use self::memory::{InMemoryEventBus, PublishedMessage};

/// Raw message handler bound to one routing key.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, payload: &[u8]) -> AppResult<()>;
}

/// Typed handler for one kind of domain event.
#[async_trait]
pub trait EventHandler<E: DomainEvent>: Send + Sync {
    async fn handle(&self, event: E) -> AppResult<()>;
}

/// Topic exchange client.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Send a serialized payload to every consumer bound to `routing_key`.
    ///
    /// Connects lazily when no connection exists yet.
    async fn publish(&self, routing_key: &str, payload: String) -> AppResult<()>;

    /// Bind `handler` to `routing_key`. Messages are delivered one at a time
    /// per binding until [`EventBus::shutdown`] is called.
    async fn consume(&self, routing_key: &str, handler: Arc<dyn MessageHandler>) -> AppResult<()>;

    fn is_connected(&self) -> bool;

    /// Stop all consumer loops and wait for in-flight handlers to finish.
    async fn shutdown(&self);
}

/// Serialize and publish a domain event under its routing key.
pub async fn publish_event<E: DomainEvent>(bus: &dyn EventBus, event: &E) -> AppResult<()> {
    let payload = serde_json::to_string(event)?;

    match bus.publish(E::ROUTING_KEY, payload).await {
        Ok(()) => {
            metrics::record_event_published(E::ROUTING_KEY, "success");
            debug!(routing_key = E::ROUTING_KEY, "Event published");
            Ok(())
        }
        Err(e) => {
            metrics::record_event_published(E::ROUTING_KEY, "error");
            Err(e)
        }
    }
}

/// Bind a typed handler to the routing key of `E`.
pub async fn subscribe<E, H>(bus: &dyn EventBus, handler: Arc<H>) -> AppResult<()>
where
    E: DomainEvent,
    H: EventHandler<E> + 'static,
{
    bus.consume(E::ROUTING_KEY, bind::<E, H>(handler)).await
}

/// Wrap a typed handler into a raw [`MessageHandler`] that decodes JSON.
pub fn bind<E, H>(handler: Arc<H>) -> Arc<dyn MessageHandler>
where
    E: DomainEvent,
    H: EventHandler<E> + 'static,
{
    Arc::new(Decoding {
        inner: handler,
        _event: PhantomData,
    })
}

struct Decoding<E, H> {
    inner: Arc<H>,
    _event: PhantomData<fn() -> E>,
}

#[async_trait]
impl<E, H> MessageHandler for Decoding<E, H>
where
    E: DomainEvent,
    H: EventHandler<E> + 'static,
{
    async fn handle(&self, payload: &[u8]) -> AppResult<()> {
        match serde_json::from_slice::<E>(payload) {
            Ok(event) => self.inner.handle(event).await,
            Err(e) => {
                // Redelivery cannot fix a malformed payload
                warn!(
                    routing_key = E::ROUTING_KEY,
                    payload_size = payload.len(),
                    error = %e,
                    "Dropping undecodable event"
                );
                metrics::record_event_handled(E::ROUTING_KEY, "undecodable");
                Ok(())
            }
        }
    }
}

// =============================================================================
// Delivery policy
// =============================================================================

/// Bounds applied to every handler invocation.
#[derive(Debug, Clone, Copy)]
pub struct DeliveryPolicy {
    pub handler_timeout: Duration,
    /// Deliveries before a failing message is acknowledged anyway (0 = never).
    pub max_attempts: u32,
    /// Pause before the same message is redelivered.
    pub retry_delay: Duration,
}

impl DeliveryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            handler_timeout: config.event_handler_timeout,
            max_attempts: config.event_max_delivery_attempts,
            retry_delay: config.event_poll_interval,
        }
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts > 0 && attempt >= self.max_attempts
    }
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            handler_timeout: Duration::from_secs(30),
            max_attempts: 5,
            retry_delay: Duration::from_millis(250),
        }
    }
}

/// What the consumer loop does with a message after one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Commit the offset and move on.
    Ack,
    /// Leave the offset where it is so the message is delivered again.
    Retry,
}

/// Run `handler` once for `payload` and decide whether to acknowledge.
///
/// `attempt` is 1-based and counts deliveries of this message.
pub async fn deliver(
    handler: &dyn MessageHandler,
    routing_key: &str,
    payload: &[u8],
    attempt: u32,
    policy: &DeliveryPolicy,
) -> Outcome {
    let failure = match tokio::time::timeout(policy.handler_timeout, handler.handle(payload)).await
    {
        Ok(Ok(())) => {
            metrics::record_event_handled(routing_key, "acked");
            return Outcome::Ack;
        }
        Ok(Err(e)) => e,
        Err(_) => AppError::OperationTimeout(format!(
            "handler exceeded {:?}",
            policy.handler_timeout
        )),
    };

    if policy.exhausted(attempt) {
        error!(
            routing_key,
            attempt,
            error = %failure,
            "Giving up on event after repeated handler failures"
        );
        metrics::record_event_handled(routing_key, "dead_lettered");
        return Outcome::Ack;
    }

    warn!(
        routing_key,
        attempt,
        error = %failure,
        "Event handler failed, message left for redelivery"
    );
    metrics::record_event_handled(routing_key, "retry");
    Outcome::Retry
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::models::{POST_DELETED, PostDeleted};
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    struct Counting {
        calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl EventHandler<PostDeleted> for Counting {
        async fn handle(&self, _event: PostDeleted) -> AppResult<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.fail_first {
                return Err(AppError::Store("down".to_string()));
            }
            Ok(())
        }
    }

    struct Slow;

    #[async_trait]
    impl MessageHandler for Slow {
        async fn handle(&self, _payload: &[u8]) -> AppResult<()> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }
    }

    fn deleted_payload() -> Vec<u8> {
        serde_json::to_vec(&PostDeleted {
            post_id: Uuid::new_v4(),
            user_id: "u1".to_string(),
            media_ids: vec![],
        })
        .unwrap()
    }

    fn policy(max_attempts: u32) -> DeliveryPolicy {
        DeliveryPolicy {
            handler_timeout: Duration::from_millis(50),
            max_attempts,
            retry_delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_acknowledged() {
        let typed = Arc::new(Counting {
            calls: AtomicU32::new(0),
            fail_first: 0,
        });
        let handler = bind::<PostDeleted, _>(typed.clone());

        let outcome = deliver(handler.as_ref(), POST_DELETED, b"not json", 1, &policy(5)).await;

        assert_eq!(outcome, Outcome::Ack);
        assert_eq!(typed.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failure_is_retried_then_acknowledged() {
        let typed = Arc::new(Counting {
            calls: AtomicU32::new(0),
            fail_first: 1,
        });
        let handler = bind::<PostDeleted, _>(typed.clone());
        let payload = deleted_payload();

        assert_eq!(
            deliver(handler.as_ref(), POST_DELETED, &payload, 1, &policy(5)).await,
            Outcome::Retry
        );
        assert_eq!(
            deliver(handler.as_ref(), POST_DELETED, &payload, 2, &policy(5)).await,
            Outcome::Ack
        );
        assert_eq!(typed.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_exhausted_attempts_acknowledge() {
        let typed = Arc::new(Counting {
            calls: AtomicU32::new(0),
            fail_first: u32::MAX,
        });
        let handler = bind::<PostDeleted, _>(typed);
        let payload = deleted_payload();

        assert_eq!(
            deliver(handler.as_ref(), POST_DELETED, &payload, 2, &policy(3)).await,
            Outcome::Retry
        );
        assert_eq!(
            deliver(handler.as_ref(), POST_DELETED, &payload, 3, &policy(3)).await,
            Outcome::Ack
        );
    }

    #[tokio::test]
    async fn test_zero_max_attempts_retries_forever() {
        assert!(!policy(0).exhausted(u32::MAX));
    }

    #[tokio::test]
    async fn test_handler_timeout_counts_as_failure() {
        let outcome = deliver(&Slow, POST_DELETED, b"{}", 1, &policy(5)).await;
        assert_eq!(outcome, Outcome::Retry);
    }
}
