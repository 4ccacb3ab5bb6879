use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

use super::{DeliveryPolicy, EventBus, MessageHandler, Outcome, deliver};
use crate::error::{AppError, AppResult};

/// A message as it was handed to [`InMemoryEventBus::publish`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub routing_key: String,
    pub payload: String,
}

/// Single-process topic exchange.
///
/// Every binding gets its own queue; a publish fans out to every queue bound
/// to the routing key at that moment. Messages published while nothing is
/// bound are dropped, and nothing survives the process.
#[derive(Clone)]
pub struct InMemoryEventBus {
    inner: Arc<Inner>,
}

struct Inner {
    queues: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Vec<u8>>>>>,
    published: Mutex<Vec<PublishedMessage>>,
    policy: DeliveryPolicy,
    available: AtomicBool,
    /// Deliveries queued but not yet acknowledged
    pending: AtomicUsize,
    idle: Notify,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::with_policy(DeliveryPolicy::default())
    }

    pub fn with_policy(policy: DeliveryPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                queues: Mutex::new(HashMap::new()),
                published: Mutex::new(Vec::new()),
                policy,
                available: AtomicBool::new(true),
                pending: AtomicUsize::new(0),
                idle: Notify::new(),
                tracker: TaskTracker::new(),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Simulate the broker going away (`false`) or coming back (`true`).
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Every successful publish so far, in order.
    pub async fn published(&self) -> Vec<PublishedMessage> {
        self.inner.published.lock().await.clone()
    }

    pub async fn published_for(&self, routing_key: &str) -> Vec<PublishedMessage> {
        self.inner
            .published
            .lock()
            .await
            .iter()
            .filter(|m| m.routing_key == routing_key)
            .cloned()
            .collect()
    }

    /// Wait until every queued delivery has been acknowledged.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.inner.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    fn settle_one(&self) {
        if self.inner.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
    }

    async fn run_binding(
        &self,
        routing_key: String,
        handler: Arc<dyn MessageHandler>,
        mut queue: mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        let cancel = self.inner.cancel.clone();
        let policy = self.inner.policy;

        'messages: loop {
            let payload = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                payload = queue.recv() => match payload {
                    Some(payload) => payload,
                    None => break,
                },
            };

            let mut attempt = 0u32;
            loop {
                attempt += 1;
                match deliver(handler.as_ref(), &routing_key, &payload, attempt, &policy).await {
                    Outcome::Ack => break,
                    Outcome::Retry => {
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => break 'messages,
                            _ = tokio::time::sleep(policy.retry_delay) => {}
                        }
                    }
                }
            }
            self.settle_one();
        }

        debug!(routing_key, "In-memory consumer shutting down");
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, routing_key: &str, payload: String) -> AppResult<()> {
        if !self.inner.available.load(Ordering::SeqCst) {
            return Err(AppError::Broker("broker unavailable".to_string()));
        }

        let mut queues = self.inner.queues.lock().await;
        if let Some(bound) = queues.get_mut(routing_key) {
            bound.retain(|queue| {
                self.inner.pending.fetch_add(1, Ordering::SeqCst);
                let sent = queue.send(payload.as_bytes().to_vec()).is_ok();
                if !sent {
                    self.settle_one();
                }
                sent
            });
        }
        drop(queues);

        self.inner.published.lock().await.push(PublishedMessage {
            routing_key: routing_key.to_string(),
            payload,
        });
        Ok(())
    }

    async fn consume(&self, routing_key: &str, handler: Arc<dyn MessageHandler>) -> AppResult<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .queues
            .lock()
            .await
            .entry(routing_key.to_string())
            .or_default()
            .push(tx);

        let bus = self.clone();
        let routing_key = routing_key.to_string();
        self.inner.tracker.spawn(async move {
            bus.run_binding(routing_key, handler, rx).await;
        });
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.available.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    struct Recorder {
        seen: Mutex<Vec<String>>,
        failures_left: AtomicU32,
    }

    impl Recorder {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                failures_left: AtomicU32::new(failures),
            })
        }
    }

    #[async_trait]
    impl MessageHandler for Recorder {
        async fn handle(&self, payload: &[u8]) -> AppResult<()> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(AppError::Internal("transient".to_string()));
            }
            self.seen
                .lock()
                .await
                .push(String::from_utf8_lossy(payload).into_owned());
            Ok(())
        }
    }

    fn fast_policy() -> DeliveryPolicy {
        DeliveryPolicy {
            handler_timeout: Duration::from_secs(1),
            max_attempts: 5,
            retry_delay: Duration::from_millis(5),
        }
    }

    async fn idle(bus: &InMemoryEventBus) {
        tokio::time::timeout(Duration::from_secs(2), bus.wait_idle())
            .await
            .expect("deliveries did not settle");
    }

    #[tokio::test]
    async fn test_fan_out_to_every_binding() {
        let bus = InMemoryEventBus::with_policy(fast_policy());
        let first = Recorder::new(0);
        let second = Recorder::new(0);
        bus.consume("post.deleted", first.clone()).await.unwrap();
        bus.consume("post.deleted", second.clone()).await.unwrap();

        bus.publish("post.deleted", "a".to_string()).await.unwrap();
        idle(&bus).await;

        assert_eq!(*first.seen.lock().await, vec!["a".to_string()]);
        assert_eq!(*second.seen.lock().await, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_routing_key_isolation() {
        let bus = InMemoryEventBus::with_policy(fast_policy());
        let created = Recorder::new(0);
        bus.consume("post.created", created.clone()).await.unwrap();

        bus.publish("post.deleted", "x".to_string()).await.unwrap();
        bus.publish("post.created", "y".to_string()).await.unwrap();
        idle(&bus).await;

        assert_eq!(*created.seen.lock().await, vec!["y".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_delivery_is_redelivered() {
        let bus = InMemoryEventBus::with_policy(fast_policy());
        let recorder = Recorder::new(2);
        bus.consume("post.created", recorder.clone()).await.unwrap();

        bus.publish("post.created", "m".to_string()).await.unwrap();
        idle(&bus).await;

        assert_eq!(*recorder.seen.lock().await, vec!["m".to_string()]);
    }

    #[tokio::test]
    async fn test_unbound_messages_are_dropped() {
        let bus = InMemoryEventBus::new();
        bus.publish("post.created", "lost".to_string()).await.unwrap();

        let late = Recorder::new(0);
        bus.consume("post.created", late.clone()).await.unwrap();
        idle(&bus).await;

        assert!(late.seen.lock().await.is_empty());
        assert_eq!(bus.published_for("post.created").await.len(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_broker_rejects_publish() {
        let bus = InMemoryEventBus::new();
        bus.set_available(false);

        let result = bus.publish("post.created", "x".to_string()).await;
        assert!(matches!(result, Err(AppError::Broker(_))));
        assert!(bus.published().await.is_empty());
        assert!(!bus.is_connected());
    }

    #[tokio::test]
    async fn test_shutdown_completes() {
        let bus = InMemoryEventBus::new();
        bus.consume("post.created", Recorder::new(0)).await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), bus.shutdown())
            .await
            .expect("shutdown hung");
    }
}
