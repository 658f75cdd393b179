//! Push channel (§4.7): one `broadcast` channel per tenant, with a
//! short replay buffer so a reconnecting client can catch up on the last
//! 60 s of events. No teacher analogue; grounded on the `tokio::sync::
//! broadcast` fan-out idiom used for streaming endpoints across the
//! example pack (e.g. `other_examples/` SSE/websocket gateways).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use uuid::Uuid;

use crate::models::action::Action;
use crate::notify::{Channel, DeliveryStatus, NotificationEvent};

const REPLAY_WINDOW_SECS: i64 = 60;
const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
pub struct PushMessage {
    pub sequence: u64,
    pub tenant_id: Uuid,
    pub subject: String,
    pub body: String,
    pub emitted_at: DateTime<Utc>,
}

struct TenantStream {
    tx: broadcast::Sender<PushMessage>,
    replay: AsyncMutex<VecDeque<PushMessage>>,
    sequence: AtomicU64,
}

/// Per-tenant broadcast registry, shared between the `Channel` impl (which
/// publishes) and the axum streaming handler (which subscribes).
pub struct PushRegistry {
    streams: DashMap<Uuid, Arc<TenantStream>>,
}

impl PushRegistry {
    pub fn new() -> Self {
        Self { streams: DashMap::new() }
    }

    fn stream_for(&self, tenant_id: Uuid) -> Arc<TenantStream> {
        self.streams
            .entry(tenant_id)
            .or_insert_with(|| {
                let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
                Arc::new(TenantStream {
                    tx,
                    replay: AsyncMutex::new(VecDeque::new()),
                    sequence: AtomicU64::new(0),
                })
            })
            .clone()
    }

    async fn publish(&self, tenant_id: Uuid, subject: String, body: String) {
        let stream = self.stream_for(tenant_id);
        let sequence = stream.sequence.fetch_add(1, Ordering::SeqCst);
        let message = PushMessage {
            sequence,
            tenant_id,
            subject,
            body,
            emitted_at: Utc::now(),
        };

        {
            let mut replay = stream.replay.lock().await;
            let cutoff = Utc::now() - chrono::Duration::seconds(REPLAY_WINDOW_SECS);
            replay.push_back(message.clone());
            while replay.front().is_some_and(|m| m.emitted_at < cutoff) {
                replay.pop_front();
            }
        }

        // A send with no subscribers is expected (no client connected right
        // now); at-least-once delivery relies on the replay buffer, not on
        // this send succeeding.
        let _ = stream.tx.send(message);
    }

    /// Subscribes a client, returning the replay buffer contents plus a live
    /// receiver for subsequent events (used by the push-stream HTTP route).
    pub async fn subscribe(&self, tenant_id: Uuid) -> (Vec<PushMessage>, broadcast::Receiver<PushMessage>) {
        let stream = self.stream_for(tenant_id);
        let rx = stream.tx.subscribe();
        let replay = stream.replay.lock().await.iter().cloned().collect();
        (replay, rx)
    }
}

impl Default for PushRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub struct PushChannel {
    registry: Arc<PushRegistry>,
}

impl PushChannel {
    pub fn new(registry: Arc<PushRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Channel for PushChannel {
    fn name(&self) -> &'static str {
        "push"
    }

    fn validate(&self, action: &Action) -> Result<(), String> {
        match action {
            Action::Push { channel } if !channel.is_empty() => Ok(()),
            Action::Push { .. } => Err("push channel name must not be empty".to_string()),
            _ => Err("not a push action".to_string()),
        }
    }

    async fn dispatch(&self, event: &NotificationEvent) -> DeliveryStatus {
        self.registry
            .publish(event.tenant_id, event.subject.clone(), event.body.clone())
            .await;
        DeliveryStatus::Sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_replay_then_live_messages() {
        let registry = PushRegistry::new();
        let tenant = Uuid::new_v4();
        registry.publish(tenant, "s1".to_string(), "b1".to_string()).await;

        let (replay, mut rx) = registry.subscribe(tenant).await;
        assert_eq!(replay.len(), 1);

        registry.publish(tenant, "s2".to_string(), "b2".to_string()).await;
        let live = rx.recv().await.unwrap();
        assert_eq!(live.subject, "s2");
        assert_eq!(live.sequence, 1);
    }
}
