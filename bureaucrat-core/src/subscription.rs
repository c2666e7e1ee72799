use crate::channel::Channel;
use crate::message::{Message, Payload};
use crate::storage::{Storage, BUCKET_SUBSCRIPTIONS};
use anyhow::Result;
use serde_json::Value;
use std::sync::Arc;

/// Event registry: one-shot bindings of an external event name to awaiting
/// nodes. The Channel writes subscriptions; this service consumes them when
/// the event arrives, fanning a `triggered` message out to every subscriber
/// and deleting the list.
pub struct Subscriptions {
    channel: Arc<Channel>,
    storage: Arc<dyn Storage>,
}

impl Subscriptions {
    pub fn new(channel: Arc<Channel>, storage: Arc<dyn Storage>) -> Self {
        Self { channel, storage }
    }

    /// Deliver an external event to its subscribers. The full event body
    /// rides along as the `triggered` payload.
    pub async fn dispatch(&self, event: &str, payload: &Payload) -> Result<()> {
        let _guard = self.storage.lock().await?;
        if !self.storage.exists(BUCKET_SUBSCRIPTIONS, event).await? {
            tracing::debug!(event, "no subscribers");
            return Ok(());
        }
        let entries: Vec<Value> =
            serde_json::from_slice(&self.storage.load(BUCKET_SUBSCRIPTIONS, event).await?)?;
        for entry in &entries {
            if let Some(target) = entry.get("target").and_then(Value::as_str) {
                self.channel
                    .send(&Message::with_payload(
                        "triggered",
                        target,
                        "",
                        payload.clone(),
                    ))
                    .await?;
                tracing::debug!(event, target, "triggered subscriber");
            }
        }
        self.storage.delete(BUCKET_SUBSCRIPTIONS, event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MessageBus;
    use crate::bus_memory::MemoryBus;
    use crate::config::Config;
    use crate::storage_memory::MemoryStorage;
    use serde_json::json;

    struct Fixture {
        bus: Arc<MemoryBus>,
        storage: Arc<MemoryStorage>,
        channel: Arc<Channel>,
        subscriptions: Subscriptions,
    }

    fn fixture() -> Fixture {
        let bus = Arc::new(MemoryBus::new());
        let storage = Arc::new(MemoryStorage::new());
        let channel = Arc::new(Channel::new(
            bus.clone(),
            storage.clone(),
            Arc::new(Config::default()),
        ));
        let subscriptions = Subscriptions::new(channel.clone(), storage.clone());
        Fixture {
            bus,
            storage,
            channel,
            subscriptions,
        }
    }

    async fn triggered(bus: &MemoryBus) -> Vec<Message> {
        let mut messages = Vec::new();
        while let Some(delivery) = bus.fetch("bureaucrat_msgs").await.unwrap() {
            messages.push(Message::loads(&delivery.body).unwrap());
            bus.ack("bureaucrat_msgs", delivery.tag).await.unwrap();
        }
        messages
    }

    #[tokio::test]
    async fn test_dispatch_fans_out_and_consumes() {
        let fx = fixture();
        fx.channel.subscribe("e", "pid-a_0").await.unwrap();
        fx.channel.subscribe("e", "pid-b_2").await.unwrap();

        let mut payload = Payload::new();
        payload.insert("event".to_string(), json!("e"));
        payload.insert("detail".to_string(), json!(42));
        fx.subscriptions.dispatch("e", &payload).await.unwrap();

        let messages = triggered(&fx.bus).await;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].name, "triggered");
        assert_eq!(messages[0].target, "pid-a_0");
        assert_eq!(messages[0].payload["detail"], json!(42));
        assert_eq!(messages[1].target, "pid-b_2");

        // One-shot: the subscription list is gone.
        assert!(!fx.storage.exists(BUCKET_SUBSCRIPTIONS, "e").await.unwrap());

        // A second firing triggers nobody.
        fx.subscriptions.dispatch("e", &payload).await.unwrap();
        assert!(triggered(&fx.bus).await.is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_without_subscribers_is_a_noop() {
        let fx = fixture();
        fx.subscriptions
            .dispatch("unknown", &Payload::new())
            .await
            .unwrap();
        assert!(triggered(&fx.bus).await.is_empty());
    }
}
