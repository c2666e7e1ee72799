use crate::bus::{Delivery, MessageBus};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Delivery>,
    /// The delivery handed out by `fetch` and not yet acked, if any.
    inflight: Option<Delivery>,
}

struct Inner {
    queues: HashMap<String, QueueState>,
    next_tag: u64,
}

/// In-process implementation of `MessageBus`.
///
/// Enforces the QoS=1 discipline: per queue, at most one delivery is out
/// until it is acked or requeued, so consumption is strictly sequential and
/// an unacked message survives for redelivery.
pub struct MemoryBus {
    inner: RwLock<Inner>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                queues: HashMap::new(),
                next_tag: 0,
            }),
        }
    }

    /// Number of pending (not inflight) messages in a queue.
    pub async fn depth(&self, queue: &str) -> usize {
        let r = self.inner.read().await;
        r.queues.get(queue).map(|q| q.pending.len()).unwrap_or(0)
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, queue: &str, body: &[u8], content_type: &str) -> Result<()> {
        let mut w = self.inner.write().await;
        w.next_tag += 1;
        let delivery = Delivery {
            tag: w.next_tag,
            body: body.to_vec(),
            content_type: content_type.to_string(),
        };
        w.queues
            .entry(queue.to_string())
            .or_default()
            .pending
            .push_back(delivery);
        Ok(())
    }

    async fn fetch(&self, queue: &str) -> Result<Option<Delivery>> {
        let mut w = self.inner.write().await;
        let state = match w.queues.get_mut(queue) {
            Some(state) => state,
            None => return Ok(None),
        };
        if state.inflight.is_some() {
            return Ok(None);
        }
        let delivery = state.pending.pop_front();
        state.inflight = delivery.clone();
        Ok(delivery)
    }

    async fn ack(&self, queue: &str, tag: u64) -> Result<()> {
        let mut w = self.inner.write().await;
        let state = w
            .queues
            .get_mut(queue)
            .ok_or_else(|| anyhow!("unknown queue: {queue}"))?;
        match &state.inflight {
            Some(delivery) if delivery.tag == tag => {
                state.inflight = None;
                Ok(())
            }
            _ => Err(anyhow!("no inflight delivery {tag} on {queue}")),
        }
    }

    async fn requeue(&self, queue: &str, tag: u64) -> Result<()> {
        let mut w = self.inner.write().await;
        let state = w
            .queues
            .get_mut(queue)
            .ok_or_else(|| anyhow!("unknown queue: {queue}"))?;
        match state.inflight.take() {
            Some(delivery) if delivery.tag == tag => {
                state.pending.push_front(delivery);
                Ok(())
            }
            other => {
                state.inflight = other;
                Err(anyhow!("no inflight delivery {tag} on {queue}"))
            }
        }
    }
}
