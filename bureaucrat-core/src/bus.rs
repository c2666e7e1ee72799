use anyhow::Result;
use async_trait::async_trait;

/// Launch queue: bodies are raw XML process definitions.
pub const QUEUE_LAUNCH: &str = "bureaucrat";
/// Schedule registration queue: bodies are `{instant, code, target}` JSON.
pub const QUEUE_SCHEDULE: &str = "bureaucrat_schedule";
/// Queue the foreign task-queue adapter publishes to.
pub const QUEUE_FOREIGN_TASKS: &str = "celery";

/// One fetched message. The tag identifies it for ack/requeue.
#[derive(Clone, Debug)]
pub struct Delivery {
    pub tag: u64,
    pub body: Vec<u8>,
    pub content_type: String,
}

/// The broker seam. An AMQP-style bus with durable queues and QoS=1
/// consumption: `fetch` hands out at most one unacked delivery per queue at
/// a time, `ack` commits it, `requeue` puts it back at the head for
/// redelivery. A real AMQP client is an external collaborator implementing
/// this trait; `MemoryBus` is the in-process default.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, queue: &str, body: &[u8], content_type: &str) -> Result<()>;

    /// Fetch the next delivery, or `None` when the queue is empty or a
    /// previous delivery from it is still unacked.
    async fn fetch(&self, queue: &str) -> Result<Option<Delivery>>;

    async fn ack(&self, queue: &str, tag: u64) -> Result<()>;

    /// Return an unacked delivery to the head of its queue.
    async fn requeue(&self, queue: &str, tag: u64) -> Result<()>;
}

/// Queue a participant's work messages are published to (native shape).
pub fn worker_queue(participant: &str) -> String {
    format!("worker_{participant}")
}
