use crate::bus::{worker_queue, MessageBus, QUEUE_FOREIGN_TASKS, QUEUE_LAUNCH, QUEUE_SCHEDULE};
use crate::config::{Config, TaskQueueType};
use crate::message::{Message, Payload, CONTENT_TYPE_MESSAGE, CONTENT_TYPE_WORKITEM};
use crate::storage::{Storage, BUCKET_SUBSCRIPTIONS};
use anyhow::Result;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

/// Bus façade used by the flow expressions and the services.
///
/// Everything a node does to the outside world goes through here: driving
/// other nodes (`send`), handing work to participants (`elaborate`),
/// registering timers (`schedule_event`), waiting on external events
/// (`subscribe`) and launching sub-processes (`launch`).
pub struct Channel {
    bus: Arc<dyn MessageBus>,
    storage: Arc<dyn Storage>,
    config: Arc<Config>,
}

impl Channel {
    pub fn new(bus: Arc<dyn MessageBus>, storage: Arc<dyn Storage>, config: Arc<Config>) -> Self {
        Self {
            bus,
            storage,
            config,
        }
    }

    /// Enqueue a control message on the engine's control queue.
    pub async fn send(&self, msg: &Message) -> Result<()> {
        tracing::debug!(name = %msg.name, target = %msg.target, origin = %msg.origin, "send");
        self.bus
            .publish(
                &self.config.bureaucrat.message_queue,
                &msg.dumps(),
                CONTENT_TYPE_MESSAGE,
            )
            .await
    }

    /// Hand a unit of work to a participant. The expected reply is a
    /// `response` control message addressed back to `origin`.
    pub async fn elaborate(&self, participant: &str, origin: &str, fields: &Payload) -> Result<()> {
        tracing::debug!(participant, origin, "elaborate");
        match self.config.bureaucrat.taskqueue_type {
            TaskQueueType::Native => {
                let body = json!({
                    "header": {
                        "message": "response",
                        "target": origin,
                        "origin": origin,
                    },
                    "fields": fields,
                });
                self.bus
                    .publish(
                        &worker_queue(participant),
                        &serde_json::to_vec(&body)?,
                        CONTENT_TYPE_WORKITEM,
                    )
                    .await
            }
            TaskQueueType::Foreign => {
                let body = json!({
                    "message": "response",
                    "target": origin,
                    "origin": origin,
                    "payload": fields,
                });
                // The envelope the foreign task-queue framework expects.
                let task = json!({
                    "task": participant,
                    "id": Uuid::new_v4().to_string(),
                    "args": [body],
                    "kwargs": {},
                    "retries": 0,
                    "eta": Value::Null,
                    "expires": Value::Null,
                    "utc": true,
                    "callbacks": Value::Null,
                    "errbacks": Value::Null,
                    "timelimit": [Value::Null, Value::Null],
                    "taskset": Value::Null,
                    "chord": Value::Null,
                });
                self.bus
                    .publish(
                        QUEUE_FOREIGN_TASKS,
                        &serde_json::to_vec(&task)?,
                        "application/json",
                    )
                    .await
            }
        }
    }

    /// Register a control message `code` to be sent to `target` once time
    /// reaches `instant` (epoch seconds). Goes through the registration
    /// queue so the Schedule service persists it under the storage lock.
    pub async fn schedule_event(&self, code: &str, instant: u64, target: &str) -> Result<()> {
        tracing::debug!(code, instant, target, "schedule_event");
        let body = json!({
            "instant": instant,
            "code": code,
            "target": target,
        });
        self.bus
            .publish(
                QUEUE_SCHEDULE,
                &serde_json::to_vec(&body)?,
                "application/json",
            )
            .await
    }

    /// Persist a one-shot subscription of `target` to a named event.
    pub async fn subscribe(&self, event: &str, target: &str) -> Result<()> {
        tracing::debug!(event, target, "subscribe");
        let _guard = self.storage.lock().await?;
        let mut entries: Vec<Value> =
            if self.storage.exists(BUCKET_SUBSCRIPTIONS, event).await? {
                serde_json::from_slice(&self.storage.load(BUCKET_SUBSCRIPTIONS, event).await?)?
            } else {
                Vec::new()
            };
        entries.push(json!({ "target": target }));
        self.storage
            .save(BUCKET_SUBSCRIPTIONS, event, &serde_json::to_vec(&entries)?)
            .await
    }

    /// Publish a process definition to the launch queue.
    pub async fn launch(&self, pdef: &[u8]) -> Result<()> {
        self.bus
            .publish(QUEUE_LAUNCH, pdef, "application/xml")
            .await
    }
}
