use crate::bus::{Delivery, MessageBus, QUEUE_LAUNCH, QUEUE_SCHEDULE};
use crate::channel::Channel;
use crate::config::Config;
use crate::message::{Message, Payload};
use crate::schedule::Schedule;
use crate::storage::{Storage, BUCKET_DEFINITION};
use crate::subscription::Subscriptions;
use crate::workflow::Workflow;
use anyhow::Result;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
struct ScheduleRegistration {
    instant: u64,
    code: String,
    target: String,
}

/// The engine: consumes the four queues (launch, schedule registration,
/// external events, control) one message at a time and owns instance
/// lifecycle.
///
/// Per-delivery error discipline follows the message class: anything that
/// can never succeed (bad XML, bad JSON, unknown instance) is logged and
/// acked away; anything transient (storage I/O) leaves the delivery
/// unacked, so the broker redelivers and the handler reruns against the
/// previous snapshot. Snapshot write + ack form the commit point.
pub struct Engine {
    bus: Arc<dyn MessageBus>,
    storage: Arc<dyn Storage>,
    config: Arc<Config>,
    channel: Arc<Channel>,
    schedule: Schedule,
    subscriptions: Subscriptions,
}

impl Engine {
    pub fn new(bus: Arc<dyn MessageBus>, storage: Arc<dyn Storage>, config: Arc<Config>) -> Self {
        let channel = Arc::new(Channel::new(bus.clone(), storage.clone(), config.clone()));
        let schedule = Schedule::new(channel.clone(), storage.clone());
        let subscriptions = Subscriptions::new(channel.clone(), storage.clone());
        Self {
            bus,
            storage,
            config,
            channel,
            schedule,
            subscriptions,
        }
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    /// Process at most one message, in fixed queue priority order.
    /// Returns whether a message was consumed.
    pub async fn step(&self) -> Result<bool> {
        if let Some(delivery) = self.bus.fetch(QUEUE_LAUNCH).await? {
            self.handle_launch(&delivery).await?;
            return Ok(true);
        }

        if let Some(delivery) = self.bus.fetch(QUEUE_SCHEDULE).await? {
            match serde_json::from_slice::<ScheduleRegistration>(&delivery.body) {
                Ok(registration) => {
                    self.commit(QUEUE_SCHEDULE, &delivery, async {
                        self.schedule
                            .register(
                                &registration.code,
                                registration.instant,
                                &registration.target,
                            )
                            .await
                    })
                    .await?;
                }
                Err(err) => {
                    tracing::error!(%err, "dropping malformed schedule registration");
                    self.bus.ack(QUEUE_SCHEDULE, delivery.tag).await?;
                }
            }
            return Ok(true);
        }

        let event_queue = self.config.bureaucrat.event_queue.clone();
        if let Some(delivery) = self.bus.fetch(&event_queue).await? {
            match parse_event(&delivery.body) {
                Ok((event, payload)) => {
                    self.commit(&event_queue, &delivery, async {
                        self.subscriptions.dispatch(&event, &payload).await
                    })
                    .await?;
                }
                Err(err) => {
                    tracing::error!(error = %format!("{err:#}"), "dropping malformed event");
                    self.bus.ack(&event_queue, delivery.tag).await?;
                }
            }
            return Ok(true);
        }

        let message_queue = self.config.bureaucrat.message_queue.clone();
        if let Some(delivery) = self.bus.fetch(&message_queue).await? {
            match Message::loads(&delivery.body) {
                Ok(msg) => {
                    self.handle_control(&message_queue, &delivery, msg).await?;
                }
                Err(err) => {
                    tracing::error!(error = %format!("{err:#}"), "dropping malformed control message");
                    self.bus.ack(&message_queue, delivery.tag).await?;
                }
            }
            return Ok(true);
        }

        Ok(false)
    }

    /// Drive until every queue is drained. The daemon calls `step` in its
    /// own pacing loop; tests use this to let an instance run to quiescence.
    pub async fn run_until_idle(&self) -> Result<()> {
        while self.step().await? {}
        Ok(())
    }

    /// Periodic alarm for the Schedule service.
    pub async fn handle_alarm(&self) -> Result<()> {
        self.schedule.handle_alarm().await
    }

    async fn handle_launch(&self, delivery: &Delivery) -> Result<()> {
        // A definition that cannot be parsed or built can never succeed:
        // ack it away and log; the instance is simply not created. Storage
        // trouble, on the other hand, leaves the launch for redelivery.
        let checked = std::str::from_utf8(&delivery.body)
            .map_err(anyhow::Error::from)
            .and_then(|pdef| {
                let root = crate::xml::XmlElement::parse(pdef)?;
                let pid = Uuid::new_v4().to_string();
                crate::flow::FlowTree::build(&root, &pid)?;
                Ok((pdef.to_string(), pid))
            });
        match checked {
            Err(err) => {
                tracing::error!(error = %format!("{err:#}"), "dropping unlaunchable definition");
                self.bus.ack(QUEUE_LAUNCH, delivery.tag).await
            }
            Ok((pdef, pid)) => {
                self.commit(QUEUE_LAUNCH, delivery, async {
                    Workflow::create_from_string(&self.storage, &pdef, &pid).await?;
                    tracing::info!(pid = %pid, "launched instance");
                    self.channel.send(&Message::new("start", &pid, "")).await
                })
                .await
            }
        }
    }

    async fn handle_control(
        &self,
        queue: &str,
        delivery: &Delivery,
        msg: Message,
    ) -> Result<()> {
        if msg.target.is_empty() {
            // The workflow's own parent notification: end of the line.
            match msg.name.as_str() {
                "completed" => tracing::info!(origin = %msg.origin, "process finished"),
                "fault" => tracing::warn!(
                    origin = %msg.origin,
                    payload = %serde_json::Value::Object(msg.payload.clone()),
                    "unhandled fault left the workflow"
                ),
                other => tracing::debug!(name = other, origin = %msg.origin, "message for the outside world"),
            }
            return self.bus.ack(queue, delivery.tag).await;
        }

        let pid = msg.target_pid().to_string();
        if !self.storage.exists(BUCKET_DEFINITION, &pid).await? {
            tracing::warn!(pid = %pid, target = %msg.target, "dropping message for unknown instance");
            return self.bus.ack(queue, delivery.tag).await;
        }

        self.commit(queue, delivery, async {
            let mut workflow = Workflow::load(&self.storage, &pid).await?;
            workflow.process.handle_message(&self.channel, &msg).await?;
            workflow.save(&self.storage).await
        })
        .await
    }

    /// Run a handler and ack on success; on failure leave the delivery for
    /// redelivery and surface the error.
    async fn commit(
        &self,
        queue: &str,
        delivery: &Delivery,
        handler: impl std::future::Future<Output = Result<()>>,
    ) -> Result<()> {
        match handler.await {
            Ok(()) => self.bus.ack(queue, delivery.tag).await,
            Err(err) => {
                tracing::error!(error = %format!("{err:#}"), queue, "handler failed, leaving message for redelivery");
                self.bus.requeue(queue, delivery.tag).await?;
                Err(err)
            }
        }
    }
}

fn parse_event(body: &[u8]) -> Result<(String, Payload)> {
    let payload: Payload = serde_json::from_slice(body)?;
    let event = payload
        .get("event")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow::anyhow!("event body has no 'event' name"))?
        .to_string();
    Ok((event, payload))
}
