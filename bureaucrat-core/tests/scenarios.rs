//! End-to-end scenarios: a real engine over the in-process bus and memory
//! storage, driven the way the daemon drives it — launch definitions,
//! participant responses and external events arrive as queue messages, and
//! the instance state is only ever observed through stored snapshots.

use bureaucrat_core::bus::{worker_queue, MessageBus, QUEUE_LAUNCH};
use bureaucrat_core::bus_memory::MemoryBus;
use bureaucrat_core::config::Config;
use bureaucrat_core::engine::Engine;
use bureaucrat_core::flow::State;
use bureaucrat_core::message::{Message, Payload, CONTENT_TYPE_MESSAGE};
use bureaucrat_core::schedule::Schedule;
use bureaucrat_core::storage::{Storage, BUCKET_DEFINITION, BUCKET_SCHEDULE, BUCKET_SUBSCRIPTIONS};
use bureaucrat_core::storage_memory::MemoryStorage;
use bureaucrat_core::workflow::Workflow;
use serde_json::{json, Value};
use std::sync::Arc;

struct Harness {
    bus: Arc<MemoryBus>,
    storage: Arc<dyn Storage>,
    config: Arc<Config>,
    engine: Engine,
}

impl Harness {
    fn new() -> Self {
        let bus = Arc::new(MemoryBus::new());
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let config = Arc::new(Config::default());
        let engine = Engine::new(bus.clone(), storage.clone(), config.clone());
        Self {
            bus,
            storage,
            config,
            engine,
        }
    }

    /// Publish a definition to the launch queue, drive to quiescence and
    /// return the new instance's pid.
    async fn launch(&self, pdef: &str) -> String {
        self.bus
            .publish(QUEUE_LAUNCH, pdef.as_bytes(), "application/xml")
            .await
            .unwrap();
        self.engine.run_until_idle().await.unwrap();
        let keys = self.storage.keys(BUCKET_DEFINITION).await.unwrap();
        assert_eq!(keys.len(), 1, "expected exactly one instance");
        keys.into_iter().next().unwrap()
    }

    /// Take the next work message for a participant off its worker queue.
    /// Returns the reply target and the context fields that were shipped.
    async fn take_work(&self, participant: &str) -> (String, Payload) {
        let queue = worker_queue(participant);
        let delivery = self
            .bus
            .fetch(&queue)
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("no work message for {participant}"));
        self.bus.ack(&queue, delivery.tag).await.unwrap();
        let body: Value = serde_json::from_slice(&delivery.body).unwrap();
        assert_eq!(body["header"]["message"], json!("response"));
        let target = body["header"]["target"].as_str().unwrap().to_string();
        let fields = body["fields"].as_object().cloned().unwrap_or_default();
        (target, fields)
    }

    async fn assert_no_work(&self, participant: &str) {
        let queue = worker_queue(participant);
        assert!(
            self.bus.fetch(&queue).await.unwrap().is_none(),
            "unexpected work message for {participant}"
        );
    }

    /// Feed a participant response back and drive to quiescence.
    async fn respond(&self, target: &str, payload: Payload) {
        let msg = Message::with_payload("response", target, target, payload);
        self.bus
            .publish(
                &self.config.bureaucrat.message_queue,
                &msg.dumps(),
                CONTENT_TYPE_MESSAGE,
            )
            .await
            .unwrap();
        self.engine.run_until_idle().await.unwrap();
    }

    /// Publish an external event and drive to quiescence.
    async fn publish_event(&self, body: Value) {
        self.bus
            .publish(
                &self.config.bureaucrat.event_queue,
                &serde_json::to_vec(&body).unwrap(),
                "application/json",
            )
            .await
            .unwrap();
        self.engine.run_until_idle().await.unwrap();
    }

    /// Instance state as reconstructed from storage alone.
    async fn loaded(&self, pid: &str) -> Workflow {
        Workflow::load(&self.storage, pid).await.unwrap()
    }

    async fn root_state(&self, pid: &str) -> State {
        self.loaded(pid).await.process.state_of(pid).unwrap()
    }

    /// A Schedule service sharing the engine's channel and storage, for
    /// driving the alarm with a controlled clock.
    fn schedule(&self) -> Schedule {
        Schedule::new(self.engine.channel().clone(), self.storage.clone())
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

#[tokio::test]
async fn scenario_sequence_of_two_actions() {
    let h = Harness::new();
    let pid = h
        .launch(
            r#"<process><sequence><action participant="p1"/><action participant="p2"/></sequence></process>"#,
        )
        .await;

    // p1 gets the work first; p2 has nothing yet.
    let (target1, _fields) = h.take_work("p1").await;
    assert_eq!(target1, format!("{pid}_0_0"));
    h.assert_no_work("p2").await;

    h.respond(&target1, Payload::new()).await;

    let (target2, _fields) = h.take_work("p2").await;
    assert_eq!(target2, format!("{pid}_0_1"));
    h.respond(&target2, Payload::new()).await;

    assert_eq!(h.root_state(&pid).await, State::Completed);
}

#[tokio::test]
async fn scenario_switch_picks_second_case() {
    let h = Harness::new();
    let pid = h
        .launch(
            r#"<process><switch>
                 <case><condition>False</condition><action participant="q"/></case>
                 <case><condition>True</condition><action participant="p"/></case>
               </switch></process>"#,
        )
        .await;

    h.assert_no_work("q").await;
    let (target, _fields) = h.take_work("p").await;
    h.respond(&target, Payload::new()).await;

    assert_eq!(h.root_state(&pid).await, State::Completed);
    h.assert_no_work("q").await;
}

#[tokio::test]
async fn scenario_delay_two_seconds() {
    let h = Harness::new();
    let before = now_secs();
    let pid = h.launch(r#"<process><delay duration="2"/></process>"#).await;

    // The schedule registration was persisted; the instance is parked.
    let keys = h.storage.keys(BUCKET_SCHEDULE).await.unwrap();
    assert_eq!(keys.len(), 1);
    let instant: u64 = keys[0].parse().unwrap();
    assert!(instant >= before + 2);
    assert_eq!(h.root_state(&pid).await, State::Active);

    // One second in: the alarm finds nothing due.
    let schedule = h.schedule();
    schedule.fire_due(before + 1).await.unwrap();
    h.engine.run_until_idle().await.unwrap();
    assert_eq!(h.root_state(&pid).await, State::Active);

    // Past the instant: the timeout fires and the instance completes.
    schedule.fire_due(instant).await.unwrap();
    h.engine.run_until_idle().await.unwrap();
    assert_eq!(h.root_state(&pid).await, State::Completed);
    assert!(h.storage.keys(BUCKET_SCHEDULE).await.unwrap().is_empty());
}

#[tokio::test]
async fn scenario_await_plus_trigger() {
    let h = Harness::new();
    let pid = h.launch(r#"<process><await event="e"/></process>"#).await;
    assert_eq!(h.root_state(&pid).await, State::Active);

    h.publish_event(json!({"event": "e"})).await;

    assert_eq!(h.root_state(&pid).await, State::Completed);
    // One-shot: the subscription record is gone.
    assert!(!h
        .storage
        .exists(BUCKET_SUBSCRIPTIONS, "e")
        .await
        .unwrap());
}

#[tokio::test]
async fn scenario_fault_and_recovery() {
    let h = Harness::new();
    let pid = h
        .launch(
            r#"<process>
                 <sequence>
                   <action participant="p1"/>
                   <fault code="TestError" message="boom"/>
                   <context>
                     <faults>
                       <case code="TestError"><action participant="p2"/></case>
                     </faults>
                   </context>
                 </sequence>
               </process>"#,
        )
        .await;

    let (target1, _fields) = h.take_work("p1").await;
    h.respond(&target1, Payload::new()).await;

    // The fault activity fired: the handler's participant gets work.
    let (target2, fields) = h.take_work("p2").await;
    assert_eq!(target2, format!("{pid}_0_faults_0_0"));
    // The active fault is visible to the handler's context.
    assert_eq!(fields["inst:fault"]["code"], json!("TestError"));
    h.respond(&target2, Payload::new()).await;

    // Recovered: the sequence completed and the fault slot is clear.
    let workflow = h.loaded(&pid).await;
    assert_eq!(workflow.process.state_of(&pid), Some(State::Completed));
    assert_eq!(
        workflow.process.state_of(&format!("{pid}_0")),
        Some(State::Completed)
    );
    assert!(workflow.process.fault_at(&format!("{pid}_0")).is_none());
}

#[tokio::test]
async fn scenario_while_bounded_by_counter() {
    let h = Harness::new();
    let pid = h
        .launch(
            r#"<process>
                 <context><property name="counter" type="int">0</property></context>
                 <while>
                   <condition>context["counter"] &lt; 3</condition>
                   <assign property="counter">context["counter"] + 1</assign>
                 </while>
               </process>"#,
        )
        .await;

    let workflow = h.loaded(&pid).await;
    assert_eq!(workflow.process.state_of(&pid), Some(State::Completed));
    assert_eq!(
        workflow.process.get_prop(&pid, "counter").unwrap(),
        json!(3)
    );
}

#[tokio::test]
async fn scenario_call_runs_sub_process() {
    let h = Harness::new();
    let parent_def = r#"<process>
        <context>
          <property name="subdef" type="str">&lt;process&gt;&lt;action participant="sub"/&gt;&lt;/process&gt;</property>
        </context>
        <call process="$subdef"/>
      </process>"#;
    h.bus
        .publish(QUEUE_LAUNCH, parent_def.as_bytes(), "application/xml")
        .await
        .unwrap();
    h.engine.run_until_idle().await.unwrap();

    // Two instances now exist: the parent and the launched sub-process.
    let pids = h.storage.keys(BUCKET_DEFINITION).await.unwrap();
    assert_eq!(pids.len(), 2);
    let mut parent = None;
    let mut sub = None;
    for pid in pids {
        let workflow = h.loaded(&pid).await;
        if workflow.process.root().parent_id.is_empty() {
            parent = Some(pid);
        } else {
            sub = Some(pid);
        }
    }
    let (parent, sub) = (parent.unwrap(), sub.unwrap());

    // The sub-process runs its action and completes both instances.
    let (target, _fields) = h.take_work("sub").await;
    assert_eq!(target, format!("{sub}_0"));
    h.respond(&target, Payload::new()).await;

    assert_eq!(h.root_state(&sub).await, State::Completed);
    assert_eq!(h.root_state(&parent).await, State::Completed);
}

#[tokio::test]
async fn scenario_action_error_aborts_the_instance() {
    let h = Harness::new();
    let pid = h
        .launch(
            r#"<process><sequence><action participant="p1"/><action participant="p2"/></sequence></process>"#,
        )
        .await;

    let (target, _fields) = h.take_work("p1").await;
    let mut payload = Payload::new();
    payload.insert("error".to_string(), json!("it broke"));
    h.respond(&target, payload).await;

    // The fault propagated up with no handler anywhere: the instance is
    // aborted and p2 was never invoked.
    let workflow = h.loaded(&pid).await;
    assert_eq!(workflow.process.state_of(&pid), Some(State::Aborted));
    assert_eq!(
        workflow.process.state_of(&format!("{pid}_0")),
        Some(State::Aborted)
    );
    h.assert_no_work("p2").await;
}

#[tokio::test]
async fn scenario_crash_between_messages_loses_nothing() {
    let h = Harness::new();
    let pid = h
        .launch(
            r#"<process><sequence><action participant="p1"/><action participant="p2"/></sequence></process>"#,
        )
        .await;

    let (target1, _fields) = h.take_work("p1").await;

    // "Crash": throw the engine away and rebuild everything from the bus
    // and storage, as a restarted daemon would.
    let engine = Engine::new(h.bus.clone(), h.storage.clone(), h.config.clone());
    let msg = Message::with_payload("response", &target1, &target1, Payload::new());
    h.bus
        .publish(
            &h.config.bureaucrat.message_queue,
            &msg.dumps(),
            CONTENT_TYPE_MESSAGE,
        )
        .await
        .unwrap();
    engine.run_until_idle().await.unwrap();

    let (target2, _fields) = h.take_work("p2").await;
    let msg = Message::with_payload("response", &target2, &target2, Payload::new());
    h.bus
        .publish(
            &h.config.bureaucrat.message_queue,
            &msg.dumps(),
            CONTENT_TYPE_MESSAGE,
        )
        .await
        .unwrap();
    engine.run_until_idle().await.unwrap();

    assert_eq!(h.root_state(&pid).await, State::Completed);
}
