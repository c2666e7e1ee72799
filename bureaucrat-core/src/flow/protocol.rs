//! Message handling: the generic protocol shared by all complex nodes,
//! followed by kind-specific behavior. One call handles exactly one
//! message and emits any follow-ups through the Channel; nothing recurses
//! in memory, so the tree can be persisted between any two messages.

use super::{FlowTree, Handling, Kind, State};
use crate::channel::Channel;
use crate::expr::eval_guard;
use crate::message::{Fei, Message, Payload};
use crate::schedule::now_secs;
use crate::xml::XmlElement;
use anyhow::{anyhow, bail, Result};
use serde_json::{json, Value};

pub(super) async fn deliver(
    tree: &mut FlowTree,
    chan: &Channel,
    msg: &Message,
) -> Result<Handling> {
    let fei = msg.target.clone();
    if tree.node(&fei).unwrap().kind.is_leaf() {
        deliver_leaf(tree, chan, msg, &fei).await
    } else {
        if let Some(handling) = generic_complex(tree, chan, msg, &fei).await? {
            return Ok(handling);
        }
        let kind = tree.node(&fei).unwrap().kind.clone();
        match kind {
            Kind::Process | Kind::Sequence | Kind::Case { .. } | Kind::FaultCase { .. } => {
                sequence_like(tree, chan, msg, &fei).await
            }
            Kind::Switch => switch_node(tree, chan, msg, &fei).await,
            Kind::While { .. } => while_node(tree, chan, msg, &fei).await,
            Kind::Foreach { .. } => foreach_node(tree, chan, msg, &fei).await,
            Kind::All => all_node(tree, chan, msg, &fei).await,
            Kind::FaultHandlers => fault_handlers(tree, chan, msg, &fei).await,
            _ => unreachable!("leaf kinds are handled above"),
        }
    }
}

// ─── Shared emission helpers ──────────────────────────────────

async fn notify_parent(tree: &FlowTree, chan: &Channel, fei: &str, name: &str) -> Result<()> {
    let parent_id = tree.node(fei).unwrap().parent_id.clone();
    chan.send(&Message::new(name, &parent_id, fei)).await
}

async fn fault_parent(tree: &FlowTree, chan: &Channel, fei: &str, payload: Payload) -> Result<()> {
    let parent_id = tree.node(fei).unwrap().parent_id.clone();
    chan.send(&Message::with_payload("fault", &parent_id, fei, payload))
        .await
}

async fn start_child(chan: &Channel, parent: &str, child: &str) -> Result<()> {
    chan.send(&Message::new("start", child, parent)).await
}

fn value_to_payload(value: Value) -> Payload {
    match value {
        Value::Object(entries) => entries,
        _ => Payload::new(),
    }
}

fn non_final_children(tree: &FlowTree, fei: &str) -> Vec<Fei> {
    tree.node(fei)
        .unwrap()
        .children
        .iter()
        .filter(|child| !tree.state_of(child).unwrap().is_final())
        .cloned()
        .collect()
}

fn all_children_final(tree: &FlowTree, fei: &str) -> bool {
    non_final_children(tree, fei).is_empty()
}

// ─── Generic complex protocol ─────────────────────────────────

/// Fault/terminate propagation and teardown bookkeeping. Returns `Some`
/// when the message was consumed here, `None` to let the kind-specific
/// handler see it.
async fn generic_complex(
    tree: &mut FlowTree,
    chan: &Channel,
    msg: &Message,
    fei: &str,
) -> Result<Option<Handling>> {
    let state = tree.state_of(fei).unwrap();
    let faults_fei = tree.node(fei).unwrap().faults.clone();

    match msg.name.as_str() {
        "fault" => {
            // A faulting handler kills its container immediately; the
            // enclosing node adopts the new fault.
            if matches!(tree.node(fei).unwrap().kind, Kind::FaultHandlers) {
                tree.node_mut(fei).unwrap().state = State::Aborted;
                fault_parent(tree, chan, fei, msg.payload.clone()).await?;
                return Ok(Some(Handling::Consumed));
            }
            match state {
                State::Active => {
                    tree.throw_at(fei, Value::Object(msg.payload.clone()));
                    tree.node_mut(fei).unwrap().state = State::Aborting;
                    let pending = non_final_children(tree, fei);
                    if pending.is_empty() {
                        resolve_abort(tree, chan, fei).await?;
                    } else {
                        for child in pending {
                            chan.send(&Message::new("terminate", &child, fei)).await?;
                        }
                    }
                    Ok(Some(Handling::Consumed))
                }
                State::Aborting if Some(&msg.origin) == faults_fei.as_ref() => {
                    // The handler itself faulted: the new fault wins.
                    tree.throw_at(fei, Value::Object(msg.payload.clone()));
                    tree.node_mut(fei).unwrap().state = State::Aborted;
                    fault_parent(tree, chan, fei, msg.payload.clone()).await?;
                    Ok(Some(Handling::Consumed))
                }
                State::Aborting | State::Canceling => {
                    // A child faulted during teardown; count it as final.
                    if tree.fault_at(fei).is_none() {
                        tree.throw_at(fei, Value::Object(msg.payload.clone()));
                    }
                    child_final_quorum(tree, chan, fei).await?;
                    Ok(Some(Handling::Consumed))
                }
                _ => {
                    tracing::debug!(node = %fei, ?state, "fault ignored in this state");
                    Ok(Some(Handling::Consumed))
                }
            }
        }
        "terminate" => {
            match state {
                State::Active => tree.node_mut(fei).unwrap().state = State::Aborting,
                State::Ready => tree.node_mut(fei).unwrap().state = State::Canceling,
                State::Aborting | State::Canceling => {}
                _ => {}
            }
            let pending = non_final_children(tree, fei);
            if pending.is_empty() {
                child_final_quorum(tree, chan, fei).await?;
            } else {
                for child in pending {
                    chan.send(&Message::new("terminate", &child, fei)).await?;
                }
            }
            Ok(Some(Handling::Consumed))
        }
        "completed" | "aborted" | "canceled" => match state {
            State::Aborting
                if msg.name == "completed" && Some(&msg.origin) == faults_fei.as_ref() =>
            {
                // Recovered by the fault handler.
                tree.clear_fault_at(fei);
                tree.node_mut(fei).unwrap().state = State::Completed;
                notify_parent(tree, chan, fei, "completed").await?;
                Ok(Some(Handling::Consumed))
            }
            State::Aborting | State::Canceling => {
                child_final_quorum(tree, chan, fei).await?;
                Ok(Some(Handling::Consumed))
            }
            _ => Ok(None),
        },
        _ => Ok(None),
    }
}

/// Close out an aborting/canceling node once every child is final.
async fn child_final_quorum(tree: &mut FlowTree, chan: &Channel, fei: &str) -> Result<()> {
    if !all_children_final(tree, fei) {
        return Ok(());
    }
    match tree.state_of(fei).unwrap() {
        State::Aborting => resolve_abort(tree, chan, fei).await,
        State::Canceling => {
            tree.node_mut(fei).unwrap().state = State::Canceled;
            notify_parent(tree, chan, fei, "canceled").await
        }
        _ => Ok(()),
    }
}

/// All children of an aborting node are final: hand over to a matching
/// fault handler, or go aborted and propagate.
async fn resolve_abort(tree: &mut FlowTree, chan: &Channel, fei: &str) -> Result<()> {
    let fault = tree.fault_at(fei);
    let code = fault
        .as_ref()
        .and_then(|f| f.get("code"))
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();

    if let Some(faults_fei) = tree.node(fei).unwrap().faults.clone() {
        if select_fault_case(tree, &faults_fei, &code).is_some() {
            match tree.state_of(&faults_fei).unwrap() {
                State::Ready => {
                    chan.send(&Message::new("start", &faults_fei, fei)).await?;
                    return Ok(());
                }
                // The handler is already in charge.
                State::Active | State::Aborting | State::Canceling => return Ok(()),
                _ => {}
            }
        }
    }

    tree.node_mut(fei).unwrap().state = State::Aborted;
    match fault {
        Some(value) => fault_parent(tree, chan, fei, value_to_payload(value)).await,
        // Pure terminate teardown carries no fault.
        None => notify_parent(tree, chan, fei, "aborted").await,
    }
}

/// First declared case matching the code, else the default case.
fn select_fault_case(tree: &FlowTree, faults_fei: &str, code: &str) -> Option<Fei> {
    let container = tree.node(faults_fei)?;
    let mut default_case = None;
    for child in &container.children {
        if let Kind::FaultCase { codes, default } = &tree.node(child)?.kind {
            if *default {
                default_case.get_or_insert_with(|| child.clone());
            } else if codes.iter().any(|c| c == code) {
                return Some(child.clone());
            }
        }
    }
    default_case
}

// ─── Sequence-like kinds (process, sequence, case, fault case) ─

async fn activate(tree: &mut FlowTree, chan: &Channel, fei: &str) -> Result<()> {
    let children = tree.node(fei).unwrap().children.clone();
    if children.is_empty() {
        tree.node_mut(fei).unwrap().state = State::Completed;
        notify_parent(tree, chan, fei, "completed").await
    } else {
        tree.node_mut(fei).unwrap().state = State::Active;
        start_child(chan, fei, &children[0]).await
    }
}

async fn complete(tree: &mut FlowTree, chan: &Channel, fei: &str) -> Result<()> {
    tree.node_mut(fei).unwrap().state = State::Completed;
    notify_parent(tree, chan, fei, "completed").await
}

async fn sequence_like(
    tree: &mut FlowTree,
    chan: &Channel,
    msg: &Message,
    fei: &str,
) -> Result<Handling> {
    let state = tree.state_of(fei).unwrap();

    if msg.name == "start" && state == State::Ready {
        if let Kind::Case { conditions } = &tree.node(fei).unwrap().kind {
            let conditions = conditions.clone();
            if !eval_guard(&conditions, &tree.scope(fei))? {
                tracing::debug!(node = %fei, "case conditions don't hold");
                return Ok(Handling::Ignored);
            }
        }
        activate(tree, chan, fei).await?;
        return Ok(Handling::Consumed);
    }

    if msg.name == "completed" && state == State::Active {
        let children = tree.node(fei).unwrap().children.clone();
        return match children.iter().position(|child| child == &msg.origin) {
            Some(index) if index + 1 < children.len() => {
                start_child(chan, fei, &children[index + 1]).await?;
                Ok(Handling::Consumed)
            }
            Some(_) => {
                complete(tree, chan, fei).await?;
                Ok(Handling::Consumed)
            }
            None => {
                tracing::warn!(node = %fei, origin = %msg.origin, "no origin found");
                Ok(Handling::Ignored)
            }
        };
    }

    Ok(Handling::Ignored)
}

// ─── Switch ───────────────────────────────────────────────────

async fn switch_node(
    tree: &mut FlowTree,
    chan: &Channel,
    msg: &Message,
    fei: &str,
) -> Result<Handling> {
    let state = tree.state_of(fei).unwrap();

    if msg.name == "start" && state == State::Ready {
        let cases = tree.node(fei).unwrap().children.clone();
        for case in &cases {
            let Kind::Case { conditions } = &tree.node(case).unwrap().kind else {
                continue;
            };
            let conditions = conditions.clone();
            if eval_guard(&conditions, &tree.scope(case))? {
                tree.node_mut(fei).unwrap().state = State::Active;
                start_child(chan, fei, case).await?;
                return Ok(Handling::Consumed);
            }
            tracing::debug!(node = %case, "case conditions don't hold");
        }
        complete(tree, chan, fei).await?;
        return Ok(Handling::Consumed);
    }

    if msg.name == "completed" && state == State::Active {
        complete(tree, chan, fei).await?;
        return Ok(Handling::Consumed);
    }

    Ok(Handling::Ignored)
}

// ─── While ────────────────────────────────────────────────────

async fn while_node(
    tree: &mut FlowTree,
    chan: &Channel,
    msg: &Message,
    fei: &str,
) -> Result<Handling> {
    let state = tree.state_of(fei).unwrap();
    let Kind::While { conditions } = &tree.node(fei).unwrap().kind else {
        unreachable!()
    };
    let conditions = conditions.clone();

    if msg.name == "start" && state == State::Ready {
        if !eval_guard(&conditions, &tree.scope(fei))? {
            complete(tree, chan, fei).await?;
        } else {
            // The builder rejects an empty while, so child 0 exists.
            let first = tree.node(fei).unwrap().children[0].clone();
            tree.node_mut(fei).unwrap().state = State::Active;
            start_child(chan, fei, &first).await?;
        }
        return Ok(Handling::Consumed);
    }

    if msg.name == "completed" && state == State::Active {
        let children = tree.node(fei).unwrap().children.clone();
        return match children.iter().position(|child| child == &msg.origin) {
            Some(index) if index + 1 < children.len() => {
                start_child(chan, fei, &children[index + 1]).await?;
                Ok(Handling::Consumed)
            }
            Some(_) => {
                if eval_guard(&conditions, &tree.scope(fei))? {
                    tree.reset_children_states(fei);
                    start_child(chan, fei, &children[0]).await?;
                } else {
                    complete(tree, chan, fei).await?;
                }
                Ok(Handling::Consumed)
            }
            None => {
                tracing::warn!(node = %fei, origin = %msg.origin, "no origin found");
                Ok(Handling::Ignored)
            }
        };
    }

    Ok(Handling::Ignored)
}

// ─── Foreach ──────────────────────────────────────────────────

fn foreach_enter_iteration(tree: &mut FlowTree, fei: &str, items: &[Value], iteration: u64) {
    let ctx = tree.node_mut(fei).unwrap().context.as_mut().unwrap();
    ctx.reset_declared();
    ctx.set_local("inst:selection", Value::Array(items.to_vec()));
    ctx.set_local("inst:iteration", json!(iteration));
    ctx.set_local("inst:current", items[(iteration - 1) as usize].clone());
}

async fn foreach_node(
    tree: &mut FlowTree,
    chan: &Channel,
    msg: &Message,
    fei: &str,
) -> Result<Handling> {
    let state = tree.state_of(fei).unwrap();
    let Kind::Foreach { select } = &tree.node(fei).unwrap().kind else {
        unreachable!()
    };
    let select = select.clone();

    if msg.name == "start" && state == State::Ready {
        let selection = select.eval(&tree.scope(fei))?;
        let Value::Array(items) = selection else {
            bail!("foreach select must yield a list, got {selection}");
        };
        if items.is_empty() {
            complete(tree, chan, fei).await?;
            return Ok(Handling::Consumed);
        }
        foreach_enter_iteration(tree, fei, &items, 1);
        let first = tree.node(fei).unwrap().children[0].clone();
        tree.node_mut(fei).unwrap().state = State::Active;
        start_child(chan, fei, &first).await?;
        return Ok(Handling::Consumed);
    }

    if msg.name == "completed" && state == State::Active {
        let children = tree.node(fei).unwrap().children.clone();
        return match children.iter().position(|child| child == &msg.origin) {
            Some(index) if index + 1 < children.len() => {
                start_child(chan, fei, &children[index + 1]).await?;
                Ok(Handling::Consumed)
            }
            Some(_) => {
                let ctx = tree.node(fei).unwrap().context.as_ref().unwrap();
                let iteration = ctx
                    .get_local("inst:iteration")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| anyhow!("foreach {fei} lost inst:iteration"))?;
                let items = ctx
                    .get_local("inst:selection")
                    .and_then(Value::as_array)
                    .cloned()
                    .ok_or_else(|| anyhow!("foreach {fei} lost inst:selection"))?;
                if (iteration as usize) < items.len() {
                    foreach_enter_iteration(tree, fei, &items, iteration + 1);
                    tree.reset_children_states(fei);
                    tree.reset_descendant_contexts(fei);
                    start_child(chan, fei, &children[0]).await?;
                } else {
                    complete(tree, chan, fei).await?;
                }
                Ok(Handling::Consumed)
            }
            None => {
                tracing::warn!(node = %fei, origin = %msg.origin, "no origin found");
                Ok(Handling::Ignored)
            }
        };
    }

    Ok(Handling::Ignored)
}

// ─── All ──────────────────────────────────────────────────────

async fn all_node(
    tree: &mut FlowTree,
    chan: &Channel,
    msg: &Message,
    fei: &str,
) -> Result<Handling> {
    let state = tree.state_of(fei).unwrap();

    if msg.name == "start" && state == State::Ready {
        let children = tree.node(fei).unwrap().children.clone();
        if children.is_empty() {
            complete(tree, chan, fei).await?;
        } else {
            tree.node_mut(fei).unwrap().state = State::Active;
            for child in &children {
                start_child(chan, fei, child).await?;
            }
        }
        return Ok(Handling::Consumed);
    }

    if msg.name == "completed" && state == State::Active {
        if all_children_final(tree, fei) {
            complete(tree, chan, fei).await?;
        }
        return Ok(Handling::Consumed);
    }

    Ok(Handling::Ignored)
}

// ─── Fault-handler container ──────────────────────────────────

async fn fault_handlers(
    tree: &mut FlowTree,
    chan: &Channel,
    msg: &Message,
    fei: &str,
) -> Result<Handling> {
    let state = tree.state_of(fei).unwrap();

    if msg.name == "start" && state == State::Ready {
        let code = tree
            .fault_at(fei)
            .as_ref()
            .and_then(|f| f.get("code"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        match select_fault_case(tree, fei, &code) {
            Some(case) => {
                tree.node_mut(fei).unwrap().state = State::Active;
                start_child(chan, fei, &case).await?;
            }
            None => {
                // No handler matches after all: pass the fault along.
                let payload = tree.fault_at(fei).map(value_to_payload).unwrap_or_default();
                tree.node_mut(fei).unwrap().state = State::Aborted;
                fault_parent(tree, chan, fei, payload).await?;
            }
        }
        return Ok(Handling::Consumed);
    }

    if msg.name == "completed" && state == State::Active {
        complete(tree, chan, fei).await?;
        return Ok(Handling::Consumed);
    }

    Ok(Handling::Ignored)
}

// ─── Leaves ───────────────────────────────────────────────────

async fn deliver_leaf(
    tree: &mut FlowTree,
    chan: &Channel,
    msg: &Message,
    fei: &str,
) -> Result<Handling> {
    let state = tree.state_of(fei).unwrap();

    // The leaf terminate protocol.
    if msg.name == "terminate" {
        match state {
            State::Ready => {
                tree.node_mut(fei).unwrap().state = State::Canceled;
                notify_parent(tree, chan, fei, "canceled").await?;
            }
            State::Active | State::Aborting => {
                tree.node_mut(fei).unwrap().state = State::Aborted;
                notify_parent(tree, chan, fei, "aborted").await?;
            }
            _ => {}
        }
        return Ok(Handling::Consumed);
    }

    let kind = tree.node(fei).unwrap().kind.clone();
    match kind {
        Kind::Action { participant } => match (msg.name.as_str(), state) {
            ("start", State::Ready) => {
                tracing::debug!(node = %fei, participant = %participant, "activating participant");
                tree.node_mut(fei).unwrap().state = State::Active;
                chan.elaborate(&participant, fei, &tree.scope(fei)).await?;
                Ok(Handling::Consumed)
            }
            ("response", State::Active) => {
                if let Some(error) = msg.payload.get("error") {
                    tree.node_mut(fei).unwrap().state = State::Aborting;
                    let mut payload = Payload::new();
                    payload.insert("code".to_string(), json!("ActionError"));
                    payload.insert("message".to_string(), error.clone());
                    fault_parent(tree, chan, fei, payload).await?;
                } else {
                    tree.update_props(fei, &msg.payload)?;
                    tree.node_mut(fei).unwrap().state = State::Completed;
                    notify_parent(tree, chan, fei, "completed").await?;
                }
                Ok(Handling::Consumed)
            }
            _ => leaf_ignores(fei, msg),
        },

        Kind::Delay { duration } => match (msg.name.as_str(), state) {
            ("start", State::Ready) => {
                tree.node_mut(fei).unwrap().state = State::Active;
                chan.schedule_event("timeout", now_secs() + duration, fei)
                    .await?;
                Ok(Handling::Consumed)
            }
            ("timeout", State::Active) => {
                tree.node_mut(fei).unwrap().state = State::Completed;
                notify_parent(tree, chan, fei, "completed").await?;
                Ok(Handling::Consumed)
            }
            _ => leaf_ignores(fei, msg),
        },

        Kind::Await { event, conditions } => match (msg.name.as_str(), state) {
            ("start", State::Ready) => {
                tree.node_mut(fei).unwrap().state = State::Active;
                chan.subscribe(&event, fei).await?;
                Ok(Handling::Consumed)
            }
            ("triggered", State::Active) => {
                let mut scope = tree.scope(fei);
                scope.insert("event".to_string(), Value::Object(msg.payload.clone()));
                if eval_guard(&conditions, &scope)? {
                    tree.set_prop(fei, "event", Value::Object(msg.payload.clone()))?;
                    tree.node_mut(fei).unwrap().state = State::Completed;
                    notify_parent(tree, chan, fei, "completed").await?;
                } else {
                    // The subscription was consumed by this firing;
                    // re-subscribe so a later event can still satisfy us.
                    tracing::debug!(node = %fei, event = %event, "guard doesn't hold, re-subscribing");
                    chan.subscribe(&event, fei).await?;
                }
                Ok(Handling::Consumed)
            }
            _ => leaf_ignores(fei, msg),
        },

        Kind::Call { process } => match (msg.name.as_str(), state) {
            ("start", State::Ready) => {
                let reference = &process[1..];
                let definition = tree.get_prop(fei, reference)?;
                let definition = definition
                    .as_str()
                    .ok_or_else(|| anyhow!("property {reference} is not a definition string"))?;
                let mut root = XmlElement::parse(definition)?;
                if root.tag != "process" {
                    bail!("called definition must be a <process>, got <{}>", root.tag);
                }
                root.set_attr("parent", fei);
                tree.node_mut(fei).unwrap().state = State::Active;
                chan.launch(root.to_xml()?.as_bytes()).await?;
                Ok(Handling::Consumed)
            }
            ("completed", State::Active) => {
                tree.node_mut(fei).unwrap().state = State::Completed;
                notify_parent(tree, chan, fei, "completed").await?;
                Ok(Handling::Consumed)
            }
            _ => leaf_ignores(fei, msg),
        },

        Kind::Assign { property, expr } => match (msg.name.as_str(), state) {
            ("start", State::Ready) => {
                let value = expr.eval(&tree.scope(fei))?;
                tree.set_prop(fei, &property, value)?;
                tree.node_mut(fei).unwrap().state = State::Completed;
                notify_parent(tree, chan, fei, "completed").await?;
                Ok(Handling::Consumed)
            }
            _ => leaf_ignores(fei, msg),
        },

        Kind::Fault { code, message } => match (msg.name.as_str(), state) {
            ("start", State::Ready) => {
                let mut payload = Payload::new();
                payload.insert("code".to_string(), json!(code));
                payload.insert("message".to_string(), json!(message));
                tree.node_mut(fei).unwrap().state = State::Completed;
                fault_parent(tree, chan, fei, payload).await?;
                Ok(Handling::Consumed)
            }
            _ => leaf_ignores(fei, msg),
        },

        _ => unreachable!("complex kinds are handled elsewhere"),
    }
}

fn leaf_ignores(fei: &str, msg: &Message) -> Result<Handling> {
    tracing::debug!(node = %fei, name = %msg.name, "leaf ignores message");
    Ok(Handling::Ignored)
}
