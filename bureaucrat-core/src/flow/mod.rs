//! The flow expression tree: a hierarchical state machine driven entirely
//! by control messages.
//!
//! Nodes are stored flat, keyed by FEI, with parent/child links as FEI
//! strings — there are no pointers, so a tree rebuilt from the stored XML
//! and a snapshot behaves identically to the one that produced the
//! snapshot. One `handle_message` call routes exactly one message, mutates
//! states and emits follow-up messages through the Channel; the caller
//! persists the snapshot afterwards.

mod build;
mod protocol;

pub use build::BuildError;

use crate::channel::Channel;
use crate::context::{Context, ContextError, FAULT_KEY};
use crate::expr::Expr;
use crate::message::{in_subtree, Fei, Message};
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

// ─── States ───────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    Ready,
    Active,
    Completed,
    Aborting,
    Aborted,
    Canceling,
    Canceled,
}

impl State {
    pub fn is_final(self) -> bool {
        matches!(self, State::Completed | State::Aborted | State::Canceled)
    }
}

// ─── Node kinds ───────────────────────────────────────────────

/// One variant per activity, carrying the kind-specific build-time data.
/// Guards and selectors are compiled to `Expr` during the build.
#[derive(Clone, Debug)]
pub enum Kind {
    Process,
    Sequence,
    All,
    Switch,
    Case { conditions: Vec<Expr> },
    While { conditions: Vec<Expr> },
    Foreach { select: Expr },
    Action { participant: String },
    Delay { duration: u64 },
    Await { event: String, conditions: Vec<Expr> },
    Call { process: String },
    Assign { property: String, expr: Expr },
    Fault { code: String, message: String },
    /// Fault-handler container, FEI `{parent}_faults`.
    FaultHandlers,
    /// One handler under the container, matching on fault codes.
    FaultCase { codes: Vec<String>, default: bool },
}

impl Kind {
    /// Tag name, also the `type` field of snapshots.
    pub fn name(&self) -> &'static str {
        match self {
            Kind::Process => "process",
            Kind::Sequence => "sequence",
            Kind::All => "all",
            Kind::Switch => "switch",
            Kind::Case { .. } | Kind::FaultCase { .. } => "case",
            Kind::While { .. } => "while",
            Kind::Foreach { .. } => "foreach",
            Kind::Action { .. } => "action",
            Kind::Delay { .. } => "delay",
            Kind::Await { .. } => "await",
            Kind::Call { .. } => "call",
            Kind::Assign { .. } => "assign",
            Kind::Fault { .. } => "fault",
            Kind::FaultHandlers => "faults",
        }
    }

    /// Leaves have no children and share their parent's context.
    pub fn is_leaf(&self) -> bool {
        matches!(
            self,
            Kind::Action { .. }
                | Kind::Delay { .. }
                | Kind::Await { .. }
                | Kind::Call { .. }
                | Kind::Assign { .. }
                | Kind::Fault { .. }
        )
    }
}

// ─── Nodes and the tree ───────────────────────────────────────

#[derive(Clone, Debug)]
pub struct FlowNode {
    pub id: Fei,
    pub parent_id: Fei,
    pub state: State,
    pub kind: Kind,
    /// Numbered children, in declaration order. Fault handlers are not
    /// numbered children; they hang off `faults`.
    pub children: Vec<Fei>,
    /// Complex kinds own a context; leaves share the nearest ancestor's.
    pub context: Option<Context>,
    /// FEI of the fault-handler container, when declared.
    pub faults: Option<Fei>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Handling {
    Consumed,
    Ignored,
}

#[derive(Debug)]
pub struct FlowTree {
    root: Fei,
    nodes: BTreeMap<Fei, FlowNode>,
}

impl FlowTree {
    pub(crate) fn from_parts(root: Fei, nodes: BTreeMap<Fei, FlowNode>) -> Self {
        Self { root, nodes }
    }

    /// The instance pid (the root FEI).
    pub fn pid(&self) -> &str {
        &self.root
    }

    pub fn root(&self) -> &FlowNode {
        &self.nodes[&self.root]
    }

    pub fn node(&self, fei: &str) -> Option<&FlowNode> {
        self.nodes.get(fei)
    }

    pub(crate) fn node_mut(&mut self, fei: &str) -> Option<&mut FlowNode> {
        self.nodes.get_mut(fei)
    }

    pub fn state_of(&self, fei: &str) -> Option<State> {
        self.nodes.get(fei).map(|n| n.state)
    }

    /// Route one control message through the tree.
    ///
    /// A message is ignored when it addresses another instance, an unknown
    /// node, or a node whose subtree has been closed off by a final-state
    /// ancestor. Otherwise the target node handles it: the generic
    /// fault/terminate protocol first, then its kind-specific behavior.
    pub async fn handle_message(&mut self, chan: &Channel, msg: &Message) -> Result<Handling> {
        if !in_subtree(&msg.target, &self.root) {
            return Ok(Handling::Ignored);
        }
        if !self.nodes.contains_key(&msg.target) {
            tracing::warn!(target = %msg.target, "message for unknown node");
            return Ok(Handling::Ignored);
        }

        // A final node ignores everything, and seals its whole subtree.
        let mut current = msg.target.clone();
        loop {
            let node = &self.nodes[&current];
            if node.state.is_final() {
                tracing::debug!(node = %current, name = %msg.name, "ignored by final node");
                return Ok(Handling::Ignored);
            }
            if current == self.root {
                break;
            }
            current = node.parent_id.clone();
        }

        protocol::deliver(self, chan, msg).await
    }

    // ─── Context chain ────────────────────────────────────────

    /// FEI of the nearest self-or-ancestor node that owns a context.
    fn context_owner(&self, fei: &str) -> Option<Fei> {
        let mut current = fei.to_string();
        loop {
            let node = self.nodes.get(&current)?;
            if node.context.is_some() {
                return Some(current);
            }
            if current == self.root {
                return None;
            }
            current = node.parent_id.clone();
        }
    }

    /// Context-owning nodes from `fei` towards the root.
    fn context_chain(&self, fei: &str) -> Vec<Fei> {
        let mut chain = Vec::new();
        let mut current = fei.to_string();
        loop {
            let Some(node) = self.nodes.get(&current) else {
                break;
            };
            if node.context.is_some() {
                chain.push(current.clone());
            }
            if current == self.root {
                break;
            }
            current = node.parent_id.clone();
        }
        chain
    }

    /// The flattened scope visible from a node: root properties overlaid by
    /// every nested context down to the node's own.
    pub fn scope(&self, fei: &str) -> Map<String, Value> {
        let mut props = Map::new();
        for owner in self.context_chain(fei).into_iter().rev() {
            let ctx = self.nodes[&owner].context.as_ref().unwrap();
            for (key, value) in ctx.localprops() {
                props.insert(key.clone(), value.clone());
            }
        }
        props
    }

    /// Look a property up through the scope chain.
    pub fn get_prop(&self, fei: &str, key: &str) -> Result<Value, ContextError> {
        for owner in self.context_chain(fei) {
            let ctx = self.nodes[&owner].context.as_ref().unwrap();
            if let Some(value) = ctx.get_local(key) {
                return Ok(value.clone());
            }
        }
        Err(ContextError::NoSuchProperty(key.to_string()))
    }

    /// Set a property: updates the nearest scope that already owns the key,
    /// else sets it in the node's effective context.
    pub fn set_prop(&mut self, fei: &str, key: &str, value: Value) -> Result<(), ContextError> {
        if Context::is_reserved(key) {
            return Err(ContextError::Reserved(key.to_string()));
        }
        let chain = self.context_chain(fei);
        let owner = chain
            .iter()
            .find(|owner| {
                self.nodes[owner.as_str()]
                    .context
                    .as_ref()
                    .unwrap()
                    .has(key)
            })
            .or(chain.first())
            .cloned()
            .ok_or_else(|| ContextError::NoSuchProperty(key.to_string()))?;
        self.nodes
            .get_mut(&owner)
            .unwrap()
            .context
            .as_mut()
            .unwrap()
            .set_local(key, value);
        Ok(())
    }

    /// Merge a payload into the scope, skipping reserved keys.
    pub fn update_props(&mut self, fei: &str, props: &Map<String, Value>) -> Result<(), ContextError> {
        for (key, value) in props {
            if Context::is_reserved(key) {
                continue;
            }
            self.set_prop(fei, key, value.clone())?;
        }
        Ok(())
    }

    /// The active fault visible from a node.
    pub fn fault_at(&self, fei: &str) -> Option<Value> {
        for owner in self.context_chain(fei) {
            if let Some(fault) = self.nodes[&owner].context.as_ref().unwrap().fault() {
                return Some(fault.clone());
            }
        }
        None
    }

    /// Record a fault in the node's effective context.
    pub(crate) fn throw_at(&mut self, fei: &str, fault: Value) {
        if let Some(owner) = self.context_owner(fei) {
            self.nodes
                .get_mut(&owner)
                .unwrap()
                .context
                .as_mut()
                .unwrap()
                .set_local(FAULT_KEY, fault);
        }
    }

    pub(crate) fn clear_fault_at(&mut self, fei: &str) {
        for owner in self.context_chain(fei) {
            let ctx = self.nodes.get_mut(&owner).unwrap().context.as_mut().unwrap();
            if ctx.fault().is_some() {
                ctx.clear_fault();
                return;
            }
        }
    }

    // ─── Subtree resets (while / foreach re-entry) ────────────

    /// Reset the states of all descendants of `fei` to ready.
    pub(crate) fn reset_children_states(&mut self, fei: &str) {
        let children = self.nodes[fei].children.clone();
        for child in children {
            self.nodes.get_mut(&child).unwrap().state = State::Ready;
            self.reset_children_states(&child);
        }
    }

    /// Re-apply the declared context properties throughout a subtree
    /// (excluding `fei` itself).
    pub(crate) fn reset_descendant_contexts(&mut self, fei: &str) {
        let children = self.nodes[fei].children.clone();
        for child in children {
            if let Some(ctx) = self.nodes.get_mut(&child).unwrap().context.as_mut() {
                ctx.reset_declared();
            }
            self.reset_descendant_contexts(&child);
        }
    }

    // ─── Snapshot / restore ───────────────────────────────────

    pub fn snapshot(&self) -> NodeSnapshot {
        self.snapshot_node(&self.root.clone())
    }

    fn snapshot_node(&self, fei: &str) -> NodeSnapshot {
        let node = &self.nodes[fei];
        NodeSnapshot {
            id: node.id.clone(),
            state: node.state,
            node_type: node.kind.name().to_string(),
            context: node.context.as_ref().map(|c| c.localprops().clone()),
            faults: node
                .faults
                .as_ref()
                .map(|f| Box::new(self.snapshot_node(f))),
            children: node
                .children
                .iter()
                .map(|c| self.snapshot_node(c))
                .collect(),
        }
    }

    /// Apply a snapshot to a freshly built tree. Walks both in lockstep;
    /// any divergence means the stored definition and snapshot no longer
    /// describe the same instance, which is fatal.
    pub fn restore(&mut self, snapshot: &NodeSnapshot) -> Result<()> {
        self.restore_node(&self.root.clone(), snapshot)
    }

    fn restore_node(&mut self, fei: &str, snapshot: &NodeSnapshot) -> Result<()> {
        let node = self
            .nodes
            .get_mut(fei)
            .ok_or_else(|| anyhow::anyhow!("snapshot references unknown node {fei}"))?;
        if snapshot.id != node.id || snapshot.node_type != node.kind.name() {
            bail!(
                "snapshot mismatch at {}: expected {}/{}, snapshot has {}/{}",
                fei,
                node.id,
                node.kind.name(),
                snapshot.id,
                snapshot.node_type
            );
        }
        node.state = snapshot.state;
        match (&mut node.context, &snapshot.context) {
            (Some(ctx), Some(props)) => ctx.set_localprops(props.clone()),
            (None, None) => {}
            _ => bail!("snapshot context mismatch at {fei}"),
        }
        if node.children.len() != snapshot.children.len() {
            bail!("snapshot children mismatch at {fei}");
        }

        let children = self.nodes[fei].children.clone();
        for (child, child_snapshot) in children.iter().zip(&snapshot.children) {
            self.restore_node(child, child_snapshot)?;
        }
        match (self.nodes[fei].faults.clone(), &snapshot.faults) {
            (Some(faults_fei), Some(faults_snapshot)) => {
                self.restore_node(&faults_fei, faults_snapshot)?
            }
            (None, None) => {}
            _ => bail!("snapshot fault-handler mismatch at {fei}"),
        }
        Ok(())
    }
}

/// JSON-serialized state of one node; the instance snapshot is the root's.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub id: String,
    pub state: State,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub faults: Option<Box<NodeSnapshot>>,
    #[serde(default)]
    pub children: Vec<NodeSnapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn build(xml: &str) -> FlowTree {
        FlowTree::build(&crate::xml::XmlElement::parse(xml).unwrap(), "fake-id").unwrap()
    }

    #[test]
    fn test_scope_chains_and_overlays() {
        let tree = build(
            r#"<process>
                 <context>
                   <property name="a" type="int">1</property>
                   <property name="b" type="int">2</property>
                 </context>
                 <sequence>
                   <context><property name="b" type="int">20</property></context>
                   <action participant="p"/>
                 </sequence>
               </process>"#,
        );
        // The action's scope is its parent sequence's chain.
        let scope = tree.scope("fake-id_0_0");
        assert_eq!(scope["a"], json!(1));
        assert_eq!(scope["b"], json!(20));
        assert_eq!(tree.get_prop("fake-id_0_0", "a").unwrap(), json!(1));
        assert_eq!(tree.get_prop("fake-id", "b").unwrap(), json!(2));
    }

    #[test]
    fn test_set_prop_updates_owning_scope() {
        let mut tree = build(
            r#"<process>
                 <context><property name="a" type="int">1</property></context>
                 <sequence>
                   <context><property name="local" type="int">0</property></context>
                   <action participant="p"/>
                 </sequence>
               </process>"#,
        );
        // `a` is owned by the root context: the update lands there.
        tree.set_prop("fake-id_0_0", "a", json!(5)).unwrap();
        assert_eq!(
            tree.node("fake-id").unwrap().context.as_ref().unwrap().get_local("a"),
            Some(&json!(5))
        );
        // A new key lands in the effective (sequence) context.
        tree.set_prop("fake-id_0_0", "fresh", json!(true)).unwrap();
        assert!(tree
            .node("fake-id_0")
            .unwrap()
            .context
            .as_ref()
            .unwrap()
            .has("fresh"));
        assert!(!tree.node("fake-id").unwrap().context.as_ref().unwrap().has("fresh"));
    }

    #[test]
    fn test_set_reserved_key_is_an_error() {
        let mut tree = build("<process><sequence><action participant=\"p\"/></sequence></process>");
        assert!(matches!(
            tree.set_prop("fake-id_0", "inst:fault", json!({})),
            Err(ContextError::Reserved(_))
        ));
    }

    #[test]
    fn test_update_props_skips_reserved() {
        let mut tree = build("<process><sequence><action participant=\"p\"/></sequence></process>");
        let mut payload = Map::new();
        payload.insert("ok".to_string(), json!(1));
        payload.insert("inst:fault".to_string(), json!({"code": "X"}));
        tree.update_props("fake-id_0_0", &payload).unwrap();
        assert_eq!(tree.get_prop("fake-id_0_0", "ok").unwrap(), json!(1));
        assert!(tree.fault_at("fake-id_0_0").is_none());
    }

    #[test]
    fn test_snapshot_restore_round_trip() {
        let xml = r#"<process>
                       <context><property name="n" type="int">1</property></context>
                       <sequence>
                         <action participant="p1"/>
                         <action participant="p2"/>
                       </sequence>
                     </process>"#;
        let mut tree = build(xml);
        tree.node_mut("fake-id").unwrap().state = State::Active;
        tree.node_mut("fake-id_0").unwrap().state = State::Active;
        tree.node_mut("fake-id_0_0").unwrap().state = State::Completed;
        tree.set_prop("fake-id", "n", json!(42)).unwrap();

        let snapshot = tree.snapshot();
        let serialized = serde_json::to_vec(&snapshot).unwrap();
        let reloaded: NodeSnapshot = serde_json::from_slice(&serialized).unwrap();

        let mut restored = build(xml);
        restored.restore(&reloaded).unwrap();
        assert_eq!(restored.state_of("fake-id"), Some(State::Active));
        assert_eq!(restored.state_of("fake-id_0"), Some(State::Active));
        assert_eq!(restored.state_of("fake-id_0_0"), Some(State::Completed));
        assert_eq!(restored.state_of("fake-id_0_1"), Some(State::Ready));
        assert_eq!(restored.get_prop("fake-id_0_1", "n").unwrap(), json!(42));
    }

    #[test]
    fn test_restore_rejects_mismatched_definition() {
        let tree = build("<process><sequence><action participant=\"p\"/></sequence></process>");
        let snapshot = tree.snapshot();
        let mut other = build("<process><all><action participant=\"p\"/></all></process>");
        assert!(other.restore(&snapshot).is_err());
    }

    #[test]
    fn test_reset_children_states() {
        let mut tree = build(
            "<process><while><condition>True</condition><action participant=\"p\"/></while></process>",
        );
        tree.node_mut("fake-id_0_0").unwrap().state = State::Completed;
        tree.reset_children_states("fake-id_0");
        assert_eq!(tree.state_of("fake-id_0_0"), Some(State::Ready));
    }
}
