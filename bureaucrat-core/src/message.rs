use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Flow Expression Identifier.
///
/// The root of an instance is the workflow pid (a UUID, which never contains
/// an underscore); child k of node X is `X_k`. Routing works entirely on
/// these strings: a node owns a message iff the target equals its id, and
/// routes it iff the target starts with its id followed by `_`.
pub type Fei = String;

/// Payload attached to a control message: a JSON object, empty by default.
pub type Payload = Map<String, Value>;

pub const CONTENT_TYPE_MESSAGE: &str = "application/x-bureaucrat-message";
pub const CONTENT_TYPE_WORKITEM: &str = "application/x-bureaucrat-workitem";

/// Control message envelope.
///
/// `name` is an open vocabulary: the fixed control names (`start`,
/// `completed`, `response`, `triggered`, `timeout`, `fault`, `terminate`,
/// `aborted`, `canceled`) plus any scheduled-event code. An empty `target`
/// addresses the outside world; the engine logs and drops such messages.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub name: String,
    pub target: Fei,
    pub origin: Fei,
    #[serde(default)]
    pub payload: Payload,
}

impl Message {
    pub fn new(name: &str, target: &str, origin: &str) -> Self {
        Self {
            name: name.to_string(),
            target: target.to_string(),
            origin: origin.to_string(),
            payload: Payload::new(),
        }
    }

    pub fn with_payload(name: &str, target: &str, origin: &str, payload: Payload) -> Self {
        Self {
            name: name.to_string(),
            target: target.to_string(),
            origin: origin.to_string(),
            payload,
        }
    }

    /// Parse a message from its JSON wire body.
    pub fn loads(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body).context("can't parse control message")
    }

    /// Serialize to the JSON wire body.
    pub fn dumps(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("message serialization is infallible")
    }

    /// Pid of the instance the target node belongs to.
    pub fn target_pid(&self) -> &str {
        pid_of(&self.target)
    }

    /// Pid of the instance the origin node belongs to.
    pub fn origin_pid(&self) -> &str {
        pid_of(&self.origin)
    }
}

/// FEI of child `index` under `parent`.
pub fn child_fei(parent: &str, index: usize) -> Fei {
    format!("{parent}_{index}")
}

/// Instance pid a FEI belongs to (the text before the first `_`).
pub fn pid_of(fei: &str) -> &str {
    fei.split('_').next().unwrap_or(fei)
}

/// True iff `target` addresses `id` itself or a node below it.
pub fn in_subtree(target: &str, id: &str) -> bool {
    target == id
        || (target.len() > id.len()
            && target.starts_with(id)
            && target.as_bytes()[id.len()] == b'_')
}
