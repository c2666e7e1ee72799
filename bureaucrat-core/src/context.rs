use crate::xml::XmlElement;
use serde_json::{json, Map, Value};
use thiserror::Error;

/// Property holding the active fault of an aborting node.
pub const FAULT_KEY: &str = "inst:fault";

const RESERVED_KEYWORDS: &[&str] = &[FAULT_KEY];

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("no such property defined in the context chain: {0}")]
    NoSuchProperty(String),
    #[error("'{0}' is a reserved keyword")]
    Reserved(String),
    #[error("unknown property type in the definition: '{0}'")]
    UnknownType(String),
    #[error("invalid value for property '{key}': {message}")]
    BadValue { key: String, message: String },
}

/// Scoped property map owned by a complex flow expression.
///
/// Only the local properties live here; lookup through the parent chain is
/// done by the flow tree, which knows the ancestry (parents are FEI links,
/// not pointers). `declared` keeps the properties as written in the
/// definition so `foreach` can reset a scope between iterations.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Context {
    props: Map<String, Value>,
    declared: Map<String, Value>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a `<context>` element. Only `<property>` children contribute
    /// properties; anything else (e.g. `<faults>`) belongs to the builder.
    pub fn parse(element: &XmlElement) -> Result<Self, ContextError> {
        let mut declared = Map::new();
        for child in &element.children {
            if child.tag != "property" {
                continue;
            }
            let key = child.attrs.get("name").cloned().ok_or_else(|| {
                ContextError::BadValue {
                    key: String::new(),
                    message: "property without a name".to_string(),
                }
            })?;
            let proptype = child.attrs.get("type").cloned().unwrap_or_default();
            let text = child.text.as_str();
            let value = parse_typed(&key, &proptype, text)?;
            declared.insert(key, value);
        }
        Ok(Self {
            props: declared.clone(),
            declared,
        })
    }

    pub fn is_reserved(key: &str) -> bool {
        RESERVED_KEYWORDS.contains(&key)
    }

    pub fn has(&self, key: &str) -> bool {
        self.props.contains_key(key)
    }

    pub fn get_local(&self, key: &str) -> Option<&Value> {
        self.props.get(key)
    }

    pub fn set_local(&mut self, key: &str, value: Value) {
        self.props.insert(key.to_string(), value);
    }

    pub fn remove_local(&mut self, key: &str) {
        self.props.remove(key);
    }

    /// Record a fault in this scope.
    pub fn throw(&mut self, code: &str, message: &str) {
        self.props.insert(
            FAULT_KEY.to_string(),
            json!({ "code": code, "message": message }),
        );
    }

    /// The active fault, if any.
    pub fn fault(&self) -> Option<&Value> {
        self.props.get(FAULT_KEY)
    }

    pub fn fault_code(&self) -> Option<&str> {
        self.fault()?.get("code")?.as_str()
    }

    pub fn clear_fault(&mut self) {
        self.props.remove(FAULT_KEY);
    }

    /// Reset the scope to its declared properties.
    pub fn reset_declared(&mut self) {
        self.props = self.declared.clone();
    }

    pub fn localprops(&self) -> &Map<String, Value> {
        &self.props
    }

    /// Replace the local properties (snapshot restore).
    pub fn set_localprops(&mut self, props: Map<String, Value>) {
        self.props = props;
    }
}

fn parse_typed(key: &str, proptype: &str, text: &str) -> Result<Value, ContextError> {
    let bad = |message: String| ContextError::BadValue {
        key: key.to_string(),
        message,
    };
    match proptype {
        "int" => text
            .parse::<i64>()
            .map(Value::from)
            .map_err(|e| bad(e.to_string())),
        "float" => text
            .parse::<f64>()
            .map(Value::from)
            .map_err(|e| bad(e.to_string())),
        "str" => Ok(Value::from(text)),
        // Encoded as 0/1 in definitions.
        "bool" => text
            .parse::<i64>()
            .map(|n| Value::from(n != 0))
            .map_err(|e| bad(e.to_string())),
        "json" => serde_json::from_str(text).map_err(|e| bad(e.to_string())),
        other => Err(ContextError::UnknownType(other.to_string())),
    }
}
