use super::{FlowNode, FlowTree, Kind, State};
use crate::context::{Context, ContextError};
use crate::expr::{Expr, ExprError};
use crate::message::{child_fei, Fei};
use crate::xml::XmlElement;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("root element must be <process>, got <{0}>")]
    NotAProcess(String),
    #[error("unknown tag <{tag}> inside <{parent}>")]
    UnknownTag { tag: String, parent: String },
    #[error("<{tag}> is a disallowed child of <{parent}>")]
    DisallowedChild { tag: String, parent: String },
    #[error("<{tag}> is missing attribute '{attr}'")]
    MissingAttribute { tag: String, attr: String },
    #[error("bad attribute '{attr}' on <{tag}>: {message}")]
    BadAttribute {
        tag: String,
        attr: String,
        message: String,
    },
    #[error("bad expression in <{tag}>: {source}")]
    BadExpression { tag: String, source: ExprError },
    #[error("<while> must contain at least one activity")]
    EmptyWhile,
    #[error(transparent)]
    Context(#[from] ContextError),
}

const ACTIVITY_TAGS: &[&str] = &[
    "action", "sequence", "switch", "while", "all", "call", "delay", "await", "foreach",
    "assign", "fault",
];

/// Inner elements that configure the enclosing node instead of becoming
/// numbered children.
const INNER_TAGS: &[&str] = &["condition", "context", "faults", "case", "default", "property"];

fn allowed_children(tag: &str) -> &'static [&'static str] {
    match tag {
        "process" | "sequence" | "while" | "all" | "foreach" | "case" | "default" => ACTIVITY_TAGS,
        "switch" => &["case"],
        _ => &[],
    }
}

fn allows_condition(tag: &str) -> bool {
    matches!(tag, "case" | "while" | "await")
}

fn is_complex(tag: &str) -> bool {
    matches!(
        tag,
        "process" | "sequence" | "switch" | "case" | "while" | "foreach" | "all"
    )
}

fn is_known(tag: &str) -> bool {
    ACTIVITY_TAGS.contains(&tag) || INNER_TAGS.contains(&tag)
}

fn require_attr<'a>(element: &'a XmlElement, attr: &str) -> Result<&'a str, BuildError> {
    element.attr(attr).ok_or_else(|| BuildError::MissingAttribute {
        tag: element.tag.clone(),
        attr: attr.to_string(),
    })
}

fn parse_expr(element_tag: &str, text: &str) -> Result<Expr, BuildError> {
    Expr::parse(text).map_err(|source| BuildError::BadExpression {
        tag: element_tag.to_string(),
        source,
    })
}

impl FlowTree {
    /// Build an instance tree from a parsed `<process>` definition,
    /// assigning FEIs by position under `pid`.
    pub fn build(root: &XmlElement, pid: &str) -> Result<Self, BuildError> {
        if root.tag != "process" {
            return Err(BuildError::NotAProcess(root.tag.clone()));
        }
        let parent_id = root.attr("parent").unwrap_or("").to_string();
        let mut nodes = BTreeMap::new();
        build_activity(&mut nodes, &parent_id, root, pid)?;
        Ok(FlowTree::from_parts(pid.to_string(), nodes))
    }
}

fn build_activity(
    nodes: &mut BTreeMap<Fei, FlowNode>,
    parent_id: &str,
    element: &XmlElement,
    fei: &str,
) -> Result<(), BuildError> {
    let tag = element.tag.as_str();
    let mut children = Vec::new();
    let mut conditions = Vec::new();
    let mut context: Option<Context> = None;
    let mut faults_element: Option<&XmlElement> = None;

    let mut index = 0;
    for child in &element.children {
        let child_tag = child.tag.as_str();
        if allowed_children(tag).contains(&child_tag) {
            let id = child_fei(fei, index);
            build_activity(nodes, fei, child, &id)?;
            children.push(id);
            index += 1;
        } else if child_tag == "condition" && allows_condition(tag) {
            conditions.push(parse_expr(tag, &child.text)?);
        } else if child_tag == "context" && is_complex(tag) {
            context = Some(Context::parse(child)?);
            // The original schema also nests <faults> inside <context>.
            if let Some(nested) = child.children.iter().find(|c| c.tag == "faults") {
                faults_element = Some(nested);
            }
        } else if child_tag == "faults" && is_complex(tag) {
            faults_element = Some(child);
        } else if is_known(child_tag) {
            return Err(BuildError::DisallowedChild {
                tag: child_tag.to_string(),
                parent: tag.to_string(),
            });
        } else {
            return Err(BuildError::UnknownTag {
                tag: child_tag.to_string(),
                parent: tag.to_string(),
            });
        }
    }

    let kind = make_kind(element, conditions)?;
    if matches!(kind, Kind::While { .. }) && children.is_empty() {
        return Err(BuildError::EmptyWhile);
    }

    let faults = match faults_element {
        Some(faults) => Some(build_faults(nodes, fei, faults)?),
        None => None,
    };

    nodes.insert(
        fei.to_string(),
        FlowNode {
            id: fei.to_string(),
            parent_id: parent_id.to_string(),
            state: State::Ready,
            kind,
            children,
            context: if is_complex(tag) {
                Some(context.unwrap_or_default())
            } else {
                None
            },
            faults,
        },
    );
    Ok(())
}

fn make_kind(element: &XmlElement, conditions: Vec<Expr>) -> Result<Kind, BuildError> {
    let tag = element.tag.as_str();
    let kind = match tag {
        "process" => Kind::Process,
        "sequence" => Kind::Sequence,
        "all" => Kind::All,
        "switch" => Kind::Switch,
        "case" => Kind::Case { conditions },
        "while" => Kind::While { conditions },
        "foreach" => Kind::Foreach {
            select: parse_expr(tag, require_attr(element, "select")?)?,
        },
        "action" => Kind::Action {
            participant: require_attr(element, "participant")?.to_string(),
        },
        "delay" => {
            let duration = require_attr(element, "duration")?;
            Kind::Delay {
                duration: duration.parse().map_err(|_| BuildError::BadAttribute {
                    tag: tag.to_string(),
                    attr: "duration".to_string(),
                    message: format!("not a number of seconds: {duration:?}"),
                })?,
            }
        }
        "await" => Kind::Await {
            event: require_attr(element, "event")?.to_string(),
            conditions,
        },
        "call" => {
            let process = require_attr(element, "process")?;
            if !process.starts_with('$') {
                return Err(BuildError::BadAttribute {
                    tag: tag.to_string(),
                    attr: "process".to_string(),
                    message: "only $property references are supported".to_string(),
                });
            }
            Kind::Call {
                process: process.to_string(),
            }
        }
        "assign" => Kind::Assign {
            property: require_attr(element, "property")?.to_string(),
            expr: parse_expr(tag, &element.text)?,
        },
        "fault" => Kind::Fault {
            code: element.attr("code").unwrap_or("terminate").to_string(),
            message: element.attr("message").unwrap_or("").to_string(),
        },
        other => {
            return Err(BuildError::UnknownTag {
                tag: other.to_string(),
                parent: String::new(),
            })
        }
    };
    Ok(kind)
}

/// Build the fault-handler container (`{owner}_faults`) and its cases.
fn build_faults(
    nodes: &mut BTreeMap<Fei, FlowNode>,
    owner_fei: &str,
    element: &XmlElement,
) -> Result<Fei, BuildError> {
    let fei = format!("{owner_fei}_faults");
    let mut children = Vec::new();

    for (index, child) in element.children.iter().enumerate() {
        let id = child_fei(&fei, index);
        match child.tag.as_str() {
            "case" => {
                let codes = require_attr(child, "code")?
                    .split(',')
                    .map(|code| code.trim().to_string())
                    .filter(|code| !code.is_empty())
                    .collect();
                build_fault_case(nodes, &fei, child, &id, codes, false)?;
            }
            "default" => build_fault_case(nodes, &fei, child, &id, Vec::new(), true)?,
            other => {
                return Err(BuildError::DisallowedChild {
                    tag: other.to_string(),
                    parent: "faults".to_string(),
                })
            }
        }
        children.push(id);
    }

    nodes.insert(
        fei.clone(),
        FlowNode {
            id: fei.clone(),
            parent_id: owner_fei.to_string(),
            state: State::Ready,
            kind: Kind::FaultHandlers,
            children,
            context: None,
            faults: None,
        },
    );
    Ok(fei)
}

fn build_fault_case(
    nodes: &mut BTreeMap<Fei, FlowNode>,
    parent_id: &str,
    element: &XmlElement,
    fei: &str,
    codes: Vec<String>,
    default: bool,
) -> Result<(), BuildError> {
    let mut children = Vec::new();
    let mut context: Option<Context> = None;

    let mut index = 0;
    for child in &element.children {
        let child_tag = child.tag.as_str();
        if ACTIVITY_TAGS.contains(&child_tag) {
            let id = child_fei(fei, index);
            build_activity(nodes, fei, child, &id)?;
            children.push(id);
            index += 1;
        } else if child_tag == "context" {
            context = Some(Context::parse(child)?);
        } else if is_known(child_tag) {
            return Err(BuildError::DisallowedChild {
                tag: child_tag.to_string(),
                parent: element.tag.clone(),
            });
        } else {
            return Err(BuildError::UnknownTag {
                tag: child_tag.to_string(),
                parent: element.tag.clone(),
            });
        }
    }

    nodes.insert(
        fei.to_string(),
        FlowNode {
            id: fei.to_string(),
            parent_id: parent_id.to_string(),
            state: State::Ready,
            kind: Kind::FaultCase { codes, default },
            children,
            context: Some(context.unwrap_or_default()),
            faults: None,
        },
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(xml: &str) -> Result<FlowTree, BuildError> {
        FlowTree::build(&XmlElement::parse(xml).unwrap(), "fake-id")
    }

    #[test]
    fn test_feis_are_positional() {
        let tree = build(
            r#"<process>
                 <sequence>
                   <action participant="p1"/>
                   <all>
                     <action participant="p2"/>
                     <action participant="p3"/>
                   </all>
                 </sequence>
               </process>"#,
        )
        .unwrap();

        let root = tree.root();
        assert_eq!(root.id, "fake-id");
        assert_eq!(root.children, vec!["fake-id_0"]);
        let all = tree.node("fake-id_0_1").unwrap();
        assert_eq!(all.parent_id, "fake-id_0");
        assert_eq!(all.children, vec!["fake-id_0_1_0", "fake-id_0_1_1"]);
    }

    #[test]
    fn test_inner_elements_are_not_numbered() {
        let tree = build(
            r#"<process>
                 <context><property name="x" type="int">1</property></context>
                 <while>
                   <condition>context["x"] == 1</condition>
                   <action participant="p"/>
                 </while>
               </process>"#,
        )
        .unwrap();
        // The while is child 0 despite the preceding context element, and
        // its action is child 0 despite the condition.
        let whl = tree.node("fake-id_0").unwrap();
        assert_eq!(whl.children, vec!["fake-id_0_0"]);
        assert!(matches!(
            &tree.node("fake-id_0_0").unwrap().kind,
            Kind::Action { participant } if participant == "p"
        ));
    }

    #[test]
    fn test_unknown_tag_is_rejected() {
        let err = build("<process><wibble/></process>").unwrap_err();
        assert!(matches!(err, BuildError::UnknownTag { .. }));
    }

    #[test]
    fn test_case_outside_switch_is_rejected() {
        let err = build("<process><sequence><case/></sequence></process>").unwrap_err();
        assert!(matches!(err, BuildError::DisallowedChild { .. }));
    }

    #[test]
    fn test_switch_accepts_only_cases() {
        let err = build("<process><switch><action participant=\"p\"/></switch></process>")
            .unwrap_err();
        assert!(matches!(err, BuildError::DisallowedChild { .. }));
    }

    #[test]
    fn test_missing_attribute_is_rejected() {
        let err = build("<process><action/></process>").unwrap_err();
        assert!(matches!(
            err,
            BuildError::MissingAttribute { attr, .. } if attr == "participant"
        ));
    }

    #[test]
    fn test_bad_condition_is_rejected_at_build_time() {
        let err = build(
            "<process><while><condition>1 +</condition><action participant=\"p\"/></while></process>",
        )
        .unwrap_err();
        assert!(matches!(err, BuildError::BadExpression { .. }));
    }

    #[test]
    fn test_empty_while_is_rejected() {
        let err =
            build("<process><while><condition>True</condition></while></process>").unwrap_err();
        assert!(matches!(err, BuildError::EmptyWhile));
    }

    #[test]
    fn test_call_requires_property_reference() {
        let err = build("<process><call process=\"inline\"/></process>").unwrap_err();
        assert!(matches!(err, BuildError::BadAttribute { .. }));
    }

    #[test]
    fn test_faults_inside_context() {
        let tree = build(
            r#"<process>
                 <sequence>
                   <action participant="p1"/>
                   <context>
                     <faults>
                       <case code="UnknownError"><action participant="h1"/></case>
                       <default><action participant="h2"/></default>
                       <case code="GenericError, TestError"><action participant="h3"/></case>
                     </faults>
                   </context>
                 </sequence>
               </process>"#,
        )
        .unwrap();

        let seq = tree.node("fake-id_0").unwrap();
        assert_eq!(seq.faults.as_deref(), Some("fake-id_0_faults"));
        let container = tree.node("fake-id_0_faults").unwrap();
        assert!(matches!(container.kind, Kind::FaultHandlers));
        assert_eq!(
            container.children,
            vec![
                "fake-id_0_faults_0",
                "fake-id_0_faults_1",
                "fake-id_0_faults_2"
            ]
        );
        assert!(matches!(
            &tree.node("fake-id_0_faults_1").unwrap().kind,
            Kind::FaultCase { default: true, .. }
        ));
        assert!(matches!(
            &tree.node("fake-id_0_faults_2").unwrap().kind,
            Kind::FaultCase { codes, default: false } if codes == &["GenericError", "TestError"]
        ));
        // Handler bodies are numbered under their case.
        assert!(tree.node("fake-id_0_faults_2_0").is_some());
    }

    #[test]
    fn test_faults_as_direct_child() {
        let tree = build(
            r#"<process>
                 <sequence>
                   <faults><default><action participant="h"/></default></faults>
                   <action participant="p"/>
                 </sequence>
               </process>"#,
        )
        .unwrap();
        let seq = tree.node("fake-id_0").unwrap();
        assert_eq!(seq.faults.as_deref(), Some("fake-id_0_faults"));
        // The faults element is not numbered: the action is child 0.
        assert_eq!(seq.children, vec!["fake-id_0_0"]);
    }

    #[test]
    fn test_sub_process_parent_attribute() {
        let tree = FlowTree::build(
            &XmlElement::parse(r#"<process parent="caller_0"><action participant="p"/></process>"#)
                .unwrap(),
            "sub-id",
        )
        .unwrap();
        assert_eq!(tree.root().parent_id, "caller_0");
    }
}
