//! Self-driving condition step.
//!
//! Evaluates the `condition` setting against the item as soon as it arrives
//! and forwards it along the true or false edge without human interaction.
//!
//! # Expressions
//!
//! ```text
//! attr:<key>=<value>     item attribute equals value
//! type=<a;b>             item type is one of the list
//! schema=<a;b>           item `schema` attribute is one of the list
//! hasfile                item has at least one file
//! hasfile:<filetype>     item has a file of that type
//! hasfile:<name.ext>     item has a file with that name
//! ```
//!
//! Expressions are parsed when the workflow is loaded; a malformed one
//! rejects the whole definition.

use std::fmt;

use log::debug;

use crate::execution::behavior::{BehaviorError, StepBehavior, StepContext};
use crate::store::Node;
use crate::workflow::Step;

/// Which files satisfy a `hasfile` test.
#[derive(Debug, Clone, PartialEq)]
pub enum FileMatch {
    Any,
    Type(String),
    Name(String),
}

/// A parsed condition expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Attribute { key: String, value: String },
    NodeType(Vec<String>),
    Schema(Vec<String>),
    HasFile(FileMatch),
}

fn split_list(list: &str) -> Vec<String> {
    list.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl Condition {
    pub fn parse(expression: &str) -> Result<Self, String> {
        let expression = expression.trim();

        if let Some(rest) = expression.strip_prefix("attr:") {
            return match rest.split_once('=') {
                Some((key, value)) if !key.trim().is_empty() => Ok(Condition::Attribute {
                    key: key.trim().to_string(),
                    value: value.trim().to_string(),
                }),
                _ => Err(format!("expected 'attr:<key>=<value>', got '{}'", expression)),
            };
        }

        if expression == "hasfile" {
            return Ok(Condition::HasFile(FileMatch::Any));
        }
        if let Some(rest) = expression.strip_prefix("hasfile:") {
            let rest = rest.trim();
            if rest.is_empty() {
                return Err("'hasfile:' needs a file type or file name".to_string());
            }
            return Ok(Condition::HasFile(if rest.contains('.') {
                FileMatch::Name(rest.to_string())
            } else {
                FileMatch::Type(rest.to_string())
            }));
        }

        for (prefix, build) in [
            ("type=", Condition::NodeType as fn(Vec<String>) -> Condition),
            ("schema=", Condition::Schema),
        ] {
            if let Some(rest) = expression.strip_prefix(prefix) {
                let list = split_list(rest);
                if list.is_empty() {
                    return Err(format!("'{}' needs at least one value", prefix));
                }
                return Ok(build(list));
            }
        }

        Err(format!("unrecognized condition '{}'", expression))
    }

    pub fn evaluate(&self, item: &Node) -> bool {
        match self {
            Condition::Attribute { key, value } => item.get(key) == value,
            Condition::NodeType(types) => types.iter().any(|t| {
                item.node_type == *t
                    || item
                        .node_type
                        .split_once('/')
                        .is_some_and(|(base, _)| base == t)
            }),
            Condition::Schema(schemas) => {
                let schema = item.get("schema");
                schemas.iter().any(|s| s == schema)
            }
            Condition::HasFile(FileMatch::Any) => !item.files.is_empty(),
            Condition::HasFile(FileMatch::Type(file_type)) => {
                item.files.iter().any(|f| f.file_type == *file_type)
            }
            Condition::HasFile(FileMatch::Name(name)) => item.files.iter().any(|f| f.name == *name),
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Attribute { key, value } => write!(f, "attr:{}={}", key, value),
            Condition::NodeType(types) => write!(f, "type={}", types.join(";")),
            Condition::Schema(schemas) => write!(f, "schema={}", schemas.join(";")),
            Condition::HasFile(FileMatch::Any) => write!(f, "hasfile"),
            Condition::HasFile(FileMatch::Type(t)) => write!(f, "hasfile:{}", t),
            Condition::HasFile(FileMatch::Name(n)) => write!(f, "hasfile:{}", n),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConditionStep {
    pub condition: Condition,
}

impl ConditionStep {
    pub fn from_step(step: &Step) -> Result<Self, String> {
        Ok(Self {
            condition: Condition::parse(step.setting("condition"))?,
        })
    }
}

impl StepBehavior for ConditionStep {
    fn run_action(&self, ctx: &mut StepContext<'_>, _outcome: bool) -> Result<(), BehaviorError> {
        let item = ctx.item_node()?;
        let result = self.condition.evaluate(&item);
        debug!(
            "Condition '{}' in step '{}' is {} for item {}",
            self.condition,
            ctx.step().name,
            result,
            item.id
        );
        ctx.forward(result)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FileAttachment;

    fn item() -> Node {
        let mut node = Node::new(1, "thesis", "document/diss");
        node.attributes.insert("status".to_string(), "ready".to_string());
        node.attributes.insert("schema".to_string(), "diss".to_string());
        node.files.push(FileAttachment::new("thesis.pdf", "document"));
        node
    }

    #[test]
    fn test_parse_expressions() {
        assert_eq!(
            Condition::parse("attr:status=ready").unwrap(),
            Condition::Attribute {
                key: "status".to_string(),
                value: "ready".to_string()
            }
        );
        assert_eq!(
            Condition::parse("type=document; image").unwrap(),
            Condition::NodeType(vec!["document".to_string(), "image".to_string()])
        );
        assert_eq!(
            Condition::parse("hasfile:thesis.pdf").unwrap(),
            Condition::HasFile(FileMatch::Name("thesis.pdf".to_string()))
        );
        assert_eq!(
            Condition::parse("hasfile:image").unwrap(),
            Condition::HasFile(FileMatch::Type("image".to_string()))
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Condition::parse("").is_err());
        assert!(Condition::parse("nonsense").is_err());
        assert!(Condition::parse("attr:=x").is_err());
        assert!(Condition::parse("type=").is_err());
        assert!(Condition::parse("hasfile:").is_err());
    }

    #[test]
    fn test_evaluate() {
        let item = item();
        let eval = |expr: &str| Condition::parse(expr).unwrap().evaluate(&item);

        assert!(eval("attr:status=ready"));
        assert!(!eval("attr:status=draft"));
        assert!(eval("type=image;document"));
        assert!(eval("type=document/diss"));
        assert!(!eval("type=image"));
        assert!(eval("schema=diss"));
        assert!(eval("hasfile"));
        assert!(eval("hasfile:document"));
        assert!(eval("hasfile:thesis.pdf"));
        assert!(!eval("hasfile:other.pdf"));
    }

    #[test]
    fn test_display_round_trips_through_parse() {
        let condition = Condition::parse("schema=a;b").unwrap();
        assert_eq!(condition.to_string(), "schema=a;b");
    }

    #[test]
    fn test_from_step_requires_condition() {
        assert!(ConditionStep::from_step(&Step::new("c", "condition")).is_err());
    }
}
