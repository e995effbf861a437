//! Access Control Boundary
//!
//! The engine never decides on its own who may see or operate a node; it
//! asks an [`AccessGate`]. Two gates ship with the crate: [`OpenGate`] for
//! trusted callers (CLI, scheduler) and [`RulesetGate`], which evaluates the
//! ruleset strings stored on nodes.
//!
//! # Ruleset Syntax
//!
//! Rulesets are stored per capability in the node attribute
//! `access.<capability>` and consist of clauses separated by `,` or `;`:
//!
//! ```text
//! {user alice}, {group editors}; bob
//! ```
//!
//! A bare word matches either a user or a group name. An empty ruleset
//! grants access to everybody.

use std::fmt;

use crate::store::Node;

/// Kind of access requested on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Read,
    Write,
    Data,
}

impl Capability {
    pub const ALL: [Capability; 3] = [Capability::Read, Capability::Write, Capability::Data];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Data => "data",
        }
    }

    /// Attribute key holding the ruleset for this capability.
    pub fn attribute_key(&self) -> String {
        format!("access.{}", self.as_str())
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The user on whose behalf a request is made.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Actor {
    pub name: String,
    pub groups: Vec<String>,
    pub admin: bool,
}

impl Actor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            groups: Vec::new(),
            admin: false,
        }
    }

    /// An actor that passes every ruleset.
    pub fn administrator(name: impl Into<String>) -> Self {
        Self {
            admin: true,
            ..Self::new(name)
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.groups.push(group.into());
        self
    }
}

/// Answers "may this actor do this to this node?".
pub trait AccessGate: Send + Sync {
    fn has_access(&self, actor: &Actor, node: &Node, capability: Capability) -> bool;
}

/// Grants everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenGate;

impl AccessGate for OpenGate {
    fn has_access(&self, _actor: &Actor, _node: &Node, _capability: Capability) -> bool {
        true
    }
}

/// Evaluates the ruleset stored on the node itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct RulesetGate;

impl AccessGate for RulesetGate {
    fn has_access(&self, actor: &Actor, node: &Node, capability: Capability) -> bool {
        if actor.admin {
            return true;
        }
        ruleset_allows(node.get(&capability.attribute_key()), actor)
    }
}

/// Returns true if any clause of the ruleset matches the actor.
pub fn ruleset_allows(ruleset: &str, actor: &Actor) -> bool {
    let clauses: Vec<&str> = ruleset
        .split([',', ';'])
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .collect();

    if clauses.is_empty() {
        return true;
    }

    clauses.iter().any(|clause| clause_matches(clause, actor))
}

fn clause_matches(clause: &str, actor: &Actor) -> bool {
    let inner = clause
        .strip_prefix('{')
        .and_then(|c| c.strip_suffix('}'))
        .map(str::trim);

    match inner {
        Some(rule) => match rule.split_once(char::is_whitespace) {
            Some(("user", name)) => actor.name == name.trim(),
            Some(("group", name)) => actor.groups.iter().any(|g| g == name.trim()),
            _ => false,
        },
        None => actor.name == clause || actor.groups.iter().any(|g| g == clause),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node_with_rule(capability: Capability, rule: &str) -> Node {
        let mut node = Node::new(1, "review", "workflowstep");
        node.attributes
            .insert(capability.attribute_key(), rule.to_string());
        node
    }

    #[test]
    fn test_empty_ruleset_allows_everyone() {
        assert!(ruleset_allows("", &Actor::new("anyone")));
        assert!(ruleset_allows(" ; , ", &Actor::new("anyone")));
    }

    #[test]
    fn test_user_and_group_clauses() {
        let alice = Actor::new("alice");
        let editor = Actor::new("bob").with_group("editors");

        let rule = "{user alice}; {group editors}";
        assert!(ruleset_allows(rule, &alice));
        assert!(ruleset_allows(rule, &editor));
        assert!(!ruleset_allows(rule, &Actor::new("mallory")));
    }

    #[test]
    fn test_bare_word_matches_user_or_group() {
        assert!(ruleset_allows("alice", &Actor::new("alice")));
        assert!(ruleset_allows("staff", &Actor::new("x").with_group("staff")));
        assert!(!ruleset_allows("{unknown thing}", &Actor::new("thing")));
    }

    #[test]
    fn test_ruleset_gate_reads_capability_attribute() {
        let gate = RulesetGate;
        let node = node_with_rule(Capability::Write, "{user alice}");

        assert!(gate.has_access(&Actor::new("alice"), &node, Capability::Write));
        assert!(!gate.has_access(&Actor::new("bob"), &node, Capability::Write));
        // read has no ruleset set
        assert!(gate.has_access(&Actor::new("bob"), &node, Capability::Read));
    }

    #[test]
    fn test_admin_bypasses_rules() {
        let gate = RulesetGate;
        let node = node_with_rule(Capability::Data, "{user alice}");
        assert!(gate.has_access(&Actor::administrator("root"), &node, Capability::Data));
    }

    #[test]
    fn test_open_gate() {
        let node = node_with_rule(Capability::Write, "{user alice}");
        assert!(OpenGate.has_access(&Actor::new("bob"), &node, Capability::Write));
    }

    #[test]
    fn test_capability_keys() {
        assert_eq!(Capability::Read.attribute_key(), "access.read");
        assert_eq!(Capability::Data.to_string(), "data");
    }
}
