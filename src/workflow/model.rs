//! Workflow Data Model
//!
//! Core data structures describing a workflow graph: a named
//! [`WorkflowDefinition`] owning an ordered list of [`Step`]s, each with a
//! true and a false outgoing [`Edge`].
//!
//! # Example YAML Format
//!
//! ```yaml
//! name: submission
//! description: Submit, review and publish a document
//! steps:
//!   - name: start
//!     type: start
//!     on_true: { target: review, label: Submit }
//!
//!   - name: review
//!     type: wait
//!     on_true: { target: end, label: Accept }
//!     on_false:
//!       target: start
//!       label: Reject
//!       labels: { de: Ablehnen }
//!
//!   - name: end
//!     type: end
//!     settings:
//!       endremove: "1"
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::access::Capability;
use crate::error::{WorkflowError, WorkflowResult};
use crate::execution::registry::canonical_type_name;
use crate::store::NodeId;

use super::validator::ValidationError;

/// Node type of the top-level container of all workflows.
pub const WORKFLOWS_ROOT: &str = "workflows";

/// Node type of a workflow definition.
pub const WORKFLOW_NODE_TYPE: &str = "workflow";

/// Step type marking the entry of a workflow whose steps all have
/// incoming edges.
pub const START_STEP_TYPE: &str = "start";

/// Node type of a workflow step. Items contained by a node of this type are
/// in a workflow.
pub const STEP_NODE_TYPE: &str = "workflowstep";

/// One outgoing branch of a step.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Edge {
    /// Name of the target step; empty means no further transition
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target: String,

    /// Caption used when no localized caption matches
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub label: String,

    /// Localized captions (language -> caption)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl Edge {
    pub fn to(target: impl Into<String>) -> Self {
        Self {
            target: target.into().trim().to_string(),
            ..Self::default()
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_label_for(mut self, language: impl Into<String>, label: impl Into<String>) -> Self {
        self.labels.insert(language.into(), label.into());
        self
    }

    /// Returns the target step name, or `None` when the edge is unset.
    pub fn target(&self) -> Option<&str> {
        if self.target.is_empty() {
            None
        } else {
            Some(&self.target)
        }
    }

    /// Caption for a language, falling back to the default caption.
    ///
    /// An empty caption means the branch has no interactive button.
    pub fn label_for(&self, language: &str) -> &str {
        self.labels
            .get(language)
            .map(String::as_str)
            .unwrap_or(&self.label)
    }
}

/// Access rulesets per capability.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct AccessRules {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub read: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub write: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub data: String,
}

impl AccessRules {
    pub fn get(&self, capability: Capability) -> &str {
        match capability {
            Capability::Read => &self.read,
            Capability::Write => &self.write,
            Capability::Data => &self.data,
        }
    }

    pub fn set(&mut self, capability: Capability, ruleset: impl Into<String>) {
        let ruleset = ruleset.into();
        match capability {
            Capability::Read => self.read = ruleset,
            Capability::Write => self.write = ruleset,
            Capability::Data => self.data = ruleset,
        }
    }

    fn is_empty(&self) -> bool {
        self.read.is_empty() && self.write.is_empty() && self.data.is_empty()
    }
}

/// A single stage of a workflow.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Step {
    /// Unique name within the workflow
    pub name: String,

    /// Behavior type, resolved through the step registry
    #[serde(rename = "type")]
    pub step_type: String,

    #[serde(default, rename = "on_true", skip_serializing_if = "edge_is_unset")]
    pub true_edge: Edge,

    #[serde(default, rename = "on_false", skip_serializing_if = "edge_is_unset")]
    pub false_edge: Edge,

    /// Free-text note shown to administrators
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub comment: String,

    /// Who may interactively operate this step
    #[serde(default, skip_serializing_if = "AccessRules::is_empty")]
    pub access: AccessRules,

    /// Behavior-specific configuration, passed through unparsed
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub settings: BTreeMap<String, String>,

    /// Store node backing this step, once persisted
    #[serde(skip)]
    pub node: Option<NodeId>,
}

fn edge_is_unset(edge: &Edge) -> bool {
    *edge == Edge::default()
}

impl Step {
    /// Creates a step without outgoing edges.
    ///
    /// # Example
    ///
    /// ```
    /// use docflow::workflow::Step;
    ///
    /// let review = Step::new("review", "wait")
    ///     .with_true("end")
    ///     .with_false("start")
    ///     .with_setting("notify", "editors@example.org");
    /// assert_eq!(review.target_for(true), Some("end"));
    /// ```
    pub fn new(name: impl Into<String>, step_type: impl Into<String>) -> Self {
        Self {
            name: name.into().trim().to_string(),
            step_type: step_type.into().trim().to_string(),
            true_edge: Edge::default(),
            false_edge: Edge::default(),
            comment: String::new(),
            access: AccessRules::default(),
            settings: BTreeMap::new(),
            node: None,
        }
    }

    pub fn with_true(mut self, target: impl Into<String>) -> Self {
        self.true_edge.target = target.into().trim().to_string();
        self
    }

    pub fn with_false(mut self, target: impl Into<String>) -> Self {
        self.false_edge.target = target.into().trim().to_string();
        self
    }

    pub fn with_true_label(mut self, label: impl Into<String>) -> Self {
        self.true_edge.label = label.into();
        self
    }

    pub fn with_false_label(mut self, label: impl Into<String>) -> Self {
        self.false_edge.label = label.into();
        self
    }

    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }

    pub fn edge(&self, outcome: bool) -> &Edge {
        if outcome {
            &self.true_edge
        } else {
            &self.false_edge
        }
    }

    pub fn edge_mut(&mut self, outcome: bool) -> &mut Edge {
        if outcome {
            &mut self.true_edge
        } else {
            &mut self.false_edge
        }
    }

    /// Target step name for an outcome, if the branch is set.
    pub fn target_for(&self, outcome: bool) -> Option<&str> {
        self.edge(outcome).target()
    }

    /// Returns a behavior setting, or an empty string.
    pub fn setting(&self, key: &str) -> &str {
        self.settings.get(key).map(String::as_str).unwrap_or("")
    }

    /// Names of steps this step transitions to, excluding itself.
    pub fn successors(&self) -> Vec<&str> {
        let mut result = Vec::new();
        for target in [self.target_for(true), self.target_for(false)]
            .into_iter()
            .flatten()
        {
            if target != self.name && !result.contains(&target) {
                result.push(target);
            }
        }
        result
    }

    /// True if the step has no transition leading anywhere but itself.
    pub fn is_terminal(&self) -> bool {
        self.successors().is_empty()
    }

    fn points_to(&self, name: &str) -> bool {
        self.target_for(true) == Some(name) || self.target_for(false) == Some(name)
    }
}

/// A named graph of steps.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkflowDefinition {
    /// Unique name within the system
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(default, skip_serializing_if = "AccessRules::is_empty")]
    pub access: AccessRules,

    /// Ordered list of steps
    #[serde(default)]
    pub steps: Vec<Step>,

    /// Store node backing this workflow, once persisted
    #[serde(skip)]
    pub node: Option<NodeId>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into().trim().to_string(),
            description: String::new(),
            access: AccessRules::default(),
            steps: Vec::new(),
            node: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Appends a step without checking for duplicates; used to assemble
    /// definitions that are validated afterwards.
    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Adds a step, rejecting duplicate names.
    pub fn add_step(&mut self, step: Step) -> WorkflowResult<()> {
        if step.name.is_empty() {
            return Err(ValidationError::EmptyStepName.into());
        }
        if self.get_step(&step.name).is_some() {
            return Err(WorkflowError::DuplicateStepName {
                workflow: self.name.clone(),
                step: step.name,
            });
        }
        self.steps.push(step);
        Ok(())
    }

    pub fn get_step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn get_step_mut(&mut self, name: &str) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.name == name)
    }

    /// Looks up a step, failing with [`WorkflowError::UnknownStep`].
    pub fn step(&self, name: &str) -> WorkflowResult<&Step> {
        self.get_step(name).ok_or_else(|| self.unknown_step(name))
    }

    /// Returns the step backed by the given store node.
    pub fn step_by_node(&self, node: NodeId) -> Option<&Step> {
        self.steps.iter().find(|s| s.node == Some(node))
    }

    /// Steps with no incoming edge from any other step.
    pub fn start_candidates(&self) -> Vec<&Step> {
        self.steps
            .iter()
            .filter(|step| self.referrers(&step.name).is_empty())
            .collect()
    }

    /// Returns the unique start step.
    ///
    /// This is the one step without incoming edges. When every step has an
    /// incoming edge (a rejection loop back to the entry), the single step
    /// of type `start` is the entry instead.
    pub fn start_step(&self) -> Result<&Step, ValidationError> {
        let candidates = self.start_candidates();
        match candidates.as_slice() {
            [start] => Ok(start),
            [] => {
                let mut typed = self
                    .steps
                    .iter()
                    .filter(|s| canonical_type_name(&s.step_type) == START_STEP_TYPE);
                match (typed.next(), typed.next()) {
                    (Some(start), None) => Ok(start),
                    _ => Err(ValidationError::NoStartStep),
                }
            }
            many => Err(ValidationError::MultipleStartSteps(
                many.iter().map(|s| s.name.clone()).collect(),
            )),
        }
    }

    /// Names of the other steps whose edges point at `name`.
    pub fn referrers(&self, name: &str) -> Vec<String> {
        self.steps
            .iter()
            .filter(|s| s.name != name && s.points_to(name))
            .map(|s| s.name.clone())
            .collect()
    }

    /// Renames a step and rewrites every edge that referenced the old name.
    pub fn rename_step(&mut self, old_name: &str, new_name: &str) -> WorkflowResult<()> {
        let new_name = new_name.trim();
        if new_name.is_empty() {
            return Err(ValidationError::EmptyStepName.into());
        }
        if old_name == new_name {
            return self.step(old_name).map(|_| ());
        }
        if self.get_step(new_name).is_some() {
            return Err(WorkflowError::DuplicateStepName {
                workflow: self.name.clone(),
                step: new_name.to_string(),
            });
        }

        let missing = self.unknown_step(old_name);
        let step = self.get_step_mut(old_name).ok_or(missing)?;
        step.name = new_name.to_string();

        for step in &mut self.steps {
            for outcome in [true, false] {
                let edge = step.edge_mut(outcome);
                if edge.target == old_name {
                    edge.target = new_name.to_string();
                }
            }
        }
        Ok(())
    }

    /// Points a step's edges at new targets. Empty strings clear an edge.
    pub fn set_targets(
        &mut self,
        name: &str,
        true_target: &str,
        false_target: &str,
    ) -> WorkflowResult<()> {
        for target in [true_target.trim(), false_target.trim()] {
            if !target.is_empty() && target != name && self.get_step(target).is_none() {
                return Err(self.unknown_step(target));
            }
        }

        let missing = self.unknown_step(name);
        let step = self.get_step_mut(name).ok_or(missing)?;
        step.true_edge.target = true_target.trim().to_string();
        step.false_edge.target = false_target.trim().to_string();
        Ok(())
    }

    /// Removes a step that no other step transitions to.
    pub fn remove_step(&mut self, name: &str) -> WorkflowResult<Step> {
        let index = self
            .steps
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| self.unknown_step(name))?;

        let referenced_by = self.referrers(name);
        if !referenced_by.is_empty() {
            return Err(WorkflowError::DanglingReference {
                step: name.to_string(),
                referenced_by,
            });
        }

        Ok(self.steps.remove(index))
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    fn unknown_step(&self, name: &str) -> WorkflowError {
        WorkflowError::UnknownStep {
            workflow: self.name.clone(),
            step: name.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// start -> review -> end, review -false-> start
    fn submission() -> WorkflowDefinition {
        WorkflowDefinition::new("submission")
            .with_step(Step::new("start", "start").with_true("review"))
            .with_step(
                Step::new("review", "wait")
                    .with_true("end")
                    .with_false("start"),
            )
            .with_step(Step::new("end", "end"))
    }

    #[test]
    fn test_step_builder() {
        let step = Step::new(" review ", "wait")
            .with_true("end")
            .with_true_label("Accept")
            .with_false("start")
            .with_setting("notify", "yes")
            .with_comment("editor review");

        assert_eq!(step.name, "review");
        assert_eq!(step.target_for(true), Some("end"));
        assert_eq!(step.target_for(false), Some("start"));
        assert_eq!(step.true_edge.label, "Accept");
        assert_eq!(step.setting("notify"), "yes");
        assert_eq!(step.setting("missing"), "");
    }

    #[test]
    fn test_edge_label_fallback() {
        let edge = Edge::to("end")
            .with_label("Accept")
            .with_label_for("de", "Annehmen");

        assert_eq!(edge.label_for("de"), "Annehmen");
        assert_eq!(edge.label_for("fr"), "Accept");
        assert_eq!(Edge::default().label_for("en"), "");
        assert_eq!(Edge::default().target(), None);
    }

    #[test]
    fn test_self_loop_is_terminal() {
        let step = Step::new("hold", "wait").with_true("hold").with_false("hold");
        assert!(step.is_terminal());
        assert!(step.successors().is_empty());
    }

    #[test]
    fn test_successors_deduplicated() {
        let step = Step::new("a", "wait").with_true("b").with_false("b");
        assert_eq!(step.successors(), vec!["b"]);
    }

    #[test]
    fn test_add_step_rejects_duplicate() {
        let mut workflow = submission();
        let result = workflow.add_step(Step::new("review", "wait"));
        assert!(matches!(result, Err(WorkflowError::DuplicateStepName { .. })));
        assert_eq!(workflow.len(), 3);
    }

    #[test]
    fn test_start_step_unique() {
        let workflow = WorkflowDefinition::new("linear")
            .with_step(Step::new("draft", "wait").with_true("done"))
            .with_step(Step::new("done", "end"));
        assert_eq!(workflow.start_step().unwrap().name, "draft");
    }

    #[test]
    fn test_start_step_ignores_self_edges() {
        let workflow = WorkflowDefinition::new("single")
            .with_step(Step::new("only", "wait").with_true("only").with_false("only"));
        assert_eq!(workflow.start_step().unwrap().name, "only");
    }

    #[test]
    fn test_start_step_falls_back_to_start_type() {
        // review -false-> start gives start an incoming edge
        let workflow = submission();
        assert!(workflow.start_candidates().is_empty());
        assert_eq!(workflow.start_step().unwrap().name, "start");
    }

    #[test]
    fn test_start_step_fully_cyclic() {
        let workflow = WorkflowDefinition::new("loop")
            .with_step(Step::new("a", "wait").with_true("b"))
            .with_step(Step::new("b", "wait").with_true("a"));
        assert!(matches!(workflow.start_step(), Err(ValidationError::NoStartStep)));
    }

    #[test]
    fn test_start_step_ambiguous() {
        let workflow = WorkflowDefinition::new("two")
            .with_step(Step::new("a", "wait"))
            .with_step(Step::new("b", "wait"));
        assert!(matches!(
            workflow.start_step(),
            Err(ValidationError::MultipleStartSteps(names)) if names == vec!["a", "b"]
        ));
    }

    #[test]
    fn test_rename_rewrites_all_references() {
        let mut workflow = submission()
            .with_step(Step::new("fix", "wait").with_true("start").with_false("start"));

        workflow.rename_step("start", "draft").unwrap();

        assert!(workflow.get_step("start").is_none());
        assert!(workflow.get_step("draft").is_some());
        assert_eq!(workflow.get_step("review").unwrap().target_for(false), Some("draft"));
        let fix = workflow.get_step("fix").unwrap();
        assert_eq!(fix.target_for(true), Some("draft"));
        assert_eq!(fix.target_for(false), Some("draft"));
        assert!(workflow
            .steps
            .iter()
            .all(|s| s.target_for(true) != Some("start") && s.target_for(false) != Some("start")));
    }

    #[test]
    fn test_rename_rewrites_self_reference() {
        let mut workflow = WorkflowDefinition::new("single")
            .with_step(Step::new("hold", "wait").with_true("hold"));
        workflow.rename_step("hold", "pause").unwrap();
        assert_eq!(workflow.steps[0].target_for(true), Some("pause"));
    }

    #[test]
    fn test_rename_to_existing_name_rejected() {
        let mut workflow = submission();
        let result = workflow.rename_step("start", "review");
        assert!(matches!(result, Err(WorkflowError::DuplicateStepName { .. })));
    }

    #[test]
    fn test_rename_unknown_step() {
        let mut workflow = submission();
        let result = workflow.rename_step("ghost", "spirit");
        assert!(matches!(result, Err(WorkflowError::UnknownStep { .. })));
    }

    #[test]
    fn test_remove_referenced_step_rejected() {
        let mut workflow = submission();
        let result = workflow.remove_step("review");
        match result {
            Err(WorkflowError::DanglingReference { step, referenced_by }) => {
                assert_eq!(step, "review");
                assert_eq!(referenced_by, vec!["start"]);
            }
            other => panic!("expected dangling reference, got {:?}", other),
        }
        assert_eq!(workflow.len(), 3);
    }

    #[test]
    fn test_remove_unreferenced_terminal_step() {
        let mut workflow = submission();
        workflow.set_targets("review", "", "start").unwrap();

        let removed = workflow.remove_step("end").unwrap();
        assert_eq!(removed.name, "end");
        assert!(workflow.get_step("end").is_none());
        assert!(workflow.referrers("end").is_empty());
    }

    #[test]
    fn test_set_targets_rejects_unknown() {
        let mut workflow = submission();
        let result = workflow.set_targets("start", "nowhere", "");
        assert!(matches!(result, Err(WorkflowError::UnknownStep { step, .. }) if step == "nowhere"));
        assert_eq!(workflow.get_step("start").unwrap().target_for(true), Some("review"));
    }

    #[test]
    fn test_access_rules() {
        let mut rules = AccessRules::default();
        rules.set(Capability::Write, "{group editors}");
        assert_eq!(rules.get(Capability::Write), "{group editors}");
        assert_eq!(rules.get(Capability::Read), "");
    }

    #[test]
    fn test_yaml_format() {
        let yaml = r#"
name: submission
steps:
  - name: start
    type: start
    on_true: { target: review, label: Submit }
  - name: review
    type: wait
    on_false:
      target: start
      labels: { de: Ablehnen }
"#;
        let workflow: WorkflowDefinition = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(workflow.len(), 2);
        assert_eq!(workflow.steps[0].true_edge.label, "Submit");
        assert_eq!(workflow.steps[1].false_edge.label_for("de"), "Ablehnen");
        assert_eq!(workflow.steps[1].target_for(true), None);
    }
}
