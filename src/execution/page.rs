//! Rendering boundary data.
//!
//! The engine never produces markup. Behaviors return a [`Page`] describing
//! what the web layer should show; turning it into HTML is the caller's job.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::store::NodeId;

/// Request parameters that trigger a transition instead of a render.
pub const ACTION_PARAMS: [&str; 4] = ["gotrue", "gofalse", "forcetrue", "forcefalse"];

/// An interactive request as seen by the engine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Request {
    pub params: BTreeMap<String, String>,
    /// Preferred language for captions
    pub language: String,
    /// Item access key presented by the caller
    pub key: Option<String>,
}

impl Request {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn has_param(&self, name: &str) -> bool {
        self.params.contains_key(name)
    }

    /// Copy of the request without transition parameters, used to render
    /// the step an item landed in after a submitted action.
    pub fn without_actions(&self) -> Self {
        let mut request = self.clone();
        request
            .params
            .retain(|name, _| !ACTION_PARAMS.contains(&name.as_str()));
        request
    }
}

/// A button offered for one outgoing branch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Action {
    pub outcome: bool,
    pub label: String,
    /// Request parameter submitting this action
    pub param: String,
}

impl Action {
    pub fn new(outcome: bool, label: impl Into<String>) -> Self {
        Self {
            outcome,
            label: label.into(),
            param: if outcome { "gotrue" } else { "gofalse" }.to_string(),
        }
    }
}

/// Default view of an item sitting in a step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepView {
    pub workflow: String,
    pub step: String,
    pub step_type: String,
    pub item: NodeId,
    pub item_name: String,
    /// Only branches with a caption. An uncaptioned branch is taken only when
    /// the step's behavior forwards the item itself, or through `forcetrue`/`forcefalse`
    pub actions: Vec<Action>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, String>,
}

/// What the web layer should display.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Page {
    Step(StepView),
    /// Free text produced by a behavior
    Text { item: NodeId, text: String },
    /// The item left workflow containment
    Finished {
        item: NodeId,
        workflow: String,
        step: String,
    },
    /// The item sits in a different step than the one requested
    Redirect { step: NodeId, item: NodeId },
    NotInWorkflow { item: NodeId },
    PermissionDenied,
    Error { message: String },
}

impl Page {
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Page::Error { .. } | Page::PermissionDenied | Page::NotInWorkflow { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_without_actions_strips_transition_params() {
        let request = Request::new()
            .with_param("gotrue", "1")
            .with_param("forcefalse", "1")
            .with_param("comment", "looks good")
            .with_language("de");

        let stripped = request.without_actions();
        assert!(!stripped.has_param("gotrue"));
        assert!(!stripped.has_param("forcefalse"));
        assert_eq!(stripped.param("comment"), Some("looks good"));
        assert_eq!(stripped.language, "de");
    }

    #[test]
    fn test_action_param() {
        assert_eq!(Action::new(true, "Accept").param, "gotrue");
        assert_eq!(Action::new(false, "Reject").param, "gofalse");
    }

    #[test]
    fn test_page_serializes_with_kind_tag() {
        let page = Page::Redirect { step: 4, item: 9 };
        let json = serde_json::to_value(&page).unwrap();
        assert_eq!(json["kind"], "redirect");
        assert_eq!(json["step"], 4);
        assert!(Page::PermissionDenied.is_error());
        assert!(!page.is_error());
    }
}
