//! Declarative action and field descriptors
//!
//! Plugins describe their "new install" form fields, list actions, and
//! detail sections as plain data. The UI renders these descriptors and the
//! engine evaluates the confirm → select → prompt chain they declare; no
//! business logic lives on the UI side.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Kind of a "new install" form field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    /// Free text input
    Text,
    /// Choice from options resolved by the plugin
    Select,
    /// Boolean toggle
    Toggle,
    /// Filesystem path
    Path,
}

/// One field of a plugin's "new install" form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    /// Field identifier used as the selections key
    pub id: String,

    /// Human-readable label
    pub label: String,

    /// Field kind
    pub kind: FieldKind,

    /// Whether a value must be supplied
    pub required: bool,

    /// Field whose value must be selected before this one resolves
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub depends_on: Option<String>,
}

/// One selectable option of a select field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldOption {
    /// Value stored in selections
    pub value: String,

    /// Human-readable label
    pub label: String,
}

impl FieldOption {
    pub fn new(value: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            label: label.into(),
        }
    }
}

/// Visual style hint for an action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStyle {
    Normal,
    Primary,
    Danger,
}

/// Confirmation step of an action chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmSpec {
    /// Dialog title
    pub title: String,

    /// Dialog message
    pub message: String,

    /// Optional checkbox options the user may tick
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub options: Vec<FieldOption>,
}

/// Free-text prompt step of an action chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptSpec {
    /// Prompt label
    pub label: String,

    /// Whether an empty value aborts the chain
    pub required: bool,

    /// Regular-expression pattern the value must match, if any
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub pattern: Option<String>,
}

/// Selection step of an action chain
///
/// Either carries its options inline, or names a plugin field whose option
/// resolver supplies them (possibly chained through earlier selections).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectSpec {
    /// Selections key the chosen value is stored under
    pub id: String,

    /// Human-readable label
    pub label: String,

    /// Inline options; empty when `field` is set
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub options: Vec<FieldOption>,

    /// Plugin field id to resolve options through
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub field: Option<String>,
}

/// Declarative description of one mutating operation on an installation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionDescriptor {
    /// Action identifier dispatched to the plugin
    pub id: String,

    /// Human-readable label
    pub label: String,

    /// Visual style hint
    pub style: ActionStyle,

    /// Whether the action may currently run
    pub enabled: bool,

    /// User-facing reason when disabled
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub disabled_reason: Option<String>,

    /// Confirmation step, evaluated first
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub confirm: Option<ConfirmSpec>,

    /// Selection steps, evaluated after confirmation in declaration order
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub selects: Vec<SelectSpec>,

    /// Prompt step, evaluated after selections
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub prompt: Option<PromptSpec>,

    /// Minimum free bytes required at the install path before dispatch
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub min_free_bytes: Option<u64>,

    /// Whether the UI should show a progress surface for this action
    pub show_progress: bool,

    /// Title for the progress surface
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub progress_title: Option<String>,

    /// Whether the operation honors cancellation
    pub cancellable: bool,
}

impl ActionDescriptor {
    /// Minimal enabled action with no chain steps
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            style: ActionStyle::Normal,
            enabled: true,
            disabled_reason: None,
            confirm: None,
            selects: Vec::new(),
            prompt: None,
            min_free_bytes: None,
            show_progress: false,
            progress_title: None,
            cancellable: false,
        }
    }
}

/// Data accumulated by a completed action chain
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionData {
    /// Checkbox options ticked during confirmation
    #[serde(default)]
    pub confirmed_options: Vec<String>,

    /// Values chosen by selection steps, keyed by select id
    #[serde(default)]
    pub selections: HashMap<String, String>,

    /// Value supplied by the prompt step
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub prompt_value: Option<String>,
}

/// Structured description of a port collision found during pre-flight
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortConflict {
    /// The contested port
    pub port: u16,

    /// Next free port, if one was found
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub next_free: Option<u16>,
}

/// Result of executing an action
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResult {
    /// Whether the action succeeded
    pub ok: bool,

    /// Human-readable outcome message
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub message: Option<String>,

    /// View the UI should navigate to
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub navigate: Option<String>,

    /// Terminal mode hint ("cancelled", "reverted", ...)
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub mode: Option<String>,

    /// Port collision details when a pre-flight check found one
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub port_conflict: Option<PortConflict>,
}

impl ActionResult {
    /// Successful result with a message
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: Some(message.into()),
            ..Default::default()
        }
    }

    /// Failed result with a message
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: Some(message.into()),
            ..Default::default()
        }
    }

    /// Terminal user-cancelled result; distinct from failure
    pub fn cancelled() -> Self {
        Self {
            ok: false,
            message: Some("Cancelled".to_string()),
            mode: Some("cancelled".to_string()),
            ..Default::default()
        }
    }
}

/// One row group of a plugin's detail view; declarative metadata only
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetailSection {
    /// Section title
    pub title: String,

    /// Label/value rows
    pub rows: Vec<(String, String)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_defaults() {
        let action = ActionDescriptor::new("snapshot", "Take snapshot");
        assert!(action.enabled);
        assert!(action.confirm.is_none());
        assert!(action.selects.is_empty());
        assert!(!action.show_progress);
    }

    #[test]
    fn test_action_result_cancelled_is_terminal_not_ok() {
        let result = ActionResult::cancelled();
        assert!(!result.ok);
        assert_eq!(result.mode.as_deref(), Some("cancelled"));
    }

    #[test]
    fn test_descriptor_serialization_skips_empty() {
        let action = ActionDescriptor::new("remove", "Remove");
        let json = serde_json::to_string(&action).unwrap();
        assert!(!json.contains("confirm"));
        assert!(!json.contains("selects"));
        assert!(!json.contains("disabled_reason"));
    }
}
