// Copyright (c) 2026 Loom Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Immutable event records — the ground truth of system activity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::entity::new_id;
use crate::domain::Properties;
use crate::error::{FabricError, Result};

/// Reference to a graph node by label and id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRef {
    pub label: String,
    pub id: String,
}

impl NodeRef {
    pub fn new(label: impl Into<String>, id: impl Into<String>) -> Self {
        Self { label: label.into(), id: id.into() }
    }
}

/// An immutable record of a happening. Once committed an event is never
/// mutated; compaction is an out-of-band concern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FabricEvent {
    pub id: String,
    /// Dotted type string, e.g. `agent.action`, `workflow.step.completed`
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    /// Emitting component name or agent id
    pub source: String,
    /// Opaque payload
    pub metadata: Properties,
    /// Nodes this event refers to
    pub related: Vec<NodeRef>,
}

impl FabricEvent {
    pub fn new(
        event_type: impl Into<String>,
        source: impl Into<String>,
        metadata: Properties,
    ) -> Self {
        Self {
            id: new_id(),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            source: source.into(),
            metadata,
            related: Vec::new(),
        }
    }

    pub fn with_related(mut self, related: Vec<NodeRef>) -> Self {
        self.related = related;
        self
    }

    /// Shape an agent action as an event.
    pub fn agent_action(
        agent_id: &str,
        action_type: &str,
        inputs: Value,
        outputs: Value,
        success: bool,
    ) -> Self {
        let mut metadata = Properties::new();
        metadata.insert("agent_id".into(), Value::String(agent_id.to_string()));
        metadata.insert("action_type".into(), Value::String(action_type.to_string()));
        metadata.insert("inputs".into(), inputs);
        metadata.insert("outputs".into(), outputs);
        metadata.insert("success".into(), Value::Bool(success));
        Self::new("agent.action", agent_id, metadata)
    }

    /// Shape an internal component event.
    pub fn system_event(component: &str, kind: &str, details: Value) -> Self {
        let mut metadata = Properties::new();
        metadata.insert("details".into(), details);
        Self::new(format!("system.{kind}"), component, metadata)
    }

    /// Shape a workflow step transition.
    pub fn workflow_step(workflow_id: &str, step_id: &str, status: &str, data: Value) -> Self {
        let mut metadata = Properties::new();
        metadata.insert("workflow_id".into(), Value::String(workflow_id.to_string()));
        metadata.insert("step_id".into(), Value::String(step_id.to_string()));
        metadata.insert("data".into(), data);
        Self::new(format!("workflow.step.{status}"), workflow_id, metadata)
    }

    /// Graph representation. Nested values travel as JSON strings.
    pub fn to_properties(&self) -> Result<Properties> {
        let now = self.timestamp;
        let mut props = Properties::new();
        props.insert("id".into(), Value::String(self.id.clone()));
        props.insert("type".into(), Value::String(self.event_type.clone()));
        props.insert("timestamp".into(), Value::String(self.timestamp.to_rfc3339()));
        props.insert("source".into(), Value::String(self.source.clone()));
        props.insert(
            "metadata".into(),
            Value::String(serde_json::to_string(&self.metadata)?),
        );
        props.insert(
            "related".into(),
            Value::String(serde_json::to_string(&self.related)?),
        );
        props.insert("created_at".into(), Value::String(now.to_rfc3339()));
        props.insert("updated_at".into(), Value::String(now.to_rfc3339()));
        Ok(props)
    }

    pub fn from_properties(props: &Properties) -> Result<Self> {
        let str_field = |key: &str| -> Result<String> {
            props
                .get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| FabricError::Internal(format!("event node missing {key}")))
        };
        let timestamp = DateTime::parse_from_rfc3339(&str_field("timestamp")?)
            .map_err(|e| FabricError::Internal(format!("bad event timestamp: {e}")))?
            .with_timezone(&Utc);
        let metadata = match props.get("metadata").and_then(Value::as_str) {
            Some(raw) => serde_json::from_str(raw)?,
            None => Properties::new(),
        };
        let related = match props.get("related").and_then(Value::as_str) {
            Some(raw) => serde_json::from_str(raw)?,
            None => Vec::new(),
        };
        Ok(Self {
            id: str_field("id")?,
            event_type: str_field("type")?,
            timestamp,
            source: str_field("source")?,
            metadata,
            related,
        })
    }
}

/// Match a dotted event type (or a node label) against a glob pattern.
/// `*` matches any run of characters; everything else matches literally.
pub fn glob_match(pattern: &str, value: &str) -> bool {
    fn matches(p: &[u8], v: &[u8]) -> bool {
        match (p.first(), v.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                matches(&p[1..], v) || (!v.is_empty() && matches(p, &v[1..]))
            }
            (Some(pc), Some(vc)) if pc == vc => matches(&p[1..], &v[1..]),
            _ => false,
        }
    }
    matches(pattern.as_bytes(), value.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("*", "agent.action"));
        assert!(glob_match("task.*", "task.started"));
        assert!(glob_match("task.*", "task.step.completed"));
        assert!(glob_match("*.completed", "workflow.step.completed"));
        assert!(glob_match("agent.action", "agent.action"));
        assert!(!glob_match("task.*", "workflow.started"));
        assert!(!glob_match("task.started", "task.starte"));
    }

    #[test]
    fn test_event_property_round_trip() {
        let mut metadata = Properties::new();
        metadata.insert("task_id".into(), json!("t-1"));
        let event = FabricEvent::new("task.started", "agent_pm", metadata)
            .with_related(vec![NodeRef::new("Component", "c-1")]);

        let props = event.to_properties().unwrap();
        let back = FabricEvent::from_properties(&props).unwrap();

        assert_eq!(back.id, event.id);
        assert_eq!(back.event_type, "task.started");
        assert_eq!(back.source, "agent_pm");
        assert_eq!(back.metadata.get("task_id"), Some(&json!("t-1")));
        assert_eq!(back.related, event.related);
    }

    #[test]
    fn test_agent_action_shape() {
        let event =
            FabricEvent::agent_action("agent_pm", "plan", json!({"goal": "x"}), json!({}), true);
        assert_eq!(event.event_type, "agent.action");
        assert_eq!(event.source, "agent_pm");
        assert_eq!(event.metadata.get("success"), Some(&json!(true)));
    }

    #[test]
    fn test_workflow_step_type_carries_status() {
        let event = FabricEvent::workflow_step("wf-1", "step-2", "completed", json!({}));
        assert_eq!(event.event_type, "workflow.step.completed");
    }
}
