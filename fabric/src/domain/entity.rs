// Copyright (c) 2026 Loom Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Typed entity models for the core node labels.
//!
//! Every entity carries the graph-wide base fields (`id`, `created_at`,
//! `updated_at`) and round-trips losslessly through a property map. In-memory
//! projections reference other entities by id, never by pointer.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::schema::NodeLabel;
use crate::domain::Properties;
use crate::error::{FabricError, Result};

/// Common capability of every typed node model.
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const LABEL: NodeLabel;

    fn id(&self) -> &str;

    fn to_properties(&self) -> Result<Properties> {
        match serde_json::to_value(self)? {
            serde_json::Value::Object(map) => Ok(map),
            other => Err(FabricError::Internal(format!(
                "entity serialized to non-object value: {other}"
            ))),
        }
    }

    fn from_properties(props: Properties) -> Result<Self> {
        serde_json::from_value(serde_json::Value::Object(props)).map_err(FabricError::from)
    }
}

pub(crate) fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Top of the ownership tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Domain {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Domain {
    pub fn new(name: impl Into<String>, description: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            name: name.into(),
            description,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Entity for Domain {
    const LABEL: NodeLabel = NodeLabel::Domain;
    fn id(&self) -> &str {
        &self.id
    }
}

/// A development initiative within a domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    pub fn new(name: impl Into<String>, status: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            name: name.into(),
            description: None,
            status: status.into(),
            created_at: now,
            updated_at: now,
        }
    }
}

impl Entity for Project {
    const LABEL: NodeLabel = NodeLabel::Project;
    fn id(&self) -> &str {
        &self.id
    }
}

/// Modular part of the system under development.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Component {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub component_type: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Component {
    pub fn new(
        name: impl Into<String>,
        component_type: impl Into<String>,
        status: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            name: name.into(),
            description: None,
            component_type: component_type.into(),
            status: status.into(),
            created_at: now,
            updated_at: now,
        }
    }
}

impl Entity for Component {
    const LABEL: NodeLabel = NodeLabel::Component;
    fn id(&self) -> &str {
        &self.id
    }
}

/// Functional or non-functional specification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Requirement {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(rename = "type")]
    pub requirement_type: String,
    pub priority: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Requirement {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        requirement_type: impl Into<String>,
        priority: impl Into<String>,
        status: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            name: name.into(),
            description: description.into(),
            requirement_type: requirement_type.into(),
            priority: priority.into(),
            status: status.into(),
            created_at: now,
            updated_at: now,
        }
    }
}

impl Entity for Requirement {
    const LABEL: NodeLabel = NodeLabel::Requirement;
    fn id(&self) -> &str {
        &self.id
    }
}

/// Code or configuration realizing part of a component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Implementation {
    pub id: String,
    pub name: String,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Implementation {
    pub fn new(
        name: impl Into<String>,
        path: impl Into<String>,
        status: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            name: name.into(),
            path: path.into(),
            language: None,
            version: None,
            status: status.into(),
            created_at: now,
            updated_at: now,
        }
    }
}

impl Entity for Implementation {
    const LABEL: NodeLabel = NodeLabel::Implementation;
    fn id(&self) -> &str {
        &self.id
    }
}

/// Reusable design or architecture pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DesignPattern {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(rename = "type")]
    pub pattern_type: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DesignPattern {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        pattern_type: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            name: name.into(),
            description: description.into(),
            pattern_type: pattern_type.into(),
            created_at: now,
            updated_at: now,
        }
    }
}

impl Entity for DesignPattern {
    const LABEL: NodeLabel = NodeLabel::Pattern;
    fn id(&self) -> &str {
        &self.id
    }
}

/// A recorded architectural or development decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub id: String,
    pub title: String,
    pub description: String,
    pub context: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Decision {
    pub fn new(
        title: impl Into<String>,
        description: impl Into<String>,
        context: impl Into<String>,
        status: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            title: title.into(),
            description: description.into(),
            context: context.into(),
            status: status.into(),
            created_at: now,
            updated_at: now,
        }
    }
}

impl Entity for Decision {
    const LABEL: NodeLabel = NodeLabel::Decision;
    fn id(&self) -> &str {
        &self.id
    }
}

/// A collaborator in the crew.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub agent_type: String,
    pub layer: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentProfile {
    pub fn new(
        name: impl Into<String>,
        agent_type: impl Into<String>,
        layer: impl Into<String>,
        status: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            name: name.into(),
            agent_type: agent_type.into(),
            layer: layer.into(),
            description: None,
            status: status.into(),
            created_at: now,
            updated_at: now,
        }
    }
}

impl Entity for AgentProfile {
    const LABEL: NodeLabel = NodeLabel::Agent;
    fn id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_round_trip() {
        let component = Component::new("auth-service", "service", "active");
        let props = component.to_properties().unwrap();
        assert_eq!(props.get("type").unwrap(), "service");

        let back = Component::from_properties(props).unwrap();
        assert_eq!(back.id, component.id);
        assert_eq!(back.component_type, "service");
    }

    #[test]
    fn test_new_fills_id_and_timestamps() {
        let domain = Domain::new("Development", None);
        assert!(!domain.id.is_empty());
        assert_eq!(domain.created_at, domain.updated_at);
    }

    #[test]
    fn test_optional_fields_omitted() {
        let domain = Domain::new("Development", None);
        let props = domain.to_properties().unwrap();
        assert!(!props.contains_key("description"));
    }

    #[test]
    fn test_ids_are_unique() {
        let a = Decision::new("t", "d", "c", "draft");
        let b = Decision::new("t", "d", "c", "draft");
        assert_ne!(a.id, b.id);
    }
}
