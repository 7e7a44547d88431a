// Copyright (c) 2026 Loom Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Knowledge graph schema: node labels, relationship types, declarative
//! property definitions, and validation.
//!
//! The registry is advisory at the repository boundary and mandatory at the
//! graph access layer: uniqueness constraints derived from
//! [`SchemaRegistry::constraint_specs`] are installed into the backend at
//! bootstrap, so a write that bypasses validation is still rejected there.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::domain::Properties;
use crate::error::{FabricError, Result};

/// Core node labels in the knowledge graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeLabel {
    Domain,
    Project,
    Component,
    Requirement,
    Implementation,
    Pattern,
    Decision,
    Agent,
    Event,
    Memory,
    Policy,
    ManagedKg,
    SynchronizationRule,
    SchemaMapping,
    KnowledgePolicy,
}

impl NodeLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeLabel::Domain => "Domain",
            NodeLabel::Project => "Project",
            NodeLabel::Component => "Component",
            NodeLabel::Requirement => "Requirement",
            NodeLabel::Implementation => "Implementation",
            NodeLabel::Pattern => "Pattern",
            NodeLabel::Decision => "Decision",
            NodeLabel::Agent => "Agent",
            NodeLabel::Event => "Event",
            NodeLabel::Memory => "Memory",
            NodeLabel::Policy => "Policy",
            NodeLabel::ManagedKg => "ManagedKG",
            NodeLabel::SynchronizationRule => "SynchronizationRule",
            NodeLabel::SchemaMapping => "SchemaMapping",
            NodeLabel::KnowledgePolicy => "KnowledgePolicy",
        }
    }

    pub fn all() -> &'static [NodeLabel] {
        &[
            NodeLabel::Domain,
            NodeLabel::Project,
            NodeLabel::Component,
            NodeLabel::Requirement,
            NodeLabel::Implementation,
            NodeLabel::Pattern,
            NodeLabel::Decision,
            NodeLabel::Agent,
            NodeLabel::Event,
            NodeLabel::Memory,
            NodeLabel::Policy,
            NodeLabel::ManagedKg,
            NodeLabel::SynchronizationRule,
            NodeLabel::SchemaMapping,
            NodeLabel::KnowledgePolicy,
        ]
    }
}

impl std::fmt::Display for NodeLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Core relationship types in the knowledge graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelationshipType {
    BelongsTo,
    DependsOn,
    Implements,
    UsesPattern,
    MadeBy,
    Satisfies,
    ContributesTo,
    RelatedTo,
    Triggers,
    GovernedBy,
    NextStep,
    SyncsWith,
    SyncsTo,
    AppliesTo,
    MapsBetween,
    Governs,
}

impl RelationshipType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationshipType::BelongsTo => "BELONGS_TO",
            RelationshipType::DependsOn => "DEPENDS_ON",
            RelationshipType::Implements => "IMPLEMENTS",
            RelationshipType::UsesPattern => "USES_PATTERN",
            RelationshipType::MadeBy => "MADE_BY",
            RelationshipType::Satisfies => "SATISFIES",
            RelationshipType::ContributesTo => "CONTRIBUTES_TO",
            RelationshipType::RelatedTo => "RELATED_TO",
            RelationshipType::Triggers => "TRIGGERS",
            RelationshipType::GovernedBy => "GOVERNED_BY",
            RelationshipType::NextStep => "NEXT_STEP",
            RelationshipType::SyncsWith => "SYNCS_WITH",
            RelationshipType::SyncsTo => "SYNCS_TO",
            RelationshipType::AppliesTo => "APPLIES_TO",
            RelationshipType::MapsBetween => "MAPS_BETWEEN",
            RelationshipType::Governs => "GOVERNS",
        }
    }
}

impl std::fmt::Display for RelationshipType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Property value types recognized by the schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyType {
    String,
    Number,
    Boolean,
    DateTime,
    Vector,
}

/// Definition of a single property.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertySchema {
    pub name: String,
    pub data_type: PropertyType,
    pub required: bool,
    /// Numeric values must fall within [0, 1]
    pub unit_interval: bool,
}

impl PropertySchema {
    pub fn required(name: &str, data_type: PropertyType) -> Self {
        Self {
            name: name.to_string(),
            data_type,
            required: true,
            unit_interval: false,
        }
    }

    pub fn optional(name: &str, data_type: PropertyType) -> Self {
        Self {
            name: name.to_string(),
            data_type,
            required: false,
            unit_interval: false,
        }
    }

    pub fn unit_interval(mut self) -> Self {
        self.unit_interval = true;
        self
    }
}

/// Schema definition for a node label.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSchema {
    pub label: String,
    pub properties: Vec<PropertySchema>,
}

impl NodeSchema {
    pub fn new(label: impl Into<String>, properties: Vec<PropertySchema>) -> Self {
        Self { label: label.into(), properties }
    }
}

/// Schema definition for a relationship type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipSchema {
    pub rel_type: String,
    pub source_labels: Vec<String>,
    pub target_labels: Vec<String>,
    pub properties: Vec<PropertySchema>,
}

/// A backend constraint or index derived from the schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConstraintSpec {
    /// Uniqueness constraint on a single property of a label
    Unique { label: String, property: String },
    /// Lookup index on one or more properties of a label
    Index { label: String, properties: Vec<String> },
    /// Vector similarity index, honored where the backend supports it
    VectorIndex { label: String, property: String },
}

/// Domain extension: additional labels and relationship types registered
/// under a domain namespace.
#[derive(Debug, Clone, Default)]
pub struct SchemaExtension {
    pub nodes: Vec<NodeSchema>,
    pub relationships: Vec<RelationshipSchema>,
}

struct SchemaSet {
    nodes: HashMap<String, NodeSchema>,
    relationships: HashMap<String, RelationshipSchema>,
}

/// Declarative schema registry with validation.
pub struct SchemaRegistry {
    inner: RwLock<SchemaSet>,
}

impl SchemaRegistry {
    /// Registry pre-loaded with the core schema.
    pub fn core() -> Self {
        let mut nodes = HashMap::new();
        for schema in core_node_schemas() {
            nodes.insert(schema.label.clone(), schema);
        }
        let mut relationships = HashMap::new();
        for schema in core_relationship_schemas() {
            relationships.insert(schema.rel_type.clone(), schema);
        }
        Self {
            inner: RwLock::new(SchemaSet { nodes, relationships }),
        }
    }

    /// All node labels currently known to the registry.
    pub fn node_labels(&self) -> Vec<String> {
        let inner = self.inner.read().expect("schema lock poisoned");
        let mut labels: Vec<String> = inner.nodes.keys().cloned().collect();
        labels.sort();
        labels
    }

    pub fn has_label(&self, label: &str) -> bool {
        let inner = self.inner.read().expect("schema lock poisoned");
        inner.nodes.contains_key(label)
    }

    /// Validate node properties against the label's schema. Returns every
    /// missing required property and every type mismatch at once.
    pub fn validate(&self, label: &str, props: &Properties) -> Result<()> {
        let inner = self.inner.read().expect("schema lock poisoned");
        let schema = inner
            .nodes
            .get(label)
            .ok_or_else(|| FabricError::validation(format!("unknown node label: {label}")))?;
        let errors = validate_against(&schema.properties, props);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(FabricError::Validation { errors })
        }
    }

    /// Validate a relationship's endpoint labels and properties.
    pub fn validate_relationship(
        &self,
        rel_type: &str,
        source_label: &str,
        target_label: &str,
        props: &Properties,
    ) -> Result<()> {
        let inner = self.inner.read().expect("schema lock poisoned");
        let schema = match inner.relationships.get(rel_type) {
            Some(schema) => schema,
            // Extension relationship types register lazily; unknown types
            // only need known endpoint labels.
            None => {
                if inner.nodes.contains_key(source_label) && inner.nodes.contains_key(target_label)
                {
                    return Ok(());
                }
                return Err(FabricError::validation(format!(
                    "unknown endpoint label for relationship {rel_type}"
                )));
            }
        };

        let mut errors = Vec::new();
        if !schema.source_labels.iter().any(|l| l == source_label) {
            errors.push(format!(
                "{rel_type} does not allow source label {source_label}"
            ));
        }
        if !schema.target_labels.iter().any(|l| l == target_label) {
            errors.push(format!(
                "{rel_type} does not allow target label {target_label}"
            ));
        }
        errors.extend(validate_against(&schema.properties, props));
        if errors.is_empty() {
            Ok(())
        } else {
            Err(FabricError::Validation { errors })
        }
    }

    /// Register additional labels and relationship types under a domain
    /// namespace. Redefining an existing label incompatibly fails with
    /// `SchemaConflict`; re-registering the identical definition is a no-op.
    pub fn extend_for_domain(&self, domain_name: &str, extension: SchemaExtension) -> Result<()> {
        let namespace = domain_name.replace(' ', "");
        let mut inner = self.inner.write().expect("schema lock poisoned");

        for node in extension.nodes {
            let label = format!("{namespace}{}", node.label);
            if let Some(existing) = inner.nodes.get(&label) {
                if !compatible(existing, &node) {
                    return Err(FabricError::SchemaConflict(format!(
                        "label {label} is already defined with a different property set"
                    )));
                }
                continue;
            }
            let mut properties = node.properties;
            ensure_base_properties(&mut properties);
            inner.nodes.insert(
                label.clone(),
                NodeSchema { label, properties },
            );
        }

        for rel in extension.relationships {
            if let Some(existing) = inner.relationships.get(&rel.rel_type) {
                if existing.source_labels != rel.source_labels
                    || existing.target_labels != rel.target_labels
                {
                    return Err(FabricError::SchemaConflict(format!(
                        "relationship {} is already defined with different endpoints",
                        rel.rel_type
                    )));
                }
                continue;
            }
            inner.relationships.insert(rel.rel_type.clone(), rel);
        }
        Ok(())
    }

    /// Constraints and indexes the backend must install at bootstrap.
    pub fn constraint_specs(&self) -> Vec<ConstraintSpec> {
        let inner = self.inner.read().expect("schema lock poisoned");
        let mut specs = Vec::new();
        let mut labels: Vec<&NodeSchema> = inner.nodes.values().collect();
        labels.sort_by(|a, b| a.label.cmp(&b.label));
        for schema in labels {
            specs.push(ConstraintSpec::Unique {
                label: schema.label.clone(),
                property: "id".to_string(),
            });
            for indexed in ["name", "type", "status"] {
                if schema.properties.iter().any(|p| p.name == indexed) {
                    specs.push(ConstraintSpec::Index {
                        label: schema.label.clone(),
                        properties: vec![indexed.to_string()],
                    });
                }
            }
            if schema.properties.iter().any(|p| p.name == "embedding") {
                specs.push(ConstraintSpec::VectorIndex {
                    label: schema.label.clone(),
                    property: "embedding".to_string(),
                });
            }
        }
        specs
    }
}

fn compatible(existing: &NodeSchema, candidate: &NodeSchema) -> bool {
    // Compatible means every existing property keeps its type and required
    // flag; additions are allowed.
    existing.properties.iter().all(|old| {
        candidate
            .properties
            .iter()
            .chain(base_properties().iter())
            .any(|new| new.name == old.name && new.data_type == old.data_type)
            || base_properties().iter().any(|b| b.name == old.name)
    })
}

fn validate_against(schema: &[PropertySchema], props: &Properties) -> Vec<String> {
    let mut errors = Vec::new();
    for prop in schema {
        match props.get(&prop.name) {
            None | Some(serde_json::Value::Null) => {
                if prop.required {
                    errors.push(format!("missing required property: {}", prop.name));
                }
            }
            Some(value) => {
                if let Some(error) = check_type(prop, value) {
                    errors.push(error);
                }
            }
        }
    }
    errors
}

fn check_type(prop: &PropertySchema, value: &serde_json::Value) -> Option<String> {
    use serde_json::Value;
    match prop.data_type {
        PropertyType::String => {
            if !value.is_string() {
                return Some(format!("property {} must be a string", prop.name));
            }
        }
        PropertyType::Number => match value.as_f64() {
            Some(number) => {
                if prop.unit_interval && !(0.0..=1.0).contains(&number) {
                    return Some(format!(
                        "property {} must be within [0, 1], got {number}",
                        prop.name
                    ));
                }
            }
            None => return Some(format!("property {} must be a number", prop.name)),
        },
        PropertyType::Boolean => {
            if !value.is_boolean() {
                return Some(format!("property {} must be a boolean", prop.name));
            }
        }
        PropertyType::DateTime => {
            let ok = value
                .as_str()
                .map(|s| chrono::DateTime::parse_from_rfc3339(s).is_ok())
                .unwrap_or(false);
            if !ok {
                return Some(format!(
                    "property {} must be an RFC 3339 datetime string",
                    prop.name
                ));
            }
        }
        PropertyType::Vector => {
            let ok = match value {
                Value::Array(items) => items.iter().all(|v| v.is_number()),
                // Vectors round-trip through the backend as JSON strings
                Value::String(s) => serde_json::from_str::<Vec<f64>>(s).is_ok(),
                _ => false,
            };
            if !ok {
                return Some(format!("property {} must be a numeric vector", prop.name));
            }
        }
    }
    None
}

fn base_properties() -> Vec<PropertySchema> {
    vec![
        PropertySchema::required("id", PropertyType::String),
        PropertySchema::required("created_at", PropertyType::DateTime),
        PropertySchema::required("updated_at", PropertyType::DateTime),
    ]
}

fn ensure_base_properties(properties: &mut Vec<PropertySchema>) {
    for base in base_properties() {
        if !properties.iter().any(|p| p.name == base.name) {
            properties.push(base);
        }
    }
}

fn core_node_schemas() -> Vec<NodeSchema> {
    use PropertyType::*;
    let with_base = |mut props: Vec<PropertySchema>| {
        ensure_base_properties(&mut props);
        props
    };

    vec![
        NodeSchema::new(
            "Domain",
            with_base(vec![
                PropertySchema::required("name", String),
                PropertySchema::optional("description", String),
            ]),
        ),
        NodeSchema::new(
            "Project",
            with_base(vec![
                PropertySchema::required("name", String),
                PropertySchema::optional("description", String),
                PropertySchema::required("status", String),
            ]),
        ),
        NodeSchema::new(
            "Component",
            with_base(vec![
                PropertySchema::required("name", String),
                PropertySchema::optional("description", String),
                PropertySchema::required("type", String),
                PropertySchema::required("status", String),
            ]),
        ),
        NodeSchema::new(
            "Requirement",
            with_base(vec![
                PropertySchema::required("name", String),
                PropertySchema::required("description", String),
                PropertySchema::required("type", String),
                PropertySchema::required("priority", String),
                PropertySchema::required("status", String),
            ]),
        ),
        NodeSchema::new(
            "Implementation",
            with_base(vec![
                PropertySchema::required("name", String),
                PropertySchema::required("path", String),
                PropertySchema::optional("language", String),
                PropertySchema::optional("version", String),
                PropertySchema::required("status", String),
            ]),
        ),
        NodeSchema::new(
            "Pattern",
            with_base(vec![
                PropertySchema::required("name", String),
                PropertySchema::required("description", String),
                PropertySchema::required("type", String),
            ]),
        ),
        NodeSchema::new(
            "Decision",
            with_base(vec![
                PropertySchema::required("title", String),
                PropertySchema::required("description", String),
                PropertySchema::required("context", String),
                PropertySchema::required("status", String),
            ]),
        ),
        NodeSchema::new(
            "Agent",
            with_base(vec![
                PropertySchema::required("name", String),
                PropertySchema::required("type", String),
                PropertySchema::required("layer", String),
                PropertySchema::optional("description", String),
                PropertySchema::required("status", String),
            ]),
        ),
        NodeSchema::new(
            "Event",
            with_base(vec![
                PropertySchema::required("type", String),
                PropertySchema::required("timestamp", DateTime),
                PropertySchema::required("source", String),
                PropertySchema::optional("metadata", String),
                PropertySchema::optional("related", String),
            ]),
        ),
        NodeSchema::new(
            "Memory",
            with_base(vec![
                PropertySchema::required("content", String),
                PropertySchema::required("context", String),
                PropertySchema::required("memory_type", String),
                PropertySchema::required("timestamp", DateTime),
                PropertySchema::required("importance", Number).unit_interval(),
                PropertySchema::required("last_accessed", DateTime),
                PropertySchema::required("access_count", Number),
                PropertySchema::optional("embedding", Vector),
            ]),
        ),
        NodeSchema::new(
            "Policy",
            with_base(vec![
                PropertySchema::required("name", String),
                PropertySchema::required("description", String),
                PropertySchema::required("domain", String),
                PropertySchema::required("enforcement", String),
            ]),
        ),
        NodeSchema::new(
            "ManagedKG",
            with_base(vec![
                PropertySchema::required("name", String),
                PropertySchema::required("kind", String),
                PropertySchema::optional("description", String),
            ]),
        ),
        NodeSchema::new(
            "SynchronizationRule",
            with_base(vec![
                PropertySchema::required("name", String),
                PropertySchema::required("spec", String),
            ]),
        ),
        NodeSchema::new(
            "SchemaMapping",
            with_base(vec![
                PropertySchema::required("name", String),
                PropertySchema::required("spec", String),
            ]),
        ),
        NodeSchema::new(
            "KnowledgePolicy",
            with_base(vec![
                PropertySchema::required("name", String),
                PropertySchema::required("spec", String),
            ]),
        ),
    ]
}

fn core_relationship_schemas() -> Vec<RelationshipSchema> {
    use PropertyType::*;
    let all: Vec<std::string::String> = NodeLabel::all().iter().map(|l| l.as_str().to_string()).collect();
    let labels = |names: &[&str]| names.iter().map(|s| s.to_string()).collect::<Vec<_>>();

    vec![
        RelationshipSchema {
            rel_type: "BELONGS_TO".to_string(),
            source_labels: labels(&[
                "Component",
                "Requirement",
                "Implementation",
                "Pattern",
                "Decision",
                "Agent",
                "Project",
            ]),
            target_labels: labels(&["Domain", "Project", "Component"]),
            properties: vec![PropertySchema::required("created_at", DateTime)],
        },
        RelationshipSchema {
            rel_type: "DEPENDS_ON".to_string(),
            source_labels: labels(&["Component", "Implementation", "Requirement"]),
            target_labels: labels(&["Component", "Implementation", "Requirement"]),
            properties: vec![
                PropertySchema::optional("dependency_type", String),
                PropertySchema::optional("strength", Number).unit_interval(),
                PropertySchema::required("created_at", DateTime),
            ],
        },
        RelationshipSchema {
            rel_type: "IMPLEMENTS".to_string(),
            source_labels: labels(&["Component", "Implementation"]),
            target_labels: labels(&["Requirement"]),
            properties: vec![
                PropertySchema::optional("status", String),
                PropertySchema::required("created_at", DateTime),
            ],
        },
        RelationshipSchema {
            rel_type: "USES_PATTERN".to_string(),
            source_labels: labels(&["Component", "Implementation"]),
            target_labels: labels(&["Pattern"]),
            properties: vec![PropertySchema::required("created_at", DateTime)],
        },
        RelationshipSchema {
            rel_type: "MADE_BY".to_string(),
            source_labels: labels(&["Decision"]),
            target_labels: labels(&["Agent"]),
            properties: vec![
                PropertySchema::optional("context", String),
                PropertySchema::optional("confidence", Number).unit_interval(),
                PropertySchema::required("created_at", DateTime),
            ],
        },
        RelationshipSchema {
            rel_type: "SATISFIES".to_string(),
            source_labels: labels(&["Implementation"]),
            target_labels: labels(&["Requirement"]),
            properties: vec![
                PropertySchema::optional("satisfaction_level", Number).unit_interval(),
                PropertySchema::required("created_at", DateTime),
            ],
        },
        RelationshipSchema {
            rel_type: "CONTRIBUTES_TO".to_string(),
            source_labels: labels(&["Agent"]),
            target_labels: labels(&["Component", "Implementation", "Project"]),
            properties: vec![
                PropertySchema::optional("contribution_type", String),
                PropertySchema::required("created_at", DateTime),
            ],
        },
        RelationshipSchema {
            rel_type: "RELATED_TO".to_string(),
            source_labels: all.clone(),
            target_labels: all.clone(),
            properties: vec![
                PropertySchema::optional("relation", String),
                PropertySchema::optional("strength", Number).unit_interval(),
                PropertySchema::required("created_at", DateTime),
            ],
        },
        RelationshipSchema {
            rel_type: "TRIGGERS".to_string(),
            source_labels: labels(&["Event"]),
            target_labels: all.clone(),
            properties: vec![PropertySchema::required("created_at", DateTime)],
        },
        RelationshipSchema {
            rel_type: "GOVERNED_BY".to_string(),
            source_labels: all.clone(),
            target_labels: labels(&["Policy", "KnowledgePolicy"]),
            properties: vec![PropertySchema::required("created_at", DateTime)],
        },
        RelationshipSchema {
            rel_type: "NEXT_STEP".to_string(),
            source_labels: labels(&["Event"]),
            target_labels: labels(&["Event"]),
            properties: vec![PropertySchema::required("created_at", DateTime)],
        },
        RelationshipSchema {
            rel_type: "SYNCS_WITH".to_string(),
            source_labels: labels(&["ManagedKG"]),
            target_labels: labels(&["ManagedKG"]),
            properties: vec![PropertySchema::required("created_at", DateTime)],
        },
        RelationshipSchema {
            rel_type: "SYNCS_TO".to_string(),
            source_labels: labels(&["ManagedKG"]),
            target_labels: labels(&["ManagedKG"]),
            properties: vec![PropertySchema::required("created_at", DateTime)],
        },
        RelationshipSchema {
            rel_type: "APPLIES_TO".to_string(),
            source_labels: labels(&["SynchronizationRule"]),
            target_labels: labels(&["ManagedKG"]),
            properties: vec![PropertySchema::required("created_at", DateTime)],
        },
        RelationshipSchema {
            rel_type: "MAPS_BETWEEN".to_string(),
            source_labels: labels(&["SchemaMapping"]),
            target_labels: labels(&["ManagedKG"]),
            properties: vec![PropertySchema::required("created_at", DateTime)],
        },
        RelationshipSchema {
            rel_type: "GOVERNS".to_string(),
            source_labels: labels(&["KnowledgePolicy"]),
            target_labels: labels(&["ManagedKG"]),
            properties: vec![PropertySchema::required("created_at", DateTime)],
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn props(pairs: &[(&str, serde_json::Value)]) -> Properties {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_validate_accepts_complete_domain() {
        let registry = SchemaRegistry::core();
        let now = chrono::Utc::now().to_rfc3339();
        let result = registry.validate(
            "Domain",
            &props(&[
                ("id", json!("d-1")),
                ("name", json!("Development")),
                ("created_at", json!(now.clone())),
                ("updated_at", json!(now)),
            ]),
        );
        assert!(result.is_ok());
    }

    #[test]
    fn test_validate_reports_every_violation() {
        let registry = SchemaRegistry::core();
        let result = registry.validate(
            "Project",
            &props(&[("id", json!("p-1")), ("status", json!(42))]),
        );
        let Err(FabricError::Validation { errors }) = result else {
            panic!("expected validation failure");
        };
        // Missing name, created_at, updated_at; status has the wrong type.
        assert!(errors.iter().any(|e| e.contains("name")));
        assert!(errors.iter().any(|e| e.contains("status")));
        assert!(errors.len() >= 4, "got {errors:?}");
    }

    #[test]
    fn test_unit_interval_enforced() {
        let registry = SchemaRegistry::core();
        let now = chrono::Utc::now().to_rfc3339();
        let result = registry.validate_relationship(
            "SATISFIES",
            "Implementation",
            "Requirement",
            &props(&[
                ("satisfaction_level", json!(1.2)),
                ("created_at", json!(now)),
            ]),
        );
        assert!(matches!(result, Err(FabricError::Validation { .. })));
    }

    #[test]
    fn test_relationship_label_rules() {
        let registry = SchemaRegistry::core();
        let now = chrono::Utc::now().to_rfc3339();
        let good = registry.validate_relationship(
            "MADE_BY",
            "Decision",
            "Agent",
            &props(&[("created_at", json!(now.clone()))]),
        );
        assert!(good.is_ok());

        let bad = registry.validate_relationship(
            "MADE_BY",
            "Agent",
            "Decision",
            &props(&[("created_at", json!(now))]),
        );
        assert!(bad.is_err());
    }

    #[test]
    fn test_extend_for_domain_registers_namespaced_label() {
        let registry = SchemaRegistry::core();
        let extension = SchemaExtension {
            nodes: vec![NodeSchema::new(
                "Threat",
                vec![PropertySchema::required("name", PropertyType::String)],
            )],
            relationships: vec![],
        };
        registry.extend_for_domain("Cyber Security", extension).unwrap();
        assert!(registry.has_label("CyberSecurityThreat"));
    }

    #[test]
    fn test_extend_for_domain_conflict() {
        let registry = SchemaRegistry::core();
        let first = SchemaExtension {
            nodes: vec![NodeSchema::new(
                "Threat",
                vec![PropertySchema::required("name", PropertyType::String)],
            )],
            relationships: vec![],
        };
        registry.extend_for_domain("Sec", first).unwrap();

        let incompatible = SchemaExtension {
            nodes: vec![NodeSchema::new(
                "Threat",
                vec![PropertySchema::required("name", PropertyType::Number)],
            )],
            relationships: vec![],
        };
        let result = registry.extend_for_domain("Sec", incompatible);
        assert!(matches!(result, Err(FabricError::SchemaConflict(_))));
    }

    #[test]
    fn test_constraint_specs_cover_every_label() {
        let registry = SchemaRegistry::core();
        let specs = registry.constraint_specs();
        for label in NodeLabel::all() {
            assert!(
                specs.iter().any(|spec| matches!(
                    spec,
                    ConstraintSpec::Unique { label: l, property } if l == label.as_str() && property == "id"
                )),
                "no uniqueness constraint for {label}"
            );
        }
        assert!(specs.iter().any(|spec| matches!(
            spec,
            ConstraintSpec::VectorIndex { label, .. } if label == "Memory"
        )));
    }
}
