// Copyright (c) 2026 Loom Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Meta objects governing the dual knowledge architecture: managed graphs,
//! synchronization rules, schema mappings, and knowledge policies.
//!
//! Rule filters and policy predicates are declarative data rather than
//! closures so they can be persisted as nodes in the meta-graph and
//! evaluated identically on either layer.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::entity::new_id;
use crate::domain::event::glob_match;
use crate::domain::Properties;

/// Layer a managed knowledge graph belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KgKind {
    Local,
    Global,
}

impl KgKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            KgKind::Local => "local",
            KgKind::Global => "global",
        }
    }
}

/// A named graph slice plus its backend binding, under DKM governance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedKg {
    pub id: String,
    pub name: String,
    pub kind: KgKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ManagedKg {
    pub fn new(name: impl Into<String>, kind: KgKind, description: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            name: name.into(),
            kind,
            description,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Direction knowledge moves in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    LocalToGlobal,
    GlobalToLocal,
    Bidirectional,
}

/// When a rule runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cadence", rename_all = "snake_case")]
pub enum SyncCadence {
    /// Runs whenever an event matching the pattern is dispatched
    OnEvent { pattern: String },
    /// Runs on a fixed period
    Scheduled { period_ms: u64 },
    /// Runs only on explicit trigger
    Manual,
}

/// An equality predicate over a single node property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyMatch {
    pub key: String,
    pub equals: Value,
}

impl PropertyMatch {
    pub fn new(key: impl Into<String>, equals: Value) -> Self {
        Self { key: key.into(), equals }
    }

    pub fn matches(&self, props: &Properties) -> bool {
        props.get(&self.key) == Some(&self.equals)
    }
}

/// Node filter of a synchronization rule: label globs plus property
/// predicates that must all hold.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncFilter {
    /// Label globs; empty means every label
    pub labels: Vec<String>,
    /// All predicates must match
    #[serde(default)]
    pub matches: Vec<PropertyMatch>,
}

impl SyncFilter {
    pub fn for_labels(labels: &[&str]) -> Self {
        Self {
            labels: labels.iter().map(|s| s.to_string()).collect(),
            matches: Vec::new(),
        }
    }

    pub fn label_matches(&self, label: &str) -> bool {
        self.labels.is_empty() || self.labels.iter().any(|g| glob_match(g, label))
    }

    pub fn node_matches(&self, props: &Properties) -> bool {
        self.matches.iter().all(|m| m.matches(props))
    }
}

/// Declaration of when and how data moves between two managed KGs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRule {
    pub name: String,
    pub direction: SyncDirection,
    pub filter: SyncFilter,
    pub cadence: SyncCadence,
    pub priority: i64,
}

impl SyncRule {
    pub fn new(name: impl Into<String>, direction: SyncDirection, filter: SyncFilter) -> Self {
        Self {
            name: name.into(),
            direction,
            filter,
            cadence: SyncCadence::Manual,
            priority: 0,
        }
    }

    pub fn with_cadence(mut self, cadence: SyncCadence) -> Self {
        self.cadence = cadence;
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }
}

/// Field-level mapping applied when a node crosses layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaMapping {
    pub name: String,
    pub source_label: String,
    pub target_label: String,
    /// Property renames, source name → target name
    #[serde(default)]
    pub field_map: HashMap<String, String>,
    /// Target fields never overwritten once present
    #[serde(default)]
    pub immutable: Vec<String>,
}

impl SchemaMapping {
    pub fn identity(label: &str) -> Self {
        Self {
            name: format!("identity-{label}"),
            source_label: label.to_string(),
            target_label: label.to_string(),
            field_map: HashMap::new(),
            immutable: Vec::new(),
        }
    }

    /// Produce the target-shaped record for a source node.
    pub fn apply(&self, props: &Properties) -> Properties {
        let mut mapped = Properties::new();
        for (key, value) in props {
            let target_key = self.field_map.get(key).cloned().unwrap_or_else(|| key.clone());
            mapped.insert(target_key, value.clone());
        }
        mapped
    }
}

/// What a knowledge policy vetoes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    /// Vetoes data crossing layers
    Sharing,
    /// Vetoes reads
    Access,
}

/// Declarative veto rule over a label scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgePolicy {
    pub name: String,
    pub kind: PolicyKind,
    /// Label globs the policy governs
    pub scope: Vec<String>,
    /// The policy vetoes a node when all predicates match
    pub deny_when: Vec<PropertyMatch>,
}

impl KnowledgePolicy {
    pub fn sharing(name: impl Into<String>, scope: &[&str], deny_when: Vec<PropertyMatch>) -> Self {
        Self {
            name: name.into(),
            kind: PolicyKind::Sharing,
            scope: scope.iter().map(|s| s.to_string()).collect(),
            deny_when,
        }
    }

    pub fn governs_label(&self, label: &str) -> bool {
        self.scope.is_empty() || self.scope.iter().any(|g| glob_match(g, label))
    }

    /// True when the policy vetoes this node.
    pub fn vetoes(&self, label: &str, props: &Properties) -> bool {
        self.governs_label(label)
            && !self.deny_when.is_empty()
            && self.deny_when.iter().all(|m| m.matches(props))
    }
}

/// Result classification of one synchronization run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncResult {
    Ok,
    Partial,
    Failed,
}

/// Counters and timing for one synchronization run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncReport {
    pub rule: String,
    pub source: String,
    pub target: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub result: SyncResult,
    pub items_considered: u64,
    pub items_applied: u64,
    pub items_vetoed: u64,
    pub items_deferred: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl SyncReport {
    pub fn started(rule: &str, source: &str, target: &str) -> Self {
        Self {
            rule: rule.to_string(),
            source: source.to_string(),
            target: target.to_string(),
            started_at: Utc::now(),
            duration_ms: 0,
            result: SyncResult::Ok,
            items_considered: 0,
            items_applied: 0,
            items_vetoed: 0,
            items_deferred: 0,
            last_error: None,
        }
    }

    pub fn absorb(&mut self, other: &SyncReport) {
        self.items_considered += other.items_considered;
        self.items_applied += other.items_applied;
        self.items_vetoed += other.items_vetoed;
        self.items_deferred += other.items_deferred;
        if other.result == SyncResult::Failed
            || (other.result == SyncResult::Partial && self.result == SyncResult::Ok)
        {
            self.result = other.result;
        }
        if other.last_error.is_some() {
            self.last_error = other.last_error.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn props(pairs: &[(&str, Value)]) -> Properties {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_filter_label_globs() {
        let filter = SyncFilter::for_labels(&["Decision", "Cyber*"]);
        assert!(filter.label_matches("Decision"));
        assert!(filter.label_matches("CyberSecurityThreat"));
        assert!(!filter.label_matches("Project"));
        assert!(SyncFilter::default().label_matches("Anything"));
    }

    #[test]
    fn test_policy_veto() {
        let policy = KnowledgePolicy::sharing(
            "no-drafts",
            &["Decision"],
            vec![PropertyMatch::new("status", json!("draft"))],
        );
        assert!(policy.vetoes("Decision", &props(&[("status", json!("draft"))])));
        assert!(!policy.vetoes("Decision", &props(&[("status", json!("approved"))])));
        assert!(!policy.vetoes("Project", &props(&[("status", json!("draft"))])));
    }

    #[test]
    fn test_policy_without_predicates_never_vetoes() {
        let policy = KnowledgePolicy::sharing("noop", &["Decision"], vec![]);
        assert!(!policy.vetoes("Decision", &props(&[("status", json!("draft"))])));
    }

    #[test]
    fn test_mapping_renames_fields() {
        let mut mapping = SchemaMapping::identity("Decision");
        mapping.field_map.insert("title".to_string(), "headline".to_string());
        let mapped = mapping.apply(&props(&[("title", json!("use rust")), ("status", json!("ok"))]));
        assert_eq!(mapped.get("headline"), Some(&json!("use rust")));
        assert!(!mapped.contains_key("title"));
        assert_eq!(mapped.get("status"), Some(&json!("ok")));
    }

    #[test]
    fn test_report_absorb_prefers_worse_result() {
        let mut total = SyncReport::started("r", "a", "b");
        let mut partial = SyncReport::started("r", "b", "a");
        partial.result = SyncResult::Partial;
        partial.items_applied = 3;
        total.absorb(&partial);
        assert_eq!(total.result, SyncResult::Partial);
        assert_eq!(total.items_applied, 3);
    }

    #[test]
    fn test_rule_serialization_round_trip() {
        let rule = SyncRule::new(
            "promote-decisions",
            SyncDirection::LocalToGlobal,
            SyncFilter::for_labels(&["Decision"]),
        )
        .with_cadence(SyncCadence::Scheduled { period_ms: 60_000 })
        .with_priority(5);
        let raw = serde_json::to_string(&rule).unwrap();
        let back: SyncRule = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.name, "promote-decisions");
        assert_eq!(back.priority, 5);
        assert_eq!(back.cadence, SyncCadence::Scheduled { period_ms: 60_000 });
    }
}
