// Copyright (c) 2026 Loom Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Graph access layer contract.
//!
//! [`GraphStore`] is the seam between the fabric and the labeled property
//! graph backend. The embedded store implements it directly; the bolt
//! backend renders the same operations as parameterized Cypher. Dialect and
//! version differences stay below this trait.

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::schema::ConstraintSpec;
use crate::domain::Properties;
use crate::error::Result;

/// Traversal direction relative to the node being returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Returned nodes have an outgoing edge to the anchor
    Outgoing,
    /// Returned nodes have an incoming edge from the anchor
    Incoming,
}

/// A relationship to be created.
#[derive(Debug, Clone)]
pub struct EdgeSpec {
    pub source_label: String,
    pub source_id: String,
    pub target_label: String,
    pub target_id: String,
    pub rel_type: String,
    pub props: Properties,
}

/// A relationship as stored.
#[derive(Debug, Clone)]
pub struct StoredRelationship {
    pub source_label: String,
    pub source_id: String,
    pub target_label: String,
    pub target_id: String,
    pub rel_type: String,
    pub props: Properties,
}

/// Criteria for relationship lookups. Unset fields match anything.
#[derive(Debug, Clone)]
pub struct RelationshipFilter {
    pub source_id: Option<String>,
    pub target_id: Option<String>,
    pub rel_type: Option<String>,
    pub limit: usize,
}

impl Default for RelationshipFilter {
    fn default() -> Self {
        Self {
            source_id: None,
            target_id: None,
            rel_type: None,
            limit: 100,
        }
    }
}

impl RelationshipFilter {
    pub fn from_source(source_id: &str) -> Self {
        Self {
            source_id: Some(source_id.to_string()),
            ..Self::default()
        }
    }

    pub fn between(source_id: &str, target_id: &str, rel_type: &str) -> Self {
        Self {
            source_id: Some(source_id.to_string()),
            target_id: Some(target_id.to_string()),
            rel_type: Some(rel_type.to_string()),
            limit: 1,
        }
    }

    pub fn accepts(&self, rel: &StoredRelationship) -> bool {
        if let Some(source) = &self.source_id {
            if &rel.source_id != source {
                return false;
            }
        }
        if let Some(target) = &self.target_id {
            if &rel.target_id != target {
                return false;
            }
        }
        if let Some(rel_type) = &self.rel_type {
            if &rel.rel_type != rel_type {
                return false;
            }
        }
        true
    }
}

/// One write in a transactional batch.
#[derive(Debug, Clone)]
pub enum BatchOp {
    CreateNode { label: String, props: Properties },
    UpdateNode { label: String, id: String, patch: Properties },
    DeleteNode { label: String, id: String },
    CreateRelationship(EdgeSpec),
}

/// Typed operations against one labeled property graph.
///
/// Implementations must enforce id uniqueness per label (`DuplicateId`),
/// detach-delete nodes, collapse duplicate `(source, target, type)` edges,
/// and reject edges against missing endpoints (`EntityNotFound`).
#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn verify_connectivity(&self) -> Result<()>;

    /// Install the schema's constraints and indexes. Idempotent.
    async fn apply_constraints(&self, specs: &[ConstraintSpec]) -> Result<()>;

    /// Escape hatch for raw parameterized statements. The embedded store
    /// rejects this with `Query`; the bolt backend forwards it verbatim.
    async fn run_statement(&self, statement: &str, params: Properties)
        -> Result<Vec<Properties>>;

    async fn create_node(&self, label: &str, props: Properties) -> Result<Properties>;

    async fn find_node(&self, label: &str, id: &str) -> Result<Option<Properties>>;

    async fn find_by_property(
        &self,
        label: &str,
        key: &str,
        value: &Value,
        limit: usize,
    ) -> Result<Vec<Properties>>;

    async fn find_all(&self, label: &str, limit: usize, offset: usize) -> Result<Vec<Properties>>;

    async fn count(&self, label: &str) -> Result<u64>;

    /// Merge `patch` into the node's properties. Returns the updated node,
    /// or `None` when it does not exist. Callers own the `updated_at` rule.
    async fn update_node(
        &self,
        label: &str,
        id: &str,
        patch: Properties,
    ) -> Result<Option<Properties>>;

    /// Detach-delete: the node and every inbound/outbound relationship go
    /// in the same commit.
    async fn delete_node(&self, label: &str, id: &str) -> Result<bool>;

    async fn create_relationship(&self, edge: EdgeSpec) -> Result<StoredRelationship>;

    async fn find_relationships(
        &self,
        filter: RelationshipFilter,
    ) -> Result<Vec<StoredRelationship>>;

    async fn update_relationship(
        &self,
        source_id: &str,
        target_id: &str,
        rel_type: &str,
        patch: Properties,
    ) -> Result<bool>;

    /// Delete matching relationships, returning how many went away.
    async fn delete_relationships(
        &self,
        source_id: &str,
        target_id: &str,
        rel_type: Option<&str>,
    ) -> Result<usize>;

    /// Nodes of `label` connected to the anchor node through `rel_type`.
    async fn find_related(
        &self,
        label: &str,
        rel_type: &str,
        direction: Direction,
        other_label: &str,
        other_id: &str,
        limit: usize,
    ) -> Result<Vec<Properties>>;

    /// Apply every operation in one transaction: all of them commit, or
    /// none do.
    async fn run_batch(&self, ops: Vec<BatchOp>) -> Result<()>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Read the required `id` property out of a property map.
pub fn require_id(props: &Properties) -> Result<String> {
    props
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| crate::error::FabricError::validation("node properties missing id"))
}
