// Copyright (c) 2026 Loom Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Embedded in-memory graph store.
//!
//! The default backend for tests, demos, and single-process development.
//! Behaves like the bolt backend for every typed operation: per-label id
//! uniqueness, detach-delete, duplicate-edge collapse, endpoint checks.
//! Raw statements are the one thing it refuses.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::schema::ConstraintSpec;
use crate::domain::Properties;
use crate::error::{FabricError, Result};
use crate::infrastructure::graph::{
    require_id, BatchOp, Direction, EdgeSpec, GraphStore, RelationshipFilter, StoredRelationship,
};

#[derive(Default, Clone)]
struct StoreState {
    /// label → id → properties
    nodes: HashMap<String, HashMap<String, Properties>>,
    edges: Vec<StoredRelationship>,
    constraints: Vec<ConstraintSpec>,
}

fn apply_create_node(state: &mut StoreState, label: &str, props: Properties) -> Result<()> {
    let id = require_id(&props)?;
    let nodes = state.nodes.entry(label.to_string()).or_default();
    if nodes.contains_key(&id) {
        return Err(FabricError::DuplicateId {
            label: label.to_string(),
            id,
        });
    }
    nodes.insert(id, props);
    Ok(())
}

fn apply_update_node(
    state: &mut StoreState,
    label: &str,
    id: &str,
    patch: Properties,
) -> Option<Properties> {
    let props = state.nodes.get_mut(label)?.get_mut(id)?;
    for (key, value) in patch {
        props.insert(key, value);
    }
    Some(props.clone())
}

fn apply_delete_node(state: &mut StoreState, label: &str, id: &str) -> bool {
    let removed = state
        .nodes
        .get_mut(label)
        .map(|nodes| nodes.remove(id).is_some())
        .unwrap_or(false);
    if removed {
        state
            .edges
            .retain(|edge| edge.source_id != id && edge.target_id != id);
    }
    removed
}

fn apply_create_relationship(
    state: &mut StoreState,
    edge: EdgeSpec,
) -> Result<StoredRelationship> {
    for (label, id) in [
        (&edge.source_label, &edge.source_id),
        (&edge.target_label, &edge.target_id),
    ] {
        let exists = state
            .nodes
            .get(label.as_str())
            .map(|nodes| nodes.contains_key(id.as_str()))
            .unwrap_or(false);
        if !exists {
            return Err(FabricError::EntityNotFound {
                label: label.clone(),
                id: id.clone(),
            });
        }
    }

    // Duplicate (source, target, type) edges collapse into one.
    if let Some(existing) = state.edges.iter_mut().find(|e| {
        e.source_id == edge.source_id
            && e.target_id == edge.target_id
            && e.rel_type == edge.rel_type
    }) {
        for (key, value) in edge.props {
            existing.props.insert(key, value);
        }
        return Ok(existing.clone());
    }

    let stored = StoredRelationship {
        source_label: edge.source_label,
        source_id: edge.source_id,
        target_label: edge.target_label,
        target_id: edge.target_id,
        rel_type: edge.rel_type,
        props: edge.props,
    };
    state.edges.push(stored.clone());
    Ok(stored)
}

/// In-memory implementation of [`GraphStore`].
#[derive(Default)]
pub struct MemoryGraphStore {
    state: RwLock<StoreState>,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, StoreState> {
        self.state.read().expect("graph store lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, StoreState> {
        self.state.write().expect("graph store lock poisoned")
    }
}

fn sorted_by_creation(mut rows: Vec<Properties>) -> Vec<Properties> {
    rows.sort_by(|a, b| {
        let key = |p: &Properties| {
            (
                p.get("created_at")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                p.get("id").and_then(Value::as_str).unwrap_or_default().to_string(),
            )
        };
        key(a).cmp(&key(b))
    });
    rows
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn verify_connectivity(&self) -> Result<()> {
        Ok(())
    }

    async fn apply_constraints(&self, specs: &[ConstraintSpec]) -> Result<()> {
        let mut state = self.write();
        for spec in specs {
            if !state.constraints.contains(spec) {
                state.constraints.push(spec.clone());
            }
        }
        Ok(())
    }

    async fn run_statement(
        &self,
        statement: &str,
        _params: Properties,
    ) -> Result<Vec<Properties>> {
        Err(FabricError::Query {
            statement: statement.to_string(),
            message: "raw statements are not supported by the embedded store".to_string(),
        })
    }

    async fn create_node(&self, label: &str, props: Properties) -> Result<Properties> {
        let mut state = self.write();
        apply_create_node(&mut state, label, props.clone())?;
        Ok(props)
    }

    async fn find_node(&self, label: &str, id: &str) -> Result<Option<Properties>> {
        let state = self.read();
        Ok(state
            .nodes
            .get(label)
            .and_then(|nodes| nodes.get(id))
            .cloned())
    }

    async fn find_by_property(
        &self,
        label: &str,
        key: &str,
        value: &Value,
        limit: usize,
    ) -> Result<Vec<Properties>> {
        let state = self.read();
        let rows = state
            .nodes
            .get(label)
            .map(|nodes| {
                nodes
                    .values()
                    .filter(|props| props.get(key) == Some(value))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        Ok(sorted_by_creation(rows).into_iter().take(limit).collect())
    }

    async fn find_all(&self, label: &str, limit: usize, offset: usize) -> Result<Vec<Properties>> {
        let state = self.read();
        let rows = state
            .nodes
            .get(label)
            .map(|nodes| nodes.values().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        Ok(sorted_by_creation(rows)
            .into_iter()
            .skip(offset)
            .take(limit)
            .collect())
    }

    async fn count(&self, label: &str) -> Result<u64> {
        let state = self.read();
        Ok(state.nodes.get(label).map(|n| n.len() as u64).unwrap_or(0))
    }

    async fn update_node(
        &self,
        label: &str,
        id: &str,
        patch: Properties,
    ) -> Result<Option<Properties>> {
        let mut state = self.write();
        Ok(apply_update_node(&mut state, label, id, patch))
    }

    async fn delete_node(&self, label: &str, id: &str) -> Result<bool> {
        let mut state = self.write();
        Ok(apply_delete_node(&mut state, label, id))
    }

    async fn create_relationship(&self, edge: EdgeSpec) -> Result<StoredRelationship> {
        let mut state = self.write();
        apply_create_relationship(&mut state, edge)
    }

    async fn find_relationships(
        &self,
        filter: RelationshipFilter,
    ) -> Result<Vec<StoredRelationship>> {
        let state = self.read();
        Ok(state
            .edges
            .iter()
            .filter(|edge| filter.accepts(edge))
            .take(filter.limit)
            .cloned()
            .collect())
    }

    async fn update_relationship(
        &self,
        source_id: &str,
        target_id: &str,
        rel_type: &str,
        patch: Properties,
    ) -> Result<bool> {
        let mut state = self.write();
        let Some(edge) = state.edges.iter_mut().find(|e| {
            e.source_id == source_id && e.target_id == target_id && e.rel_type == rel_type
        }) else {
            return Ok(false);
        };
        for (key, value) in patch {
            edge.props.insert(key, value);
        }
        Ok(true)
    }

    async fn delete_relationships(
        &self,
        source_id: &str,
        target_id: &str,
        rel_type: Option<&str>,
    ) -> Result<usize> {
        let mut state = self.write();
        let before = state.edges.len();
        state.edges.retain(|edge| {
            !(edge.source_id == source_id
                && edge.target_id == target_id
                && rel_type.map(|t| edge.rel_type == t).unwrap_or(true))
        });
        Ok(before - state.edges.len())
    }

    async fn find_related(
        &self,
        label: &str,
        rel_type: &str,
        direction: Direction,
        other_label: &str,
        other_id: &str,
        limit: usize,
    ) -> Result<Vec<Properties>> {
        let state = self.read();
        let mut ids: Vec<String> = Vec::new();
        for edge in &state.edges {
            if edge.rel_type != rel_type {
                continue;
            }
            match direction {
                Direction::Outgoing => {
                    if edge.target_label == other_label
                        && edge.target_id == other_id
                        && edge.source_label == label
                    {
                        ids.push(edge.source_id.clone());
                    }
                }
                Direction::Incoming => {
                    if edge.source_label == other_label
                        && edge.source_id == other_id
                        && edge.target_label == label
                    {
                        ids.push(edge.target_id.clone());
                    }
                }
            }
        }
        let rows = ids
            .into_iter()
            .filter_map(|id| state.nodes.get(label).and_then(|nodes| nodes.get(&id)).cloned())
            .collect();
        Ok(sorted_by_creation(rows).into_iter().take(limit).collect())
    }

    async fn run_batch(&self, ops: Vec<BatchOp>) -> Result<()> {
        let mut state = self.write();
        // All-or-nothing: work against the live state, restore the
        // snapshot if any operation fails.
        let snapshot = state.clone();
        for op in ops {
            let outcome = match op {
                BatchOp::CreateNode { label, props } => {
                    apply_create_node(&mut state, &label, props)
                }
                BatchOp::UpdateNode { label, id, patch } => {
                    match apply_update_node(&mut state, &label, &id, patch) {
                        Some(_) => Ok(()),
                        None => Err(FabricError::EntityNotFound { label, id }),
                    }
                }
                BatchOp::DeleteNode { label, id } => {
                    if apply_delete_node(&mut state, &label, &id) {
                        Ok(())
                    } else {
                        Err(FabricError::EntityNotFound { label, id })
                    }
                }
                BatchOp::CreateRelationship(edge) => {
                    apply_create_relationship(&mut state, edge).map(|_| ())
                }
            };
            if let Err(e) = outcome {
                *state = snapshot;
                return Err(e);
            }
        }
        Ok(())
    }
}
