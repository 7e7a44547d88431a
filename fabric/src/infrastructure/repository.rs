// Copyright (c) 2026 Loom Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Typed repositories over the graph access layer.
//!
//! One [`NodeRepository`] instantiation per node label shares the common
//! contract (create, find, update, delete, count); label-specific finders
//! live on the concrete instantiations. All writes go through here —
//! validation happens before the statement is issued, and the backend's
//! uniqueness constraints back it up.

use std::collections::{HashSet, VecDeque};
use std::marker::PhantomData;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use crate::domain::entity::{new_id, Entity};
use crate::domain::schema::{RelationshipType, SchemaRegistry};
use crate::domain::{
    AgentProfile, Component, Decision, DesignPattern, Implementation, Project, Properties,
    Requirement,
};
use crate::error::{FabricError, Result};
use crate::infrastructure::graph::{Direction, EdgeSpec, RelationshipFilter, StoredRelationship};
use crate::infrastructure::pool::GraphPool;

/// Generic repository for one node label.
pub struct NodeRepository<M: Entity> {
    pool: GraphPool,
    registry: Arc<SchemaRegistry>,
    _marker: PhantomData<fn() -> M>,
}

impl<M: Entity> Clone for NodeRepository<M> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            registry: self.registry.clone(),
            _marker: PhantomData,
        }
    }
}

impl<M: Entity> NodeRepository<M> {
    pub fn new(pool: GraphPool, registry: Arc<SchemaRegistry>) -> Self {
        Self {
            pool,
            registry,
            _marker: PhantomData,
        }
    }

    fn label(&self) -> &'static str {
        M::LABEL.as_str()
    }

    /// Validate and persist a new entity, returning the stored form.
    pub async fn create(&self, entity: M) -> Result<M> {
        let props = entity.to_properties()?;
        self.registry.validate(self.label(), &props)?;
        let graph = self.pool.acquire().await?;
        let stored = graph.create_node(self.label(), props).await?;
        M::from_properties(stored)
    }

    /// Persist from raw properties, filling id and timestamps if absent.
    /// Used by synchronization and by domain-extension writers.
    pub async fn create_from_props(&self, mut props: Properties) -> Result<M> {
        let now = Utc::now().to_rfc3339();
        props
            .entry("id".to_string())
            .or_insert_with(|| Value::String(new_id()));
        props
            .entry("created_at".to_string())
            .or_insert_with(|| Value::String(now.clone()));
        props
            .entry("updated_at".to_string())
            .or_insert_with(|| Value::String(now));
        self.registry.validate(self.label(), &props)?;
        let graph = self.pool.acquire().await?;
        let stored = graph.create_node(self.label(), props).await?;
        M::from_properties(stored)
    }

    pub async fn find_by_id(&self, id: &str) -> Result<Option<M>> {
        let graph = self.pool.acquire().await?;
        match graph.find_node(self.label(), id).await? {
            Some(props) => Ok(Some(M::from_properties(props)?)),
            None => Ok(None),
        }
    }

    pub async fn find_by_property(&self, name: &str, value: Value) -> Result<Vec<M>> {
        let graph = self.pool.acquire().await?;
        let rows = graph
            .find_by_property(self.label(), name, &value, usize::MAX)
            .await?;
        rows.into_iter().map(M::from_properties).collect()
    }

    pub async fn find_all(&self, limit: usize, offset: usize) -> Result<Vec<M>> {
        let graph = self.pool.acquire().await?;
        let rows = graph.find_all(self.label(), limit, offset).await?;
        rows.into_iter().map(M::from_properties).collect()
    }

    pub async fn count(&self) -> Result<u64> {
        let graph = self.pool.acquire().await?;
        graph.count(self.label()).await
    }

    /// Apply a partial update. The id is immutable; `updated_at` always
    /// moves to the commit clock reading.
    pub async fn update(&self, id: &str, mut patch: Properties) -> Result<Option<M>> {
        if patch.contains_key("id") {
            return Err(FabricError::validation("the id property is immutable"));
        }
        patch.insert(
            "updated_at".to_string(),
            Value::String(Utc::now().to_rfc3339()),
        );

        let graph = self.pool.acquire().await?;
        let Some(current) = graph.find_node(self.label(), id).await? else {
            return Ok(None);
        };
        let mut merged = current;
        for (key, value) in &patch {
            merged.insert(key.clone(), value.clone());
        }
        self.registry.validate(self.label(), &merged)?;

        match graph.update_node(self.label(), id, patch).await? {
            Some(props) => Ok(Some(M::from_properties(props)?)),
            None => Ok(None),
        }
    }

    /// Delete the node and every attached relationship in one commit.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let graph = self.pool.acquire().await?;
        graph.delete_node(self.label(), id).await
    }

    async fn find_related(
        &self,
        rel_type: RelationshipType,
        direction: Direction,
        other_label: &str,
        other_id: &str,
    ) -> Result<Vec<M>> {
        let graph = self.pool.acquire().await?;
        let rows = graph
            .find_related(
                self.label(),
                rel_type.as_str(),
                direction,
                other_label,
                other_id,
                usize::MAX,
            )
            .await?;
        rows.into_iter().map(M::from_properties).collect()
    }
}

impl NodeRepository<Project> {
    /// Projects connected to the domain via `BELONGS_TO`.
    pub async fn find_by_domain(&self, domain_id: &str) -> Result<Vec<Project>> {
        self.find_related(RelationshipType::BelongsTo, Direction::Outgoing, "Domain", domain_id)
            .await
    }
}

impl NodeRepository<Component> {
    pub async fn find_by_project(&self, project_id: &str) -> Result<Vec<Component>> {
        self.find_related(RelationshipType::BelongsTo, Direction::Outgoing, "Project", project_id)
            .await
    }

    /// Components that depend on the given component.
    pub async fn find_dependents(&self, component_id: &str) -> Result<Vec<Component>> {
        self.find_related(
            RelationshipType::DependsOn,
            Direction::Outgoing,
            "Component",
            component_id,
        )
        .await
    }

    /// Components the given component depends on.
    pub async fn find_dependencies(&self, component_id: &str) -> Result<Vec<Component>> {
        self.find_related(
            RelationshipType::DependsOn,
            Direction::Incoming,
            "Component",
            component_id,
        )
        .await
    }
}

impl NodeRepository<Requirement> {
    pub async fn find_by_project(&self, project_id: &str) -> Result<Vec<Requirement>> {
        self.find_related(RelationshipType::BelongsTo, Direction::Outgoing, "Project", project_id)
            .await
    }

    /// Requirements the component implements.
    pub async fn find_for_component(&self, component_id: &str) -> Result<Vec<Requirement>> {
        self.find_related(
            RelationshipType::Implements,
            Direction::Incoming,
            "Component",
            component_id,
        )
        .await
    }
}

impl NodeRepository<Implementation> {
    pub async fn find_by_component(&self, component_id: &str) -> Result<Vec<Implementation>> {
        self.find_related(
            RelationshipType::BelongsTo,
            Direction::Outgoing,
            "Component",
            component_id,
        )
        .await
    }

    /// Implementations that satisfy the requirement.
    pub async fn find_for_requirement(&self, requirement_id: &str) -> Result<Vec<Implementation>> {
        self.find_related(
            RelationshipType::Satisfies,
            Direction::Outgoing,
            "Requirement",
            requirement_id,
        )
        .await
    }
}

impl NodeRepository<DesignPattern> {
    pub async fn find_by_type(&self, pattern_type: &str) -> Result<Vec<DesignPattern>> {
        self.find_by_property("type", Value::String(pattern_type.to_string()))
            .await
    }

    pub async fn find_used_by_component(&self, component_id: &str) -> Result<Vec<DesignPattern>> {
        self.find_related(
            RelationshipType::UsesPattern,
            Direction::Incoming,
            "Component",
            component_id,
        )
        .await
    }
}

impl NodeRepository<Decision> {
    pub async fn find_by_agent(&self, agent_id: &str) -> Result<Vec<Decision>> {
        self.find_related(RelationshipType::MadeBy, Direction::Outgoing, "Agent", agent_id)
            .await
    }

    pub async fn find_for_component(&self, component_id: &str) -> Result<Vec<Decision>> {
        self.find_related(
            RelationshipType::RelatedTo,
            Direction::Outgoing,
            "Component",
            component_id,
        )
        .await
    }
}

impl NodeRepository<AgentProfile> {
    pub async fn find_by_layer(&self, layer: &str) -> Result<Vec<AgentProfile>> {
        self.find_by_property("layer", Value::String(layer.to_string()))
            .await
    }

    pub async fn find_by_type(&self, agent_type: &str) -> Result<Vec<AgentProfile>> {
        self.find_by_property("type", Value::String(agent_type.to_string()))
            .await
    }

    pub async fn find_contributing_to_component(
        &self,
        component_id: &str,
    ) -> Result<Vec<AgentProfile>> {
        self.find_related(
            RelationshipType::ContributesTo,
            Direction::Outgoing,
            "Component",
            component_id,
        )
        .await
    }
}

/// Repository for relationships between nodes of any label.
#[derive(Clone)]
pub struct RelationshipRepository {
    pool: GraphPool,
    registry: Arc<SchemaRegistry>,
}

impl RelationshipRepository {
    pub fn new(pool: GraphPool, registry: Arc<SchemaRegistry>) -> Self {
        Self { pool, registry }
    }

    /// Create a typed edge. Verifies endpoint existence, enforces the
    /// schema's source/target label rules, and rejects `DEPENDS_ON`
    /// self-loops and strong dependency cycles.
    pub async fn create(
        &self,
        source_label: &str,
        source_id: &str,
        target_label: &str,
        target_id: &str,
        rel_type: &str,
        props: Option<Properties>,
    ) -> Result<StoredRelationship> {
        let mut props = props.unwrap_or_default();
        props
            .entry("created_at".to_string())
            .or_insert_with(|| Value::String(Utc::now().to_rfc3339()));

        self.registry
            .validate_relationship(rel_type, source_label, target_label, &props)?;

        if rel_type == RelationshipType::DependsOn.as_str() {
            if source_id == target_id {
                return Err(FabricError::validation(
                    "a component cannot depend on itself",
                ));
            }
            let weak = props.get("dependency_type").and_then(Value::as_str) == Some("weak");
            if !weak && self.dependency_path_exists(target_id, source_id).await? {
                return Err(FabricError::validation(format!(
                    "dependency {source_id} -> {target_id} would close a cycle; \
                     mark it dependency_type=\"weak\" to allow it"
                )));
            }
        }

        let graph = self.pool.acquire().await?;
        graph
            .create_relationship(EdgeSpec {
                source_label: source_label.to_string(),
                source_id: source_id.to_string(),
                target_label: target_label.to_string(),
                target_id: target_id.to_string(),
                rel_type: rel_type.to_string(),
                props,
            })
            .await
    }

    pub async fn find(&self, filter: RelationshipFilter) -> Result<Vec<StoredRelationship>> {
        let graph = self.pool.acquire().await?;
        graph.find_relationships(filter).await
    }

    pub async fn delete(
        &self,
        source_id: &str,
        target_id: &str,
        rel_type: Option<&str>,
    ) -> Result<bool> {
        let graph = self.pool.acquire().await?;
        Ok(graph
            .delete_relationships(source_id, target_id, rel_type)
            .await?
            > 0)
    }

    /// Whether `to` is reachable from `from` along `DEPENDS_ON` edges.
    async fn dependency_path_exists(&self, from: &str, to: &str) -> Result<bool> {
        let graph = self.pool.acquire().await?;
        let mut frontier = VecDeque::from([from.to_string()]);
        let mut visited: HashSet<String> = HashSet::new();
        while let Some(current) = frontier.pop_front() {
            if current == to {
                return Ok(true);
            }
            if !visited.insert(current.clone()) {
                continue;
            }
            let mut filter = RelationshipFilter::from_source(&current);
            filter.rel_type = Some(RelationshipType::DependsOn.as_str().to_string());
            filter.limit = usize::MAX;
            for edge in graph.find_relationships(filter).await? {
                frontier.push_back(edge.target_id);
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Domain;
    use crate::infrastructure::memory_store::MemoryGraphStore;
    use serde_json::json;
    use std::time::Duration;

    fn fixture() -> (GraphPool, Arc<SchemaRegistry>) {
        let pool = GraphPool::new(
            Arc::new(MemoryGraphStore::new()),
            4,
            Duration::from_millis(100),
        );
        (pool, Arc::new(SchemaRegistry::core()))
    }

    #[tokio::test]
    async fn test_create_read_update_delete_cycle() {
        let (pool, registry) = fixture();
        let repo: NodeRepository<Project> = NodeRepository::new(pool, registry);

        let created = repo.create(Project::new("DC", "active")).await.unwrap();
        let echoed = repo.find_by_id(&created.id).await.unwrap().unwrap();
        assert_eq!(echoed.name, "DC");
        assert_eq!(echoed.status, "active");

        let mut patch = Properties::new();
        patch.insert("status".into(), json!("archived"));
        let updated = repo.update(&created.id, patch).await.unwrap().unwrap();
        assert_eq!(updated.status, "archived");
        assert!(updated.updated_at >= created.updated_at);

        let echoed = repo.find_by_id(&created.id).await.unwrap().unwrap();
        assert_eq!(echoed.status, "archived");

        assert!(repo.delete(&created.id).await.unwrap());
        assert!(repo.find_by_id(&created.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_rejects_id_mutation() {
        let (pool, registry) = fixture();
        let repo: NodeRepository<Domain> = NodeRepository::new(pool, registry);
        let domain = repo.create(Domain::new("Dev", None)).await.unwrap();

        let mut patch = Properties::new();
        patch.insert("id".into(), json!("other"));
        let result = repo.update(&domain.id, patch).await;
        assert!(matches!(result, Err(FabricError::Validation { .. })));
    }

    #[tokio::test]
    async fn test_create_from_props_fills_base_fields() {
        let (pool, registry) = fixture();
        let repo: NodeRepository<Domain> = NodeRepository::new(pool, registry);
        let mut props = Properties::new();
        props.insert("name".into(), json!("Dev"));
        let domain = repo.create_from_props(props).await.unwrap();
        assert!(!domain.id.is_empty());
    }

    #[tokio::test]
    async fn test_create_from_props_missing_required_fails() {
        let (pool, registry) = fixture();
        let repo: NodeRepository<Project> = NodeRepository::new(pool, registry);
        // No name, no status.
        let result = repo.create_from_props(Properties::new()).await;
        assert!(matches!(result, Err(FabricError::Validation { .. })));
    }

    #[tokio::test]
    async fn test_dependency_cycle_rejected_weak_allowed() {
        let (pool, registry) = fixture();
        let components: NodeRepository<Component> =
            NodeRepository::new(pool.clone(), registry.clone());
        let rels = RelationshipRepository::new(pool, registry);

        let a = components
            .create(Component::new("A", "service", "active"))
            .await
            .unwrap();
        let b = components
            .create(Component::new("B", "service", "active"))
            .await
            .unwrap();

        rels.create("Component", &a.id, "Component", &b.id, "DEPENDS_ON", None)
            .await
            .unwrap();

        // Closing the cycle without the weak marker fails.
        let strong = rels
            .create("Component", &b.id, "Component", &a.id, "DEPENDS_ON", None)
            .await;
        assert!(matches!(strong, Err(FabricError::Validation { .. })));

        // The weak marker allows it.
        let mut props = Properties::new();
        props.insert("dependency_type".into(), json!("weak"));
        rels.create("Component", &b.id, "Component", &a.id, "DEPENDS_ON", Some(props))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_self_dependency_rejected() {
        let (pool, registry) = fixture();
        let components: NodeRepository<Component> =
            NodeRepository::new(pool.clone(), registry.clone());
        let rels = RelationshipRepository::new(pool, registry);
        let a = components
            .create(Component::new("A", "service", "active"))
            .await
            .unwrap();
        let result = rels
            .create("Component", &a.id, "Component", &a.id, "DEPENDS_ON", None)
            .await;
        assert!(matches!(result, Err(FabricError::Validation { .. })));
    }

    #[tokio::test]
    async fn test_edge_against_missing_endpoint() {
        let (pool, registry) = fixture();
        let components: NodeRepository<Component> =
            NodeRepository::new(pool.clone(), registry.clone());
        let rels = RelationshipRepository::new(pool, registry);
        let a = components
            .create(Component::new("A", "service", "active"))
            .await
            .unwrap();
        let result = rels
            .create("Component", &a.id, "Component", "ghost", "DEPENDS_ON", None)
            .await;
        assert!(matches!(result, Err(FabricError::EntityNotFound { .. })));
    }

    #[tokio::test]
    async fn test_satisfaction_level_bounds() {
        let (pool, registry) = fixture();
        let rels = RelationshipRepository::new(pool, registry);
        let mut props = Properties::new();
        props.insert("satisfaction_level".into(), json!(1.5));
        let result = rels
            .create("Implementation", "i-1", "Requirement", "r-1", "SATISFIES", Some(props))
            .await;
        // Range violation is caught before the endpoint check runs.
        assert!(matches!(result, Err(FabricError::Validation { .. })));
    }

    #[tokio::test]
    async fn test_count_and_find_all() {
        let (pool, registry) = fixture();
        let repo: NodeRepository<Domain> = NodeRepository::new(pool, registry);
        for i in 0..3 {
            repo.create(Domain::new(format!("d{i}"), None)).await.unwrap();
        }
        assert_eq!(repo.count().await.unwrap(), 3);
        assert_eq!(repo.find_all(2, 0).await.unwrap().len(), 2);
        assert_eq!(repo.find_all(10, 2).await.unwrap().len(), 1);
    }
}
