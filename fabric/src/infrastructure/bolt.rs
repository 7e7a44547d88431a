// Copyright (c) 2026 Loom Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Bolt-protocol backend over `neo4rs`.
//!
//! Renders the typed [`GraphStore`] operations as parameterized Cypher.
//! Transport loss is retried with exponential backoff up to the configured
//! `max_retry_time`; application errors surface immediately. Labels and
//! relationship types are interpolated only after passing the identifier
//! check below; values always travel as parameters.

use std::time::Duration;

use async_trait::async_trait;
use neo4rs::{query, Graph, Query};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::GraphConfig;
use crate::domain::schema::ConstraintSpec;
use crate::domain::Properties;
use crate::error::{FabricError, Result};
use crate::infrastructure::graph::{
    BatchOp, Direction, EdgeSpec, GraphStore, RelationshipFilter, StoredRelationship,
};

/// Bolt-backed implementation of [`GraphStore`].
pub struct BoltGraphStore {
    graph: Graph,
    max_retry_time: Duration,
}

impl BoltGraphStore {
    /// Establish and verify connectivity. Bad URIs or credentials fail with
    /// `Configuration`; unreachable servers with `BackendUnavailable`.
    pub async fn open(config: &GraphConfig) -> Result<Self> {
        let bolt_config = neo4rs::ConfigBuilder::default()
            .uri(&config.uri)
            .user(&config.username)
            .password(&config.password)
            .db(config.database.as_str())
            .max_connections(config.max_pool_size as usize)
            .build()
            .map_err(|e| FabricError::Configuration(format!("bad graph configuration: {e}")))?;

        let graph = Graph::connect(bolt_config)
            .await
            .map_err(|e| FabricError::BackendUnavailable(e.to_string()))?;

        let store = Self {
            graph,
            max_retry_time: Duration::from_millis(config.max_retry_time_ms),
        };
        store.verify_connectivity().await?;
        Ok(store)
    }

    /// Run a statement, collecting result rows, retrying transient loss.
    async fn run_rows(&self, statement: &str, params: &Properties) -> Result<Vec<Properties>> {
        let mut attempt: u32 = 0;
        let deadline = tokio::time::Instant::now() + self.max_retry_time;
        loop {
            match self.execute_once(statement, params).await {
                Ok(rows) => return Ok(rows),
                Err(e) if is_transient(&e) => {
                    let backoff = Duration::from_millis(100u64.saturating_mul(1 << attempt.min(6)));
                    if tokio::time::Instant::now() + backoff >= deadline {
                        return Err(FabricError::BackendUnavailable(e.to_string()));
                    }
                    warn!(error = %e, attempt, "transient backend failure, retrying");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(FabricError::Query {
                        statement: statement.to_string(),
                        message: e.to_string(),
                    })
                }
            }
        }
    }

    async fn execute_once(
        &self,
        statement: &str,
        params: &Properties,
    ) -> std::result::Result<Vec<Properties>, neo4rs::Error> {
        let mut q = query(statement);
        for (key, value) in params {
            q = bind_param(q, key, value);
        }
        let mut stream = self.graph.execute(q).await?;
        let mut rows = Vec::new();
        while let Ok(Some(row)) = stream.next().await {
            rows.push(row_to_properties(&row));
        }
        Ok(rows)
    }
}

fn is_transient(error: &neo4rs::Error) -> bool {
    matches!(error, neo4rs::Error::ConnectionError)
}

/// Only schema-derived identifiers may be interpolated into a statement.
fn check_identifier(name: &str) -> Result<&str> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if ok {
        Ok(name)
    } else {
        Err(FabricError::validation(format!("invalid graph identifier: {name}")))
    }
}

fn bind_param(q: Query, key: &str, value: &Value) -> Query {
    match value {
        Value::Null => q.param(key, ""),
        Value::Bool(b) => q.param(key, *b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                q.param(key, i)
            } else {
                q.param(key, n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => q.param(key, s.as_str()),
        // Nested structures travel as JSON strings.
        other => q.param(key, other.to_string()),
    }
}

fn row_to_properties(row: &neo4rs::Row) -> Properties {
    if let Some(node) = row.get::<neo4rs::Node>("n") {
        return node_to_properties(&node);
    }
    let mut props = Properties::new();
    if let Some(count) = row.get::<i64>("count") {
        props.insert("count".into(), Value::from(count));
    }
    if let Some(deleted) = row.get::<i64>("deleted") {
        props.insert("deleted".into(), Value::from(deleted));
    }
    props
}

fn node_to_properties(node: &neo4rs::Node) -> Properties {
    let mut props = Properties::new();
    for key in node.keys() {
        let value = if let Some(s) = node.get::<String>(key) {
            Value::String(s)
        } else if let Some(b) = node.get::<bool>(key) {
            Value::Bool(b)
        } else if let Some(i) = node.get::<i64>(key) {
            Value::from(i)
        } else if let Some(f) = node.get::<f64>(key) {
            serde_json::Number::from_f64(f)
                .map(Value::Number)
                .unwrap_or(Value::Null)
        } else {
            Value::Null
        };
        props.insert(key.to_string(), value);
    }
    props
}

fn property_pattern(props: &Properties) -> (String, Properties) {
    let mut assignments = Vec::new();
    let mut params = Properties::new();
    for (index, (key, value)) in props.iter().enumerate() {
        let param = format!("p{index}");
        assignments.push(format!("`{key}`: ${param}"));
        params.insert(param, value.clone());
    }
    (assignments.join(", "), params)
}

fn set_clause(var: &str, props: &Properties) -> (String, Properties) {
    let mut assignments = Vec::new();
    let mut params = Properties::new();
    for (index, (key, value)) in props.iter().enumerate() {
        let param = format!("p{index}");
        assignments.push(format!("{var}.`{key}` = ${param}"));
        params.insert(param, value.clone());
    }
    (assignments.join(", "), params)
}

#[async_trait]
impl GraphStore for BoltGraphStore {
    async fn verify_connectivity(&self) -> Result<()> {
        self.run_rows("RETURN 1 AS count", &Properties::new()).await?;
        Ok(())
    }

    async fn apply_constraints(&self, specs: &[ConstraintSpec]) -> Result<()> {
        for spec in specs {
            let statement = match spec {
                ConstraintSpec::Unique { label, property } => {
                    let label = check_identifier(label)?;
                    let property = check_identifier(property)?;
                    format!(
                        "CREATE CONSTRAINT IF NOT EXISTS FOR (n:{label}) REQUIRE n.`{property}` IS UNIQUE"
                    )
                }
                ConstraintSpec::Index { label, properties } => {
                    let label = check_identifier(label)?;
                    let fields = properties
                        .iter()
                        .map(|p| check_identifier(p).map(|p| format!("n.`{p}`")))
                        .collect::<Result<Vec<_>>>()?
                        .join(", ");
                    format!("CREATE INDEX IF NOT EXISTS FOR (n:{label}) ON ({fields})")
                }
                ConstraintSpec::VectorIndex { label, property } => {
                    let label = check_identifier(label)?;
                    let property = check_identifier(property)?;
                    format!(
                        "CREATE VECTOR INDEX `{label}_{property}` IF NOT EXISTS FOR (n:{label}) ON (n.`{property}`)"
                    )
                }
            };
            match self.run_rows(&statement, &Properties::new()).await {
                Ok(_) => debug!(statement, "applied schema constraint"),
                // Older backends reject vector indexes; everything else is fatal.
                Err(e) if matches!(spec, ConstraintSpec::VectorIndex { .. }) => {
                    warn!(error = %e, "backend does not support vector indexes, skipping");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn run_statement(
        &self,
        statement: &str,
        params: Properties,
    ) -> Result<Vec<Properties>> {
        self.run_rows(statement, &params).await
    }

    async fn create_node(&self, label: &str, props: Properties) -> Result<Properties> {
        let label = check_identifier(label)?;
        let id = crate::infrastructure::graph::require_id(&props)?;
        let (pattern, params) = property_pattern(&props);
        let statement = format!("CREATE (n:{label} {{{pattern}}}) RETURN n");
        let rows = self.run_rows(&statement, &params).await.map_err(|e| match e {
            // The uniqueness constraint serializes competing creates.
            FabricError::Query { message, .. } if message.contains("already exists") => {
                FabricError::DuplicateId { label: label.to_string(), id: id.clone() }
            }
            other => other,
        })?;
        rows.into_iter()
            .next()
            .ok_or_else(|| FabricError::Internal("create returned no node".to_string()))
    }

    async fn find_node(&self, label: &str, id: &str) -> Result<Option<Properties>> {
        let label = check_identifier(label)?;
        let mut params = Properties::new();
        params.insert("id".into(), Value::String(id.to_string()));
        let statement = format!("MATCH (n:{label} {{id: $id}}) RETURN n");
        Ok(self.run_rows(&statement, &params).await?.into_iter().next())
    }

    async fn find_by_property(
        &self,
        label: &str,
        key: &str,
        value: &Value,
        limit: usize,
    ) -> Result<Vec<Properties>> {
        let label = check_identifier(label)?;
        let mut params = Properties::new();
        params.insert("value".into(), value.clone());
        let statement = format!(
            "MATCH (n:{label}) WHERE n.`{key}` = $value RETURN n ORDER BY n.created_at LIMIT {limit}"
        );
        self.run_rows(&statement, &params).await
    }

    async fn find_all(&self, label: &str, limit: usize, offset: usize) -> Result<Vec<Properties>> {
        let label = check_identifier(label)?;
        let statement = format!(
            "MATCH (n:{label}) RETURN n ORDER BY n.created_at SKIP {offset} LIMIT {limit}"
        );
        self.run_rows(&statement, &Properties::new()).await
    }

    async fn count(&self, label: &str) -> Result<u64> {
        let label = check_identifier(label)?;
        let statement = format!("MATCH (n:{label}) RETURN count(n) AS count");
        let rows = self.run_rows(&statement, &Properties::new()).await?;
        Ok(rows
            .first()
            .and_then(|row| row.get("count"))
            .and_then(Value::as_u64)
            .unwrap_or(0))
    }

    async fn update_node(
        &self,
        label: &str,
        id: &str,
        patch: Properties,
    ) -> Result<Option<Properties>> {
        if patch.is_empty() {
            return self.find_node(label, id).await;
        }
        let label = check_identifier(label)?;
        let (assignments, mut params) = set_clause("n", &patch);
        params.insert("id".into(), Value::String(id.to_string()));
        let statement = format!("MATCH (n:{label} {{id: $id}}) SET {assignments} RETURN n");
        Ok(self.run_rows(&statement, &params).await?.into_iter().next())
    }

    async fn delete_node(&self, label: &str, id: &str) -> Result<bool> {
        let label = check_identifier(label)?;
        let mut params = Properties::new();
        params.insert("id".into(), Value::String(id.to_string()));
        let statement = format!(
            "MATCH (n:{label} {{id: $id}}) DETACH DELETE n RETURN count(n) AS deleted"
        );
        let rows = self.run_rows(&statement, &params).await?;
        Ok(rows
            .first()
            .and_then(|row| row.get("deleted"))
            .and_then(Value::as_u64)
            .unwrap_or(0)
            > 0)
    }

    async fn create_relationship(&self, edge: EdgeSpec) -> Result<StoredRelationship> {
        let source_label = check_identifier(&edge.source_label)?.to_string();
        let target_label = check_identifier(&edge.target_label)?.to_string();
        let rel_type = check_identifier(&edge.rel_type)?.to_string();

        for (label, id) in [(&source_label, &edge.source_id), (&target_label, &edge.target_id)] {
            if self.find_node(label, id).await?.is_none() {
                return Err(FabricError::EntityNotFound {
                    label: label.clone(),
                    id: id.clone(),
                });
            }
        }

        let (assignments, mut params) = set_clause("r", &edge.props);
        params.insert("source_id".into(), Value::String(edge.source_id.clone()));
        params.insert("target_id".into(), Value::String(edge.target_id.clone()));
        let set = if assignments.is_empty() {
            String::new()
        } else {
            format!("SET {assignments} ")
        };
        // MERGE collapses duplicate (source, target, type) edges.
        let statement = format!(
            "MATCH (a:{source_label} {{id: $source_id}}) \
             MATCH (b:{target_label} {{id: $target_id}}) \
             MERGE (a)-[r:{rel_type}]->(b) {set}RETURN count(r) AS count"
        );
        self.run_rows(&statement, &params).await?;
        Ok(StoredRelationship {
            source_label,
            source_id: edge.source_id,
            target_label,
            target_id: edge.target_id,
            rel_type,
            props: edge.props,
        })
    }

    async fn find_relationships(
        &self,
        filter: RelationshipFilter,
    ) -> Result<Vec<StoredRelationship>> {
        let rel = match &filter.rel_type {
            Some(t) => format!("[r:{}]", check_identifier(t)?),
            None => "[r]".to_string(),
        };
        let mut clauses = Vec::new();
        let mut params = Properties::new();
        if let Some(source) = &filter.source_id {
            clauses.push("a.id = $source_id".to_string());
            params.insert("source_id".into(), Value::String(source.clone()));
        }
        if let Some(target) = &filter.target_id {
            clauses.push("b.id = $target_id".to_string());
            params.insert("target_id".into(), Value::String(target.clone()));
        }
        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {} ", clauses.join(" AND "))
        };
        let statement = format!(
            "MATCH (a)-{rel}->(b) {where_clause}\
             RETURN a.id AS source_id, head(labels(a)) AS source_label, \
                    b.id AS target_id, head(labels(b)) AS target_label, \
                    type(r) AS rel_type, properties(r) AS props \
             LIMIT {}",
            filter.limit
        );

        let mut q = query(&statement);
        for (key, value) in &params {
            q = bind_param(q, key, value);
        }
        let mut stream = self
            .graph
            .execute(q)
            .await
            .map_err(|e| FabricError::BackendUnavailable(e.to_string()))?;
        let mut rels = Vec::new();
        while let Ok(Some(row)) = stream.next().await {
            let get = |key: &str| row.get::<String>(key).unwrap_or_default();
            let props = row
                .get::<String>("props")
                .and_then(|raw| serde_json::from_str(&raw).ok())
                .unwrap_or_default();
            rels.push(StoredRelationship {
                source_label: get("source_label"),
                source_id: get("source_id"),
                target_label: get("target_label"),
                target_id: get("target_id"),
                rel_type: get("rel_type"),
                props,
            });
        }
        Ok(rels)
    }

    async fn update_relationship(
        &self,
        source_id: &str,
        target_id: &str,
        rel_type: &str,
        patch: Properties,
    ) -> Result<bool> {
        let rel_type = check_identifier(rel_type)?;
        let (assignments, mut params) = set_clause("r", &patch);
        params.insert("source_id".into(), Value::String(source_id.to_string()));
        params.insert("target_id".into(), Value::String(target_id.to_string()));
        let statement = format!(
            "MATCH (a {{id: $source_id}})-[r:{rel_type}]->(b {{id: $target_id}}) \
             SET {assignments} RETURN count(r) AS count"
        );
        let rows = self.run_rows(&statement, &params).await?;
        Ok(rows
            .first()
            .and_then(|row| row.get("count"))
            .and_then(Value::as_u64)
            .unwrap_or(0)
            > 0)
    }

    async fn delete_relationships(
        &self,
        source_id: &str,
        target_id: &str,
        rel_type: Option<&str>,
    ) -> Result<usize> {
        let rel = match rel_type {
            Some(t) => format!("[r:{}]", check_identifier(t)?),
            None => "[r]".to_string(),
        };
        let mut params = Properties::new();
        params.insert("source_id".into(), Value::String(source_id.to_string()));
        params.insert("target_id".into(), Value::String(target_id.to_string()));
        let statement = format!(
            "MATCH (a {{id: $source_id}})-{rel}->(b {{id: $target_id}}) \
             DELETE r RETURN count(r) AS deleted"
        );
        let rows = self.run_rows(&statement, &params).await?;
        Ok(rows
            .first()
            .and_then(|row| row.get("deleted"))
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize)
    }

    async fn run_batch(&self, ops: Vec<BatchOp>) -> Result<()> {
        // One explicit transaction: commit on success, roll back on the
        // first failing statement.
        let mut statements: Vec<Query> = Vec::with_capacity(ops.len());
        for op in ops {
            let (statement, params) = match op {
                BatchOp::CreateNode { label, props } => {
                    let label = check_identifier(&label)?.to_string();
                    let (pattern, params) = property_pattern(&props);
                    (format!("CREATE (n:{label} {{{pattern}}})"), params)
                }
                BatchOp::UpdateNode { label, id, patch } => {
                    let label = check_identifier(&label)?.to_string();
                    let (assignments, mut params) = set_clause("n", &patch);
                    params.insert("id".into(), Value::String(id));
                    (
                        format!("MATCH (n:{label} {{id: $id}}) SET {assignments}"),
                        params,
                    )
                }
                BatchOp::DeleteNode { label, id } => {
                    let label = check_identifier(&label)?.to_string();
                    let mut params = Properties::new();
                    params.insert("id".into(), Value::String(id));
                    (
                        format!("MATCH (n:{label} {{id: $id}}) DETACH DELETE n"),
                        params,
                    )
                }
                BatchOp::CreateRelationship(edge) => {
                    let source_label = check_identifier(&edge.source_label)?.to_string();
                    let target_label = check_identifier(&edge.target_label)?.to_string();
                    let rel_type = check_identifier(&edge.rel_type)?.to_string();
                    let (assignments, mut params) = set_clause("r", &edge.props);
                    params.insert("source_id".into(), Value::String(edge.source_id));
                    params.insert("target_id".into(), Value::String(edge.target_id));
                    let set = if assignments.is_empty() {
                        String::new()
                    } else {
                        format!(" SET {assignments}")
                    };
                    (
                        format!(
                            "MATCH (a:{source_label} {{id: $source_id}}) \
                             MATCH (b:{target_label} {{id: $target_id}}) \
                             MERGE (a)-[r:{rel_type}]->(b){set}"
                        ),
                        params,
                    )
                }
            };
            let mut q = query(&statement);
            for (key, value) in &params {
                q = bind_param(q, key, value);
            }
            statements.push(q);
        }

        let mut txn = self
            .graph
            .start_txn()
            .await
            .map_err(|e| FabricError::BackendUnavailable(e.to_string()))?;
        if let Err(e) = txn.run_queries(statements).await {
            let _ = txn.rollback().await;
            return Err(FabricError::Query {
                statement: "<batch>".to_string(),
                message: e.to_string(),
            });
        }
        txn.commit()
            .await
            .map_err(|e| FabricError::BackendUnavailable(e.to_string()))
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
        let label = check_identifier(label)?;
        let rel_type = check_identifier(rel_type)?;
        let other_label = check_identifier(other_label)?;
        let mut params = Properties::new();
        params.insert("other_id".into(), Value::String(other_id.to_string()));
        let statement = match direction {
            Direction::Outgoing => format!(
                "MATCH (n:{label})-[:{rel_type}]->(o:{other_label} {{id: $other_id}}) \
                 RETURN n ORDER BY n.created_at LIMIT {limit}"
            ),
            Direction::Incoming => format!(
                "MATCH (o:{other_label} {{id: $other_id}})-[:{rel_type}]->(n:{label}) \
                 RETURN n ORDER BY n.created_at LIMIT {limit}"
            ),
        };
        self.run_rows(&statement, &params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_check() {
        assert!(check_identifier("Component").is_ok());
        assert!(check_identifier("DEPENDS_ON").is_ok());
        assert!(check_identifier("bad-label").is_err());
        assert!(check_identifier("n) DETACH DELETE (m").is_err());
        assert!(check_identifier("").is_err());
    }

    #[test]
    fn test_property_pattern_parameterizes_values() {
        let mut props = Properties::new();
        props.insert("name".into(), Value::String("x".into()));
        props.insert("weight".into(), Value::from(2));
        let (pattern, params) = property_pattern(&props);
        assert!(pattern.contains("`name`: $p0"));
        assert!(pattern.contains("`weight`: $p1"));
        assert_eq!(params.len(), 2);
    }
}
