// Copyright (c) 2026 Loom Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Associative memory over Memory nodes in the graph.
//!
//! Recall by context ranks candidates with a weighted sum of context match,
//! time-decayed importance, and semantic similarity. Decay is applied
//! lazily while scoring; the periodic decay pass is the only writer of
//! stored importance, and it prunes records that fall below the threshold.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use crate::application::event_log::EventLog;
use crate::config::MemoryConfig;
use crate::domain::memory::{context_match, semantic_similarity};
use crate::domain::schema::{NodeLabel, RelationshipType, SchemaRegistry};
use crate::domain::{FabricEvent, MemoryRecord, MemoryType, Properties};
use crate::error::{FabricError, Result};
use crate::infrastructure::embedding::EmbeddingProvider;
use crate::infrastructure::graph::{EdgeSpec, RelationshipFilter};
use crate::infrastructure::pool::GraphPool;

/// Aggregate view of the memory population.
#[derive(Debug, Clone)]
pub struct MemoryStats {
    pub total: u64,
    pub avg_importance: f64,
    pub avg_access_count: f64,
    pub by_type: HashMap<String, u64>,
}

/// Context-tagged memory store for agents.
pub struct AssociativeMemory {
    pool: GraphPool,
    registry: Arc<SchemaRegistry>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    config: MemoryConfig,
    event_log: Option<EventLog>,
}

impl AssociativeMemory {
    pub fn new(
        pool: GraphPool,
        registry: Arc<SchemaRegistry>,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
        config: MemoryConfig,
    ) -> Self {
        Self {
            pool,
            registry,
            embedder,
            config,
            event_log: None,
        }
    }

    /// Leave a persisted system-event trail for memory operations.
    pub fn with_event_log(mut self, log: EventLog) -> Self {
        self.event_log = Some(log);
        self
    }

    /// Persist a new memory and return its id.
    pub async fn store(
        &self,
        content: Value,
        context: Properties,
        memory_type: MemoryType,
        importance: Option<f64>,
    ) -> Result<String> {
        let importance = importance.unwrap_or(0.5);
        if !(0.0..=1.0).contains(&importance) {
            return Err(FabricError::validation(format!(
                "importance must be within [0, 1], got {importance}"
            )));
        }

        let mut record = MemoryRecord::new(content, context, memory_type, importance);
        if let Some(embedder) = &self.embedder {
            record.embedding = Some(embedder.embed(&record.canonical_text()).await?);
        }

        let props = record.to_properties()?;
        self.registry.validate(NodeLabel::Memory.as_str(), &props)?;
        let graph = self.pool.acquire().await?;
        graph.create_node(NodeLabel::Memory.as_str(), props).await?;
        drop(graph);

        self.trail(
            "memory_created",
            serde_json::json!({
                "memory_id": record.id,
                "memory_type": record.memory_type.as_str(),
                "importance": importance,
            }),
        )
        .await;
        Ok(record.id)
    }

    /// Fetch one memory, updating its access bookkeeping.
    pub async fn recall_by_id(&self, id: &str) -> Result<Option<MemoryRecord>> {
        let graph = self.pool.acquire().await?;
        let Some(props) = graph.find_node(NodeLabel::Memory.as_str(), id).await? else {
            return Ok(None);
        };
        drop(graph);
        let mut record = MemoryRecord::from_properties(&props)?;
        record.touch();
        self.persist_access(&record).await?;
        Ok(Some(record))
    }

    /// Memories matching the context query, best first. A candidate must
    /// share at least one context key with the query to appear at all; the
    /// ranking then blends context match, decayed importance, and semantic
    /// similarity with the configured weights.
    pub async fn recall_by_context(
        &self,
        query: &Properties,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>> {
        let candidates = self.scan().await?;
        let now = Utc::now();
        let weights = self.config.weights;

        let query_embedding = match (&self.embedder, weights.gamma > 0.0) {
            (Some(embedder), true) => {
                let text = crate::domain::memory::canonical_text(&Value::Null, query);
                Some(embedder.embed(&text).await?)
            }
            _ => None,
        };

        let mut scored: Vec<(MemoryRecord, f64)> = Vec::new();
        for record in candidates {
            let context_score = context_match(query, &record.context);
            if context_score <= 0.0 {
                continue;
            }
            let semantic = match (&query_embedding, &record.embedding) {
                (Some(a), Some(b)) => semantic_similarity(a, b),
                _ => 0.0,
            };
            let score = weights.alpha * context_score
                + weights.beta * record.importance_now(now, self.config.decay_lambda)
                + weights.gamma * semantic;
            scored.push((record, score));
        }
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);

        let mut results = Vec::with_capacity(scored.len());
        for (mut record, score) in scored {
            debug!(memory_id = %record.id, score, "context recall hit");
            record.touch();
            self.persist_access(&record).await?;
            results.push(record);
        }
        Ok(results)
    }

    /// Memories of one type, most recent first.
    pub async fn recall_by_type(
        &self,
        memory_type: MemoryType,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>> {
        let graph = self.pool.acquire().await?;
        let rows = graph
            .find_by_property(
                NodeLabel::Memory.as_str(),
                "memory_type",
                &Value::String(memory_type.as_str().to_string()),
                usize::MAX,
            )
            .await?;
        drop(graph);
        let mut records = rows
            .iter()
            .map(MemoryRecord::from_properties)
            .collect::<Result<Vec<_>>>()?;
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        records.truncate(limit);
        for record in &mut records {
            record.touch();
            self.persist_access(record).await?;
        }
        Ok(records)
    }

    /// Memories created inside a time window, most recent first.
    pub async fn recall_by_time(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>> {
        let mut records: Vec<MemoryRecord> = self
            .scan()
            .await?
            .into_iter()
            .filter(|record| record.timestamp >= start && record.timestamp <= end)
            .collect();
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        records.truncate(limit);
        for record in &mut records {
            record.touch();
            self.persist_access(record).await?;
        }
        Ok(records)
    }

    /// Memories reachable from `id` along association edges, up to `depth`
    /// hops, nearest first.
    pub async fn recall_associations(&self, id: &str, depth: usize) -> Result<Vec<MemoryRecord>> {
        let graph = self.pool.acquire().await?;
        let mut visited: HashSet<String> = HashSet::from([id.to_string()]);
        let mut frontier: VecDeque<(String, usize)> = VecDeque::from([(id.to_string(), 0)]);
        let mut found: Vec<String> = Vec::new();

        while let Some((current, hops)) = frontier.pop_front() {
            if hops >= depth {
                continue;
            }
            let mut filter = RelationshipFilter::from_source(&current);
            filter.rel_type = Some(RelationshipType::RelatedTo.as_str().to_string());
            filter.limit = usize::MAX;
            for edge in graph.find_relationships(filter).await? {
                if edge.target_label == NodeLabel::Memory.as_str()
                    && visited.insert(edge.target_id.clone())
                {
                    found.push(edge.target_id.clone());
                    frontier.push_back((edge.target_id, hops + 1));
                }
            }
        }
        drop(graph);

        let mut records = Vec::with_capacity(found.len());
        for memory_id in found {
            if let Some(record) = self.recall_by_id(&memory_id).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Create or strengthen an association between two memories. Repeated
    /// calls keep the maximum strength seen.
    pub async fn associate(
        &self,
        source_id: &str,
        target_id: &str,
        relation: &str,
        strength: f64,
    ) -> Result<()> {
        if !(0.0..=1.0).contains(&strength) {
            return Err(FabricError::validation(format!(
                "association strength must be within [0, 1], got {strength}"
            )));
        }
        let graph = self.pool.acquire().await?;
        for id in [source_id, target_id] {
            if graph.find_node(NodeLabel::Memory.as_str(), id).await?.is_none() {
                return Err(FabricError::EntityNotFound {
                    label: NodeLabel::Memory.as_str().to_string(),
                    id: id.to_string(),
                });
            }
        }

        let existing = graph
            .find_relationships(RelationshipFilter::between(
                source_id,
                target_id,
                RelationshipType::RelatedTo.as_str(),
            ))
            .await?;

        let mut props = Properties::new();
        props.insert("relation".into(), Value::String(relation.to_string()));
        props.insert("created_at".into(), Value::String(Utc::now().to_rfc3339()));

        match existing.first() {
            Some(edge) => {
                let old = edge.props.get("strength").and_then(Value::as_f64).unwrap_or(0.0);
                let kept = old.max(strength);
                props.insert("strength".into(), number(kept));
                props.remove("created_at");
                graph
                    .update_relationship(
                        source_id,
                        target_id,
                        RelationshipType::RelatedTo.as_str(),
                        props,
                    )
                    .await?;
            }
            None => {
                props.insert("strength".into(), number(strength));
                graph
                    .create_relationship(EdgeSpec {
                        source_label: NodeLabel::Memory.as_str().to_string(),
                        source_id: source_id.to_string(),
                        target_label: NodeLabel::Memory.as_str().to_string(),
                        target_id: target_id.to_string(),
                        rel_type: RelationshipType::RelatedTo.as_str().to_string(),
                        props,
                    })
                    .await?;
            }
        }
        drop(graph);

        self.trail(
            "association_created",
            serde_json::json!({
                "source_id": source_id,
                "target_id": target_id,
                "relation": relation,
                "strength": strength,
            }),
        )
        .await;
        Ok(())
    }

    /// Apply decay to every stored memory, persisting the new importances
    /// and pruning records that fall below the threshold. Returns how many
    /// records changed.
    pub async fn decay_pass(&self, now: DateTime<Utc>) -> Result<usize> {
        let records = self.scan().await?;
        let mut changed = 0;
        for record in records {
            let decayed = record.importance_now(now, self.config.decay_lambda);
            if (record.importance - decayed).abs() <= 0.01 {
                continue;
            }
            changed += 1;
            if decayed < self.config.importance_threshold {
                self.prune(&record.id).await?;
                continue;
            }
            let mut patch = Properties::new();
            patch.insert("importance".into(), number(decayed));
            patch.insert("updated_at".into(), Value::String(now.to_rfc3339()));
            let graph = self.pool.acquire().await?;
            graph
                .update_node(NodeLabel::Memory.as_str(), &record.id, patch)
                .await?;
        }
        if changed > 0 {
            self.trail("memories_decayed", serde_json::json!({ "count": changed }))
                .await;
        }
        Ok(changed)
    }

    /// Remove a memory and its association edges.
    pub async fn prune(&self, id: &str) -> Result<bool> {
        let graph = self.pool.acquire().await?;
        let removed = graph.delete_node(NodeLabel::Memory.as_str(), id).await?;
        drop(graph);
        if removed {
            self.trail("memory_pruned", serde_json::json!({ "memory_id": id }))
                .await;
        }
        Ok(removed)
    }

    pub async fn stats(&self) -> Result<MemoryStats> {
        let records = self.scan().await?;
        let total = records.len() as u64;
        let mut by_type: HashMap<String, u64> = HashMap::new();
        let mut importance_sum = 0.0;
        let mut access_sum = 0.0;
        for record in &records {
            *by_type.entry(record.memory_type.as_str().to_string()).or_insert(0) += 1;
            importance_sum += record.importance;
            access_sum += record.access_count as f64;
        }
        Ok(MemoryStats {
            total,
            avg_importance: if total > 0 { importance_sum / total as f64 } else { 0.0 },
            avg_access_count: if total > 0 { access_sum / total as f64 } else { 0.0 },
            by_type,
        })
    }

    async fn scan(&self) -> Result<Vec<MemoryRecord>> {
        let graph = self.pool.acquire().await?;
        let rows = graph
            .find_all(NodeLabel::Memory.as_str(), self.config.scan_limit, 0)
            .await?;
        rows.iter().map(MemoryRecord::from_properties).collect()
    }

    /// `access_count` and `last_accessed` are the only fields an access
    /// mutates.
    async fn persist_access(&self, record: &MemoryRecord) -> Result<()> {
        let mut patch = Properties::new();
        patch.insert(
            "last_accessed".into(),
            Value::String(record.last_accessed.to_rfc3339()),
        );
        patch.insert("access_count".into(), Value::from(record.access_count));
        patch.insert(
            "updated_at".into(),
            Value::String(record.last_accessed.to_rfc3339()),
        );
        let graph = self.pool.acquire().await?;
        graph
            .update_node(NodeLabel::Memory.as_str(), &record.id, patch)
            .await?;
        Ok(())
    }

    async fn trail(&self, kind: &str, details: Value) {
        let Some(log) = &self.event_log else { return };
        let event = FabricEvent::system_event("associative-memory", kind, details);
        if let Err(e) = log.append(&event).await {
            warn!(error = %e, kind, "failed to record memory trail event");
        }
    }
}

fn number(value: f64) -> Value {
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or_else(|| Value::from(0))
}
