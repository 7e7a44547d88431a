// Copyright (c) 2026 Loom Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Dual knowledge manager: the coexistence of per-agent local graphs and
//! the shared global graph.
//!
//! Managed KGs, synchronization rules, schema mappings, and knowledge
//! policies are registered declaratively and persisted as nodes in the
//! meta-graph (which lives in the shared layer), with `SYNCS_TO`,
//! `APPLIES_TO`, `MAPS_BETWEEN`, and `GOVERNS` edges to the graphs they
//! touch. `synchronize` runs one rule: policy gate, mapping, upsert with
//! per-field last-writer-wins, relationship carry-over with deferral.

use std::collections::HashMap;
use std::sync::{Arc, RwLock as StdRwLock};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::event_processor::EventProcessor;
use crate::domain::schema::{NodeLabel, RelationshipType, SchemaRegistry};
use crate::domain::{
    FabricEvent, KgKind, KnowledgePolicy, ManagedKg, PolicyKind, Properties, SchemaMapping,
    SyncDirection, SyncReport, SyncResult, SyncRule,
};
use crate::error::{FabricError, Result};
use crate::infrastructure::graph::{EdgeSpec, GraphStore, RelationshipFilter};
use crate::infrastructure::pool::GraphPool;

/// Builds the backend for a managed KG that has no explicit binding.
pub type StoreFactory = Arc<dyn Fn(&str) -> Result<Arc<dyn GraphStore>> + Send + Sync>;

/// A rule bound to its source and target graphs.
#[derive(Clone)]
pub struct RegisteredRule {
    pub rule: SyncRule,
    pub source: String,
    pub target: String,
}

#[derive(Clone)]
struct RegisteredMapping {
    mapping: SchemaMapping,
    source: String,
    target: String,
}

#[derive(Clone)]
struct RegisteredPolicy {
    policy: KnowledgePolicy,
    kgs: Vec<String>,
}

#[derive(Clone)]
struct ManagedGraph {
    kg: ManagedKg,
    pool: GraphPool,
}

struct DkmInner {
    registry: Arc<SchemaRegistry>,
    /// The shared layer hosts the meta-graph
    meta: GraphPool,
    factory: StoreFactory,
    pool_size: usize,
    pool_wait: std::time::Duration,
    kgs: StdRwLock<HashMap<String, ManagedGraph>>,
    rules: StdRwLock<HashMap<String, RegisteredRule>>,
    mappings: StdRwLock<Vec<RegisteredMapping>>,
    policies: StdRwLock<Vec<RegisteredPolicy>>,
    events: StdRwLock<Option<EventProcessor>>,
}

/// Governs knowledge movement between managed graphs.
#[derive(Clone)]
pub struct DualKnowledgeManager {
    inner: Arc<DkmInner>,
}

impl DualKnowledgeManager {
    pub fn new(
        registry: Arc<SchemaRegistry>,
        meta: GraphPool,
        factory: StoreFactory,
        pool_size: usize,
        pool_wait: std::time::Duration,
    ) -> Self {
        Self {
            inner: Arc::new(DkmInner {
                registry,
                meta,
                factory,
                pool_size,
                pool_wait,
                kgs: StdRwLock::new(HashMap::new()),
                rules: StdRwLock::new(HashMap::new()),
                mappings: StdRwLock::new(Vec::new()),
                policies: StdRwLock::new(Vec::new()),
                events: StdRwLock::new(None),
            }),
        }
    }

    /// Wire the event pipeline so sync activity is observable.
    pub fn attach_events(&self, processor: EventProcessor) {
        *self.inner.events.write().expect("events lock poisoned") = Some(processor);
    }

    /// Register a managed KG backed by an existing pool. Idempotent under
    /// the name.
    pub async fn bind_managed_kg(
        &self,
        name: &str,
        kind: KgKind,
        description: Option<String>,
        pool: GraphPool,
    ) -> Result<ManagedKg> {
        {
            let kgs = self.inner.kgs.read().expect("kgs lock poisoned");
            if let Some(existing) = kgs.get(name) {
                return Ok(existing.kg.clone());
            }
        }
        let kg = ManagedKg::new(name, kind, description);
        let props = match serde_json::to_value(&kg)? {
            Value::Object(map) => map,
            _ => return Err(FabricError::Internal("managed kg serialized oddly".into())),
        };
        self.inner
            .registry
            .validate(NodeLabel::ManagedKg.as_str(), &props)?;
        self.upsert_meta_node(NodeLabel::ManagedKg, name, props).await?;

        let mut kgs = self.inner.kgs.write().expect("kgs lock poisoned");
        let entry = kgs.entry(name.to_string()).or_insert(ManagedGraph {
            kg: kg.clone(),
            pool,
        });
        info!(kg = name, kind = kind.as_str(), "managed kg registered");
        Ok(entry.kg.clone())
    }

    /// Create (or return) a managed KG, building its backend through the
    /// store factory.
    pub async fn create_managed_kg(
        &self,
        name: &str,
        kind: KgKind,
        description: Option<String>,
    ) -> Result<ManagedKg> {
        {
            let kgs = self.inner.kgs.read().expect("kgs lock poisoned");
            if let Some(existing) = kgs.get(name) {
                return Ok(existing.kg.clone());
            }
        }
        let store = (self.inner.factory)(name)?;
        store
            .apply_constraints(&self.inner.registry.constraint_specs())
            .await?;
        let pool = GraphPool::new(store, self.inner.pool_size, self.inner.pool_wait);
        self.bind_managed_kg(name, kind, description, pool).await
    }

    pub fn managed_kg(&self, name: &str) -> Option<ManagedKg> {
        let kgs = self.inner.kgs.read().expect("kgs lock poisoned");
        kgs.get(name).map(|entry| entry.kg.clone())
    }

    pub fn kg_pool(&self, name: &str) -> Result<GraphPool> {
        let kgs = self.inner.kgs.read().expect("kgs lock poisoned");
        kgs.get(name)
            .map(|entry| entry.pool.clone())
            .ok_or_else(|| FabricError::EntityNotFound {
                label: NodeLabel::ManagedKg.as_str().to_string(),
                id: name.to_string(),
            })
    }

    /// Register a rule binding `source` to `target`. Both graphs must
    /// already be managed.
    pub async fn register_rule(&self, rule: SyncRule, source: &str, target: &str) -> Result<()> {
        self.kg_pool(source)?;
        self.kg_pool(target)?;

        let spec = serde_json::to_string(&rule)?;
        let node_id = self
            .upsert_meta_spec(NodeLabel::SynchronizationRule, &rule.name, &spec)
            .await?;
        self.link_meta(NodeLabel::SynchronizationRule, &node_id, RelationshipType::AppliesTo, source)
            .await?;
        self.link_meta(NodeLabel::SynchronizationRule, &node_id, RelationshipType::AppliesTo, target)
            .await?;
        self.link_kgs(source, target).await?;

        info!(rule = %rule.name, source, target, "synchronization rule registered");
        let mut rules = self.inner.rules.write().expect("rules lock poisoned");
        rules.insert(
            rule.name.clone(),
            RegisteredRule {
                rule,
                source: source.to_string(),
                target: target.to_string(),
            },
        );
        Ok(())
    }

    pub async fn register_mapping(
        &self,
        mapping: SchemaMapping,
        source: &str,
        target: &str,
    ) -> Result<()> {
        self.kg_pool(source)?;
        self.kg_pool(target)?;

        let spec = serde_json::to_string(&mapping)?;
        let node_id = self
            .upsert_meta_spec(NodeLabel::SchemaMapping, &mapping.name, &spec)
            .await?;
        self.link_meta(NodeLabel::SchemaMapping, &node_id, RelationshipType::MapsBetween, source)
            .await?;
        self.link_meta(NodeLabel::SchemaMapping, &node_id, RelationshipType::MapsBetween, target)
            .await?;

        let mut mappings = self.inner.mappings.write().expect("mappings lock poisoned");
        mappings.push(RegisteredMapping {
            mapping,
            source: source.to_string(),
            target: target.to_string(),
        });
        Ok(())
    }

    pub async fn register_policy(&self, policy: KnowledgePolicy, kgs: &[&str]) -> Result<()> {
        for kg in kgs {
            self.kg_pool(kg)?;
        }
        let spec = serde_json::to_string(&policy)?;
        let node_id = self
            .upsert_meta_spec(NodeLabel::KnowledgePolicy, &policy.name, &spec)
            .await?;
        for kg in kgs {
            self.link_meta(NodeLabel::KnowledgePolicy, &node_id, RelationshipType::Governs, kg)
                .await?;
        }

        let mut policies = self.inner.policies.write().expect("policies lock poisoned");
        policies.push(RegisteredPolicy {
            policy,
            kgs: kgs.iter().map(|s| s.to_string()).collect(),
        });
        Ok(())
    }

    pub fn rule(&self, name: &str) -> Option<RegisteredRule> {
        let rules = self.inner.rules.read().expect("rules lock poisoned");
        rules.get(name).cloned()
    }

    pub fn rules(&self) -> Vec<RegisteredRule> {
        let rules = self.inner.rules.read().expect("rules lock poisoned");
        rules.values().cloned().collect()
    }

    /// Evaluate access policies for a read of `label` out of `kg`.
    /// Returns the veto-ing policy name, if any.
    pub fn access_veto(&self, kg: &str, label: &str, props: &Properties) -> Option<String> {
        let policies = self.inner.policies.read().expect("policies lock poisoned");
        policies
            .iter()
            .find(|registered| {
                registered.policy.kind == PolicyKind::Access
                    && registered.kgs.iter().any(|g| g == kg)
                    && registered.policy.vetoes(label, props)
            })
            .map(|registered| registered.policy.name.clone())
    }

    /// Read one node out of a managed graph, under the access policies
    /// governing it. A vetoed node reads back as absent.
    pub async fn read_node(&self, kg: &str, label: &str, id: &str) -> Result<Option<Properties>> {
        let pool = self.kg_pool(kg)?;
        let graph = pool.acquire().await?;
        let Some(props) = graph.find_node(label, id).await? else {
            return Ok(None);
        };
        drop(graph);
        if let Some(policy) = self.access_veto(kg, label, &props) {
            debug!(kg, label, id, policy = %policy, "read vetoed by access policy");
            return Ok(None);
        }
        Ok(Some(props))
    }

    /// Read a page of nodes of one label out of a managed graph, with
    /// vetoed nodes filtered out.
    pub async fn read_all(
        &self,
        kg: &str,
        label: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Properties>> {
        let pool = self.kg_pool(kg)?;
        let graph = pool.acquire().await?;
        let rows = graph.find_all(label, limit, offset).await?;
        drop(graph);
        Ok(rows
            .into_iter()
            .filter(|props| {
                match self.access_veto(kg, label, props) {
                    Some(policy) => {
                        debug!(kg, label, policy = %policy, "node withheld by access policy");
                        false
                    }
                    None => true,
                }
            })
            .collect())
    }

    /// Run a rule between two managed graphs. With `items` set, only those
    /// ids are considered; otherwise the rule's filter selects candidates
    /// from the whole source graph. Bidirectional rules run local→global
    /// first.
    pub async fn synchronize(
        &self,
        source: &str,
        target: &str,
        rule_name: &str,
        items: Option<&[String]>,
        cancel: &CancellationToken,
    ) -> Result<SyncReport> {
        let registered = self.rule(rule_name).ok_or_else(|| FabricError::EntityNotFound {
            label: NodeLabel::SynchronizationRule.as_str().to_string(),
            id: rule_name.to_string(),
        })?;
        let rule = registered.rule.clone();

        let passes: Vec<(String, String)> = match rule.direction {
            SyncDirection::LocalToGlobal | SyncDirection::GlobalToLocal => {
                vec![(source.to_string(), target.to_string())]
            }
            SyncDirection::Bidirectional => {
                // Deterministic order: the local side pushes first.
                let source_is_local = self
                    .managed_kg(source)
                    .map(|kg| kg.kind == KgKind::Local)
                    .unwrap_or(true);
                if source_is_local {
                    vec![
                        (source.to_string(), target.to_string()),
                        (target.to_string(), source.to_string()),
                    ]
                } else {
                    vec![
                        (target.to_string(), source.to_string()),
                        (source.to_string(), target.to_string()),
                    ]
                }
            }
        };

        let started = std::time::Instant::now();
        let mut total = SyncReport::started(rule_name, source, target);
        for (pass_source, pass_target) in passes {
            let report = self
                .sync_pass(&rule, &pass_source, &pass_target, items, cancel)
                .await?;
            total.absorb(&report);
            if cancel.is_cancelled() {
                break;
            }
        }
        total.duration_ms = started.elapsed().as_millis() as u64;
        Ok(total)
    }

    async fn sync_pass(
        &self,
        rule: &SyncRule,
        source: &str,
        target: &str,
        items: Option<&[String]>,
        cancel: &CancellationToken,
    ) -> Result<SyncReport> {
        let source_pool = self.kg_pool(source)?;
        let target_pool = self.kg_pool(target)?;
        let mut report = SyncReport::started(&rule.name, source, target);

        let labels: Vec<String> = self
            .inner
            .registry
            .node_labels()
            .into_iter()
            .filter(|label| rule.filter.label_matches(label))
            .collect();

        let sharing_policies: Vec<KnowledgePolicy> = {
            let policies = self.inner.policies.read().expect("policies lock poisoned");
            policies
                .iter()
                .filter(|registered| {
                    registered.policy.kind == PolicyKind::Sharing
                        && registered
                            .kgs
                            .iter()
                            .any(|kg| kg == source || kg == target)
                })
                .map(|registered| registered.policy.clone())
                .collect()
        };

        let src = source_pool.acquire().await?;
        let tgt = target_pool.acquire().await?;

        for label in labels {
            let candidates: Vec<Properties> = match items {
                Some(ids) => {
                    let mut found = Vec::new();
                    for id in ids {
                        if let Some(props) = src.find_node(&label, id).await? {
                            found.push(props);
                        }
                    }
                    found
                }
                None => src
                    .find_all(&label, usize::MAX, 0)
                    .await?
                    .into_iter()
                    .filter(|props| rule.filter.node_matches(props))
                    .collect(),
            };

            for props in candidates {
                if cancel.is_cancelled() {
                    report.result = SyncResult::Partial;
                    self.emit_sync_event(
                        "synchronization.cancelled",
                        &rule.name,
                        source,
                        target,
                        &label,
                        None,
                    )
                    .await;
                    return Ok(report);
                }
                report.items_considered += 1;

                if let Some(policy) = sharing_policies
                    .iter()
                    .find(|policy| policy.vetoes(&label, &props))
                {
                    debug!(
                        rule = %rule.name,
                        policy = %policy.name,
                        label = %label,
                        "candidate skipped: policy_veto"
                    );
                    report.items_vetoed += 1;
                    continue;
                }

                let mapping = self.mapping_for(source, target, &label);
                let mapped = mapping.apply(&props);
                let target_label = mapping.target_label.clone();
                let Some(id) = mapped.get("id").and_then(Value::as_str).map(str::to_string)
                else {
                    report.result = SyncResult::Partial;
                    report.last_error = Some(format!("{label} candidate without id"));
                    continue;
                };

                let applied = match tgt.find_node(&target_label, &id).await? {
                    None => {
                        tgt.create_node(&target_label, mapped.clone()).await?;
                        true
                    }
                    Some(existing) => {
                        let patch =
                            lww_patch(&mapped, &existing, &mapping.immutable);
                        if patch.is_empty() {
                            false
                        } else {
                            tgt.update_node(&target_label, &id, patch).await?;
                            true
                        }
                    }
                };

                if applied {
                    report.items_applied += 1;
                    self.emit_sync_event(
                        "knowledge.synchronized",
                        &rule.name,
                        source,
                        target,
                        &target_label,
                        Some(&id),
                    )
                    .await;
                }

                // Carry relationships whose endpoints both exist in the
                // target; the rest wait for their endpoint's label to sync.
                let mut filter = RelationshipFilter::from_source(&id);
                filter.limit = usize::MAX;
                for edge in src.find_relationships(filter).await? {
                    let endpoint_label = if edge.target_label == label {
                        target_label.clone()
                    } else {
                        edge.target_label.clone()
                    };
                    let endpoint_exists = tgt
                        .find_node(&endpoint_label, &edge.target_id)
                        .await?
                        .is_some();
                    if !endpoint_exists {
                        report.items_deferred += 1;
                        continue;
                    }
                    tgt.create_relationship(EdgeSpec {
                        source_label: target_label.clone(),
                        source_id: id.clone(),
                        target_label: endpoint_label,
                        target_id: edge.target_id.clone(),
                        rel_type: edge.rel_type.clone(),
                        props: edge.props.clone(),
                    })
                    .await?;
                }
            }
        }
        Ok(report)
    }

    fn mapping_for(&self, source: &str, target: &str, label: &str) -> SchemaMapping {
        let mappings = self.inner.mappings.read().expect("mappings lock poisoned");
        mappings
            .iter()
            .find(|registered| {
                registered.source == source
                    && registered.target == target
                    && registered.mapping.source_label == label
            })
            .map(|registered| registered.mapping.clone())
            .unwrap_or_else(|| SchemaMapping::identity(label))
    }

    async fn emit_sync_event(
        &self,
        event_type: &str,
        rule: &str,
        source: &str,
        target: &str,
        label: &str,
        id: Option<&str>,
    ) {
        let processor = self.inner.events.read().expect("events lock poisoned").clone();
        let Some(processor) = processor else { return };
        let mut metadata = Properties::new();
        metadata.insert("rule".into(), Value::String(rule.to_string()));
        metadata.insert("source".into(), Value::String(source.to_string()));
        metadata.insert("target".into(), Value::String(target.to_string()));
        metadata.insert("label".into(), Value::String(label.to_string()));
        let mut event = FabricEvent::new(event_type, "dual-knowledge-manager", metadata);
        if let Some(id) = id {
            event = event.with_related(vec![crate::domain::NodeRef::new(label, id)]);
        }
        if let Err(e) = processor.log(event).await {
            warn!(error = %e, event_type, "failed to emit sync event");
        }
    }

    /// Create or refresh a meta node carrying a JSON `spec`.
    async fn upsert_meta_spec(&self, label: NodeLabel, name: &str, spec: &str) -> Result<String> {
        let mut props = Properties::new();
        props.insert("name".into(), Value::String(name.to_string()));
        props.insert("spec".into(), Value::String(spec.to_string()));
        self.upsert_meta_node(label, name, props).await
    }

    async fn upsert_meta_node(
        &self,
        label: NodeLabel,
        name: &str,
        mut props: Properties,
    ) -> Result<String> {
        let graph = self.inner.meta.acquire().await?;
        let existing = graph
            .find_by_property(label.as_str(), "name", &Value::String(name.to_string()), 1)
            .await?;
        if let Some(found) = existing.into_iter().next() {
            let id = found
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            props.remove("id");
            props.insert("updated_at".into(), Value::String(Utc::now().to_rfc3339()));
            graph.update_node(label.as_str(), &id, props).await?;
            return Ok(id);
        }

        let now = Utc::now().to_rfc3339();
        let id = props
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(crate::domain::entity::new_id);
        props.insert("id".into(), Value::String(id.clone()));
        props
            .entry("created_at".to_string())
            .or_insert_with(|| Value::String(now.clone()));
        props
            .entry("updated_at".to_string())
            .or_insert_with(|| Value::String(now));
        graph.create_node(label.as_str(), props).await?;
        Ok(id)
    }

    async fn link_meta(
        &self,
        source_label: NodeLabel,
        source_id: &str,
        rel_type: RelationshipType,
        kg_name: &str,
    ) -> Result<()> {
        let graph = self.inner.meta.acquire().await?;
        let kg_node = graph
            .find_by_property(
                NodeLabel::ManagedKg.as_str(),
                "name",
                &Value::String(kg_name.to_string()),
                1,
            )
            .await?;
        let Some(kg_id) = kg_node
            .first()
            .and_then(|props| props.get("id"))
            .and_then(Value::as_str)
        else {
            return Ok(());
        };
        let mut props = Properties::new();
        props.insert("created_at".into(), Value::String(Utc::now().to_rfc3339()));
        graph
            .create_relationship(EdgeSpec {
                source_label: source_label.as_str().to_string(),
                source_id: source_id.to_string(),
                target_label: NodeLabel::ManagedKg.as_str().to_string(),
                target_id: kg_id.to_string(),
                rel_type: rel_type.as_str().to_string(),
                props,
            })
            .await?;
        Ok(())
    }

    async fn link_kgs(&self, source: &str, target: &str) -> Result<()> {
        let graph = self.inner.meta.acquire().await?;
        let source_node = graph
            .find_by_property(
                NodeLabel::ManagedKg.as_str(),
                "name",
                &Value::String(source.to_string()),
                1,
            )
            .await?;
        let target_node = graph
            .find_by_property(
                NodeLabel::ManagedKg.as_str(),
                "name",
                &Value::String(target.to_string()),
                1,
            )
            .await?;
        let (Some(source_id), Some(target_id)) = (
            source_node.first().and_then(|p| p.get("id")).and_then(Value::as_str),
            target_node.first().and_then(|p| p.get("id")).and_then(Value::as_str),
        ) else {
            return Ok(());
        };
        let mut props = Properties::new();
        props.insert("created_at".into(), Value::String(Utc::now().to_rfc3339()));
        graph
            .create_relationship(EdgeSpec {
                source_label: NodeLabel::ManagedKg.as_str().to_string(),
                source_id: source_id.to_string(),
                target_label: NodeLabel::ManagedKg.as_str().to_string(),
                target_id: target_id.to_string(),
                rel_type: RelationshipType::SyncsTo.as_str().to_string(),
                props,
            })
            .await?;
        Ok(())
    }
}

/// Per-field last-writer-wins: fields absent in the target are added;
/// conflicting fields follow the newer `updated_at`; the id and fields the
/// mapping marks immutable never move.
fn lww_patch(mapped: &Properties, existing: &Properties, immutable: &[String]) -> Properties {
    let source_newer = match (timestamp_of(mapped), timestamp_of(existing)) {
        (Some(source), Some(target)) => source > target,
        _ => true,
    };
    let mut patch = Properties::new();
    for (key, value) in mapped {
        if key == "id" || immutable.iter().any(|field| field == key) {
            continue;
        }
        match existing.get(key) {
            None => {
                patch.insert(key.clone(), value.clone());
            }
            Some(old) if old != value && source_newer => {
                patch.insert(key.clone(), value.clone());
            }
            _ => {}
        }
    }
    patch
}

fn timestamp_of(props: &Properties) -> Option<DateTime<Utc>> {
    props
        .get("updated_at")
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|t| t.with_timezone(&Utc))
}
