// Copyright (c) 2026 Loom Contributors
// SPDX-License-Identifier: AGPL-3.0

//! The knowledge fabric facade.
//!
//! Single entry point owning the lifetime of every subsystem: graph pools,
//! schema bootstrap, repositories, the event pipeline, associative memory,
//! and — when a shared graph is configured — the dual knowledge manager
//! and synchronizer. `start` either brings the full fabric up or fails
//! before any worker is launched; `stop` drains in reverse order.

use std::collections::HashMap;
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;

use serde_json::Value;
use tracing::{info, warn};

use crate::application::associative_memory::{AssociativeMemory, MemoryStats};
use crate::application::dual_knowledge::{DualKnowledgeManager, StoreFactory};
use crate::application::event_log::EventLog;
use crate::application::event_processor::{
    CorrelationRule, EventFilter, EventHandler, EventProcessor, ProcessorStats,
};
use crate::application::synchronizer::{RuleStatus, Synchronizer};
use crate::config::FabricConfig;
use crate::domain::schema::{SchemaExtension, SchemaRegistry};
use crate::domain::{
    AgentProfile, Component, Decision, DesignPattern, Domain, FabricEvent, Implementation,
    KgKind, Project, Requirement,
};
use crate::error::{FabricError, Result};
use crate::infrastructure::embedding::provider_from_config;
use crate::infrastructure::memory_store::MemoryGraphStore;
use crate::infrastructure::pool::GraphPool;
use crate::infrastructure::repository::{NodeRepository, RelationshipRepository};
use crate::infrastructure::{open_store, GraphStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Running,
    Stopped,
}

/// Aggregate view over the running fabric.
#[derive(Debug, Clone)]
pub struct FabricStatus {
    pub agent_id: String,
    pub running: bool,
    pub dual_mode: bool,
    pub events: ProcessorStats,
    pub memory: MemoryStats,
    pub sync: HashMap<String, RuleStatus>,
}

struct FabricState {
    config: FabricConfig,
    registry: Arc<SchemaRegistry>,
    individual: GraphPool,
    shared: Option<GraphPool>,
    domains: NodeRepository<Domain>,
    projects: NodeRepository<Project>,
    components: NodeRepository<Component>,
    requirements: NodeRepository<Requirement>,
    implementations: NodeRepository<Implementation>,
    patterns: NodeRepository<DesignPattern>,
    decisions: NodeRepository<Decision>,
    agents: NodeRepository<AgentProfile>,
    relationships: RelationshipRepository,
    event_log: EventLog,
    processor: EventProcessor,
    memory: Arc<AssociativeMemory>,
    dkm: Option<DualKnowledgeManager>,
    synchronizer: Option<Synchronizer>,
    lifecycle: StdRwLock<Lifecycle>,
}

/// The public entry point to the knowledge fabric.
#[derive(Clone)]
pub struct KnowledgeFabric {
    state: Arc<FabricState>,
}

impl KnowledgeFabric {
    /// Build the fabric from configuration. Opens the backends but starts
    /// no workers; call [`KnowledgeFabric::start`] next.
    pub async fn init(config: FabricConfig) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(SchemaRegistry::core());
        let pool_wait = Duration::from_millis(config.pool.wait_ms);

        let individual_store = open_store(&config.graph).await?;
        let individual = GraphPool::new(individual_store, config.pool.size, pool_wait);

        let shared = match &config.shared_graph {
            Some(shared_config) => {
                let store = open_store(shared_config).await?;
                Some(GraphPool::new(store, config.pool.size, pool_wait))
            }
            None => None,
        };

        let event_log = EventLog::new(individual.clone(), registry.clone());
        let processor = EventProcessor::new(event_log.clone(), &config.events);

        let embedder = provider_from_config(&config.embedding)?;
        let memory = Arc::new(
            AssociativeMemory::new(
                individual.clone(),
                registry.clone(),
                embedder,
                config.memory.clone(),
            )
            .with_event_log(event_log.clone()),
        );
        processor.attach_memory(memory.clone());

        // Dual mode only with a shared graph configured. The two layer
        // KGs are bound here so rules can be registered before `start`.
        let (dkm, synchronizer) = match &shared {
            Some(shared_pool) => {
                // Managed KGs beyond the two bound layers get embedded
                // slices; bolt-backed extras are bound explicitly through
                // `bind_managed_kg`.
                let factory: StoreFactory =
                    Arc::new(|_| Ok(Arc::new(MemoryGraphStore::new()) as Arc<dyn GraphStore>));
                let dkm = DualKnowledgeManager::new(
                    registry.clone(),
                    shared_pool.clone(),
                    factory,
                    config.pool.size,
                    pool_wait,
                );
                dkm.attach_events(processor.clone());
                dkm.bind_managed_kg(
                    &format!("local_{}", config.agent_id),
                    KgKind::Local,
                    Some(format!("individual graph of {}", config.agent_id)),
                    individual.clone(),
                )
                .await?;
                dkm.bind_managed_kg(
                    "global",
                    KgKind::Global,
                    Some("shared knowledge fabric".to_string()),
                    shared_pool.clone(),
                )
                .await?;
                let synchronizer = Synchronizer::new(dkm.clone(), &config.sync);
                synchronizer.attach_events(processor.clone());
                (Some(dkm), Some(synchronizer))
            }
            None => (None, None),
        };

        let state = FabricState {
            registry: registry.clone(),
            domains: NodeRepository::new(individual.clone(), registry.clone()),
            projects: NodeRepository::new(individual.clone(), registry.clone()),
            components: NodeRepository::new(individual.clone(), registry.clone()),
            requirements: NodeRepository::new(individual.clone(), registry.clone()),
            implementations: NodeRepository::new(individual.clone(), registry.clone()),
            patterns: NodeRepository::new(individual.clone(), registry.clone()),
            decisions: NodeRepository::new(individual.clone(), registry.clone()),
            agents: NodeRepository::new(individual.clone(), registry.clone()),
            relationships: RelationshipRepository::new(individual.clone(), registry.clone()),
            event_log,
            processor,
            memory,
            dkm,
            synchronizer,
            individual,
            shared,
            config,
            lifecycle: StdRwLock::new(Lifecycle::Created),
        };
        Ok(Self { state: Arc::new(state) })
    }

    /// Verify connectivity, install schema constraints, and launch the
    /// workers. Every fallible step runs before any worker starts, so a
    /// failed start leaves nothing running.
    pub async fn start(&self) -> Result<()> {
        {
            let lifecycle = self.state.lifecycle.read().expect("lifecycle lock poisoned");
            match *lifecycle {
                Lifecycle::Running => return Ok(()),
                Lifecycle::Stopped => {
                    return Err(FabricError::Configuration(
                        "a stopped fabric cannot be restarted".into(),
                    ))
                }
                Lifecycle::Created => {}
            }
        }

        let specs = self.state.registry.constraint_specs();
        self.state.individual.store().verify_connectivity().await?;
        self.state.individual.store().apply_constraints(&specs).await?;
        if let Some(shared) = &self.state.shared {
            shared.store().verify_connectivity().await?;
            shared.store().apply_constraints(&specs).await?;
        }

        self.state.processor.start();
        if let Some(synchronizer) = &self.state.synchronizer {
            synchronizer.start();
        }

        *self.state.lifecycle.write().expect("lifecycle lock poisoned") = Lifecycle::Running;
        info!(
            agent_id = %self.state.config.agent_id,
            dual_mode = self.state.shared.is_some(),
            "knowledge fabric started"
        );

        let started = FabricEvent::system_event(
            "knowledge-fabric",
            "started",
            serde_json::json!({
                "agent_id": self.state.config.agent_id,
                "dual_mode": self.state.shared.is_some(),
            }),
        );
        if let Err(e) = self.state.processor.log(started).await {
            warn!(error = %e, "failed to log startup event");
        }
        Ok(())
    }

    /// Drain and stop everything in reverse start order.
    pub async fn stop(&self) -> Result<()> {
        {
            let lifecycle = self.state.lifecycle.read().expect("lifecycle lock poisoned");
            if *lifecycle != Lifecycle::Running {
                return Ok(());
            }
        }
        if let Some(synchronizer) = &self.state.synchronizer {
            synchronizer.drain().await;
        }
        self.state.processor.stop(true).await;

        let stopped = FabricEvent::system_event(
            "knowledge-fabric",
            "stopped",
            serde_json::json!({ "agent_id": self.state.config.agent_id }),
        );
        if let Err(e) = self.state.event_log.append(&stopped).await {
            warn!(error = %e, "failed to log shutdown event");
        }

        self.state.individual.store().close().await?;
        if let Some(shared) = &self.state.shared {
            shared.store().close().await?;
        }
        *self.state.lifecycle.write().expect("lifecycle lock poisoned") = Lifecycle::Stopped;
        info!(agent_id = %self.state.config.agent_id, "knowledge fabric stopped");
        Ok(())
    }

    /// Name of this agent's local managed KG.
    pub fn local_kg_name(&self) -> String {
        format!("local_{}", self.state.config.agent_id)
    }

    // ----- event surface -----

    /// Persist an event and dispatch it to subscribers.
    pub async fn log_event(&self, event: FabricEvent) -> Result<String> {
        self.state.processor.log(event).await
    }

    /// Subscribe a handler to events matching the type glob.
    pub fn subscribe(&self, pattern: &str, handler: EventHandler) {
        self.state.processor.register_handler(pattern, handler);
    }

    pub fn register_filter(&self, pattern: &str, filter: EventFilter) {
        self.state.processor.register_filter(pattern, filter);
    }

    pub fn register_correlation(&self, rule: CorrelationRule) {
        self.state.processor.register_correlation(rule);
    }

    pub fn events(&self) -> &EventLog {
        &self.state.event_log
    }

    // ----- memory surface -----

    pub fn memory(&self) -> &AssociativeMemory {
        &self.state.memory
    }

    // ----- knowledge surface -----

    pub fn domains(&self) -> &NodeRepository<Domain> {
        &self.state.domains
    }

    pub fn projects(&self) -> &NodeRepository<Project> {
        &self.state.projects
    }

    pub fn components(&self) -> &NodeRepository<Component> {
        &self.state.components
    }

    pub fn requirements(&self) -> &NodeRepository<Requirement> {
        &self.state.requirements
    }

    pub fn implementations(&self) -> &NodeRepository<Implementation> {
        &self.state.implementations
    }

    pub fn patterns(&self) -> &NodeRepository<DesignPattern> {
        &self.state.patterns
    }

    pub fn decisions(&self) -> &NodeRepository<Decision> {
        &self.state.decisions
    }

    pub fn agents(&self) -> &NodeRepository<AgentProfile> {
        &self.state.agents
    }

    pub fn relationships(&self) -> &RelationshipRepository {
        &self.state.relationships
    }

    /// Register additional labels under a domain namespace, ensure the
    /// Domain node exists, and install the constraints the extension
    /// implies.
    pub async fn extend_schema(
        &self,
        domain_name: &str,
        extension: SchemaExtension,
    ) -> Result<()> {
        self.state.registry.extend_for_domain(domain_name, extension)?;
        let existing = self
            .state
            .domains
            .find_by_property("name", Value::String(domain_name.to_string()))
            .await?;
        if existing.is_empty() {
            self.state
                .domains
                .create(Domain::new(domain_name, Some(format!("{domain_name} domain"))))
                .await?;
        }
        let specs = self.state.registry.constraint_specs();
        self.state.individual.store().apply_constraints(&specs).await?;
        if let Some(shared) = &self.state.shared {
            shared.store().apply_constraints(&specs).await?;
        }
        Ok(())
    }

    pub fn schema(&self) -> &Arc<SchemaRegistry> {
        &self.state.registry
    }

    // ----- dual knowledge surface -----

    /// `None` when no shared graph is configured (dual mode disabled).
    pub fn dual_knowledge(&self) -> Option<&DualKnowledgeManager> {
        self.state.dkm.as_ref()
    }

    pub fn synchronizer(&self) -> Option<&Synchronizer> {
        self.state.synchronizer.as_ref()
    }

    pub async fn system_status(&self) -> Result<FabricStatus> {
        let running = {
            let lifecycle = self.state.lifecycle.read().expect("lifecycle lock poisoned");
            *lifecycle == Lifecycle::Running
        };
        Ok(FabricStatus {
            agent_id: self.state.config.agent_id.clone(),
            running,
            dual_mode: self.state.shared.is_some(),
            events: self.state.processor.stats(),
            memory: self.state.memory.stats().await?,
            sync: self
                .state
                .synchronizer
                .as_ref()
                .map(|s| s.sync_status())
                .unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Properties;

    #[tokio::test]
    async fn test_init_start_stop() {
        let fabric = KnowledgeFabric::init(FabricConfig::embedded("pm")).await.unwrap();
        fabric.start().await.unwrap();
        let status = fabric.system_status().await.unwrap();
        assert!(status.running);
        assert!(!status.dual_mode);
        fabric.stop().await.unwrap();

        let status = fabric.system_status().await.unwrap();
        assert!(!status.running);
        // A stopped fabric rejects new events and a restart.
        let result = fabric
            .log_event(FabricEvent::new("late.event", "t", Properties::new()))
            .await;
        assert!(matches!(result, Err(FabricError::ProcessorStopped)));
        assert!(fabric.start().await.is_err());
    }

    #[tokio::test]
    async fn test_start_idempotent_while_running() {
        let fabric = KnowledgeFabric::init(FabricConfig::embedded("pm")).await.unwrap();
        fabric.start().await.unwrap();
        fabric.start().await.unwrap();
        fabric.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_dual_mode_binds_layers() {
        let fabric = KnowledgeFabric::init(FabricConfig::embedded_dual("pm"))
            .await
            .unwrap();
        fabric.start().await.unwrap();
        let dkm = fabric.dual_knowledge().unwrap();
        assert!(dkm.managed_kg("local_pm").is_some());
        assert!(dkm.managed_kg("global").is_some());
        assert!(fabric.synchronizer().is_some());
        fabric.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_single_mode_has_no_dkm() {
        let fabric = KnowledgeFabric::init(FabricConfig::embedded("pm")).await.unwrap();
        assert!(fabric.dual_knowledge().is_none());
        assert!(fabric.synchronizer().is_none());
    }

    #[tokio::test]
    async fn test_bad_config_rejected_at_init() {
        let mut config = FabricConfig::embedded("pm");
        config.agent_id = String::new();
        let result = KnowledgeFabric::init(config).await;
        assert!(matches!(result, Err(FabricError::Configuration(_))));
    }
}
