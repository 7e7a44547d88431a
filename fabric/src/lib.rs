// Copyright (c) 2026 Loom Contributors
// SPDX-License-Identifier: AGPL-3.0

//! # Loom Knowledge Fabric
//!
//! Dual-layer knowledge graph store for multi-agent systems: every agent
//! owns a private graph of facts and experiences, a shared graph records
//! team-wide knowledge, and declarative rules and policies govern what
//! moves between the two.
//!
//! ## Architecture
//!
//! ```text
//! agents ──► KnowledgeFabric (facade)
//!               │
//!               ├─ event surface ──► EventProcessor ──► EventLog
//!               │                        │  filters / handlers / correlation
//!               │                        └──► AssociativeMemory
//!               ├─ memory surface ─► AssociativeMemory ──► Memory nodes
//!               ├─ knowledge surface ─► NodeRepository / RelationshipRepository
//!               │                        │
//!               │                        ▼
//!               │                   GraphPool ──► GraphStore ──► backend
//!               │                                 (embedded | bolt)
//!               └─ dual knowledge ─► DualKnowledgeManager ◄── Synchronizer
//!                                    local graphs ⇄ global graph
//! ```
//!
//! The domain layer holds schema and pure types, the infrastructure layer
//! the graph access path, the application layer the services. The default
//! backend is the embedded store; the `neo4j` feature adds the
//! bolt-protocol backend.

pub mod application;
pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;

pub use application::{
    AssociativeMemory, CorrelationRule, DualKnowledgeManager, EventLog, EventProcessor,
    FabricStatus, KnowledgeFabric, Synchronizer,
};
pub use config::{FabricConfig, GraphConfig};
pub use domain::{
    AgentProfile, Component, Decision, DesignPattern, Domain, FabricEvent, Implementation,
    KgKind, KnowledgePolicy, ManagedKg, MemoryRecord, MemoryType, NodeRef, Project, Properties,
    Requirement, SchemaMapping, SchemaRegistry, SyncCadence, SyncDirection, SyncFilter, SyncRule,
};
pub use error::{with_deadline, FabricError, Result};
