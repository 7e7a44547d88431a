// Copyright (c) 2026 Loom Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Domain types for the knowledge fabric: schema, entities, events,
//! memories, and the dual-knowledge meta objects.

pub mod entity;
pub mod event;
pub mod memory;
pub mod schema;
pub mod sync;

/// Property map of a graph node or relationship. Nested structures are
/// stored as JSON strings, scalars as themselves.
pub type Properties = serde_json::Map<String, serde_json::Value>;

pub use entity::{
    AgentProfile, Component, Decision, DesignPattern, Domain, Entity, Implementation, Project,
    Requirement,
};
pub use event::{glob_match, FabricEvent, NodeRef};
pub use memory::{context_match, cosine_similarity, semantic_similarity, MemoryRecord, MemoryType};
pub use schema::{
    ConstraintSpec, NodeLabel, NodeSchema, PropertySchema, PropertyType, RelationshipSchema,
    RelationshipType, SchemaExtension, SchemaRegistry,
};
pub use sync::{
    KgKind, KnowledgePolicy, ManagedKg, PolicyKind, PropertyMatch, SchemaMapping, SyncCadence,
    SyncDirection, SyncFilter, SyncReport, SyncResult, SyncRule,
};
