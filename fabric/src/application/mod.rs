// Copyright (c) 2026 Loom Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Application services: event pipeline, associative memory, dual
//! knowledge management, synchronization, and the facade.

pub mod associative_memory;
pub mod dual_knowledge;
pub mod event_log;
pub mod event_processor;
pub mod fabric;
pub mod synchronizer;

pub use associative_memory::{AssociativeMemory, MemoryStats};
pub use dual_knowledge::{DualKnowledgeManager, RegisteredRule, StoreFactory};
pub use event_log::EventLog;
pub use event_processor::{
    CorrelationRule, EventFilter, EventHandler, EventProcessor, ProcessorStats,
};
pub use fabric::{FabricStatus, KnowledgeFabric};
pub use synchronizer::{RuleStatus, Synchronizer};
