// Copyright (c) 2026 Loom Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Fabric configuration records.
//!
//! Every recognized option is an explicit field; unknown keys are rejected
//! at deserialization time. Loading from files or the environment is the
//! caller's concern — the fabric only consumes these records.

use serde::{Deserialize, Serialize};

use crate::error::{FabricError, Result};

/// Top-level configuration for a fabric instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FabricConfig {
    /// Identifier of the agent owning the individual graph
    pub agent_id: String,
    /// Individual (private) graph backend
    pub graph: GraphConfig,
    /// Shared graph backend; when absent, dual mode is disabled and only
    /// the individual graph operates
    pub shared_graph: Option<GraphConfig>,
    pub pool: PoolConfig,
    pub events: EventsConfig,
    pub memory: MemoryConfig,
    pub sync: SyncConfig,
    pub embedding: EmbeddingConfig,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            agent_id: "agent".to_string(),
            graph: GraphConfig::default(),
            shared_graph: None,
            pool: PoolConfig::default(),
            events: EventsConfig::default(),
            memory: MemoryConfig::default(),
            sync: SyncConfig::default(),
            embedding: EmbeddingConfig::default(),
        }
    }
}

impl FabricConfig {
    /// Embedded-store configuration for tests and local development.
    pub fn embedded(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            graph: GraphConfig::embedded(),
            ..Self::default()
        }
    }

    /// Embedded-store configuration with a shared graph (dual mode).
    pub fn embedded_dual(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            graph: GraphConfig::embedded(),
            shared_graph: Some(GraphConfig::embedded()),
            ..Self::default()
        }
    }

    /// Reject configurations that cannot possibly come up.
    pub fn validate(&self) -> Result<()> {
        if self.agent_id.trim().is_empty() {
            return Err(FabricError::Configuration("agent_id must not be empty".into()));
        }
        self.graph.validate()?;
        if let Some(shared) = &self.shared_graph {
            shared.validate()?;
        }
        if self.pool.size == 0 {
            return Err(FabricError::Configuration("pool.size must be at least 1".into()));
        }
        if self.events.queue_capacity == 0 {
            return Err(FabricError::Configuration(
                "events.queue_capacity must be at least 1".into(),
            ));
        }
        if self.events.worker_count == 0 {
            return Err(FabricError::Configuration(
                "events.worker_count must be at least 1".into(),
            ));
        }
        if self.sync.priority_queue_capacity == 0 {
            return Err(FabricError::Configuration(
                "sync.priority_queue_capacity must be at least 1".into(),
            ));
        }
        self.memory.validate()?;
        self.embedding.validate()?;
        Ok(())
    }
}

/// Connection settings for one graph backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct GraphConfig {
    /// Backend URI. `memory://` selects the embedded store; `bolt://` /
    /// `neo4j://` select the bolt backend (requires the `neo4j` feature).
    pub uri: String,
    pub username: String,
    pub password: String,
    pub database: String,
    /// Ceiling for the driver-side connection pool
    pub max_pool_size: u32,
    /// Total budget for transparent retries on backend loss, milliseconds
    pub max_retry_time_ms: u64,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            uri: "bolt://localhost:7687".to_string(),
            username: "neo4j".to_string(),
            password: String::new(),
            database: "neo4j".to_string(),
            max_pool_size: 50,
            max_retry_time_ms: 30_000,
        }
    }
}

impl GraphConfig {
    pub fn embedded() -> Self {
        Self {
            uri: "memory://".to_string(),
            ..Self::default()
        }
    }

    pub fn is_embedded(&self) -> bool {
        self.uri.starts_with("memory://")
    }

    fn validate(&self) -> Result<()> {
        if self.uri.trim().is_empty() {
            return Err(FabricError::Configuration("graph uri must not be empty".into()));
        }
        let known_scheme = self.uri.starts_with("memory://")
            || self.uri.starts_with("bolt://")
            || self.uri.starts_with("neo4j://");
        if !known_scheme {
            return Err(FabricError::Configuration(format!(
                "unsupported graph uri scheme: {}",
                self.uri
            )));
        }
        Ok(())
    }
}

/// Graph access layer pool sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PoolConfig {
    pub size: usize,
    /// Bounded wait for acquiring a pooled connection, milliseconds
    pub wait_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { size: 8, wait_ms: 5_000 }
    }
}

/// Event pipeline sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EventsConfig {
    pub queue_capacity: usize,
    pub worker_count: usize,
    /// Bounded wait before `log` gives up with backpressure, milliseconds
    pub backpressure_wait_ms: u64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1_000,
            worker_count: 2,
            backpressure_wait_ms: 200,
        }
    }
}

/// Associative memory scoring weights.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct MemoryWeights {
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
}

impl Default for MemoryWeights {
    fn default() -> Self {
        Self { alpha: 0.4, beta: 0.4, gamma: 0.2 }
    }
}

/// Associative memory tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct MemoryConfig {
    pub weights: MemoryWeights,
    /// Importance decay constant, per day
    pub decay_lambda: f64,
    /// Memories decayed below this importance are pruned by the decay pass
    pub importance_threshold: f64,
    /// Upper bound on candidates scanned by a context recall
    pub scan_limit: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            weights: MemoryWeights::default(),
            decay_lambda: 0.15,
            importance_threshold: 0.05,
            scan_limit: 1_000,
        }
    }
}

impl MemoryConfig {
    fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("memory.weights.alpha", self.weights.alpha),
            ("memory.weights.beta", self.weights.beta),
            ("memory.weights.gamma", self.weights.gamma),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(FabricError::Configuration(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }
        if self.decay_lambda < 0.0 {
            return Err(FabricError::Configuration(
                "memory.decay_lambda must be non-negative".into(),
            ));
        }
        Ok(())
    }
}

/// Synchronizer sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SyncConfig {
    /// Period for scheduled rules that do not carry their own, milliseconds
    pub default_period_ms: u64,
    pub priority_queue_capacity: usize,
    /// Bounded wait for job intake when the queue is full, milliseconds
    pub intake_wait_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            default_period_ms: 900_000,
            priority_queue_capacity: 64,
            intake_wait_ms: 1_000,
        }
    }
}

/// Embedding provider selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EmbeddingConfig {
    /// `none` disables semantic similarity; `hash` selects the
    /// deterministic built-in provider
    pub provider: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self { provider: "none".to_string() }
    }
}

impl EmbeddingConfig {
    fn validate(&self) -> Result<()> {
        match self.provider.as_str() {
            "none" | "hash" => Ok(()),
            other => Err(FabricError::Configuration(format!(
                "unknown embedding provider: {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(FabricConfig::default().validate().is_ok());
        assert!(FabricConfig::embedded("pm").validate().is_ok());
    }

    #[test]
    fn test_unknown_option_rejected() {
        let raw = r#"{"agent_id": "pm", "surprise": true}"#;
        let parsed: std::result::Result<FabricConfig, _> = serde_json::from_str(raw);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_bad_weight_rejected() {
        let mut config = FabricConfig::embedded("pm");
        config.memory.weights.alpha = 1.5;
        assert!(matches!(
            config.validate(),
            Err(FabricError::Configuration(_))
        ));
    }

    #[test]
    fn test_unknown_scheme_rejected() {
        let mut config = FabricConfig::embedded("pm");
        config.graph.uri = "postgres://localhost".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_pool_rejected() {
        let mut config = FabricConfig::embedded("pm");
        config.pool.size = 0;
        assert!(config.validate().is_err());
    }
}
