// Copyright (c) 2026 Loom Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Append-only persistence for events.
//!
//! Events are written once and never mutated. Each persisted event also
//! links to its related nodes through `RELATED_TO` edges so activity can be
//! traversed from the entities it touched.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::domain::schema::{NodeLabel, RelationshipType, SchemaRegistry};
use crate::domain::{FabricEvent, NodeRef, Properties};
use crate::error::Result;
use crate::infrastructure::graph::{BatchOp, EdgeSpec};
use crate::infrastructure::pool::GraphPool;

/// Writes and reads Event nodes in one managed graph.
#[derive(Clone)]
pub struct EventLog {
    pool: GraphPool,
    registry: Arc<SchemaRegistry>,
}

impl EventLog {
    pub fn new(pool: GraphPool, registry: Arc<SchemaRegistry>) -> Self {
        Self { pool, registry }
    }

    /// Persist an event and link it to its related nodes, all in one
    /// commit. Links against nodes that do not exist are skipped; the
    /// reference list on the event itself is kept either way.
    pub async fn append(&self, event: &FabricEvent) -> Result<()> {
        let props = event.to_properties()?;
        self.registry.validate(NodeLabel::Event.as_str(), &props)?;

        let graph = self.pool.acquire().await?;
        let mut ops = vec![BatchOp::CreateNode {
            label: NodeLabel::Event.as_str().to_string(),
            props,
        }];
        for node_ref in &event.related {
            let exists = graph.find_node(&node_ref.label, &node_ref.id).await?.is_some();
            if !exists {
                debug!(
                    event_id = %event.id,
                    label = %node_ref.label,
                    id = %node_ref.id,
                    "related node absent, keeping reference only"
                );
                continue;
            }
            let mut props = Properties::new();
            props.insert(
                "created_at".into(),
                Value::String(event.timestamp.to_rfc3339()),
            );
            ops.push(BatchOp::CreateRelationship(EdgeSpec {
                source_label: NodeLabel::Event.as_str().to_string(),
                source_id: event.id.clone(),
                target_label: node_ref.label.clone(),
                target_id: node_ref.id.clone(),
                rel_type: RelationshipType::RelatedTo.as_str().to_string(),
                props,
            }));
        }
        graph.run_batch(ops).await
    }

    /// Log an agent action: who did what, with which inputs and outputs,
    /// and whether it worked.
    pub async fn log_agent_action(
        &self,
        agent_id: &str,
        action_type: &str,
        inputs: Value,
        outputs: Value,
        success: bool,
        related: Vec<NodeRef>,
    ) -> Result<FabricEvent> {
        let event = FabricEvent::agent_action(agent_id, action_type, inputs, outputs, success)
            .with_related(related);
        self.append(&event).await?;
        Ok(event)
    }

    /// Log an internal component event with a severity level.
    pub async fn log_system_event(
        &self,
        component: &str,
        kind: &str,
        details: Value,
        severity: &str,
        related: Vec<NodeRef>,
    ) -> Result<FabricEvent> {
        let mut event = FabricEvent::system_event(component, kind, details).with_related(related);
        event
            .metadata
            .insert("severity".into(), Value::String(severity.to_string()));
        self.append(&event).await?;
        Ok(event)
    }

    /// Log a workflow step transition.
    pub async fn log_workflow_step(
        &self,
        workflow_id: &str,
        step_id: &str,
        status: &str,
        data: Value,
        related: Vec<NodeRef>,
    ) -> Result<FabricEvent> {
        let event =
            FabricEvent::workflow_step(workflow_id, step_id, status, data).with_related(related);
        self.append(&event).await?;
        Ok(event)
    }

    pub async fn find_by_id(&self, id: &str) -> Result<Option<FabricEvent>> {
        let graph = self.pool.acquire().await?;
        match graph.find_node(NodeLabel::Event.as_str(), id).await? {
            Some(props) => Ok(Some(FabricEvent::from_properties(&props)?)),
            None => Ok(None),
        }
    }

    /// Events of one type, most recent first.
    pub async fn find_by_type(&self, event_type: &str, limit: usize) -> Result<Vec<FabricEvent>> {
        let graph = self.pool.acquire().await?;
        let rows = graph
            .find_by_property(
                NodeLabel::Event.as_str(),
                "type",
                &Value::String(event_type.to_string()),
                usize::MAX,
            )
            .await?;
        let mut events = rows
            .iter()
            .map(FabricEvent::from_properties)
            .collect::<Result<Vec<_>>>()?;
        events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        events.truncate(limit);
        Ok(events)
    }

    /// Most recent events across all types.
    pub async fn recent(&self, limit: usize) -> Result<Vec<FabricEvent>> {
        let graph = self.pool.acquire().await?;
        let rows = graph
            .find_all(NodeLabel::Event.as_str(), usize::MAX, 0)
            .await?;
        let mut events = rows
            .iter()
            .map(FabricEvent::from_properties)
            .collect::<Result<Vec<_>>>()?;
        events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        events.truncate(limit);
        Ok(events)
    }

    pub async fn count(&self) -> Result<u64> {
        let graph = self.pool.acquire().await?;
        graph.count(NodeLabel::Event.as_str()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::memory_store::MemoryGraphStore;
    use crate::infrastructure::graph::RelationshipFilter;
    use serde_json::json;
    use std::time::Duration;

    fn log() -> (EventLog, GraphPool) {
        let pool = GraphPool::new(
            Arc::new(MemoryGraphStore::new()),
            4,
            Duration::from_millis(100),
        );
        (
            EventLog::new(pool.clone(), Arc::new(SchemaRegistry::core())),
            pool,
        )
    }

    #[tokio::test]
    async fn test_append_and_read_back() {
        let (log, _) = log();
        let mut metadata = Properties::new();
        metadata.insert("task_id".into(), json!("t-1"));
        let event = FabricEvent::new("task.started", "agent_pm", metadata);

        log.append(&event).await.unwrap();
        let back = log.find_by_id(&event.id).await.unwrap().unwrap();
        assert_eq!(back.event_type, event.event_type);
        assert_eq!(back.source, event.source);
        assert_eq!(back.metadata, event.metadata);
    }

    #[tokio::test]
    async fn test_related_edges_created_when_target_exists() {
        let (log, pool) = log();
        {
            let graph = pool.acquire().await.unwrap();
            let mut props = Properties::new();
            props.insert("id".into(), json!("c-1"));
            graph.create_node("Component", props).await.unwrap();
        }

        let event = FabricEvent::new("component.changed", "agent_dev", Properties::new())
            .with_related(vec![
                NodeRef::new("Component", "c-1"),
                NodeRef::new("Component", "c-missing"),
            ]);
        log.append(&event).await.unwrap();

        let graph = pool.acquire().await.unwrap();
        let rels = graph
            .find_relationships(RelationshipFilter::from_source(&event.id))
            .await
            .unwrap();
        assert_eq!(rels.len(), 1);
        assert_eq!(rels[0].target_id, "c-1");

        // The reference list survives even for the absent node.
        let back = log.find_by_id(&event.id).await.unwrap().unwrap();
        assert_eq!(back.related.len(), 2);
    }

    #[tokio::test]
    async fn test_log_agent_action_shapes_metadata() {
        let (log, _) = log();
        let event = log
            .log_agent_action(
                "agent_pm",
                "plan",
                json!({"goal": "ship"}),
                json!({"steps": 3}),
                true,
                vec![],
            )
            .await
            .unwrap();

        let back = log.find_by_id(&event.id).await.unwrap().unwrap();
        assert_eq!(back.event_type, "agent.action");
        assert_eq!(back.source, "agent_pm");
        assert_eq!(back.metadata.get("action_type"), Some(&json!("plan")));
        assert_eq!(back.metadata.get("inputs"), Some(&json!({"goal": "ship"})));
        assert_eq!(back.metadata.get("outputs"), Some(&json!({"steps": 3})));
        assert_eq!(back.metadata.get("success"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn test_log_system_event_carries_severity() {
        let (log, _) = log();
        let event = log
            .log_system_event(
                "synchronizer",
                "sync_error",
                json!({"rule": "promote"}),
                "error",
                vec![],
            )
            .await
            .unwrap();

        let back = log.find_by_id(&event.id).await.unwrap().unwrap();
        assert_eq!(back.event_type, "system.sync_error");
        assert_eq!(back.source, "synchronizer");
        assert_eq!(back.metadata.get("severity"), Some(&json!("error")));
        assert_eq!(back.metadata.get("details"), Some(&json!({"rule": "promote"})));
    }

    #[tokio::test]
    async fn test_log_workflow_step_links_related() {
        let (log, pool) = log();
        {
            let graph = pool.acquire().await.unwrap();
            let mut props = Properties::new();
            props.insert("id".into(), json!("c-1"));
            graph.create_node("Component", props).await.unwrap();
        }

        let event = log
            .log_workflow_step(
                "wf-1",
                "step-2",
                "completed",
                json!({"artifact": "build"}),
                vec![NodeRef::new("Component", "c-1")],
            )
            .await
            .unwrap();

        let back = log.find_by_id(&event.id).await.unwrap().unwrap();
        assert_eq!(back.event_type, "workflow.step.completed");
        assert_eq!(back.metadata.get("workflow_id"), Some(&json!("wf-1")));
        assert_eq!(back.metadata.get("step_id"), Some(&json!("step-2")));

        let rels = pool
            .acquire()
            .await
            .unwrap()
            .find_relationships(RelationshipFilter::from_source(&event.id))
            .await
            .unwrap();
        assert_eq!(rels.len(), 1);
        assert_eq!(rels[0].target_id, "c-1");
    }

    #[tokio::test]
    async fn test_find_by_type_most_recent_first() {
        let (log, _) = log();
        for i in 0..3 {
            let mut event = FabricEvent::new("task.started", "src", Properties::new());
            event.timestamp = chrono::Utc::now() + chrono::Duration::seconds(i);
            log.append(&event).await.unwrap();
        }
        log.append(&FabricEvent::new("task.completed", "src", Properties::new()))
            .await
            .unwrap();

        let events = log.find_by_type("task.started", 2).await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(events[0].timestamp >= events[1].timestamp);
        assert_eq!(log.count().await.unwrap(), 4);
    }
}
