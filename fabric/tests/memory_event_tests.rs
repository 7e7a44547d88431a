// Copyright (c) 2026 Loom Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Integration tests for the event and memory surfaces.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use loom_fabric::application::CorrelationRule;
use loom_fabric::domain::Properties;
use loom_fabric::{FabricConfig, FabricError, KnowledgeFabric, MemoryType};
use serde_json::json;

async fn fabric() -> KnowledgeFabric {
    let fabric = KnowledgeFabric::init(FabricConfig::embedded("it"))
        .await
        .expect("init");
    fabric.start().await.expect("start");
    fabric
}

fn ctx(pairs: &[(&str, &str)]) -> Properties {
    pairs.iter().map(|(k, v)| (k.to_string(), json!(v))).collect()
}

fn meta(pairs: &[(&str, &str)]) -> Properties {
    ctx(pairs)
}

#[tokio::test]
async fn test_event_round_trip_fieldwise() {
    let fabric = fabric().await;

    let event = loom_fabric::FabricEvent::new(
        "workflow.step.completed",
        "agent_dev",
        meta(&[("workflow_id", "wf-1"), ("step", "compile")]),
    );
    let written = event.clone();
    let id = fabric.log_event(event).await.unwrap();

    let read = fabric.events().find_by_id(&id).await.unwrap().unwrap();
    assert_eq!(read.id, written.id);
    assert_eq!(read.event_type, written.event_type);
    assert_eq!(read.source, written.source);
    assert_eq!(read.metadata, written.metadata);
    assert_eq!(read.related, written.related);

    fabric.stop().await.unwrap();
}

#[tokio::test]
async fn test_subscription_receives_matching_events() {
    let fabric = fabric().await;
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    fabric.subscribe(
        "workflow.*",
        Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
    );

    fabric
        .log_event(loom_fabric::FabricEvent::new("workflow.step.started", "t", Properties::new()))
        .await
        .unwrap();
    fabric
        .log_event(loom_fabric::FabricEvent::new("agent.action", "t", Properties::new()))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;

    assert_eq!(hits.load(Ordering::SeqCst), 1);
    fabric.stop().await.unwrap();
}

#[tokio::test]
async fn test_correlation_produces_graph_event() {
    let fabric = fabric().await;
    fabric.register_correlation(CorrelationRule {
        name: "task-success".into(),
        event_types: vec!["task.started".into(), "task.completed".into()],
        window: Duration::from_secs(300),
        match_key: Some("task_id".into()),
        emit_type: "task.succeeded".into(),
    });

    let started = fabric
        .log_event(loom_fabric::FabricEvent::new(
            "task.started",
            "agent_pm",
            meta(&[("task_id", "t-9")]),
        ))
        .await
        .unwrap();
    let completed = fabric
        .log_event(loom_fabric::FabricEvent::new(
            "task.completed",
            "agent_pm",
            meta(&[("task_id", "t-9")]),
        ))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;

    let succeeded = fabric.events().find_by_type("task.succeeded", 10).await.unwrap();
    assert_eq!(succeeded.len(), 1);
    let related: Vec<&str> = succeeded[0].related.iter().map(|r| r.id.as_str()).collect();
    assert!(related.contains(&started.as_str()));
    assert!(related.contains(&completed.as_str()));

    fabric.stop().await.unwrap();
}

#[tokio::test]
async fn test_memory_context_recall_scenario() {
    let fabric = fabric().await;
    let memory = fabric.memory();

    let m1 = memory
        .store(json!("m1"), ctx(&[("project", "P1"), ("topic", "auth")]), MemoryType::Semantic, None)
        .await
        .unwrap();
    let m2 = memory
        .store(json!("m2"), ctx(&[("project", "P1"), ("topic", "db")]), MemoryType::Semantic, None)
        .await
        .unwrap();
    let m3 = memory
        .store(json!("m3"), ctx(&[("project", "P2"), ("topic", "auth")]), MemoryType::Semantic, None)
        .await
        .unwrap();

    let by_project = memory
        .recall_by_context(&ctx(&[("project", "P1")]), 10)
        .await
        .unwrap();
    let ids: Vec<&str> = by_project.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&m1.as_str()) && ids.contains(&m2.as_str()));

    let by_topic = memory
        .recall_by_context(&ctx(&[("topic", "auth")]), 10)
        .await
        .unwrap();
    let ids: Vec<&str> = by_topic.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&m1.as_str()) && ids.contains(&m3.as_str()));

    fabric.stop().await.unwrap();
}

#[tokio::test]
async fn test_memory_access_counters_monotonic() {
    let fabric = fabric().await;
    let memory = fabric.memory();
    let id = memory
        .store(json!("note"), ctx(&[("k", "v")]), MemoryType::Working, None)
        .await
        .unwrap();

    let mut last_count = 0;
    for _ in 0..3 {
        let record = memory.recall_by_id(&id).await.unwrap().unwrap();
        assert!(record.access_count > last_count);
        assert!(record.last_accessed >= record.timestamp);
        last_count = record.access_count;
    }
    fabric.stop().await.unwrap();
}

#[tokio::test]
async fn test_associate_idempotent_max_strength() {
    let fabric = fabric().await;
    let memory = fabric.memory();
    let a = memory
        .store(json!("a"), ctx(&[]), MemoryType::Semantic, None)
        .await
        .unwrap();
    let b = memory
        .store(json!("b"), ctx(&[]), MemoryType::Semantic, None)
        .await
        .unwrap();

    memory.associate(&a, &b, "supports", 0.4).await.unwrap();
    memory.associate(&a, &b, "supports", 0.9).await.unwrap();
    memory.associate(&a, &b, "supports", 0.2).await.unwrap();

    let related = memory.recall_associations(&a, 1).await.unwrap();
    assert_eq!(related.len(), 1);
    assert_eq!(related[0].id, b);

    fabric.stop().await.unwrap();
}

#[tokio::test]
async fn test_backpressure_boundary() {
    let mut config = FabricConfig::embedded("it");
    config.events.queue_capacity = 2;
    config.events.worker_count = 1;
    config.events.backpressure_wait_ms = 30;
    let fabric = KnowledgeFabric::init(config).await.unwrap();
    // Not started: no workers drain the queue.

    fabric
        .log_event(loom_fabric::FabricEvent::new("a.1", "t", Properties::new()))
        .await
        .unwrap();
    fabric
        .log_event(loom_fabric::FabricEvent::new("a.2", "t", Properties::new()))
        .await
        .unwrap();
    let result = fabric
        .log_event(loom_fabric::FabricEvent::new("a.3", "t", Properties::new()))
        .await;
    assert!(matches!(result, Err(FabricError::BackpressureExceeded)));
    // The rejected event never hit the graph.
    assert_eq!(fabric.events().count().await.unwrap(), 2);
}

#[tokio::test]
async fn test_events_become_episodic_memories() {
    let fabric = fabric().await;
    fabric
        .log_event(loom_fabric::FabricEvent::new(
            "agent.action",
            "agent_pm",
            meta(&[("action", "plan")]),
        ))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;

    let episodic = fabric
        .memory()
        .recall_by_type(MemoryType::Episodic, 10)
        .await
        .unwrap();
    assert!(!episodic.is_empty());
    fabric.stop().await.unwrap();
}
