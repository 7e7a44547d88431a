// Copyright (c) 2026 Loom Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Integration tests for the knowledge surface: ownership hierarchy,
//! dependency rules, and the repository contract.

use loom_fabric::domain::Properties;
use loom_fabric::infrastructure::RelationshipFilter;
use loom_fabric::{
    Component, Domain, FabricConfig, FabricError, Implementation, KnowledgeFabric, Project,
    Requirement,
};
use serde_json::json;

async fn fabric() -> KnowledgeFabric {
    let fabric = KnowledgeFabric::init(FabricConfig::embedded("it"))
        .await
        .expect("init");
    fabric.start().await.expect("start");
    fabric
}

#[tokio::test]
async fn test_domain_project_hierarchy() {
    let fabric = fabric().await;

    let domain = fabric
        .domains()
        .create(Domain::new("Development", None))
        .await
        .unwrap();
    let project = fabric
        .projects()
        .create(Project::new("DC", "active"))
        .await
        .unwrap();
    fabric
        .relationships()
        .create("Project", &project.id, "Domain", &domain.id, "BELONGS_TO", None)
        .await
        .unwrap();

    let found = fabric.projects().find_by_domain(&domain.id).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, project.id);

    // Deleting the domain detaches the project's BELONGS_TO edge.
    assert!(fabric.domains().delete(&domain.id).await.unwrap());
    let edges = fabric
        .relationships()
        .find(RelationshipFilter::from_source(&project.id))
        .await
        .unwrap();
    assert!(edges.is_empty());
    // The project itself survives.
    assert!(fabric.projects().find_by_id(&project.id).await.unwrap().is_some());

    fabric.stop().await.unwrap();
}

#[tokio::test]
async fn test_component_dependency_cycle_prevention() {
    let fabric = fabric().await;

    let a = fabric
        .components()
        .create(Component::new("A", "service", "active"))
        .await
        .unwrap();
    let b = fabric
        .components()
        .create(Component::new("B", "service", "active"))
        .await
        .unwrap();

    fabric
        .relationships()
        .create("Component", &a.id, "Component", &b.id, "DEPENDS_ON", None)
        .await
        .unwrap();

    let result = fabric
        .relationships()
        .create("Component", &b.id, "Component", &a.id, "DEPENDS_ON", None)
        .await;
    assert!(matches!(result, Err(FabricError::Validation { .. })));

    let mut weak = Properties::new();
    weak.insert("dependency_type".into(), json!("weak"));
    fabric
        .relationships()
        .create("Component", &b.id, "Component", &a.id, "DEPENDS_ON", Some(weak))
        .await
        .unwrap();

    let dependents = fabric.components().find_dependents(&b.id).await.unwrap();
    assert_eq!(dependents.len(), 1);
    assert_eq!(dependents[0].id, a.id);

    fabric.stop().await.unwrap();
}

#[tokio::test]
async fn test_repository_crud_law() {
    let fabric = fabric().await;
    let repo = fabric.requirements();

    // create → read → update → read → delete → read
    let created = repo
        .create(Requirement::new("login", "users log in", "functional", "high", "open"))
        .await
        .unwrap();
    let echoed = repo.find_by_id(&created.id).await.unwrap().unwrap();
    assert_eq!(echoed.name, "login");
    assert_eq!(echoed.priority, "high");

    let mut patch = Properties::new();
    patch.insert("status".into(), json!("done"));
    let mutated = repo.update(&created.id, patch).await.unwrap().unwrap();
    assert_eq!(mutated.status, "done");
    assert!(mutated.updated_at >= created.updated_at);

    let echoed = repo.find_by_id(&created.id).await.unwrap().unwrap();
    assert_eq!(echoed.status, "done");

    assert!(repo.delete(&created.id).await.unwrap());
    assert!(repo.find_by_id(&created.id).await.unwrap().is_none());

    fabric.stop().await.unwrap();
}

#[tokio::test]
async fn test_missing_required_property_fails_validation() {
    let fabric = fabric().await;
    let mut props = Properties::new();
    props.insert("name".into(), json!("half-baked"));
    // Requirement needs description, type, priority, status as well.
    let result = fabric.requirements().create_from_props(props).await;
    let Err(FabricError::Validation { errors }) = result else {
        panic!("expected validation failure");
    };
    assert!(errors.iter().any(|e| e.contains("description")));
    assert!(errors.iter().any(|e| e.contains("priority")));
    fabric.stop().await.unwrap();
}

#[tokio::test]
async fn test_ids_unique_per_label() {
    let fabric = fabric().await;
    let repo = fabric.projects();
    for i in 0..10 {
        repo.create(Project::new(format!("p{i}"), "active")).await.unwrap();
    }
    let all = repo.find_all(100, 0).await.unwrap();
    let mut ids: Vec<&str> = all.iter().map(|p| p.id.as_str()).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len() as u64, repo.count().await.unwrap());
    fabric.stop().await.unwrap();
}

#[tokio::test]
async fn test_belongs_to_path_reaches_domain() {
    let fabric = fabric().await;

    let domain = fabric.domains().create(Domain::new("Dev", None)).await.unwrap();
    let project = fabric.projects().create(Project::new("P", "active")).await.unwrap();
    let component = fabric
        .components()
        .create(Component::new("C", "service", "active"))
        .await
        .unwrap();
    let implementation = fabric
        .implementations()
        .create(Implementation::new("I", "src/c.rs", "active"))
        .await
        .unwrap();

    for (src_label, src, tgt_label, tgt) in [
        ("Project", project.id.as_str(), "Domain", domain.id.as_str()),
        ("Component", component.id.as_str(), "Project", project.id.as_str()),
        ("Implementation", implementation.id.as_str(), "Component", component.id.as_str()),
    ] {
        fabric
            .relationships()
            .create(src_label, src, tgt_label, tgt, "BELONGS_TO", None)
            .await
            .unwrap();
    }

    // Walk BELONGS_TO edges from the implementation up to a Domain.
    let mut current = implementation.id.clone();
    let mut reached_domain = false;
    for _ in 0..5 {
        let mut filter = RelationshipFilter::from_source(&current);
        filter.rel_type = Some("BELONGS_TO".to_string());
        let edges = fabric.relationships().find(filter).await.unwrap();
        let Some(edge) = edges.first() else { break };
        if edge.target_label == "Domain" {
            reached_domain = true;
            break;
        }
        current = edge.target_id.clone();
    }
    assert!(reached_domain, "no BELONGS_TO path to a Domain");

    fabric.stop().await.unwrap();
}

#[tokio::test]
async fn test_satisfies_with_level() {
    let fabric = fabric().await;
    let requirement = fabric
        .requirements()
        .create(Requirement::new("r", "d", "functional", "high", "open"))
        .await
        .unwrap();
    let implementation = fabric
        .implementations()
        .create(Implementation::new("impl", "src/x.rs", "active"))
        .await
        .unwrap();

    let mut props = Properties::new();
    props.insert("satisfaction_level".into(), json!(0.8));
    fabric
        .relationships()
        .create(
            "Implementation",
            &implementation.id,
            "Requirement",
            &requirement.id,
            "SATISFIES",
            Some(props),
        )
        .await
        .unwrap();

    let satisfying = fabric
        .implementations()
        .find_for_requirement(&requirement.id)
        .await
        .unwrap();
    assert_eq!(satisfying.len(), 1);
    assert_eq!(satisfying[0].id, implementation.id);

    fabric.stop().await.unwrap();
}
