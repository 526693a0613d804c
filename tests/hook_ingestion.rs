mod common;

use common::*;
use metagraph_store::config::{AppConfig, DeleteMode};
use metagraph_store::logic::ConsumeOutcome;
use metagraph_store::{
    EntitiesWithExtInfo, Entity, EntityStore, HookConsumer, HookMessage, InMemoryGraph, ObjectId, RepositoryError,
};
use sha2::{Digest, Sha256};
use std::sync::Arc;

fn consumer_for(graph: Arc<InMemoryGraph>, config: AppConfig) -> (Arc<EntityStore>, HookConsumer) {
    let consumer_config = config.consumer.clone();
    let store = Arc::new(catalog_store(graph, config));
    (Arc::clone(&store), HookConsumer::new(store, consumer_config))
}

fn create_message(entities: Vec<Entity>) -> HookMessage {
    HookMessage::EntityCreate {
        user: Some("etl".into()),
        entities: EntitiesWithExtInfo::new(entities),
    }
}

fn processed(outcome: ConsumeOutcome) -> metagraph_store::MutationResponse {
    match outcome {
        ConsumeOutcome::Processed(response) => response,
        ConsumeOutcome::Dropped(e) => panic!("message dropped: {}", e),
    }
}

#[test]
fn test_long_indexed_string_is_trimmed_on_last_attempt() {
    let mut config = test_config(DeleteMode::Soft);
    config.repository.indexed_string_safe_length = 100;
    config.consumer.max_retries = 4;
    let graph = Arc::new(InMemoryGraph::new().with_max_string_length(100));
    let (store, consumer) = consumer_for(Arc::clone(&graph), config);

    let long_name = "n".repeat(500);
    let response = processed(consumer.handle_message(&create_message(vec![table("sales.wide", &long_name)])));
    let guid = guid_of(&response, "Table");
    // three rejected attempts were rolled back
    assert_eq!(graph.rollback_count(), 3);

    let stored = store
        .get_by_id(&store.request_context(), &guid, true)
        .unwrap()
        .entity
        .unwrap();
    let name = stored.attribute("name").and_then(|v| v.as_str()).unwrap();
    let checksum = format!(":{}", hex::encode(Sha256::digest(long_name.as_bytes())));
    assert_eq!(name.len(), 100);
    assert!(name.ends_with(&checksum));
    assert!(name.starts_with("nnnn"));
    assert_eq!(stored.created_by.as_deref(), Some("etl"));
}

#[test]
fn test_message_succeeds_after_transient_edge_failures() {
    let mut config = test_config(DeleteMode::Soft);
    config.graph.edge_retries = 1;
    config.consumer.max_retries = 3;
    let graph = Arc::new(InMemoryGraph::new());
    let (store, consumer) = consumer_for(Arc::clone(&graph), config);
    create(&store, vec![db("sales")]);

    graph.fail_next_edge_writes(2);
    let message = create_message(vec![table("sales.t1", "t1").with_attribute("db", db_ref("sales"))]);
    let response = processed(consumer.handle_message(&message));

    assert_eq!(response.created().len(), 1);
    assert_eq!(graph.vertex_count(), 2);
    // forward and inverse edge
    assert_eq!(graph.edge_count(), 2);
    assert!(consumer.failed_messages().is_empty());
    assert!(store.locks().is_empty());
}

#[test]
fn test_message_dropped_after_final_attempt() {
    let mut config = test_config(DeleteMode::Soft);
    config.graph.edge_retries = 1;
    config.consumer.max_retries = 2;
    let graph = Arc::new(InMemoryGraph::new());
    let (store, consumer) = consumer_for(Arc::clone(&graph), config);
    create(&store, vec![db("sales")]);

    graph.fail_next_edge_writes(10);
    let message = create_message(vec![table("sales.t1", "t1").with_attribute("db", db_ref("sales"))]);
    match consumer.handle_message(&message) {
        ConsumeOutcome::Dropped(RepositoryError::Internal(_)) => {}
        other => panic!("expected a dropped message, got {:?}", other),
    }

    assert_eq!(consumer.failed_messages().len(), 1);
    assert_eq!(graph.vertex_count(), 1);
    assert_eq!(graph.edge_count(), 0);
    assert!(store.locks().is_empty());
}

#[test]
fn test_delete_message_by_guid_and_full_update_message() {
    let graph = Arc::new(InMemoryGraph::new());
    let (store, consumer) = consumer_for(Arc::clone(&graph), test_config(DeleteMode::Soft));

    let response = processed(consumer.handle_message(&create_message(vec![db("sales"), db("hr")])));
    assert_eq!(response.created().len(), 2);

    let update = HookMessage::EntityFullUpdate {
        user: None,
        entities: EntitiesWithExtInfo::new(vec![db("hr").with_attribute("owner", "people-team")]),
    };
    let updated = processed(consumer.handle_message(&update));
    let hr = guid_of(&updated, "Db");
    let stored = store.get_by_id(&store.request_context(), &hr, true).unwrap().entity.unwrap();
    assert_eq!(stored.updated_by.as_deref(), Some("admin"));

    let delete = HookMessage::EntityDelete {
        user: Some("etl".into()),
        entities: vec![ObjectId::new(hr.clone(), "Db")],
    };
    let deleted = processed(consumer.handle_message(&delete));
    assert_eq!(deleted.deleted().len(), 1);
    assert_eq!(deleted.deleted()[0].guid, hr);
}

#[test]
fn test_ignored_database_is_skipped_and_unreferenced() {
    let mut config = test_config(DeleteMode::Soft);
    config.consumer.ignore_patterns = vec!["scratch(\\..*)?".to_string()];
    let graph = Arc::new(InMemoryGraph::new());
    let (store, consumer) = consumer_for(Arc::clone(&graph), config);

    let scratch = db("scratch");
    let scratch_ref = ObjectId::new(scratch.guid.clone(), "Db");
    let staged = table("scratch.staged", "staged").with_attribute("db", scratch_ref.clone());
    let report = table("sales.report", "report").with_attribute("db", scratch_ref);
    let response = processed(consumer.handle_message(&create_message(vec![scratch, staged, report])));

    assert_eq!(response.created().len(), 1);
    let report = guid_of(&response, "Table");
    let stored = store.get_by_id(&store.request_context(), &report, true).unwrap().entity.unwrap();
    assert!(stored.attribute("db").is_none());
    assert_eq!(graph.vertex_count(), 1);
    assert_eq!(graph.edge_count(), 0);
}
