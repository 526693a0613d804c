#![allow(dead_code)]

use metagraph_store::config::{AppConfig, DeleteMode};
use metagraph_store::seed;
use metagraph_store::{BatchEntityStream, Entity, EntityStore, InMemoryGraph, MutationResponse, ObjectId};
use std::sync::Arc;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn test_config(delete_mode: DeleteMode) -> AppConfig {
    let mut config = AppConfig::default();
    config.repository.delete_mode = delete_mode;
    config.graph.retry_sleep_ms = 1;
    config.consumer.retry_interval_ms = 1;
    config.consumer.min_retry_interval_ms = 1;
    config.consumer.max_retry_interval_ms = 2;
    config
}

pub fn catalog_store(graph: Arc<InMemoryGraph>, config: AppConfig) -> EntityStore {
    init_logging();
    let registry = seed::catalog_registry().expect("catalog model");
    EntityStore::new(graph, Arc::new(registry), config)
}

pub fn soft_store() -> (Arc<InMemoryGraph>, EntityStore) {
    let graph = Arc::new(InMemoryGraph::new());
    let store = catalog_store(Arc::clone(&graph), test_config(DeleteMode::Soft));
    (graph, store)
}

pub fn db(qualified_name: &str) -> Entity {
    Entity::new("Db")
        .with_attribute("qualifiedName", qualified_name)
        .with_attribute("name", qualified_name)
}

pub fn table(qualified_name: &str, name: &str) -> Entity {
    Entity::new("Table")
        .with_attribute("qualifiedName", qualified_name)
        .with_attribute("name", name)
}

pub fn db_ref(qualified_name: &str) -> ObjectId {
    ObjectId::by_unique_attribute("Db", "qualifiedName", qualified_name)
}

pub fn create(store: &EntityStore, entities: Vec<Entity>) -> MutationResponse {
    store
        .create_or_update(&store.request_context(), &BatchEntityStream::from(entities), false)
        .expect("create_or_update")
}

pub fn guid_of(response: &MutationResponse, type_name: &str) -> String {
    response
        .first_created_by_type(type_name)
        .or_else(|| response.first_updated_by_type(type_name))
        .map(|h| h.guid.clone())
        .expect("entity in response")
}
