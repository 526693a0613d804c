mod common;

use common::*;
use metagraph_store::config::DeleteMode;
use metagraph_store::logic::{DeleteHandler, GraphDeleteHandler, TransactionContext};
use metagraph_store::store::{EdgeId, EdgeInfo, Graph, GraphTransaction, VertexId};
use metagraph_store::{
    is_assigned_guid, AttrValue, AttributeDef, BatchEntityStream, Classification, Entity, EntityDef, EntityStore, EntityWithExtInfo,
    InMemoryGraph, ObjectId, Relationship, RepositoryError, Status, Struct, TypeCategory, TypeRegistry, TypesDef,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn object_guids(value: Option<&AttrValue>) -> Vec<String> {
    match value {
        Some(AttrValue::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_object_id().and_then(|id| id.guid()).map(str::to_string))
            .collect(),
        Some(AttrValue::ObjectId(id)) => id.guid().map(str::to_string).into_iter().collect(),
        _ => Vec::new(),
    }
}

fn entity(store: &EntityStore, guid: &str) -> Entity {
    store
        .get_by_id(&store.request_context(), guid, false)
        .expect("get_by_id")
        .entity
        .expect("entity")
}

#[test]
fn test_created_table_reads_back_active_at_version_zero() {
    let (_, store) = soft_store();

    let response = create(&store, vec![table("db.t1@cluster", "t1")]);
    assert_eq!(response.created().len(), 1);
    let guid = guid_of(&response, "Table");
    assert!(is_assigned_guid(&guid));

    let stored = entity(&store, &guid);
    assert_eq!(stored.status, Status::Active);
    assert_eq!(stored.version, 0);
    assert_eq!(stored.attributes.len(), 2);
    assert_eq!(stored.attribute("name").and_then(|v| v.as_str()), Some("t1"));
    assert_eq!(
        stored.attribute("qualifiedName").and_then(|v| v.as_str()),
        Some("db.t1@cluster")
    );
    assert_eq!(stored.created_by.as_deref(), Some("admin"));
}

#[test]
fn test_unchanged_entity_is_not_rewritten() {
    let (_, store) = soft_store();
    let guid = guid_of(&create(&store, vec![db("sales")]), "Db");
    let before = entity(&store, &guid);

    std::thread::sleep(std::time::Duration::from_millis(5));
    let response = create(&store, vec![db("sales")]);
    assert!(response.is_empty());

    let after = entity(&store, &guid);
    assert_eq!(after.update_time, before.update_time);
    assert_eq!(after.updated_by, before.updated_by);

    let changed = create(&store, vec![db("sales").with_attribute("description", "sales data")]);
    assert_eq!(changed.updated().len(), 1);
    assert_eq!(changed.updated()[0].guid, guid);
}

#[test]
fn test_deleting_missing_guid_touches_nothing() {
    let (_, store) = soft_store();
    let response = store
        .delete_by_id(&store.request_context(), "3f0c1d9e-0000-0000-0000-000000000000")
        .unwrap();
    assert_eq!(response.total(), 0);
}

#[test]
fn test_inverse_reference_follows_forward_reference() {
    let (_, store) = soft_store();
    let created = create(&store, vec![db("sales"), db("hr")]);
    let sales = created.created().iter().find(|h| h.display_text.as_deref() == Some("sales")).unwrap().guid.clone();
    let hr = created.created().iter().find(|h| h.display_text.as_deref() == Some("hr")).unwrap().guid.clone();

    let t1 = guid_of(
        &create(&store, vec![table("sales.t1", "t1").with_attribute("db", db_ref("sales"))]),
        "Table",
    );
    assert_eq!(object_guids(entity(&store, &sales).attribute("tables")), vec![t1.clone()]);
    assert_eq!(object_guids(entity(&store, &t1).attribute("db")), vec![sales.clone()]);

    // a second identical write must not append the table twice
    create(&store, vec![table("sales.t1", "t1").with_attribute("db", db_ref("sales"))]);
    assert_eq!(object_guids(entity(&store, &sales).attribute("tables")), vec![t1.clone()]);

    let moved = create(&store, vec![table("sales.t1", "t1").with_attribute("db", db_ref("hr"))]);
    assert!(moved.updated().iter().any(|h| h.guid == t1));
    assert!(object_guids(entity(&store, &sales).attribute("tables")).is_empty());
    assert_eq!(object_guids(entity(&store, &hr).attribute("tables")), vec![t1.clone()]);
    assert_eq!(object_guids(entity(&store, &t1).attribute("db")), vec![hr]);
}

fn table_with_columns(store: &EntityStore) -> (String, String, Vec<String>) {
    let sales = guid_of(&create(store, vec![db("sales")]), "Db");

    let c1 = Entity::new("Column")
        .with_attribute("qualifiedName", "sales.orders.id")
        .with_attribute("name", "id");
    let c2 = Entity::new("Column")
        .with_attribute("qualifiedName", "sales.orders.total")
        .with_attribute("name", "total");
    let orders = table("sales.orders", "orders")
        .with_attribute("db", db_ref("sales"))
        .with_attribute(
            "columns",
            vec![ObjectId::new(c1.guid.clone(), "Column"), ObjectId::new(c2.guid.clone(), "Column")],
        );

    let response = create(store, vec![orders, c1, c2]);
    assert_eq!(response.created().len(), 3);
    let orders = guid_of(&response, "Table");
    let columns = object_guids(entity(store, &orders).attribute("columns"));
    assert_eq!(columns.len(), 2);
    (sales, orders, columns)
}

#[test]
fn test_owned_columns_point_back_at_their_table() {
    let (_, store) = soft_store();
    let (_, orders, columns) = table_with_columns(&store);
    for column in &columns {
        assert_eq!(object_guids(entity(&store, column).attribute("table")), vec![orders.clone()]);
    }

    let with_ext = store.get_by_id(&store.request_context(), &orders, false).unwrap();
    assert_eq!(with_ext.referred_entities.len(), 2);
}

#[test]
fn test_soft_delete_cascades_to_owned_columns() {
    let (_, store) = soft_store();
    let (sales, orders, columns) = table_with_columns(&store);

    let response = store.delete_by_id(&store.request_context(), &orders).unwrap();
    assert_eq!(response.deleted().len(), 3);
    assert!(response.updated().iter().any(|h| h.guid == sales));

    assert_eq!(entity(&store, &orders).status, Status::Deleted);
    for column in &columns {
        assert_eq!(entity(&store, column).status, Status::Deleted);
    }
    assert!(entity(&store, &sales).attribute("tables").is_none());

    let again = store.delete_by_id(&store.request_context(), &orders).unwrap();
    assert!(again.deleted().is_empty());
}

fn column_edges(graph: &InMemoryGraph, table_guid: &str) -> Vec<(String, Option<Value>)> {
    let tx = graph.begin();
    let vertex = tx.query_vertices("__guid", &Value::from(table_guid))[0];
    let Some(Value::Array(ids)) = tx.vertex_property(vertex, "Table.columns") else {
        return Vec::new();
    };
    ids.iter()
        .filter_map(|id| id.as_str())
        .map(|id| {
            let state = EdgeId::parse(id).and_then(|edge| tx.edge_property(edge, "__state"));
            (id.to_string(), state)
        })
        .collect()
}

#[test]
fn test_full_update_reactivates_deleted_owned_column() {
    let (graph, store) = soft_store();
    let (_, orders, columns) = table_with_columns(&store);
    let before = column_edges(&graph, &orders);

    let deleted = store.delete_by_id(&store.request_context(), &columns[0]).unwrap();
    assert_eq!(deleted.deleted().len(), 1);
    assert_eq!(entity(&store, &columns[0]).status, Status::Deleted);
    assert_eq!(column_edges(&graph, &orders)[0].1, Some(Value::from("DELETED")));

    let orders_again = table("sales.orders", "orders")
        .with_attribute("db", db_ref("sales"))
        .with_attribute(
            "columns",
            vec![ObjectId::new(columns[0].clone(), "Column"), ObjectId::new(columns[1].clone(), "Column")],
        );
    let response = create(&store, vec![orders_again]);

    assert!(response.updated().iter().any(|h| h.guid == columns[0]));
    assert_eq!(entity(&store, &columns[0]).status, Status::Active);
    assert_eq!(object_guids(entity(&store, &orders).attribute("columns")), columns);

    // the original edge is reused, not replaced
    let after = column_edges(&graph, &orders);
    assert_eq!(after.len(), 2);
    assert_eq!(after[0].0, before[0].0);
    assert_eq!(after[0].1, Some(Value::from("ACTIVE")));
}

#[test]
fn test_hard_delete_removes_vertices() {
    let graph = Arc::new(InMemoryGraph::new());
    let store = catalog_store(Arc::clone(&graph), test_config(DeleteMode::Hard));
    let (sales, orders, columns) = table_with_columns(&store);

    store.delete_by_ids(&store.request_context(), &[orders.clone()]).unwrap();

    let request = store.request_context();
    assert!(store.get_by_id(&request, &orders, false).unwrap_err().is_not_found());
    for column in &columns {
        assert!(store.get_by_id(&request, column, false).unwrap_err().is_not_found());
    }
    assert!(entity(&store, &sales).attribute("tables").is_none());
    assert_eq!(graph.vertex_count(), 1);
}

#[test]
fn test_delete_by_unique_attributes() {
    let (_, store) = soft_store();
    create(&store, vec![db("sales")]);
    let request = store.request_context();

    let mut key = HashMap::new();
    key.insert("qualifiedName".to_string(), Value::from("sales"));
    let response = store.delete_by_unique_attributes(&request, "Db", &key).unwrap();
    assert_eq!(response.deleted().len(), 1);

    let missing = store.delete_by_unique_attributes(&request, "Db", &key).unwrap();
    assert!(missing.is_empty());

    let err = store
        .delete_by_unique_attributes(&request, "Db", &HashMap::new())
        .unwrap_err();
    assert!(matches!(err, RepositoryError::EntityByUniqueAttributesNotFound { .. }));
}

#[test]
fn test_classification_attach_and_detach() {
    let (_, store) = soft_store();
    let guid = guid_of(&create(&store, vec![table("sales.t1", "t1")]), "Table");
    let request = store.request_context();

    store
        .add_classifications(&request, &guid, &[Classification::new("PII").with_attribute("level", 2i64)])
        .unwrap();
    let err = store
        .add_classifications(&request, &guid, &[Classification::new("PII")])
        .unwrap_err();
    assert!(matches!(err, RepositoryError::ClassificationAlreadyAssociated { .. }));

    store
        .add_classification(&request, &[guid.clone()], &Classification::new("Retained").with_attribute("days", 30i64))
        .unwrap();
    assert_eq!(
        store.get_header_by_id(&request, &guid).unwrap().classification_names,
        vec!["PII".to_string(), "Retained".to_string()]
    );

    store
        .update_classifications(&request, &guid, &[Classification::new("PII").with_attribute("level", 3i64)])
        .unwrap();
    let pii = store.get_classification(&request, &guid, "PII").unwrap();
    assert_eq!(pii.attributes.get("level"), Some(&AttrValue::from(3i64)));

    store.delete_classification(&request, &guid, "PII").unwrap();
    let err = store.delete_classification(&request, &guid, "PII").unwrap_err();
    assert!(matches!(err, RepositoryError::ClassificationNotFound { .. }));

    let remaining = store.get_classifications(&request, &guid).unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].type_name, "Retained");
    assert_eq!(
        store.get_header_by_id(&request, &guid).unwrap().classification_names,
        vec!["Retained".to_string()]
    );
}

#[test]
fn test_entity_round_trips_through_the_graph() {
    let (_, store) = soft_store();
    let sales = guid_of(
        &create(
            &store,
            vec![db("sales").with_attribute("parameters", {
                let mut params = HashMap::new();
                params.insert("owner".to_string(), AttrValue::from("finance"));
                params.insert("tier".to_string(), AttrValue::from("gold"));
                AttrValue::Map(params)
            })],
        ),
        "Db",
    );
    let replica = guid_of(&create(&store, vec![table("hr.orders", "orders")]), "Table");

    let sd = Struct::new("StorageDesc")
        .with_attribute("location", "s3://sales/orders")
        .with_attribute("compressed", true);
    let orders = table("sales.orders", "orders")
        .with_attribute("db", db_ref("sales"))
        .with_attribute("sd", sd.clone())
        .with_attribute("tableType", "EXTERNAL")
        .with_attribute("retention", 7i64)
        .with_attribute("aliases", vec!["o", "ord"])
        .with_attribute("replicaOf", ObjectId::new(replica.clone(), "Table"));
    let orders = guid_of(&create(&store, vec![orders]), "Table");

    let stored = entity(&store, &orders);
    assert_eq!(stored.attribute("sd"), Some(&AttrValue::Struct(sd)));
    assert_eq!(stored.attribute("tableType").and_then(|v| v.as_str()), Some("EXTERNAL"));
    assert_eq!(stored.attribute("retention"), Some(&AttrValue::from(7i64)));
    assert_eq!(stored.attribute("aliases"), Some(&AttrValue::from(vec!["o", "ord"])));
    assert_eq!(
        stored.attribute("replicaOf"),
        Some(&AttrValue::ObjectId(ObjectId::new(replica, "Table")))
    );
    assert_eq!(object_guids(stored.attribute("db")), vec![sales.clone()]);

    let params = entity(&store, &sales);
    let params = params.attribute("parameters").and_then(|v| v.as_map()).unwrap();
    assert_eq!(params.get("tier").and_then(|v| v.as_str()), Some("gold"));
    assert_eq!(params.len(), 2);
}

#[test]
fn test_partial_update_keeps_absent_attributes() {
    let (_, store) = soft_store();
    let guid = guid_of(
        &create(&store, vec![table("sales.t1", "t1").with_attribute("retention", 7i64)]),
        "Table",
    );
    let request = store.request_context();

    let update = Entity::new("Table").with_attribute("description", "orders");
    let response = store
        .update_entity(&request, &ObjectId::new(guid.clone(), "Table"), EntityWithExtInfo::new(update))
        .unwrap();
    assert_eq!(response.partial_updated().len(), 1);

    let stored = entity(&store, &guid);
    assert_eq!(stored.attribute("description").and_then(|v| v.as_str()), Some("orders"));
    assert_eq!(stored.attribute("retention"), Some(&AttrValue::from(7i64)));
}

#[test]
fn test_update_single_attribute_by_guid() {
    let (_, store) = soft_store();
    let sales = guid_of(&create(&store, vec![db("sales")]), "Db");
    let t1 = guid_of(&create(&store, vec![table("sales.t1", "t1")]), "Table");
    let request = store.request_context();

    store
        .update_entity_attribute_by_guid(&request, &t1, "description", AttrValue::from("orders"))
        .unwrap();
    store
        .update_entity_attribute_by_guid(&request, &t1, "db", AttrValue::from(sales.as_str()))
        .unwrap();

    let stored = entity(&store, &t1);
    assert_eq!(stored.attribute("description").and_then(|v| v.as_str()), Some("orders"));
    assert_eq!(object_guids(stored.attribute("db")), vec![sales]);

    let err = store
        .update_entity_attribute_by_guid(&request, &t1, "aliases", AttrValue::from(vec!["x"]))
        .unwrap_err();
    assert!(matches!(err, RepositoryError::UnsupportedAttributeType { .. }));
    let err = store
        .update_entity_attribute_by_guid(&request, &t1, "nope", AttrValue::from("x"))
        .unwrap_err();
    assert!(matches!(err, RepositoryError::UnknownAttribute { .. }));
}

#[test]
fn test_relationship_between_tables() {
    let (_, store) = soft_store();
    let source = guid_of(&create(&store, vec![table("sales.raw", "raw")]), "Table");
    let target = guid_of(&create(&store, vec![table("sales.clean", "clean")]), "Table");
    let request = store.request_context();

    let relationship = Relationship::new(
        "table_lineage",
        ObjectId::new(source.clone(), "Table"),
        ObjectId::by_unique_attribute("Table", "qualifiedName", "sales.clean"),
    )
    .with_attribute("query", "insert into clean select * from raw");
    let created = store.create_relationship(&request, &relationship).unwrap();
    let guid = created.guid.clone().expect("relationship guid");

    let fetched = store.get_relationship_by_guid(&request, &guid).unwrap();
    assert_eq!(fetched.end1.guid(), Some(source.as_str()));
    assert_eq!(fetched.end2.guid(), Some(target.as_str()));
    assert_eq!(
        fetched.attributes.get("query").and_then(|v| v.as_str()),
        Some("insert into clean select * from raw")
    );

    let err = store
        .create_relationship(&request, &relationship.clone().with_attribute("bogus", 1i64))
        .unwrap_err();
    assert!(matches!(err, RepositoryError::UnknownAttribute { .. }));
    assert!(store
        .get_relationship_by_guid(&request, "missing")
        .unwrap_err()
        .is_not_found());
}

#[test]
fn test_edge_write_failures_roll_back_the_call() {
    let graph = Arc::new(InMemoryGraph::new());
    let mut config = test_config(DeleteMode::Soft);
    config.graph.edge_retries = 2;
    let store = catalog_store(Arc::clone(&graph), config);
    let sd = Struct::new("StorageDesc").with_attribute("location", "/tmp");

    graph.fail_next_edge_writes(1);
    create(&store, vec![table("sales.t1", "t1").with_attribute("sd", sd.clone())]);
    let committed_vertices = graph.vertex_count();

    graph.fail_next_edge_writes(10);
    let err = store
        .create_or_update(
            &store.request_context(),
            &BatchEntityStream::from(table("sales.t2", "t2").with_attribute("sd", sd)),
            false,
        )
        .unwrap_err();
    assert!(matches!(err, RepositoryError::Internal(_)));
    assert_eq!(graph.vertex_count(), committed_vertices);
    assert!(graph.rollback_count() >= 1);
    assert!(store.locks().is_empty());
}

/// Reports every reference deletion as blocked without touching the graph
struct BlockingDeleteHandler {
    inner: GraphDeleteHandler,
    blocked: AtomicUsize,
}

impl DeleteHandler for BlockingDeleteHandler {
    fn delete_entities(&self, ctx: &mut TransactionContext<'_>, vertices: &[VertexId]) -> metagraph_store::Result<()> {
        self.inner.delete_entities(ctx, vertices)
    }

    fn delete_edge_reference(
        &self,
        _ctx: &mut TransactionContext<'_>,
        _edge: &EdgeInfo,
        _category: TypeCategory,
        _is_owned: bool,
        _force: bool,
    ) -> metagraph_store::Result<bool> {
        self.blocked.fetch_add(1, Ordering::SeqCst);
        Ok(false)
    }

    fn mode(&self) -> DeleteMode {
        self.inner.mode()
    }
}

fn bucket_registry() -> Arc<TypeRegistry> {
    Arc::new(
        TypeRegistry::new(TypesDef {
            entity_defs: vec![
                EntityDef {
                    name: "Item".into(),
                    super_types: vec![],
                    attribute_defs: vec![AttributeDef::new("name", "string").unique().required()],
                },
                EntityDef {
                    name: "Bucket".into(),
                    super_types: vec![],
                    attribute_defs: vec![
                        AttributeDef::new("name", "string").unique().required(),
                        AttributeDef::new("items", "array<Item>"),
                    ],
                },
            ],
            ..Default::default()
        })
        .unwrap(),
    )
}

fn item(name: &str) -> ObjectId {
    ObjectId::by_unique_attribute("Item", "name", name)
}

fn bucket(items: &[&str]) -> Entity {
    Entity::new("Bucket")
        .with_attribute("name", "b")
        .with_attribute("items", items.iter().map(|n| item(n)).collect::<Vec<_>>())
}

fn item_edges(graph: &InMemoryGraph, bucket_guid: &str) -> Vec<Value> {
    let tx = graph.begin();
    let vertex = tx.query_vertices("__guid", &Value::from(bucket_guid))[0];
    match tx.vertex_property(vertex, "Bucket.items") {
        Some(Value::Array(ids)) => ids,
        _ => Vec::new(),
    }
}

fn seed_items(store: &EntityStore) {
    let items = ["x", "y", "z", "w"]
        .iter()
        .map(|n| Entity::new("Item").with_attribute("name", *n))
        .collect();
    create(store, items);
}

#[test]
fn test_array_update_keeps_edges_whose_deletion_is_blocked() {
    let registry = bucket_registry();
    let graph = Arc::new(InMemoryGraph::new());
    let handler = Arc::new(BlockingDeleteHandler {
        inner: GraphDeleteHandler::new(Arc::clone(&registry), DeleteMode::Soft),
        blocked: AtomicUsize::new(0),
    });
    let store = EntityStore::new(graph.clone(), registry, test_config(DeleteMode::Soft))
        .with_delete_handler(handler.clone());
    seed_items(&store);

    let guid = guid_of(&create(&store, vec![bucket(&["x", "y", "z"])]), "Bucket");
    let before = item_edges(&graph, &guid);
    assert_eq!(before.len(), 3);

    create(&store, vec![bucket(&["y", "w"])]);
    let after = item_edges(&graph, &guid);
    assert_eq!(handler.blocked.load(Ordering::SeqCst), 2);
    assert_eq!(after.len(), 4);
    assert_eq!(after[0], before[1]);
    assert!(after.contains(&before[0]));
    assert!(after.contains(&before[2]));
}

#[test]
fn test_array_update_replaces_removed_edges() {
    let registry = bucket_registry();
    let graph = Arc::new(InMemoryGraph::new());
    let store = EntityStore::new(graph.clone(), registry, test_config(DeleteMode::Soft));
    seed_items(&store);

    let guid = guid_of(&create(&store, vec![bucket(&["x", "y", "z"])]), "Bucket");
    let before = item_edges(&graph, &guid);

    create(&store, vec![bucket(&["y", "w"])]);
    let after = item_edges(&graph, &guid);
    assert_eq!(after.len(), 2);
    assert_eq!(after[0], before[1]);
    assert!(!before.contains(&after[1]));

    let names: Vec<String> = match entity(&store, &guid).attribute("items") {
        Some(AttrValue::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_object_id())
            .filter_map(|id| id.unique_attributes.get("name").and_then(|v| v.as_str()).map(str::to_string))
            .collect(),
        _ => Vec::new(),
    };
    assert_eq!(names, vec!["y".to_string(), "w".to_string()]);
}
