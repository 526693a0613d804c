use crate::error::{RepositoryError, Result};
use crate::logic::graph_helper::GraphHelper;
use crate::logic::transaction::TransactionContext;
use crate::model::{
    is_assigned_guid, AttrValue, AttributeType, EntitiesWithExtInfo, Entity, EntityType, EntityWithExtInfo,
    Guid, ObjectId, Status, TypeRegistry,
};
use crate::store::VertexId;
use itertools::Itertools;
use log::debug;
use serde_json::Value;
use std::collections::HashMap;

/// Rewindable sequence of incoming entities
pub trait EntityStream {
    /// Top-level entities, in input order
    fn entities(&self) -> Box<dyn Iterator<Item = &Entity> + '_>;

    /// Any entity carried by the stream, referred entities included
    fn get_by_guid(&self, guid: &str) -> Option<&Entity>;

    /// Import streams keep the guids they carry
    fn is_import(&self) -> bool {
        false
    }
}

/// Stream over a batch of entities and the entities they refer to
#[derive(Debug, Clone, Default)]
pub struct BatchEntityStream {
    entities: EntitiesWithExtInfo,
}

impl BatchEntityStream {
    pub fn new(entities: EntitiesWithExtInfo) -> Self {
        Self { entities }
    }

    pub fn is_empty(&self) -> bool {
        self.entities.entities.is_empty()
    }
}

impl From<Entity> for BatchEntityStream {
    fn from(entity: Entity) -> Self {
        Self::new(EntitiesWithExtInfo::new(vec![entity]))
    }
}

impl From<Vec<Entity>> for BatchEntityStream {
    fn from(entities: Vec<Entity>) -> Self {
        Self::new(EntitiesWithExtInfo::new(entities))
    }
}

impl From<EntityWithExtInfo> for BatchEntityStream {
    fn from(entity: EntityWithExtInfo) -> Self {
        Self::new(entity.into())
    }
}

impl From<EntitiesWithExtInfo> for BatchEntityStream {
    fn from(entities: EntitiesWithExtInfo) -> Self {
        Self::new(entities)
    }
}

impl EntityStream for BatchEntityStream {
    fn entities(&self) -> Box<dyn Iterator<Item = &Entity> + '_> {
        Box::new(self.entities.entities.iter())
    }

    fn get_by_guid(&self, guid: &str) -> Option<&Entity> {
        self.entities.get_entity(guid)
    }
}

/// Stream of exported entities being imported with their original guids
#[derive(Debug, Clone, Default)]
pub struct ImportEntityStream {
    batch: BatchEntityStream,
}

impl ImportEntityStream {
    pub fn new(entities: Vec<EntityWithExtInfo>) -> Self {
        let mut merged = EntitiesWithExtInfo::default();
        for entity in entities {
            merged.entities.extend(entity.entity);
            merged.referred_entities.extend(entity.referred_entities);
        }
        Self {
            batch: BatchEntityStream::new(merged),
        }
    }
}

impl EntityStream for ImportEntityStream {
    fn entities(&self) -> Box<dyn Iterator<Item = &Entity> + '_> {
        self.batch.entities()
    }

    fn get_by_guid(&self, guid: &str) -> Option<&Entity> {
        self.batch.get_by_guid(guid)
    }

    fn is_import(&self) -> bool {
        true
    }
}

/// Lock and lookup key for an entity known only by its unique attributes
pub fn unique_attributes_key(type_name: &str, values: &HashMap<String, Value>) -> String {
    let pairs = values.iter().map(|(k, v)| format!("{}={}", k, v)).sorted().join(",");
    format!("{}:{}", type_name, pairs)
}

/// Primitive values of the type's unique attributes present on the entity
pub fn unique_attribute_values(entity_type: &EntityType, entity: &Entity) -> HashMap<String, Value> {
    entity_type
        .unique_attributes()
        .filter_map(|attr| match entity.attributes.get(&attr.name) {
            Some(AttrValue::Primitive(value)) if !value.is_null() => Some((attr.name.clone(), value.clone())),
            _ => None,
        })
        .collect()
}

/// Active vertex of `entity_type` (or a subtype) matching one of the unique attributes
pub fn find_by_unique_attributes(
    ctx: &mut TransactionContext<'_>,
    entity_type: &EntityType,
    values: &HashMap<String, Value>,
) -> Option<VertexId> {
    for attribute in entity_type.unique_attributes() {
        let Some(value) = values.get(&attribute.name).filter(|v| !v.is_null()) else {
            continue;
        };
        let candidates = ctx.graph().query_vertices(&attribute.vertex_property, value);
        for vertex in candidates {
            if GraphHelper::status(ctx, vertex) != Status::Active {
                continue;
            }
            if is_instance_of(ctx, vertex, &entity_type.name) {
                return Some(vertex);
            }
        }
    }
    None
}

fn is_instance_of(ctx: &TransactionContext<'_>, vertex: VertexId, type_name: &str) -> bool {
    GraphHelper::type_name(ctx, vertex).as_deref() == Some(type_name)
        || GraphHelper::super_type_names(ctx, vertex).iter().any(|t| t == type_name)
}

#[derive(Debug, Clone)]
struct UniqueAttributesEntry {
    /// Concrete type followed by all its super types
    type_names: Vec<String>,
    values: HashMap<String, Value>,
    vertex: VertexId,
}

impl UniqueAttributesEntry {
    fn matches(&self, id: &ObjectId) -> bool {
        !id.unique_attributes.is_empty()
            && self.type_names.iter().any(|t| *t == id.type_name)
            && id
                .unique_attributes
                .iter()
                .all(|(k, v)| self.values.get(k) == Some(v))
    }
}

/// References collected from a stream and the vertices they resolved to
#[derive(Debug, Clone, Default)]
pub struct EntityGraphDiscoveryContext {
    referenced_guids: Vec<Guid>,
    referenced_ids_by_unique_attributes: Vec<ObjectId>,
    resolved_guids: HashMap<Guid, VertexId>,
    resolved_by_unique_attributes: Vec<UniqueAttributesEntry>,
    /// Referenced guids of stream entities that do not exist yet
    local_guids: Vec<Guid>,
}

impl EntityGraphDiscoveryContext {
    fn add_referenced_guid(&mut self, guid: &str) {
        if !self.referenced_guids.iter().any(|g| g == guid) {
            self.referenced_guids.push(guid.to_string());
        }
    }

    fn add_referenced_by_unique_attributes(&mut self, id: &ObjectId) {
        if !self.referenced_ids_by_unique_attributes.contains(id) {
            self.referenced_ids_by_unique_attributes.push(id.clone());
        }
    }

    /// Every guid touched by the stream, in discovery order
    pub fn referenced_guids(&self) -> &[Guid] {
        &self.referenced_guids
    }

    pub fn referenced_ids_by_unique_attributes(&self) -> &[ObjectId] {
        &self.referenced_ids_by_unique_attributes
    }

    pub fn local_guids(&self) -> &[Guid] {
        &self.local_guids
    }

    pub fn resolved_guid_vertex(&self, guid: &str) -> Option<VertexId> {
        self.resolved_guids.get(guid).copied()
    }

    pub fn add_resolved_guid(&mut self, guid: &str, vertex: VertexId) {
        self.resolved_guids.insert(guid.to_string(), vertex);
    }

    pub fn add_resolved_by_unique_attributes(
        &mut self,
        entity_type: &EntityType,
        values: HashMap<String, Value>,
        vertex: VertexId,
    ) {
        if values.is_empty() {
            return;
        }
        let mut type_names = vec![entity_type.name.clone()];
        type_names.extend(entity_type.all_super_types.iter().cloned());
        self.resolved_by_unique_attributes.push(UniqueAttributesEntry {
            type_names,
            values,
            vertex,
        });
    }

    pub fn resolved_by_unique_attributes(&self, id: &ObjectId) -> Option<VertexId> {
        self.resolved_by_unique_attributes
            .iter()
            .find(|entry| entry.matches(id))
            .map(|entry| entry.vertex)
    }

    /// Vertex for a reference: by guid first, then by unique attributes
    pub fn resolve_object_id(&self, id: &ObjectId) -> Option<VertexId> {
        id.guid()
            .and_then(|guid| self.resolved_guid_vertex(guid))
            .or_else(|| self.resolved_by_unique_attributes(id))
    }
}

/// Two passes over an entity stream: collect every reference, then resolve
/// each one to an existing vertex or mark it as a stream entity to create.
pub struct EntityGraphDiscovery<'a> {
    registry: &'a TypeRegistry,
}

impl<'a> EntityGraphDiscovery<'a> {
    pub fn new(registry: &'a TypeRegistry) -> Self {
        Self { registry }
    }

    /// Collects references, locks the entities the stream will write, then resolves
    pub fn discover_entities(
        &self,
        ctx: &mut TransactionContext<'_>,
        stream: &dyn EntityStream,
    ) -> Result<EntityGraphDiscoveryContext> {
        let mut discovery = EntityGraphDiscoveryContext::default();
        for entity in stream.entities() {
            self.collect_entity_references(entity, &mut discovery);
        }

        let lock_keys = self.lock_keys(ctx, stream, &discovery);
        ctx.lock(lock_keys.as_slice());

        self.resolve_guid_references(ctx, stream, &mut discovery)?;
        self.resolve_unique_attribute_references(ctx, stream, &mut discovery)?;

        debug!(
            "discovered {} guid references ({} local), {} unique-attribute references",
            discovery.referenced_guids.len(),
            discovery.local_guids.len(),
            discovery.referenced_ids_by_unique_attributes.len()
        );
        Ok(discovery)
    }

    fn collect_entity_references(&self, entity: &Entity, discovery: &mut EntityGraphDiscoveryContext) {
        discovery.add_referenced_guid(&entity.guid);

        let Some(entity_type) = self.registry.find_entity_type(&entity.type_name) else {
            return;
        };
        for attribute in entity_type.attributes() {
            if let Some(value) = entity.attributes.get(&attribute.name) {
                self.collect_value_references(&attribute.attr_type, value, discovery);
            }
        }
    }

    fn collect_value_references(
        &self,
        attr_type: &AttributeType,
        value: &AttrValue,
        discovery: &mut EntityGraphDiscoveryContext,
    ) {
        match attr_type {
            AttributeType::ObjectId(_) => match value {
                AttrValue::ObjectId(id) => match id.guid() {
                    Some(guid) => discovery.add_referenced_guid(guid),
                    None if !id.unique_attributes.is_empty() => discovery.add_referenced_by_unique_attributes(id),
                    None => {}
                },
                AttrValue::Primitive(Value::String(guid)) if !guid.is_empty() => discovery.add_referenced_guid(guid),
                AttrValue::Map(m) => {
                    if let Some(guid) = m.get("guid").and_then(|v| v.as_str()) {
                        discovery.add_referenced_guid(guid);
                    }
                }
                _ => {}
            },
            AttributeType::Struct(name) => {
                let (Some(value), Ok(struct_type)) = (value.as_struct(), self.registry.struct_type(name)) else {
                    return;
                };
                for attribute in struct_type.attributes() {
                    if let Some(v) = value.attributes.get(&attribute.name) {
                        self.collect_value_references(&attribute.attr_type, v, discovery);
                    }
                }
            }
            AttributeType::Array(element) => {
                for item in value.as_array().into_iter().flatten() {
                    self.collect_value_references(element, item, discovery);
                }
            }
            AttributeType::Map(element) => {
                for item in value.as_map().into_iter().flat_map(|m| m.values()) {
                    self.collect_value_references(element, item, discovery);
                }
            }
            AttributeType::Primitive(_) | AttributeType::Enum { .. } | AttributeType::Classification(_) => {}
        }
    }

    /// Identifiers of every stream entity this call may write
    fn lock_keys(
        &self,
        ctx: &mut TransactionContext<'_>,
        stream: &dyn EntityStream,
        discovery: &EntityGraphDiscoveryContext,
    ) -> Vec<String> {
        let mut keys: Vec<String> = Vec::new();

        for guid in &discovery.referenced_guids {
            let Some(entity) = stream.get_by_guid(guid) else {
                continue;
            };
            if is_assigned_guid(guid) {
                keys.push(guid.clone());
                if stream.is_import() {
                    continue;
                }
            }
            let Some(entity_type) = self.registry.find_entity_type(&entity.type_name) else {
                continue;
            };
            let values = unique_attribute_values(entity_type, entity);
            if values.is_empty() {
                continue;
            }
            // writers that found no vertex yet hold only the unique-attributes key
            if let Some(existing) =
                find_by_unique_attributes(ctx, entity_type, &values).and_then(|vertex| GraphHelper::guid(ctx, vertex))
            {
                keys.push(existing);
            }
            keys.push(unique_attributes_key(&entity_type.name, &values));
        }

        keys.into_iter().sorted().dedup().collect()
    }

    fn resolve_guid_references(
        &self,
        ctx: &mut TransactionContext<'_>,
        stream: &dyn EntityStream,
        discovery: &mut EntityGraphDiscoveryContext,
    ) -> Result<()> {
        for guid in discovery.referenced_guids.clone() {
            let assigned = is_assigned_guid(&guid);
            let mut vertex = if assigned {
                GraphHelper::find_vertex_by_guid(ctx, &guid)
            } else {
                None
            };

            if vertex.is_none() {
                match stream.get_by_guid(&guid) {
                    Some(entity) if !stream.is_import() => {
                        let entity_type = self.registry.entity_type(&entity.type_name)?;
                        let values = unique_attribute_values(entity_type, entity);
                        vertex = find_by_unique_attributes(ctx, entity_type, &values);
                    }
                    Some(_) => {}
                    None => return Err(RepositoryError::ReferencedEntityNotFound(guid)),
                }
            }

            match vertex {
                Some(vertex) => discovery.add_resolved_guid(&guid, vertex),
                None => discovery.local_guids.push(guid),
            }
        }
        Ok(())
    }

    fn resolve_unique_attribute_references(
        &self,
        ctx: &mut TransactionContext<'_>,
        stream: &dyn EntityStream,
        discovery: &mut EntityGraphDiscoveryContext,
    ) -> Result<()> {
        for id in discovery.referenced_ids_by_unique_attributes.clone() {
            let entity_type = self.registry.entity_type(&id.type_name)?;
            if let Some(vertex) = find_by_unique_attributes(ctx, entity_type, &id.unique_attributes) {
                discovery.add_resolved_by_unique_attributes(entity_type, id.unique_attributes.clone(), vertex);
                continue;
            }

            let in_stream = discovery.local_guids.iter().any(|guid| {
                stream.get_by_guid(guid).map_or(false, |entity| {
                    self.registry
                        .find_entity_type(&entity.type_name)
                        .map_or(false, |t| t.is_sub_type_of(&id.type_name))
                        && id
                            .unique_attributes
                            .iter()
                            .all(|(k, v)| matches!(entity.attributes.get(k), Some(AttrValue::Primitive(p)) if p == v))
                })
            });
            if !in_stream {
                return Err(RepositoryError::ReferencedEntityNotFound(unique_attributes_key(
                    &id.type_name,
                    &id.unique_attributes,
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::locks::LockCoordinator;
    use crate::logic::transaction::{RequestContext, TransactionScope};
    use crate::model::{AttributeDef, EntityDef, TypesDef};
    use crate::store::InMemoryGraph;
    use serde_json::json;

    fn registry() -> TypeRegistry {
        TypeRegistry::new(TypesDef {
            entity_defs: vec![
                EntityDef {
                    name: "Db".into(),
                    super_types: vec![],
                    attribute_defs: vec![AttributeDef::new("qualifiedName", "string").unique()],
                },
                EntityDef {
                    name: "Table".into(),
                    super_types: vec![],
                    attribute_defs: vec![
                        AttributeDef::new("qualifiedName", "string").unique(),
                        AttributeDef::new("db", "Db"),
                    ],
                },
            ],
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_references_to_stream_entities_stay_local() {
        let registry = registry();
        let graph = InMemoryGraph::new();
        let locks = LockCoordinator::new();
        let scope = TransactionScope::new(&graph, &locks);

        let db = Entity::new("Db").with_attribute("qualifiedName", "sales");
        let table = Entity::new("Table")
            .with_attribute("qualifiedName", "sales.orders")
            .with_attribute("db", ObjectId::new(db.guid.clone(), "Db"));
        let stream = BatchEntityStream::from(vec![table.clone(), db.clone()]);

        let discovery = scope
            .run(RequestContext::new("tester"), |ctx| {
                let discovery = EntityGraphDiscovery::new(&registry).discover_entities(ctx, &stream)?;
                assert!(ctx.held_locks().iter().any(|k| k.starts_with("Db:qualifiedName=")));
                Ok(discovery)
            })
            .unwrap();

        assert_eq!(discovery.referenced_guids(), &[table.guid.clone(), db.guid.clone()]);
        assert_eq!(discovery.local_guids().len(), 2);
        assert!(locks.is_empty());
    }

    #[test]
    fn test_missing_reference_outside_stream_fails() {
        let registry = registry();
        let graph = InMemoryGraph::new();
        let locks = LockCoordinator::new();
        let scope = TransactionScope::new(&graph, &locks);

        let by_guid = BatchEntityStream::from(
            Entity::new("Table").with_attribute("db", ObjectId::new("no-such-guid", "Db")),
        );
        let result = scope.run(RequestContext::new("tester"), |ctx| {
            EntityGraphDiscovery::new(&registry).discover_entities(ctx, &by_guid)
        });
        assert!(matches!(result, Err(RepositoryError::ReferencedEntityNotFound(g)) if g == "no-such-guid"));

        let by_name = BatchEntityStream::from(
            Entity::new("Table").with_attribute("db", ObjectId::by_unique_attribute("Db", "qualifiedName", "nope")),
        );
        let result = scope.run(RequestContext::new("tester"), |ctx| {
            EntityGraphDiscovery::new(&registry).discover_entities(ctx, &by_name)
        });
        assert!(matches!(result, Err(RepositoryError::ReferencedEntityNotFound(_))));
    }

    #[test]
    fn test_existing_vertex_resolves_by_unique_attributes() {
        let registry = registry();
        let graph = InMemoryGraph::new();
        let locks = LockCoordinator::new();
        let scope = TransactionScope::new(&graph, &locks);

        scope
            .run(RequestContext::new("tester"), |ctx| {
                let v = GraphHelper::create_vertex(ctx, "Db", &[])?;
                ctx.graph_mut().set_vertex_property(v, "__guid", json!("db-guid"))?;
                ctx.graph_mut().set_vertex_property(v, "Db.qualifiedName", json!("sales"))
            })
            .unwrap();

        let incoming = Entity::new("Db").with_attribute("qualifiedName", "sales");
        let stream = BatchEntityStream::from(incoming.clone());
        let discovery = scope
            .run(RequestContext::new("tester"), |ctx| {
                let discovery = EntityGraphDiscovery::new(&registry).discover_entities(ctx, &stream)?;
                assert_eq!(
                    ctx.held_locks(),
                    &["Db:qualifiedName=\"sales\"".to_string(), "db-guid".to_string()]
                );
                Ok(discovery)
            })
            .unwrap();

        assert!(discovery.resolved_guid_vertex(&incoming.guid).is_some());
        assert!(discovery.local_guids().is_empty());
    }
}
