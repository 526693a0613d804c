use crate::error::{RepositoryError, Result};
use crate::logic::graph_helper::{
    GraphHelper, CREATED_BY_PROPERTY, MODIFICATION_TIMESTAMP_PROPERTY, MODIFIED_BY_PROPERTY,
    RELATIONSHIP_GUID_PROPERTY, RELATIONSHIP_TYPE_PROPERTY, TIMESTAMP_PROPERTY, VERSION_PROPERTY,
};
use crate::logic::transaction::TransactionContext;
use crate::model::{
    from_epoch_millis, AttrValue, Attribute, AttributeType, Classification, EdgeDirection, EntitiesWithExtInfo,
    Entity, EntityHeader, EntityWithExtInfo, Guid, ObjectId, RelatedObjectId, Relationship, RelationshipAttrValue,
    Status, Struct, TypeRegistry,
};
use crate::store::{Direction, EdgeId, EdgeInfo, VertexId};
use log::{debug, warn};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Attributes included in every header besides the unique ones
const DISPLAY_ATTRIBUTES: [&str; 4] = ["name", "description", "owner", "createTime"];

/// Entities expanded while retrieving, keyed by guid
#[derive(Debug, Default)]
pub struct ExtInfoAccumulator {
    entities: HashMap<Guid, Entity>,
    in_progress: HashSet<Guid>,
    min_ext_info: bool,
}

impl ExtInfoAccumulator {
    pub fn new(min_ext_info: bool) -> Self {
        Self {
            min_ext_info,
            ..Default::default()
        }
    }

    pub fn contains(&self, guid: &str) -> bool {
        self.entities.contains_key(guid) || self.in_progress.contains(guid)
    }

    fn into_referred(mut self, top_level: &[&str]) -> HashMap<Guid, Entity> {
        for guid in top_level {
            self.entities.remove(*guid);
        }
        self.entities
    }
}

/// Rebuilds entities, headers, classifications and relationships from vertices
#[derive(Clone)]
pub struct EntityGraphRetriever {
    registry: Arc<TypeRegistry>,
}

impl EntityGraphRetriever {
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        Self { registry }
    }

    pub fn entity_vertex(&self, ctx: &mut TransactionContext<'_>, guid: &str) -> Result<VertexId> {
        GraphHelper::find_vertex_by_guid(ctx, guid).ok_or_else(|| RepositoryError::EntityNotFound(guid.to_string()))
    }

    pub fn to_entity(&self, ctx: &mut TransactionContext<'_>, guid: &str) -> Result<Entity> {
        let vertex = self.entity_vertex(ctx, guid)?;
        self.map_vertex_to_entity(ctx, vertex, None)
    }

    /// The entity plus the owned entities it references, expanded fully or minimally
    pub fn to_entity_with_ext_info(
        &self,
        ctx: &mut TransactionContext<'_>,
        guid: &str,
        min_ext_info: bool,
    ) -> Result<EntityWithExtInfo> {
        let vertex = self.entity_vertex(ctx, guid)?;
        let mut accumulator = ExtInfoAccumulator::new(min_ext_info);
        let entity = self.map_vertex_to_entity(ctx, vertex, Some(&mut accumulator))?;
        let referred_entities = accumulator.into_referred(&[entity.guid.as_str()]);
        Ok(EntityWithExtInfo {
            entity: Some(entity),
            referred_entities,
        })
    }

    pub fn to_entities_with_ext_info(
        &self,
        ctx: &mut TransactionContext<'_>,
        guids: &[Guid],
        min_ext_info: bool,
    ) -> Result<EntitiesWithExtInfo> {
        let mut accumulator = ExtInfoAccumulator::new(min_ext_info);
        let mut entities = Vec::with_capacity(guids.len());
        for guid in guids {
            let vertex = self.entity_vertex(ctx, guid)?;
            entities.push(self.map_vertex_to_entity(ctx, vertex, Some(&mut accumulator))?);
        }
        let top_level: Vec<&str> = entities.iter().map(|e| e.guid.as_str()).collect();
        let referred_entities = accumulator.into_referred(&top_level);
        Ok(EntitiesWithExtInfo {
            entities,
            referred_entities,
        })
    }

    pub fn map_vertex_to_entity(
        &self,
        ctx: &mut TransactionContext<'_>,
        vertex: VertexId,
        mut accumulator: Option<&mut ExtInfoAccumulator>,
    ) -> Result<Entity> {
        let guid = GraphHelper::guid(ctx, vertex)
            .ok_or_else(|| RepositoryError::Internal(format!("vertex {} has no guid", vertex)))?;
        if let Some(existing) = accumulator.as_ref().and_then(|acc| acc.entities.get(&guid)) {
            return Ok(existing.clone());
        }

        let mut entity = self.map_system_attributes(ctx, vertex, guid.clone())?;
        let entity_type = self.registry.entity_type(&entity.type_name)?;
        if let Some(acc) = accumulator.as_deref_mut() {
            acc.in_progress.insert(guid.clone());
        }

        for attribute in entity_type.attributes() {
            if let Some(value) = self.map_attribute(ctx, vertex, attribute, accumulator.as_deref_mut())? {
                entity.attributes.insert(attribute.name.clone(), value);
            }
        }
        entity.relationship_attributes = self.map_relationship_attributes(ctx, vertex, &entity.type_name)?;
        entity.classifications = self.classifications(ctx, vertex)?;

        if let Some(acc) = accumulator {
            acc.in_progress.remove(&guid);
            acc.entities.insert(guid, entity.clone());
        }
        Ok(entity)
    }

    /// System attributes plus unique and display attributes only
    fn map_vertex_to_min_entity(&self, ctx: &mut TransactionContext<'_>, vertex: VertexId, guid: Guid) -> Result<Entity> {
        let mut entity = self.map_system_attributes(ctx, vertex, guid)?;
        let entity_type = self.registry.entity_type(&entity.type_name)?;
        for attribute in entity_type.attributes() {
            if !attribute.is_unique() && !DISPLAY_ATTRIBUTES.contains(&attribute.name.as_str()) {
                continue;
            }
            if let Some(value) = self.map_attribute(ctx, vertex, attribute, None)? {
                entity.attributes.insert(attribute.name.clone(), value);
            }
        }
        Ok(entity)
    }

    fn map_system_attributes(&self, ctx: &mut TransactionContext<'_>, vertex: VertexId, guid: Guid) -> Result<Entity> {
        let type_name = GraphHelper::type_name(ctx, vertex)
            .ok_or_else(|| RepositoryError::Internal(format!("vertex {} has no type name", vertex)))?;

        let mut entity = Entity::new(type_name).with_guid(guid);
        entity.status = GraphHelper::status(ctx, vertex);
        entity.version = GraphHelper::long_property(ctx, vertex, VERSION_PROPERTY).unwrap_or(0);
        entity.created_by = GraphHelper::string_property(ctx, vertex, CREATED_BY_PROPERTY);
        entity.updated_by = GraphHelper::string_property(ctx, vertex, MODIFIED_BY_PROPERTY);
        entity.create_time = GraphHelper::long_property(ctx, vertex, TIMESTAMP_PROPERTY).and_then(from_epoch_millis);
        entity.update_time =
            GraphHelper::long_property(ctx, vertex, MODIFICATION_TIMESTAMP_PROPERTY).and_then(from_epoch_millis);
        Ok(entity)
    }

    /// Current value of one attribute, `None` when nothing is stored
    pub fn entity_attribute_value(
        &self,
        ctx: &mut TransactionContext<'_>,
        vertex: VertexId,
        attribute: &Attribute,
    ) -> Result<Option<AttrValue>> {
        self.map_attribute(ctx, vertex, attribute, None)
    }

    fn map_attribute(
        &self,
        ctx: &mut TransactionContext<'_>,
        vertex: VertexId,
        attribute: &Attribute,
        mut accumulator: Option<&mut ExtInfoAccumulator>,
    ) -> Result<Option<AttrValue>> {
        let owner_active = GraphHelper::status(ctx, vertex) == Status::Active;

        match &attribute.attr_type {
            AttributeType::Primitive(_) | AttributeType::Enum { .. } => Ok(ctx
                .graph()
                .vertex_property(vertex, &attribute.vertex_property)
                .filter(|v| !v.is_null())
                .map(AttrValue::Primitive)),
            AttributeType::Struct(struct_name) => {
                let Some(edge) = self.visible_edge(ctx, vertex, &attribute.edge_label, owner_active) else {
                    return Ok(None);
                };
                Ok(Some(AttrValue::Struct(self.map_struct(ctx, edge.in_vertex, struct_name, accumulator)?)))
            }
            AttributeType::ObjectId(_) => {
                if attribute.is_soft_ref() {
                    let Some(encoded) = GraphHelper::string_property(ctx, vertex, &attribute.vertex_property) else {
                        return Ok(None);
                    };
                    return Ok(self
                        .map_soft_reference(ctx, &encoded, attribute.is_owned_ref(), accumulator)
                        .map(AttrValue::ObjectId));
                }
                let Some(edge) = self.visible_edge(ctx, vertex, &attribute.edge_label, owner_active) else {
                    return Ok(None);
                };
                let id = self.map_vertex_to_object_id(ctx, edge.in_vertex, attribute.is_owned_ref(), accumulator)?;
                Ok(Some(AttrValue::ObjectId(id)))
            }
            AttributeType::Array(element) => {
                let Some(Value::Array(stored)) = ctx.graph().vertex_property(vertex, &attribute.vertex_property) else {
                    return Ok(None);
                };
                let mut values = Vec::with_capacity(stored.len());
                for item in stored {
                    let mapped =
                        self.map_collection_element(ctx, owner_active, element, attribute, item, accumulator.as_deref_mut())?;
                    values.extend(mapped);
                }
                Ok(if values.is_empty() { None } else { Some(AttrValue::Array(values)) })
            }
            AttributeType::Map(element) => {
                let keys = GraphHelper::map_keys(ctx, vertex, &attribute.vertex_property);
                let mut values = HashMap::with_capacity(keys.len());
                for key in keys {
                    let property = GraphHelper::map_key_property(&attribute.vertex_property, &key);
                    let Some(stored) = ctx.graph().vertex_property(vertex, &property) else {
                        continue;
                    };
                    let mapped =
                        self.map_collection_element(ctx, owner_active, element, attribute, stored, accumulator.as_deref_mut())?;
                    if let Some(value) = mapped {
                        values.insert(key, value);
                    }
                }
                Ok(if values.is_empty() { None } else { Some(AttrValue::Map(values)) })
            }
            AttributeType::Classification(name) => {
                debug!("ignoring classification-typed attribute {} ({})", attribute.qualified_name, name);
                Ok(None)
            }
        }
    }

    fn map_collection_element(
        &self,
        ctx: &mut TransactionContext<'_>,
        owner_active: bool,
        element: &AttributeType,
        attribute: &Attribute,
        stored: Value,
        accumulator: Option<&mut ExtInfoAccumulator>,
    ) -> Result<Option<AttrValue>> {
        match element {
            AttributeType::Struct(struct_name) => {
                let Some(edge) = self.visible_edge_by_id(ctx, &stored, owner_active) else {
                    return Ok(None);
                };
                Ok(Some(AttrValue::Struct(self.map_struct(ctx, edge.in_vertex, struct_name, accumulator)?)))
            }
            AttributeType::ObjectId(_) if attribute.is_soft_ref() => Ok(stored
                .as_str()
                .and_then(|encoded| self.map_soft_reference(ctx, encoded, attribute.is_owned_ref(), accumulator))
                .map(AttrValue::ObjectId)),
            AttributeType::ObjectId(_) => {
                let Some(edge) = self.visible_edge_by_id(ctx, &stored, owner_active) else {
                    return Ok(None);
                };
                let id = self.map_vertex_to_object_id(ctx, edge.in_vertex, attribute.is_owned_ref(), accumulator)?;
                Ok(Some(AttrValue::ObjectId(id)))
            }
            _ => Ok(Some(AttrValue::Primitive(stored))),
        }
    }

    /// Deleted edges are hidden while their owner is active
    fn visible_edge(
        &self,
        ctx: &mut TransactionContext<'_>,
        vertex: VertexId,
        label: &str,
        owner_active: bool,
    ) -> Option<EdgeInfo> {
        let edge = GraphHelper::edge_for_label(ctx, vertex, label)?;
        if owner_active && GraphHelper::edge_status(ctx, edge.id) == Status::Deleted {
            return None;
        }
        Some(edge)
    }

    fn visible_edge_by_id(&self, ctx: &mut TransactionContext<'_>, stored: &Value, owner_active: bool) -> Option<EdgeInfo> {
        let edge = ctx.graph().edge(EdgeId::parse(stored.as_str()?)?)?;
        if owner_active && GraphHelper::edge_status(ctx, edge.id) == Status::Deleted {
            return None;
        }
        Some(edge)
    }

    fn map_struct(
        &self,
        ctx: &mut TransactionContext<'_>,
        vertex: VertexId,
        struct_name: &str,
        mut accumulator: Option<&mut ExtInfoAccumulator>,
    ) -> Result<Struct> {
        let struct_type = self.registry.struct_type(struct_name)?;
        let mut value = Struct::new(struct_name);
        for attribute in struct_type.attributes() {
            if let Some(v) = self.map_attribute(ctx, vertex, attribute, accumulator.as_deref_mut())? {
                value.attributes.insert(attribute.name.clone(), v);
            }
        }
        Ok(value)
    }

    /// Owned references are expanded into the accumulator when one is supplied
    fn map_vertex_to_object_id(
        &self,
        ctx: &mut TransactionContext<'_>,
        vertex: VertexId,
        is_owned: bool,
        accumulator: Option<&mut ExtInfoAccumulator>,
    ) -> Result<ObjectId> {
        if let (true, Some(acc)) = (is_owned, accumulator) {
            self.expand_into(ctx, vertex, acc)?;
        }
        self.to_object_id(ctx, vertex)
    }

    fn expand_into(&self, ctx: &mut TransactionContext<'_>, vertex: VertexId, acc: &mut ExtInfoAccumulator) -> Result<()> {
        let guid = GraphHelper::guid(ctx, vertex)
            .ok_or_else(|| RepositoryError::Internal(format!("vertex {} has no guid", vertex)))?;
        if acc.contains(&guid) {
            return Ok(());
        }
        if acc.min_ext_info {
            let entity = self.map_vertex_to_min_entity(ctx, vertex, guid.clone())?;
            acc.entities.insert(guid, entity);
        } else {
            self.map_vertex_to_entity(ctx, vertex, Some(acc))?;
        }
        Ok(())
    }

    /// Decodes `type:guid`; a dangling owned reference is logged and left unresolved
    fn map_soft_reference(
        &self,
        ctx: &mut TransactionContext<'_>,
        encoded: &str,
        is_owned: bool,
        accumulator: Option<&mut ExtInfoAccumulator>,
    ) -> Option<ObjectId> {
        let Some((type_name, guid)) = GraphHelper::decode_soft_reference(encoded) else {
            warn!("ignoring malformed soft reference {}", encoded);
            return None;
        };
        let id = ObjectId::new(guid.clone(), type_name);

        if let (true, Some(acc)) = (is_owned, accumulator) {
            let resolved = GraphHelper::find_vertex_by_guid(ctx, &guid)
                .ok_or_else(|| RepositoryError::EntityNotFound(guid.clone()))
                .and_then(|vertex| self.expand_into(ctx, vertex, acc));
            if let Err(e) = resolved {
                warn!("could not resolve soft reference {}: {}", encoded, e);
            }
        }
        Some(id)
    }

    pub fn to_object_id(&self, ctx: &mut TransactionContext<'_>, vertex: VertexId) -> Result<ObjectId> {
        let guid = GraphHelper::guid(ctx, vertex)
            .ok_or_else(|| RepositoryError::Internal(format!("vertex {} has no guid", vertex)))?;
        let type_name = GraphHelper::type_name(ctx, vertex).unwrap_or_default();
        let mut id = ObjectId::new(guid, type_name.clone());
        if let Some(entity_type) = self.registry.find_entity_type(&type_name) {
            for attribute in entity_type.unique_attributes() {
                if let Some(value) = ctx.graph().vertex_property(vertex, &attribute.vertex_property) {
                    id.unique_attributes.insert(attribute.name.clone(), value);
                }
            }
        }
        Ok(id)
    }

    /// Projection with unique, display and `extra` attributes. Dotted names use their last segment.
    pub fn to_header(&self, ctx: &mut TransactionContext<'_>, vertex: VertexId, extra: &[String]) -> Result<EntityHeader> {
        let guid = GraphHelper::guid(ctx, vertex)
            .ok_or_else(|| RepositoryError::Internal(format!("vertex {} has no guid", vertex)))?;
        let type_name = GraphHelper::type_name(ctx, vertex).unwrap_or_default();
        let entity_type = self.registry.entity_type(&type_name)?;

        let mut wanted: Vec<&str> = entity_type.unique_attributes().map(|a| a.name.as_str()).collect();
        wanted.extend(DISPLAY_ATTRIBUTES);
        wanted.extend(extra.iter().map(|name| name.rsplit('.').next().unwrap_or(name.as_str())));

        let mut attributes = HashMap::new();
        for name in wanted {
            if attributes.contains_key(name) {
                continue;
            }
            let Some(attribute) = entity_type.attribute(name) else {
                continue;
            };
            if let Some(value) = self.map_attribute(ctx, vertex, attribute, None)? {
                attributes.insert(name.to_string(), value);
            }
        }

        let display_text = ["name", "qualifiedName"]
            .iter()
            .find_map(|name| attributes.get(*name).and_then(|v| v.as_str()).map(str::to_string));

        Ok(EntityHeader {
            type_name,
            guid,
            status: GraphHelper::status(ctx, vertex),
            display_text,
            classification_names: GraphHelper::trait_names(ctx, vertex),
            attributes,
        })
    }

    pub fn header_by_guid(&self, ctx: &mut TransactionContext<'_>, guid: &str) -> Result<EntityHeader> {
        let vertex = self.entity_vertex(ctx, guid)?;
        self.to_header(ctx, vertex, &[])
    }

    /// Classifications attached to the entity vertex
    pub fn classifications(&self, ctx: &mut TransactionContext<'_>, entity_vertex: VertexId) -> Result<Vec<Classification>> {
        let owner_active = GraphHelper::status(ctx, entity_vertex) == Status::Active;
        let entity_guid = GraphHelper::guid(ctx, entity_vertex);
        let mut classifications = Vec::new();
        for edge in GraphHelper::classification_edges(ctx, entity_vertex) {
            if owner_active && GraphHelper::edge_status(ctx, edge.id) == Status::Deleted {
                continue;
            }
            let mut classification = self.to_classification(ctx, edge.in_vertex)?;
            classification.entity_guid = entity_guid.clone();
            classifications.push(classification);
        }
        Ok(classifications)
    }

    pub fn classification(&self, ctx: &mut TransactionContext<'_>, guid: &str, name: &str) -> Result<Classification> {
        let vertex = self.entity_vertex(ctx, guid)?;
        let edge = GraphHelper::classification_edge(ctx, vertex, name).ok_or_else(|| {
            RepositoryError::ClassificationNotFound {
                guid: guid.to_string(),
                classification: name.to_string(),
            }
        })?;
        let mut classification = self.to_classification(ctx, edge.in_vertex)?;
        classification.entity_guid = Some(guid.to_string());
        Ok(classification)
    }

    pub fn to_classification(&self, ctx: &mut TransactionContext<'_>, vertex: VertexId) -> Result<Classification> {
        let type_name = GraphHelper::type_name(ctx, vertex)
            .ok_or_else(|| RepositoryError::Internal(format!("classification vertex {} has no type", vertex)))?;
        let classification_type = self.registry.classification_type(&type_name)?;
        let mut classification = Classification::new(type_name.clone());
        for attribute in classification_type.attributes() {
            if let Some(value) = self.map_attribute(ctx, vertex, attribute, None)? {
                classification.attributes.insert(attribute.name.clone(), value);
            }
        }
        Ok(classification)
    }

    fn map_relationship_attributes(
        &self,
        ctx: &mut TransactionContext<'_>,
        vertex: VertexId,
        type_name: &str,
    ) -> Result<HashMap<String, RelationshipAttrValue>> {
        let entity_type = self.registry.entity_type(type_name)?;
        let owner_active = GraphHelper::status(ctx, vertex) == Status::Active;
        let mut values = HashMap::new();

        for rel_attribute in entity_type.relationship_attributes() {
            let direction = match rel_attribute.direction {
                EdgeDirection::Out => Direction::Out,
                EdgeDirection::In => Direction::In,
                EdgeDirection::Both => Direction::Both,
            };
            let edges = ctx.graph().edges(vertex, direction, Some(&rel_attribute.edge_label));

            let mut related = Vec::new();
            for edge in edges {
                if owner_active && GraphHelper::edge_status(ctx, edge.id) == Status::Deleted {
                    continue;
                }
                related.push(self.to_related_object_id(ctx, &edge, vertex)?);
                if rel_attribute.cardinality == crate::model::Cardinality::Single {
                    break;
                }
            }

            match rel_attribute.cardinality {
                crate::model::Cardinality::Single => {
                    if let Some(first) = related.into_iter().next() {
                        values.insert(rel_attribute.name.clone(), RelationshipAttrValue::Single(first));
                    }
                }
                _ if !related.is_empty() => {
                    values.insert(rel_attribute.name.clone(), RelationshipAttrValue::Many(related));
                }
                _ => {}
            }
        }
        Ok(values)
    }

    fn to_related_object_id(&self, ctx: &mut TransactionContext<'_>, edge: &EdgeInfo, from: VertexId) -> Result<RelatedObjectId> {
        let other = edge.other_end(from);
        let header = self.to_header(ctx, other, &[])?;
        let relationship_type = ctx
            .graph()
            .edge_property(edge.id, RELATIONSHIP_TYPE_PROPERTY)
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        let relationship_guid = ctx
            .graph()
            .edge_property(edge.id, RELATIONSHIP_GUID_PROPERTY)
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        let relationship_attributes = self.relationship_attribute_values(ctx, edge.id, &relationship_type);

        let unique_attributes = self.to_object_id(ctx, other)?.unique_attributes;
        Ok(RelatedObjectId {
            guid: header.guid,
            type_name: header.type_name,
            unique_attributes,
            entity_status: header.status,
            display_text: header.display_text,
            relationship_type: relationship_type.clone(),
            relationship_guid,
            relationship_status: GraphHelper::edge_status(ctx, edge.id),
            relationship_attributes: if relationship_attributes.is_empty() {
                None
            } else {
                Some(Struct {
                    type_name: relationship_type,
                    attributes: relationship_attributes,
                })
            },
        })
    }

    fn relationship_attribute_values(
        &self,
        ctx: &TransactionContext<'_>,
        edge: EdgeId,
        relationship_type: &str,
    ) -> HashMap<String, AttrValue> {
        let Ok(def) = self.registry.relationship_def(relationship_type) else {
            return HashMap::new();
        };
        def.attribute_defs
            .iter()
            .filter_map(|attr| {
                ctx.graph()
                    .edge_property(edge, &attr.name)
                    .map(|v| (attr.name.clone(), AttrValue::Primitive(v)))
            })
            .collect()
    }

    pub fn to_relationship(&self, ctx: &mut TransactionContext<'_>, edge: &EdgeInfo) -> Result<Relationship> {
        let relationship_type = ctx
            .graph()
            .edge_property(edge.id, RELATIONSHIP_TYPE_PROPERTY)
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or_else(|| RepositoryError::Internal(format!("edge {} is not a relationship", edge.id)))?;
        let end1 = self.to_object_id(ctx, edge.out_vertex)?;
        let end2 = self.to_object_id(ctx, edge.in_vertex)?;

        let mut relationship = Relationship::new(relationship_type.clone(), end1, end2);
        relationship.guid = ctx
            .graph()
            .edge_property(edge.id, RELATIONSHIP_GUID_PROPERTY)
            .and_then(|v| v.as_str().map(str::to_string));
        relationship.status = GraphHelper::edge_status(ctx, edge.id);
        relationship.attributes = self.relationship_attribute_values(ctx, edge.id, &relationship_type);
        relationship.created_by = ctx
            .graph()
            .edge_property(edge.id, CREATED_BY_PROPERTY)
            .and_then(|v| v.as_str().map(str::to_string));
        relationship.create_time = ctx
            .graph()
            .edge_property(edge.id, TIMESTAMP_PROPERTY)
            .and_then(|v| v.as_i64())
            .and_then(from_epoch_millis);
        Ok(relationship)
    }

    pub fn relationship_by_guid(&self, ctx: &mut TransactionContext<'_>, guid: &str) -> Result<Relationship> {
        let edge = ctx
            .graph()
            .query_edges(RELATIONSHIP_GUID_PROPERTY, &Value::from(guid))
            .into_iter()
            .next()
            .and_then(|id| ctx.graph().edge(id))
            .ok_or_else(|| RepositoryError::RelationshipNotFound(guid.to_string()))?;
        self.to_relationship(ctx, &edge)
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

    fn registry() -> Arc<TypeRegistry> {
        Arc::new(
            TypeRegistry::new(TypesDef {
                entity_defs: vec![EntityDef {
                    name: "Db".into(),
                    super_types: vec![],
                    attribute_defs: vec![
                        AttributeDef::new("name", "string").unique(),
                        AttributeDef::new("description", "string"),
                        AttributeDef::new("location", "string"),
                        AttributeDef::new("parent", "Db").owned().soft(),
                    ],
                }],
                ..Default::default()
            })
            .unwrap(),
        )
    }

    fn db_vertex(ctx: &mut TransactionContext<'_>, guid: &str, name: &str) -> Result<VertexId> {
        let vertex = GraphHelper::create_vertex(ctx, "Db", &[])?;
        ctx.graph_mut().set_vertex_property(vertex, "__guid", json!(guid))?;
        ctx.graph_mut().set_vertex_property(vertex, "Db.name", json!(name))?;
        Ok(vertex)
    }

    #[test]
    fn test_header_has_unique_display_and_requested_attributes() {
        let retriever = EntityGraphRetriever::new(registry());
        let graph = InMemoryGraph::new();
        let locks = LockCoordinator::new();

        let header = TransactionScope::new(&graph, &locks)
            .run(RequestContext::new("tester"), |ctx| {
                let vertex = db_vertex(ctx, "d-1", "sales")?;
                ctx.graph_mut().set_vertex_property(vertex, "Db.description", json!("sales data"))?;
                ctx.graph_mut().set_vertex_property(vertex, "Db.location", json!("/data"))?;
                retriever.to_header(ctx, vertex, &["hive.Db.location".to_string()])
            })
            .unwrap();

        assert_eq!(header.guid, "d-1");
        assert_eq!(header.status, Status::Active);
        assert_eq!(header.display_text.as_deref(), Some("sales"));
        assert_eq!(header.attributes.len(), 3);
        assert_eq!(header.attributes["location"].as_str(), Some("/data"));

        let plain = TransactionScope::new(&graph, &locks)
            .run(RequestContext::new("tester"), |ctx| retriever.header_by_guid(ctx, "d-1"))
            .unwrap();
        assert!(!plain.attributes.contains_key("location"));
    }

    #[test]
    fn test_owned_soft_reference_expands_or_stays_unresolved() {
        let retriever = EntityGraphRetriever::new(registry());
        let graph = InMemoryGraph::new();
        let locks = LockCoordinator::new();

        let (dangling, resolved) = TransactionScope::new(&graph, &locks)
            .run(RequestContext::new("tester"), |ctx| {
                let orphan = db_vertex(ctx, "d-1", "orphan")?;
                ctx.graph_mut().set_vertex_property(orphan, "Db.parent", json!("Db:missing"))?;
                let child = db_vertex(ctx, "d-2", "child")?;
                ctx.graph_mut().set_vertex_property(child, "Db.parent", json!("Db:d-1"))?;

                let dangling = retriever.to_entity_with_ext_info(ctx, "d-1", false)?;
                let resolved = retriever.to_entity_with_ext_info(ctx, "d-2", true)?;
                Ok((dangling, resolved))
            })
            .unwrap();

        let orphan = dangling.entity.unwrap();
        let parent = orphan.attribute("parent").and_then(|v| v.as_object_id()).unwrap();
        assert_eq!(parent.guid(), Some("missing"));
        assert!(dangling.referred_entities.is_empty());

        assert_eq!(resolved.referred_entities.len(), 1);
        assert_eq!(
            resolved.referred_entities["d-1"].attribute("name").and_then(|v| v.as_str()),
            Some("orphan")
        );
    }

    #[test]
    fn test_missing_guid_is_not_found() {
        let retriever = EntityGraphRetriever::new(registry());
        let graph = InMemoryGraph::new();
        let locks = LockCoordinator::new();

        let err = TransactionScope::new(&graph, &locks)
            .run(RequestContext::new("tester"), |ctx| retriever.to_entity(ctx, "nope"))
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
