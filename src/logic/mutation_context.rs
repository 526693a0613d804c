use crate::logic::discovery::EntityGraphDiscoveryContext;
use crate::model::{Entity, Guid};
use crate::store::VertexId;
use std::collections::HashMap;

/// Entities of one `create_or_update` call, each with its resolved vertex and type
#[derive(Debug, Default)]
pub struct EntityMutationContext {
    discovery: EntityGraphDiscoveryContext,
    created: Vec<Entity>,
    updated: Vec<Entity>,
    vertices: HashMap<Guid, VertexId>,
    types: HashMap<Guid, String>,
    entities_to_delete: Vec<VertexId>,
    /// Guid supplied by the caller -> guid of the vertex it was written to
    guid_assignments: HashMap<Guid, Guid>,
}

impl EntityMutationContext {
    pub fn new(discovery: EntityGraphDiscoveryContext) -> Self {
        Self {
            discovery,
            ..Default::default()
        }
    }

    pub fn discovery(&self) -> &EntityGraphDiscoveryContext {
        &self.discovery
    }

    pub fn discovery_mut(&mut self) -> &mut EntityGraphDiscoveryContext {
        &mut self.discovery
    }

    /// `entity` carries the generated guid; `internal_guid` is the one it arrived with
    pub fn add_created(&mut self, internal_guid: &str, entity: Entity, vertex: VertexId) {
        self.cache_entity(&entity.guid, vertex, &entity.type_name);
        if internal_guid != entity.guid {
            self.guid_assignments.insert(internal_guid.to_string(), entity.guid.clone());
            self.cache_entity(internal_guid, vertex, &entity.type_name);
        }
        self.created.push(entity);
    }

    /// Ignored when the entity was already added under `internal_guid`
    pub fn add_updated(&mut self, internal_guid: &str, entity: Entity, vertex: VertexId) {
        if self.vertices.contains_key(internal_guid) {
            return;
        }
        self.cache_entity(&entity.guid, vertex, &entity.type_name);
        if internal_guid != entity.guid {
            self.guid_assignments.insert(internal_guid.to_string(), entity.guid.clone());
            self.cache_entity(internal_guid, vertex, &entity.type_name);
        }
        self.updated.push(entity);
    }

    pub fn cache_entity(&mut self, guid: &str, vertex: VertexId, type_name: &str) {
        self.vertices.insert(guid.to_string(), vertex);
        self.types.insert(guid.to_string(), type_name.to_string());
    }

    pub fn add_entity_to_delete(&mut self, vertex: VertexId) {
        if !self.entities_to_delete.contains(&vertex) {
            self.entities_to_delete.push(vertex);
        }
    }

    pub fn vertex(&self, guid: &str) -> Option<VertexId> {
        self.vertices.get(guid).copied()
    }

    pub fn entity_type_name(&self, guid: &str) -> Option<&str> {
        self.types.get(guid).map(String::as_str)
    }

    pub fn created_entities(&self) -> &[Entity] {
        &self.created
    }

    pub fn updated_entities(&self) -> &[Entity] {
        &self.updated
    }

    pub fn entities_to_delete(&self) -> &[VertexId] {
        &self.entities_to_delete
    }

    pub fn guid_assignments(&self) -> &HashMap<Guid, Guid> {
        &self.guid_assignments
    }

    /// Drops updates found to be no-ops
    pub fn remove_updated(&mut self, guids: &[Guid]) {
        self.updated.retain(|e| !guids.contains(&e.guid));
    }

    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.entities_to_delete.is_empty()
    }
}
