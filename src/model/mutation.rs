use crate::model::{EntityHeader, Guid};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityOperation {
    Create,
    Update,
    PartialUpdate,
    Delete,
}

/// Entities touched by one mutating call, grouped by operation
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationResponse {
    #[serde(default)]
    pub mutated_entities: HashMap<EntityOperation, Vec<EntityHeader>>,
    /// Temporary guid supplied by the caller -> guid assigned by the repository
    #[serde(default)]
    pub guid_assignments: HashMap<Guid, Guid>,
}

impl MutationResponse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a header once per operation; repeated guids are ignored
    pub fn add_entity(&mut self, op: EntityOperation, header: EntityHeader) {
        let headers = self.mutated_entities.entry(op).or_default();
        if !headers.iter().any(|h| h.guid == header.guid) {
            headers.push(header);
        }
    }

    pub fn entities_by_operation(&self, op: EntityOperation) -> &[EntityHeader] {
        self.mutated_entities
            .get(&op)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn created(&self) -> &[EntityHeader] {
        self.entities_by_operation(EntityOperation::Create)
    }

    pub fn updated(&self) -> &[EntityHeader] {
        self.entities_by_operation(EntityOperation::Update)
    }

    pub fn partial_updated(&self) -> &[EntityHeader] {
        self.entities_by_operation(EntityOperation::PartialUpdate)
    }

    pub fn deleted(&self) -> &[EntityHeader] {
        self.entities_by_operation(EntityOperation::Delete)
    }

    pub fn first_created_by_type(&self, type_name: &str) -> Option<&EntityHeader> {
        self.created().iter().find(|h| h.type_name == type_name)
    }

    pub fn first_updated_by_type(&self, type_name: &str) -> Option<&EntityHeader> {
        self.updated()
            .iter()
            .chain(self.partial_updated())
            .find(|h| h.type_name == type_name)
    }

    pub fn is_empty(&self) -> bool {
        self.mutated_entities.values().all(|v| v.is_empty())
    }

    pub fn total(&self) -> usize {
        self.mutated_entities.values().map(|v| v.len()).sum()
    }
}
