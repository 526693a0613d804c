//! Writes entities, structs and classifications onto graph vertices and edges.
//!
//! Every property key and edge label written here is read back by
//! [`EntityGraphRetriever`]; both sides go through [`GraphHelper`] for the
//! encodings.

use crate::config::{GraphConfig, RepositoryConfig};
use crate::error::{RepositoryError, Result};
use crate::logic::delete::DeleteHandler;
use crate::logic::discovery::find_by_unique_attributes;
use crate::logic::graph_helper::{
    GraphHelper, CLASSIFICATION_ENTITY_GUID_PROPERTY, CREATED_BY_PROPERTY, MODIFICATION_TIMESTAMP_PROPERTY,
    MODIFIED_BY_PROPERTY, TIMESTAMP_PROPERTY, VERSION_PROPERTY,
};
use crate::logic::mutation_context::EntityMutationContext;
use crate::logic::retriever::EntityGraphRetriever;
use crate::logic::transaction::{RequestContext, TransactionContext};
use crate::model::{
    to_epoch_millis, AttrValue, Attribute, AttributeType, Cardinality, Classification, Entity, EntityOperation,
    Guid, MutationResponse, ObjectId, PrimitiveKind, Status, TypeCategory, TypeRegistry,
};
use crate::store::{EdgeId, EdgeInfo, VertexId};
use log::{debug, warn};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MapOperation {
    /// Every attribute of the type is written, defaults included
    Create,
    /// Only attributes present in the input are written
    Update,
}

pub struct EntityGraphMapper {
    registry: Arc<TypeRegistry>,
    delete_handler: Arc<dyn DeleteHandler>,
    retriever: EntityGraphRetriever,
    repository_config: RepositoryConfig,
    graph_config: GraphConfig,
}

impl EntityGraphMapper {
    pub fn new(
        registry: Arc<TypeRegistry>,
        delete_handler: Arc<dyn DeleteHandler>,
        repository_config: RepositoryConfig,
        graph_config: GraphConfig,
    ) -> Self {
        Self {
            retriever: EntityGraphRetriever::new(Arc::clone(&registry)),
            registry,
            delete_handler,
            repository_config,
            graph_config,
        }
    }

    /// Maps the created and updated entities of `context`, then deletes the
    /// entities queued for deletion, and reports everything touched.
    pub fn map_attributes_and_classifications(
        &self,
        ctx: &mut TransactionContext<'_>,
        context: &EntityMutationContext,
        is_partial: bool,
        replace_classifications: bool,
    ) -> Result<MutationResponse> {
        let mut response = MutationResponse::new();
        let update_op = if is_partial {
            EntityOperation::PartialUpdate
        } else {
            EntityOperation::Update
        };

        for entity in context.created_entities() {
            let vertex = self.context_vertex(context, &entity.guid)?;
            let entity_type = self.registry.entity_type(&entity.type_name)?;

            self.map_attributes(ctx, context, vertex, entity_type.attributes(), &entity.attributes, MapOperation::Create)?;
            self.add_classifications(ctx, context, vertex, &entity.classifications)?;
            if ctx.request.import_in_progress {
                self.set_system_attributes(ctx, vertex, entity)?;
            }

            response.add_entity(EntityOperation::Create, self.retriever.to_header(ctx, vertex, &[])?);
        }

        for entity in context.updated_entities() {
            let vertex = self.context_vertex(context, &entity.guid)?;
            let entity_type = self.registry.entity_type(&entity.type_name)?;

            self.map_attributes(ctx, context, vertex, entity_type.attributes(), &entity.attributes, MapOperation::Update)?;
            GraphHelper::update_modification_metadata(ctx, vertex)?;

            if replace_classifications {
                let current = GraphHelper::trait_names(ctx, vertex);
                self.delete_classifications(ctx, vertex, &current)?;
                self.add_classifications(ctx, context, vertex, &entity.classifications)?;
            }
            if ctx.request.import_in_progress {
                self.set_system_attributes(ctx, vertex, entity)?;
            }

            response.add_entity(update_op, self.retriever.to_header(ctx, vertex, &[])?);
        }

        if !context.entities_to_delete().is_empty() {
            self.delete_handler.delete_entities(ctx, context.entities_to_delete())?;
        }

        self.add_side_effect_headers(ctx, &mut response, update_op)?;
        response.guid_assignments = context.guid_assignments().clone();
        Ok(response)
    }

    /// Reports the entities deleted during the call and those updated as a
    /// side effect (inverse references, referrers of deleted entities)
    pub fn add_side_effect_headers(
        &self,
        ctx: &mut TransactionContext<'_>,
        response: &mut MutationResponse,
        update_op: EntityOperation,
    ) -> Result<()> {
        for header in ctx.deleted_entities().to_vec() {
            response.add_entity(EntityOperation::Delete, header);
        }
        for guid in ctx.updated_guids().to_vec() {
            if ctx.is_deleted_in_request(&guid) || is_reported(response, &guid) {
                continue;
            }
            let header = self.retriever.header_by_guid(ctx, &guid)?;
            response.add_entity(update_op, header);
        }
        Ok(())
    }

    /// Attaches new classifications to the entity vertex
    pub fn add_classifications(
        &self,
        ctx: &mut TransactionContext<'_>,
        context: &EntityMutationContext,
        entity_vertex: VertexId,
        classifications: &[Classification],
    ) -> Result<()> {
        if classifications.is_empty() {
            return Ok(());
        }
        let (guid, entity_type) = entity_identity(ctx, entity_vertex)?;
        let mut trait_names = GraphHelper::trait_names(ctx, entity_vertex);

        for classification in classifications {
            if trait_names.contains(&classification.type_name) {
                return Err(RepositoryError::ClassificationAlreadyAssociated {
                    guid,
                    classification: classification.type_name.clone(),
                });
            }
            let classification_type = self.registry.classification_type(&classification.type_name)?;
            debug!("adding classification {} to {}", classification.type_name, guid);

            let vertex = GraphHelper::create_vertex(ctx, &classification.type_name, &classification_type.all_super_types)?;
            ctx.graph_mut()
                .set_vertex_property(vertex, CLASSIFICATION_ENTITY_GUID_PROPERTY, Value::from(guid.clone()))?;
            self.map_attributes(
                ctx,
                context,
                vertex,
                classification_type.attributes(),
                &classification.attributes,
                MapOperation::Create,
            )?;

            let label = GraphHelper::classification_edge_label(&entity_type, &classification.type_name);
            GraphHelper::get_or_create_edge(ctx, &self.graph_config, entity_vertex, vertex, &label)?;
            trait_names.push(classification.type_name.clone());
        }

        GraphHelper::set_trait_names(ctx, entity_vertex, &trait_names)?;
        GraphHelper::update_modification_metadata(ctx, entity_vertex)
    }

    /// Re-maps the given attributes onto classifications already attached
    pub fn update_classifications(
        &self,
        ctx: &mut TransactionContext<'_>,
        context: &EntityMutationContext,
        entity_vertex: VertexId,
        classifications: &[Classification],
    ) -> Result<()> {
        let (guid, _) = entity_identity(ctx, entity_vertex)?;
        for classification in classifications {
            let edge = GraphHelper::classification_edge(ctx, entity_vertex, &classification.type_name).ok_or_else(|| {
                RepositoryError::ClassificationNotFound {
                    guid: guid.clone(),
                    classification: classification.type_name.clone(),
                }
            })?;
            let classification_type = self.registry.classification_type(&classification.type_name)?;
            self.map_attributes(
                ctx,
                context,
                edge.in_vertex,
                classification_type.attributes(),
                &classification.attributes,
                MapOperation::Update,
            )?;
            GraphHelper::update_modification_metadata(ctx, edge.in_vertex)?;
        }
        GraphHelper::update_modification_metadata(ctx, entity_vertex)
    }

    pub fn delete_classifications(
        &self,
        ctx: &mut TransactionContext<'_>,
        entity_vertex: VertexId,
        names: &[String],
    ) -> Result<()> {
        if names.is_empty() {
            return Ok(());
        }
        let (guid, _) = entity_identity(ctx, entity_vertex)?;
        let mut trait_names = GraphHelper::trait_names(ctx, entity_vertex);

        for name in names {
            if !trait_names.contains(name) {
                return Err(RepositoryError::ClassificationNotFound {
                    guid,
                    classification: name.clone(),
                });
            }
            if let Some(edge) = GraphHelper::classification_edge(ctx, entity_vertex, name) {
                self.delete_handler
                    .delete_edge_reference(ctx, &edge, TypeCategory::Classification, false, true)?;
            }
            trait_names.retain(|n| n != name);
            debug!("removed classification {} from {}", name, guid);
        }

        GraphHelper::set_trait_names(ctx, entity_vertex, &trait_names)?;
        GraphHelper::update_modification_metadata(ctx, entity_vertex)
    }

    /// Writes one attribute of an entity as a partial update
    pub fn map_entity_attribute(
        &self,
        ctx: &mut TransactionContext<'_>,
        context: &EntityMutationContext,
        vertex: VertexId,
        attribute: &Attribute,
        value: Option<&AttrValue>,
    ) -> Result<()> {
        self.map_attribute(ctx, context, vertex, attribute, value, MapOperation::Update)?;
        GraphHelper::update_modification_metadata(ctx, vertex)
    }

    fn context_vertex(&self, context: &EntityMutationContext, guid: &str) -> Result<VertexId> {
        context
            .vertex(guid)
            .ok_or_else(|| RepositoryError::Internal(format!("no vertex resolved for entity {}", guid)))
    }

    fn map_attributes(
        &self,
        ctx: &mut TransactionContext<'_>,
        context: &EntityMutationContext,
        vertex: VertexId,
        attributes: &[Attribute],
        values: &HashMap<String, AttrValue>,
        op: MapOperation,
    ) -> Result<()> {
        match op {
            MapOperation::Create => {
                for attribute in attributes {
                    let value = match values.get(&attribute.name) {
                        Some(value) => Some(value.clone()),
                        None => attribute.def.default_value.clone().map(AttrValue::Primitive),
                    };
                    self.map_attribute(ctx, context, vertex, attribute, value.as_ref(), op)?;
                }
            }
            MapOperation::Update => {
                for attribute in attributes {
                    if let Some(value) = values.get(&attribute.name) {
                        self.map_attribute(ctx, context, vertex, attribute, Some(value), op)?;
                    }
                }
                for name in values.keys() {
                    if !attributes.iter().any(|a| a.name == *name) {
                        warn!("ignoring unknown attribute {} on {}", name, vertex);
                    }
                }
            }
        }
        Ok(())
    }

    fn map_attribute(
        &self,
        ctx: &mut TransactionContext<'_>,
        context: &EntityMutationContext,
        vertex: VertexId,
        attribute: &Attribute,
        value: Option<&AttrValue>,
        op: MapOperation,
    ) -> Result<()> {
        let value = value.filter(|v| !v.is_null());
        if value.is_none() && op == MapOperation::Create {
            return Ok(());
        }

        match &attribute.attr_type {
            AttributeType::Primitive(_) | AttributeType::Enum { .. } => self.map_primitive(ctx, vertex, attribute, value),
            AttributeType::Struct(_) | AttributeType::ObjectId(_) => {
                self.map_single_reference(ctx, context, vertex, attribute, value, op)
            }
            AttributeType::Array(element) => self.map_array(ctx, context, vertex, attribute, element, value, op),
            AttributeType::Map(element) => self.map_map(ctx, context, vertex, attribute, element, value, op),
            AttributeType::Classification(name) => {
                debug!("ignoring classification-typed attribute {} ({})", attribute.qualified_name, name);
                Ok(())
            }
        }
    }

    fn map_primitive(
        &self,
        ctx: &mut TransactionContext<'_>,
        vertex: VertexId,
        attribute: &Attribute,
        value: Option<&AttrValue>,
    ) -> Result<()> {
        match value {
            None => ctx.graph_mut().remove_vertex_property(vertex, &attribute.vertex_property),
            Some(AttrValue::Primitive(value)) => {
                let value = self.trim_if_indexed(&ctx.request, attribute, value);
                ctx.graph_mut().set_vertex_property(vertex, &attribute.vertex_property, value)
            }
            Some(other) => Err(type_mismatch(attribute, other)),
        }
    }

    fn trim_if_indexed(&self, request: &RequestContext, attribute: &Attribute, value: &Value) -> Value {
        let Value::String(s) = value else {
            return value.clone();
        };
        if !attribute.is_indexable() || attribute.attr_type != AttributeType::Primitive(PrimitiveKind::String) {
            return value.clone();
        }
        let safe_length = self.repository_config.indexed_string_safe_length;
        let length = s.chars().count();
        if length <= safe_length {
            return value.clone();
        }

        match trim_indexed_string(s, safe_length, request.attempt_count, request.max_attempts) {
            Some(trimmed) => {
                warn!(
                    "value of indexed attribute {} has length {}, longer than safe limit {}; trimmed to {} on attempt {} of {}",
                    attribute.qualified_name,
                    length,
                    safe_length,
                    trimmed.chars().count(),
                    request.attempt_count,
                    request.max_attempts
                );
                Value::String(trimmed)
            }
            None => {
                warn!(
                    "value of indexed attribute {} has length {}, longer than safe limit {}; not trimmed on attempt {} of {}",
                    attribute.qualified_name, length, safe_length, request.attempt_count, request.max_attempts
                );
                value.clone()
            }
        }
    }

    /// Struct and object-id attributes holding a single value
    fn map_single_reference(
        &self,
        ctx: &mut TransactionContext<'_>,
        context: &EntityMutationContext,
        vertex: VertexId,
        attribute: &Attribute,
        value: Option<&AttrValue>,
        op: MapOperation,
    ) -> Result<()> {
        if attribute.is_soft_ref() && attribute.category() == TypeCategory::ObjectId {
            return match value {
                None => ctx.graph_mut().remove_vertex_property(vertex, &attribute.vertex_property),
                Some(value) => {
                    let encoded = self.soft_reference_value(ctx, context, attribute, value)?;
                    ctx.graph_mut().set_vertex_property(vertex, &attribute.vertex_property, encoded)
                }
            };
        }

        let current = GraphHelper::active_edge_for_label(ctx, vertex, &attribute.edge_label);
        let Some(value) = value else {
            if let Some(edge) = current {
                self.delete_handler
                    .delete_edge_reference(ctx, &edge, attribute.category(), attribute.is_owned_ref(), true)?;
            }
            return Ok(());
        };

        let edge = self.map_reference(
            ctx,
            context,
            vertex,
            attribute,
            &attribute.attr_type,
            value,
            current.as_ref(),
            &attribute.edge_label,
            op,
        )?;

        if let Some(previous) = current.filter(|e| e.id != edge) {
            self.delete_handler
                .delete_edge_reference(ctx, &previous, attribute.category(), attribute.is_owned_ref(), true)?;
        }
        Ok(())
    }

    /// Maps one struct or object-id value to an edge leaving `owner`, reusing `current` when it fits
    #[allow(clippy::too_many_arguments)]
    fn map_reference(
        &self,
        ctx: &mut TransactionContext<'_>,
        context: &EntityMutationContext,
        owner: VertexId,
        attribute: &Attribute,
        value_type: &AttributeType,
        value: &AttrValue,
        current: Option<&EdgeInfo>,
        label: &str,
        op: MapOperation,
    ) -> Result<EdgeId> {
        match value_type {
            AttributeType::Struct(struct_name) => {
                let Some(value) = value.as_struct() else {
                    return Err(type_mismatch(attribute, value));
                };
                let struct_type = self.registry.struct_type(struct_name)?;

                if let Some(edge) = current {
                    if GraphHelper::edge_status(ctx, edge.id) == Status::Active {
                        self.map_attributes(ctx, context, edge.in_vertex, struct_type.attributes(), &value.attributes, op)?;
                        GraphHelper::update_modification_metadata(ctx, edge.in_vertex)?;
                        return Ok(edge.id);
                    }
                }

                let struct_vertex = GraphHelper::create_vertex(ctx, struct_name, &struct_type.all_super_types)?;
                self.map_attributes(
                    ctx,
                    context,
                    struct_vertex,
                    struct_type.attributes(),
                    &value.attributes,
                    MapOperation::Create,
                )?;
                GraphHelper::get_or_create_edge(ctx, &self.graph_config, owner, struct_vertex, label)
            }
            AttributeType::ObjectId(type_name) => {
                let id = object_id_value(value, type_name).ok_or_else(|| type_mismatch(attribute, value))?;
                let target = self.resolve_reference(ctx, context, &id)?;

                let edge = match current.filter(|e| e.in_vertex == target) {
                    Some(edge) if GraphHelper::edge_status(ctx, edge.id) == Status::Active => edge.id,
                    Some(edge)
                        if attribute.is_owned_ref()
                            && !attribute.is_soft_ref()
                            && GraphHelper::status(ctx, target) == Status::Deleted =>
                    {
                        self.resurrect(ctx, edge, target)?;
                        edge.id
                    }
                    _ => GraphHelper::get_or_create_edge(ctx, &self.graph_config, owner, target, label)?,
                };

                if GraphHelper::guid(ctx, owner).is_some() {
                    self.add_inverse_reference(ctx, attribute, owner, target)?;
                }
                Ok(edge)
            }
            other => Err(RepositoryError::UnsupportedAttributeType {
                attribute: attribute.qualified_name.clone(),
                category: other.category().to_string(),
            }),
        }
    }

    /// Re-activates an owned child and the edge to it after it was deleted
    fn resurrect(&self, ctx: &mut TransactionContext<'_>, edge: &EdgeInfo, target: VertexId) -> Result<()> {
        let details = GraphHelper::vertex_details(ctx, target);
        debug!("re-activating {} through edge {}", details, edge.id);

        GraphHelper::set_edge_status(ctx, edge.id, Status::Active)?;
        GraphHelper::update_edge_modification_metadata(ctx, edge.id)?;
        GraphHelper::set_status(ctx, target, Status::Active)?;
        GraphHelper::update_modification_metadata(ctx, target)?;
        if let Some(guid) = GraphHelper::guid(ctx, target) {
            ctx.record_entity_update(&guid);
        }
        Ok(())
    }

    /// Keeps the inverse attribute on `target` pointing back at `source`
    fn add_inverse_reference(
        &self,
        ctx: &mut TransactionContext<'_>,
        attribute: &Attribute,
        source: VertexId,
        target: VertexId,
    ) -> Result<()> {
        let Some(inverse_name) = attribute.inverse_ref() else {
            return Ok(());
        };
        let target_type = GraphHelper::type_name(ctx, target).unwrap_or_default();
        let Some(inverse) = self
            .registry
            .find_entity_type(&target_type)
            .and_then(|t| t.attribute(inverse_name))
            .cloned()
        else {
            warn!(
                "inverse attribute {} of {} not found on type {}",
                inverse_name, attribute.qualified_name, target_type
            );
            return Ok(());
        };

        let changed = match &inverse.attr_type {
            AttributeType::ObjectId(_) => {
                let current = GraphHelper::active_edge_for_label(ctx, target, &inverse.edge_label);
                let inverse_edge =
                    GraphHelper::get_or_create_edge(ctx, &self.graph_config, target, source, &inverse.edge_label)?;
                match current {
                    Some(previous) if previous.id != inverse_edge => {
                        self.delete_handler
                            .delete_edge_reference(ctx, &previous, TypeCategory::ObjectId, false, true)?;
                        true
                    }
                    Some(_) => false,
                    None => true,
                }
            }
            AttributeType::Array(element) if matches!(**element, AttributeType::ObjectId(_)) => {
                let inverse_edge =
                    GraphHelper::get_or_create_edge(ctx, &self.graph_config, target, source, &inverse.edge_label)?;
                let mut ids = GraphHelper::edge_id_list(ctx, target, &inverse.vertex_property);
                if ids.contains(&inverse_edge) {
                    false
                } else {
                    ids.push(inverse_edge);
                    GraphHelper::set_list_property(ctx, target, &inverse.vertex_property, edge_id_values(&ids))?;
                    true
                }
            }
            other => {
                warn!(
                    "inverse attribute {} has unsupported category {}",
                    inverse.qualified_name,
                    other.category()
                );
                false
            }
        };

        if changed {
            GraphHelper::update_modification_metadata(ctx, target)?;
            if let Some(guid) = GraphHelper::guid(ctx, target) {
                ctx.record_entity_update(&guid);
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn map_array(
        &self,
        ctx: &mut TransactionContext<'_>,
        context: &EntityMutationContext,
        vertex: VertexId,
        attribute: &Attribute,
        element: &AttributeType,
        value: Option<&AttrValue>,
        op: MapOperation,
    ) -> Result<()> {
        let mut elements: Vec<AttrValue> = match value {
            None => Vec::new(),
            Some(AttrValue::Array(values)) => values.iter().filter(|v| !v.is_null()).cloned().collect(),
            Some(other) => return Err(type_mismatch(attribute, other)),
        };
        if attribute.cardinality() == Cardinality::Set {
            let mut unique: Vec<AttrValue> = Vec::with_capacity(elements.len());
            for value in elements {
                if !unique.contains(&value) {
                    unique.push(value);
                }
            }
            elements = unique;
        }

        if !is_edge_backed(attribute, element) {
            let mut stored = Vec::with_capacity(elements.len());
            for value in &elements {
                stored.push(self.inline_value(ctx, context, attribute, value)?);
            }
            return GraphHelper::set_list_property(ctx, vertex, &attribute.vertex_property, stored);
        }

        let current: Vec<EdgeInfo> = GraphHelper::edge_id_list(ctx, vertex, &attribute.vertex_property)
            .into_iter()
            .filter_map(|id| ctx.graph().edge(id))
            .collect();

        let mut new_edges: Vec<EdgeId> = Vec::with_capacity(elements.len());
        for (index, value) in elements.iter().enumerate() {
            let edge = self.map_reference(
                ctx,
                context,
                vertex,
                attribute,
                element,
                value,
                current.get(index),
                &attribute.edge_label,
                op,
            )?;
            if !new_edges.contains(&edge) {
                new_edges.push(edge);
            }
        }

        for edge in current {
            if new_edges.contains(&edge.id) || GraphHelper::edge_status(ctx, edge.id) == Status::Deleted {
                continue;
            }
            let deleted =
                self.delete_handler
                    .delete_edge_reference(ctx, &edge, element.category(), attribute.is_owned_ref(), true)?;
            if !deleted {
                debug!("keeping edge {} of {}: delete did not complete", edge.id, attribute.qualified_name);
                new_edges.push(edge.id);
            }
        }

        GraphHelper::set_list_property(ctx, vertex, &attribute.vertex_property, edge_id_values(&new_edges))
    }

    #[allow(clippy::too_many_arguments)]
    fn map_map(
        &self,
        ctx: &mut TransactionContext<'_>,
        context: &EntityMutationContext,
        vertex: VertexId,
        attribute: &Attribute,
        element: &AttributeType,
        value: Option<&AttrValue>,
        op: MapOperation,
    ) -> Result<()> {
        let entries: Vec<(String, AttrValue)> = match value {
            None => Vec::new(),
            Some(AttrValue::Map(values)) => {
                let mut entries: Vec<(String, AttrValue)> = values
                    .iter()
                    .filter(|(_, v)| !v.is_null())
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                entries.sort_by(|a, b| a.0.cmp(&b.0));
                entries
            }
            Some(other) => return Err(type_mismatch(attribute, other)),
        };
        let edge_backed = is_edge_backed(attribute, element);
        let current_keys = GraphHelper::map_keys(ctx, vertex, &attribute.vertex_property);

        let mut current_edges: Vec<EdgeInfo> = Vec::new();
        if edge_backed {
            for key in &current_keys {
                let property = GraphHelper::map_key_property(&attribute.vertex_property, key);
                if let Some(edge) = stored_edge(ctx, vertex, &property) {
                    current_edges.push(edge);
                }
            }
        }

        let mut new_keys: Vec<String> = Vec::with_capacity(entries.len());
        let mut new_edges: Vec<EdgeId> = Vec::new();
        for (key, value) in &entries {
            let property = GraphHelper::map_key_property(&attribute.vertex_property, key);
            let stored = if edge_backed {
                let current = stored_edge(ctx, vertex, &property);
                let label = format!("{}.{}", attribute.edge_label, key);
                let edge = self.map_reference(ctx, context, vertex, attribute, element, value, current.as_ref(), &label, op)?;
                new_edges.push(edge);
                Value::from(edge.to_string())
            } else {
                self.inline_value(ctx, context, attribute, value)?
            };
            ctx.graph_mut().set_vertex_property(vertex, &property, stored)?;
            new_keys.push(key.clone());
        }

        for edge in current_edges {
            if new_edges.contains(&edge.id) || GraphHelper::edge_status(ctx, edge.id) == Status::Deleted {
                continue;
            }
            let deleted =
                self.delete_handler
                    .delete_edge_reference(ctx, &edge, element.category(), attribute.is_owned_ref(), true)?;
            if !deleted {
                if let Some(key) = edge.label.strip_prefix(&format!("{}.", attribute.edge_label)) {
                    if !new_keys.iter().any(|k| k == key) {
                        debug!("keeping entry {} of {}: delete did not complete", key, attribute.qualified_name);
                        new_keys.push(key.to_string());
                    }
                }
            }
        }

        for key in current_keys {
            if !new_keys.contains(&key) {
                let property = GraphHelper::map_key_property(&attribute.vertex_property, &key);
                ctx.graph_mut().remove_vertex_property(vertex, &property)?;
            }
        }

        let keys = new_keys.into_iter().map(Value::from).collect();
        GraphHelper::set_list_property(ctx, vertex, &attribute.vertex_property, keys)
    }

    /// Collection element stored in the owner's property rather than as an edge
    fn inline_value(
        &self,
        ctx: &mut TransactionContext<'_>,
        context: &EntityMutationContext,
        attribute: &Attribute,
        value: &AttrValue,
    ) -> Result<Value> {
        if attribute.is_soft_ref() {
            return self.soft_reference_value(ctx, context, attribute, value);
        }
        match value {
            AttrValue::Primitive(v) => Ok(v.clone()),
            other => Err(type_mismatch(attribute, other)),
        }
    }

    /// `typeName:guid` for a soft reference, with temporary guids replaced by assigned ones
    fn soft_reference_value(
        &self,
        ctx: &mut TransactionContext<'_>,
        context: &EntityMutationContext,
        attribute: &Attribute,
        value: &AttrValue,
    ) -> Result<Value> {
        let target_type = match attribute.attr_type.element_type().unwrap_or(&attribute.attr_type) {
            AttributeType::ObjectId(name) => name.clone(),
            _ => String::new(),
        };
        let id = object_id_value(value, &target_type).ok_or_else(|| type_mismatch(attribute, value))?;

        let guid = match id.guid() {
            Some(guid) => context
                .guid_assignments()
                .get(guid)
                .cloned()
                .unwrap_or_else(|| guid.to_string()),
            None => {
                let vertex = self.resolve_reference(ctx, context, &id)?;
                GraphHelper::guid(ctx, vertex)
                    .ok_or_else(|| RepositoryError::InvalidObjectId(format!("{:?}", id)))?
            }
        };
        Ok(Value::from(GraphHelper::encode_soft_reference(&id.type_name, &guid)))
    }

    /// Vertex of a referenced entity: the discovery context first, then the graph
    fn resolve_reference(
        &self,
        ctx: &mut TransactionContext<'_>,
        context: &EntityMutationContext,
        id: &ObjectId,
    ) -> Result<VertexId> {
        if let Some(vertex) = context.discovery().resolve_object_id(id) {
            return Ok(vertex);
        }
        if let Some(guid) = id.guid() {
            let guid = context.guid_assignments().get(guid).map(String::as_str).unwrap_or(guid);
            if let Some(vertex) = context.vertex(guid) {
                return Ok(vertex);
            }
            if let Some(vertex) = GraphHelper::find_vertex_by_guid(ctx, guid) {
                return Ok(vertex);
            }
        }
        if !id.unique_attributes.is_empty() {
            let entity_type = self.registry.entity_type(&id.type_name)?;
            if let Some(vertex) = find_by_unique_attributes(ctx, entity_type, &id.unique_attributes) {
                return Ok(vertex);
            }
        }
        Err(RepositoryError::InvalidObjectId(format!(
            "{} guid={} uniqueAttributes={}",
            id.type_name,
            id.guid().unwrap_or_default(),
            GraphHelper::unique_attribute_values(&id.unique_attributes)
        )))
    }

    /// Import keeps the system attributes the entity was exported with
    fn set_system_attributes(&self, ctx: &mut TransactionContext<'_>, vertex: VertexId, entity: &Entity) -> Result<()> {
        let graph = ctx.graph_mut();
        if let Some(created_by) = &entity.created_by {
            graph.set_vertex_property(vertex, CREATED_BY_PROPERTY, Value::from(created_by.clone()))?;
        }
        if let Some(updated_by) = &entity.updated_by {
            graph.set_vertex_property(vertex, MODIFIED_BY_PROPERTY, Value::from(updated_by.clone()))?;
        }
        if let Some(create_time) = &entity.create_time {
            graph.set_vertex_property(vertex, TIMESTAMP_PROPERTY, Value::from(to_epoch_millis(create_time)))?;
        }
        if let Some(update_time) = &entity.update_time {
            graph.set_vertex_property(vertex, MODIFICATION_TIMESTAMP_PROPERTY, Value::from(to_epoch_millis(update_time)))?;
        }
        if entity.version > 0 {
            graph.set_vertex_property(vertex, VERSION_PROPERTY, Value::from(entity.version))?;
        }
        Ok(())
    }
}

/// Trimmed replacement for an indexed string longer than `safe_length`, or
/// `None` when this attempt stores the full value. The result keeps a
/// checksum of the full value as its suffix.
pub fn trim_indexed_string(value: &str, safe_length: usize, attempt: u32, max_attempts: u32) -> Option<String> {
    let length = value.chars().count();
    let trimmed_length = if attempt <= 1 {
        length
    } else if attempt >= max_attempts {
        safe_length
    } else if attempt == 2 {
        (safe_length * 4).min(length)
    } else if attempt == 3 {
        (safe_length * 2).min(length)
    } else {
        safe_length
    };
    if trimmed_length >= length {
        return None;
    }

    let suffix = format!(":{}", hex::encode(Sha256::digest(value.as_bytes())));
    let prefix: String = value.chars().take(trimmed_length.saturating_sub(suffix.len())).collect();
    Some(prefix + &suffix)
}

fn entity_identity(ctx: &mut TransactionContext<'_>, vertex: VertexId) -> Result<(Guid, String)> {
    let guid = GraphHelper::guid(ctx, vertex)
        .ok_or_else(|| RepositoryError::Internal(format!("vertex {} has no guid", vertex)))?;
    let type_name = GraphHelper::type_name(ctx, vertex)
        .ok_or_else(|| RepositoryError::Internal(format!("vertex {} has no type name", vertex)))?;
    Ok((guid, type_name))
}

fn is_reported(response: &MutationResponse, guid: &str) -> bool {
    [EntityOperation::Create, EntityOperation::Update, EntityOperation::PartialUpdate]
        .iter()
        .any(|op| response.entities_by_operation(*op).iter().any(|h| h.guid == guid))
}

/// Struct and non-soft object-id elements live on edges
fn is_edge_backed(attribute: &Attribute, element: &AttributeType) -> bool {
    match element {
        AttributeType::Struct(_) => true,
        AttributeType::ObjectId(_) => !attribute.is_soft_ref(),
        _ => false,
    }
}

/// Object ids may also arrive as a bare guid string
fn object_id_value(value: &AttrValue, type_name: &str) -> Option<ObjectId> {
    match value {
        AttrValue::ObjectId(id) => Some(id.clone()),
        AttrValue::Primitive(Value::String(guid)) if !guid.is_empty() => Some(ObjectId::new(guid.clone(), type_name)),
        _ => None,
    }
}

fn stored_edge(ctx: &TransactionContext<'_>, vertex: VertexId, property: &str) -> Option<EdgeInfo> {
    let stored = ctx.graph().vertex_property(vertex, property)?;
    ctx.graph().edge(EdgeId::parse(stored.as_str()?)?)
}

fn edge_id_values(ids: &[EdgeId]) -> Vec<Value> {
    ids.iter().map(|id| Value::from(id.to_string())).collect()
}

fn type_mismatch(attribute: &Attribute, found: &AttrValue) -> RepositoryError {
    let found = match found {
        AttrValue::Struct(s) => format!("struct {}", s.type_name),
        AttrValue::ObjectId(id) => format!("object id of {}", id.type_name),
        AttrValue::Array(_) => "array".to_string(),
        AttrValue::Map(_) => "map".to_string(),
        AttrValue::Primitive(v) => format!("primitive {}", v),
    };
    RepositoryError::TypeMismatch {
        expected: format!("{} for {}", attribute.attr_type.type_name(), attribute.qualified_name),
        found,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeleteMode;
    use crate::logic::delete::GraphDeleteHandler;
    use crate::logic::locks::LockCoordinator;
    use crate::logic::transaction::TransactionScope;
    use crate::model::{AttributeDef, EntityDef, Struct, StructDef, TypesDef};
    use crate::store::InMemoryGraph;
    use serde_json::json;

    fn registry() -> Arc<TypeRegistry> {
        Arc::new(
            TypeRegistry::new(TypesDef {
                struct_defs: vec![StructDef {
                    name: "Location".into(),
                    attribute_defs: vec![AttributeDef::new("path", "string")],
                }],
                entity_defs: vec![
                    EntityDef {
                        name: "Db".into(),
                        super_types: vec![],
                        attribute_defs: vec![
                            AttributeDef::new("name", "string").unique(),
                            AttributeDef::new("location", "Location"),
                            AttributeDef::new("params", "map<string,string>"),
                            AttributeDef::new("tags", "array<string>").cardinality(Cardinality::Set),
                            AttributeDef::new("parent", "Db").soft(),
                            AttributeDef::new("owner", "string").default_value("nobody"),
                        ],
                    },
                ],
                ..Default::default()
            })
            .unwrap(),
        )
    }

    fn mapper(registry: &Arc<TypeRegistry>) -> EntityGraphMapper {
        let delete_handler = Arc::new(GraphDeleteHandler::new(Arc::clone(registry), DeleteMode::Soft));
        EntityGraphMapper::new(
            Arc::clone(registry),
            delete_handler,
            RepositoryConfig::default(),
            GraphConfig::default(),
        )
    }

    #[test]
    fn test_trim_follows_attempts() {
        let value = "x".repeat(1000);
        assert_eq!(trim_indexed_string(&value, 100, 1, 4), None);
        assert_eq!(trim_indexed_string(&value, 100, 2, 4).unwrap().len(), 400);
        assert_eq!(trim_indexed_string(&value, 100, 3, 4).unwrap().len(), 200);

        let last = trim_indexed_string(&value, 100, 4, 4).unwrap();
        assert_eq!(last.len(), 100);
        assert!(last.starts_with(&"x".repeat(35)));
        assert_eq!(&last[35..36], ":");

        // the final allowed attempt always trims to the safe length
        assert_eq!(trim_indexed_string(&value, 100, 2, 2).unwrap().len(), 100);
        assert_eq!(trim_indexed_string(&value, 300, 2, 5), None);
    }

    #[test]
    fn test_trimmed_values_differ_by_checksum() {
        let a = format!("{}a", "x".repeat(500));
        let b = format!("{}b", "x".repeat(500));
        assert_ne!(
            trim_indexed_string(&a, 100, 4, 4),
            trim_indexed_string(&b, 100, 4, 4)
        );
    }

    #[test]
    fn test_create_maps_struct_map_set_and_soft_reference() {
        let registry = registry();
        let mapper = mapper(&registry);
        let retriever = EntityGraphRetriever::new(Arc::clone(&registry));
        let graph = InMemoryGraph::new();
        let locks = LockCoordinator::new();

        let entity = TransactionScope::new(&graph, &locks)
            .run(RequestContext::new("tester"), |ctx| {
                let vertex = GraphHelper::create_vertex(ctx, "Db", &[])?;
                ctx.graph_mut().set_vertex_property(vertex, "__guid", json!("d-1"))?;

                let mut context = EntityMutationContext::default();
                let mut params = HashMap::new();
                params.insert("k1".to_string(), AttrValue::from("v1"));
                let input = Entity::new("Db")
                    .with_guid("d-1")
                    .with_attribute("name", "sales")
                    .with_attribute("location", Struct::new("Location").with_attribute("path", "/data"))
                    .with_attribute("params", AttrValue::Map(params))
                    .with_attribute("tags", vec!["a", "b", "a"])
                    .with_attribute("parent", ObjectId::new("p-1", "Db"));
                context.add_created("d-1", input, vertex);

                let response = mapper.map_attributes_and_classifications(ctx, &context, false, false)?;
                assert_eq!(response.created().len(), 1);
                retriever.to_entity(ctx, "d-1")
            })
            .unwrap();

        assert_eq!(entity.attribute("name").and_then(|v| v.as_str()), Some("sales"));
        assert_eq!(entity.attribute("owner").and_then(|v| v.as_str()), Some("nobody"));
        let location = entity.attribute("location").and_then(|v| v.as_struct()).unwrap();
        assert_eq!(location.attributes["path"].as_str(), Some("/data"));
        assert_eq!(entity.attribute("params").and_then(|v| v.as_map()).unwrap()["k1"].as_str(), Some("v1"));
        assert_eq!(entity.attribute("tags"), Some(&AttrValue::from(vec!["a", "b"])));
        assert_eq!(entity.attribute("parent").and_then(|v| v.as_object_id()).and_then(|id| id.guid()), Some("p-1"));
    }

    #[test]
    fn test_update_with_null_removes_struct_and_map_entries() {
        let registry = registry();
        let mapper = mapper(&registry);
        let retriever = EntityGraphRetriever::new(Arc::clone(&registry));
        let graph = InMemoryGraph::new();
        let locks = LockCoordinator::new();

        let entity = TransactionScope::new(&graph, &locks)
            .run(RequestContext::new("tester"), |ctx| {
                let vertex = GraphHelper::create_vertex(ctx, "Db", &[])?;
                ctx.graph_mut().set_vertex_property(vertex, "__guid", json!("d-1"))?;

                let mut params = HashMap::new();
                params.insert("k1".to_string(), AttrValue::from("v1"));
                params.insert("k2".to_string(), AttrValue::from("v2"));
                let mut created = EntityMutationContext::default();
                created.add_created(
                    "d-1",
                    Entity::new("Db")
                        .with_guid("d-1")
                        .with_attribute("name", "sales")
                        .with_attribute("location", Struct::new("Location").with_attribute("path", "/data"))
                        .with_attribute("params", AttrValue::Map(params)),
                    vertex,
                );
                mapper.map_attributes_and_classifications(ctx, &created, false, false)?;

                let mut params = HashMap::new();
                params.insert("k2".to_string(), AttrValue::from("v2b"));
                let mut updated = EntityMutationContext::default();
                updated.add_updated(
                    "d-1",
                    Entity::new("Db")
                        .with_guid("d-1")
                        .with_attribute("location", AttrValue::null())
                        .with_attribute("params", AttrValue::Map(params)),
                    vertex,
                );
                let response = mapper.map_attributes_and_classifications(ctx, &updated, true, false)?;
                assert_eq!(response.partial_updated().len(), 1);
                assert_eq!(ctx.graph().vertex_property(vertex, "Db.params.k1"), None);
                retriever.to_entity(ctx, "d-1")
            })
            .unwrap();

        assert!(entity.attribute("location").is_none());
        assert_eq!(entity.attribute("name").and_then(|v| v.as_str()), Some("sales"));
        let params = entity.attribute("params").and_then(|v| v.as_map()).unwrap();
        assert_eq!(params.len(), 1);
        assert_eq!(params["k2"].as_str(), Some("v2b"));
    }
}
