//! Public surface of the repository. Every operation runs inside one
//! [`TransactionScope`]; mutating operations notify the [`ChangeNotifier`]
//! once, after the commit succeeded, unless nothing changed.

use crate::config::AppConfig;
use crate::config::RepositoryConfig;
use crate::error::{RepositoryError, Result};
use crate::logic::check_state::EntityStateChecker;
use crate::logic::delete::{DeleteHandler, GraphDeleteHandler};
use crate::logic::discovery::{
    find_by_unique_attributes, unique_attribute_values, BatchEntityStream, EntityGraphDiscovery, EntityStream,
    ImportEntityStream,
};
use crate::logic::graph_helper::{GraphHelper, GUID_PROPERTY, RELATIONSHIP_GUID_PROPERTY, RELATIONSHIP_TYPE_PROPERTY};
use crate::logic::locks::LockCoordinator;
use crate::logic::mapper::EntityGraphMapper;
use crate::logic::mutation_context::EntityMutationContext;
use crate::logic::notifier::{ChangeNotifier, LoggingNotifier};
use crate::logic::retriever::EntityGraphRetriever;
use crate::logic::transaction::{RequestContext, TransactionContext, TransactionScope};
use crate::logic::validate::{EntityValidator, ValidationMode};
use crate::model::{
    generate_guid, is_assigned_guid, AttrValue, AttributeType, CheckStateRequest, CheckStateResult, Classification,
    EntitiesWithExtInfo, Entity, EntityHeader, EntityOperation, EntityWithExtInfo, Guid, MutationResponse, ObjectId,
    Relationship, Status, TypeRegistry,
};
use crate::store::{Graph, VertexId};
use log::{debug, warn};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

pub struct EntityStore {
    graph: Arc<dyn Graph>,
    locks: Arc<LockCoordinator>,
    registry: Arc<TypeRegistry>,
    retriever: EntityGraphRetriever,
    mapper: EntityGraphMapper,
    delete_handler: Arc<dyn DeleteHandler>,
    notifier: Arc<dyn ChangeNotifier>,
    checker: EntityStateChecker,
    app_config: AppConfig,
}

impl EntityStore {
    pub fn new(graph: Arc<dyn Graph>, registry: Arc<TypeRegistry>, app_config: AppConfig) -> Self {
        let delete_handler: Arc<dyn DeleteHandler> = Arc::new(GraphDeleteHandler::new(
            Arc::clone(&registry),
            app_config.repository.delete_mode,
        ));
        Self {
            graph,
            locks: Arc::new(LockCoordinator::new()),
            retriever: EntityGraphRetriever::new(Arc::clone(&registry)),
            mapper: Self::build_mapper(&registry, &delete_handler, &app_config),
            checker: EntityStateChecker::new(Arc::clone(&registry)),
            notifier: Arc::new(LoggingNotifier),
            delete_handler,
            registry,
            app_config,
        }
    }

    fn build_mapper(
        registry: &Arc<TypeRegistry>,
        delete_handler: &Arc<dyn DeleteHandler>,
        app_config: &AppConfig,
    ) -> EntityGraphMapper {
        EntityGraphMapper::new(
            Arc::clone(registry),
            Arc::clone(delete_handler),
            app_config.repository.clone(),
            app_config.graph.clone(),
        )
    }

    pub fn with_delete_handler(mut self, delete_handler: Arc<dyn DeleteHandler>) -> Self {
        self.mapper = Self::build_mapper(&self.registry, &delete_handler, &self.app_config);
        self.delete_handler = delete_handler;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn ChangeNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Shares one lock table between stores writing the same graph
    pub fn with_lock_coordinator(mut self, locks: Arc<LockCoordinator>) -> Self {
        self.locks = locks;
        self
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    pub fn locks(&self) -> &LockCoordinator {
        &self.locks
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.app_config.repository
    }

    /// Request made by the configured default user
    pub fn request_context(&self) -> RequestContext {
        RequestContext::new(self.app_config.repository.default_user.clone())
    }

    fn scope(&self) -> TransactionScope<'_> {
        TransactionScope::new(self.graph.as_ref(), &self.locks)
    }

    pub fn get_by_id(&self, request: &RequestContext, guid: &str, min_ext_info: bool) -> Result<EntityWithExtInfo> {
        self.scope().run(request.clone(), |ctx| {
            self.retriever.to_entity_with_ext_info(ctx, guid, min_ext_info)
        })
    }

    pub fn get_by_ids(&self, request: &RequestContext, guids: &[Guid], min_ext_info: bool) -> Result<EntitiesWithExtInfo> {
        self.scope().run(request.clone(), |ctx| {
            self.retriever.to_entities_with_ext_info(ctx, guids, min_ext_info)
        })
    }

    pub fn get_header_by_id(&self, request: &RequestContext, guid: &str) -> Result<EntityHeader> {
        self.scope().run(request.clone(), |ctx| self.retriever.header_by_guid(ctx, guid))
    }

    pub fn get_by_unique_attributes(
        &self,
        request: &RequestContext,
        type_name: &str,
        unique_attributes: &HashMap<String, Value>,
        min_ext_info: bool,
    ) -> Result<EntityWithExtInfo> {
        self.scope().run(request.clone(), |ctx| {
            let vertex = self.vertex_by_unique_attributes(ctx, type_name, unique_attributes)?;
            let guid = vertex_guid(ctx, vertex)?;
            self.retriever.to_entity_with_ext_info(ctx, &guid, min_ext_info)
        })
    }

    /// Creates the stream's new entities and updates the existing ones.
    /// With `is_partial`, updates leave absent attributes untouched and are
    /// reported as partial updates.
    pub fn create_or_update(
        &self,
        request: &RequestContext,
        stream: &dyn EntityStream,
        is_partial: bool,
    ) -> Result<MutationResponse> {
        self.create_or_update_internal(request.clone(), stream, is_partial, false)
    }

    /// Imports exported entities, keeping their guids, system attributes and classifications
    pub fn create_or_update_for_import(
        &self,
        request: &RequestContext,
        stream: &ImportEntityStream,
    ) -> Result<MutationResponse> {
        let mut request = request.clone();
        request.import_in_progress = true;
        self.create_or_update_internal(request, stream, false, true)
    }

    fn create_or_update_internal(
        &self,
        request: RequestContext,
        stream: &dyn EntityStream,
        is_partial: bool,
        replace_classifications: bool,
    ) -> Result<MutationResponse> {
        if stream.entities().next().is_none() {
            return Err(RepositoryError::InvalidParameters("no entities to create or update".to_string()));
        }
        let response = self
            .scope()
            .run(request, |ctx| self.mutate(ctx, stream, is_partial, replace_classifications))?;

        self.notify(&response, stream.is_import());
        Ok(response)
    }

    fn mutate(
        &self,
        ctx: &mut TransactionContext<'_>,
        stream: &dyn EntityStream,
        is_partial: bool,
        replace_classifications: bool,
    ) -> Result<MutationResponse> {
        let mut context = self.pre_create_or_update(ctx, stream, is_partial)?;

        let unchanged = self.unchanged_entities(ctx, &context, replace_classifications)?;
        if !unchanged.is_empty() {
            debug!("skipping {} entities with no changes: {:?}", unchanged.len(), unchanged);
            context.remove_updated(&unchanged);
        }

        self.mapper
            .map_attributes_and_classifications(ctx, &context, is_partial, replace_classifications)
    }

    /// Calls that changed nothing are not reported
    fn notify(&self, response: &MutationResponse, is_import: bool) {
        if response.is_empty() {
            debug!("no entities mutated");
            return;
        }
        self.notifier.on_entities_mutated(response, is_import);
    }

    /// Resolves every stream entity to an existing vertex or a new one, validating on the way
    fn pre_create_or_update(
        &self,
        ctx: &mut TransactionContext<'_>,
        stream: &dyn EntityStream,
        is_partial: bool,
    ) -> Result<EntityMutationContext> {
        let discovery = EntityGraphDiscovery::new(&self.registry).discover_entities(ctx, stream)?;
        let mut context = EntityMutationContext::new(discovery);
        let validator = EntityValidator::new(&self.registry);
        let is_import = stream.is_import();

        for guid in context.discovery().referenced_guids().to_vec() {
            let Some(entity) = stream.get_by_guid(&guid) else {
                continue;
            };

            match context.discovery().resolved_guid_vertex(&guid) {
                Some(vertex) => {
                    let mode = if is_partial {
                        ValidationMode::Update
                    } else {
                        ValidationMode::Create
                    };
                    let mut normalized = validator.validate_and_normalize(entity, mode)?;
                    let stored_guid = vertex_guid(ctx, vertex)?;
                    if stored_guid != guid {
                        ctx.record_guid_update(&guid, &stored_guid);
                    }
                    normalized.guid = stored_guid;

                    if is_import {
                        self.apply_import_status(ctx, &mut context, &normalized, vertex);
                    }
                    context.add_updated(&guid, normalized, vertex);
                }
                None => {
                    let mut normalized = validator.validate_and_normalize(entity, ValidationMode::Create)?;
                    let entity_type = self.registry.entity_type(&normalized.type_name)?;

                    let new_guid = if is_import && is_assigned_guid(&guid) {
                        guid.clone()
                    } else {
                        generate_guid()
                    };
                    let vertex = GraphHelper::create_vertex(ctx, &entity_type.name, &entity_type.all_super_types)?;
                    ctx.graph_mut()
                        .set_vertex_property(vertex, GUID_PROPERTY, Value::from(new_guid.clone()))?;
                    debug!("created vertex {} for {} {}", vertex, entity_type.name, new_guid);

                    let unique_values = unique_attribute_values(entity_type, &normalized);
                    context.discovery_mut().add_resolved_guid(&guid, vertex);
                    context
                        .discovery_mut()
                        .add_resolved_by_unique_attributes(entity_type, unique_values, vertex);

                    normalized.guid = new_guid;
                    context.add_created(&guid, normalized, vertex);
                }
            }
        }
        Ok(context)
    }

    fn apply_import_status(
        &self,
        ctx: &mut TransactionContext<'_>,
        context: &mut EntityMutationContext,
        entity: &Entity,
        vertex: VertexId,
    ) {
        let stored = GraphHelper::status(ctx, vertex);
        match (stored, entity.status) {
            (Status::Active, Status::Deleted) => context.add_entity_to_delete(vertex),
            (Status::Deleted, Status::Active) => {
                warn!("import of {} ignores its ACTIVE status: the entity is deleted", entity.guid);
            }
            _ => {}
        }
    }

    /// Guids of updated entities whose attributes present in the input equal the stored ones
    fn unchanged_entities(
        &self,
        ctx: &mut TransactionContext<'_>,
        context: &EntityMutationContext,
        replace_classifications: bool,
    ) -> Result<Vec<Guid>> {
        let mut unchanged = Vec::new();

        'entities: for entity in context.updated_entities() {
            let Some(vertex) = context.vertex(&entity.guid) else {
                continue;
            };
            if GraphHelper::status(ctx, vertex) == Status::Deleted {
                continue;
            }
            let entity_type = self.registry.entity_type(&entity.type_name)?;

            for (name, value) in &entity.attributes {
                let Some(attribute) = entity_type.attribute(name) else {
                    continue 'entities;
                };
                let current = self.retriever.entity_attribute_value(ctx, vertex, attribute)?;
                if !self
                    .registry
                    .are_equal_values(attribute, current.as_ref(), Some(value), context.guid_assignments())
                {
                    debug!("{} of {} changed", attribute.qualified_name, entity.guid);
                    continue 'entities;
                }
            }

            if replace_classifications && !self.same_classifications(ctx, vertex, &entity.classifications)? {
                continue;
            }
            unchanged.push(entity.guid.clone());
        }
        Ok(unchanged)
    }

    fn same_classifications(
        &self,
        ctx: &mut TransactionContext<'_>,
        vertex: VertexId,
        incoming: &[Classification],
    ) -> Result<bool> {
        let mut current: Vec<(String, HashMap<String, AttrValue>)> = self
            .retriever
            .classifications(ctx, vertex)?
            .into_iter()
            .map(|c| (c.type_name, c.attributes))
            .collect();
        let mut incoming: Vec<(String, HashMap<String, AttrValue>)> = incoming
            .iter()
            .map(|c| (c.type_name.clone(), c.attributes.clone()))
            .collect();
        current.sort_by(|a, b| a.0.cmp(&b.0));
        incoming.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(current == incoming)
    }

    /// Partial update of the entity identified by `id`
    pub fn update_entity(
        &self,
        request: &RequestContext,
        id: &ObjectId,
        update: EntityWithExtInfo,
    ) -> Result<MutationResponse> {
        self.partial_update(request, update, |ctx| self.resolve_guid(ctx, id))
    }

    pub fn update_by_unique_attributes(
        &self,
        request: &RequestContext,
        type_name: &str,
        unique_attributes: &HashMap<String, Value>,
        update: EntityWithExtInfo,
    ) -> Result<MutationResponse> {
        self.partial_update(request, update, |ctx| {
            let vertex = self.vertex_by_unique_attributes(ctx, type_name, unique_attributes)?;
            vertex_guid(ctx, vertex)
        })
    }

    /// Resolves the target and applies the update in the same transaction
    fn partial_update(
        &self,
        request: &RequestContext,
        mut update: EntityWithExtInfo,
        resolve: impl FnOnce(&mut TransactionContext<'_>) -> Result<Guid>,
    ) -> Result<MutationResponse> {
        if update.entity.is_none() {
            return Err(RepositoryError::InvalidParameters("no entity to update".to_string()));
        }

        let response = self.scope().run(request.clone(), |ctx| {
            let guid = resolve(ctx)?;
            if let Some(entity) = update.entity.as_mut() {
                entity.guid = guid;
            }
            self.mutate(ctx, &BatchEntityStream::from(update), true, false)
        })?;

        self.notify(&response, false);
        Ok(response)
    }

    /// Sets one primitive or object-id attribute; object ids may be given as a guid string
    pub fn update_entity_attribute_by_guid(
        &self,
        request: &RequestContext,
        guid: &str,
        attribute_name: &str,
        value: AttrValue,
    ) -> Result<MutationResponse> {
        let response = self.scope().run(request.clone(), |ctx| {
            let header = self.retriever.header_by_guid(ctx, guid)?;
            let entity_type = self.registry.entity_type(&header.type_name)?;
            let attribute = entity_type
                .attribute(attribute_name)
                .ok_or_else(|| RepositoryError::UnknownAttribute {
                    type_name: header.type_name.clone(),
                    attribute: attribute_name.to_string(),
                })?;

            let value = match &attribute.attr_type {
                AttributeType::Primitive(_) => value,
                AttributeType::ObjectId(target_type) => match value {
                    AttrValue::Primitive(Value::String(target_guid)) => {
                        ObjectId::new(target_guid, target_type.clone()).into()
                    }
                    AttrValue::ObjectId(id) => AttrValue::ObjectId(id),
                    other => {
                        return Err(RepositoryError::InvalidParameters(format!(
                            "{} expects an object id, found {:?}",
                            attribute.qualified_name, other
                        )))
                    }
                },
                other => {
                    return Err(RepositoryError::UnsupportedAttributeType {
                        attribute: attribute.qualified_name.clone(),
                        category: other.category().to_string(),
                    })
                }
            };

            let entity = Entity::new(header.type_name)
                .with_guid(guid)
                .with_attribute(attribute_name, value);
            self.mutate(ctx, &BatchEntityStream::from(entity), true, false)
        })?;

        self.notify(&response, false);
        Ok(response)
    }

    pub fn delete_by_id(&self, request: &RequestContext, guid: &str) -> Result<MutationResponse> {
        if guid.is_empty() {
            return Err(RepositoryError::EntityNotFound(guid.to_string()));
        }
        self.delete_by_ids(request, &[guid.to_string()])
    }

    /// Guids that do not exist are skipped
    pub fn delete_by_ids(&self, request: &RequestContext, guids: &[Guid]) -> Result<MutationResponse> {
        if guids.is_empty() {
            return Err(RepositoryError::InvalidParameters("guids not specified".to_string()));
        }

        let response = self.scope().run(request.clone(), |ctx| {
            ctx.lock(guids);
            let mut vertices = Vec::with_capacity(guids.len());
            for guid in guids {
                match GraphHelper::find_vertex_by_guid(ctx, guid) {
                    Some(vertex) => vertices.push(vertex),
                    None => debug!("delete: entity {} not found, ignoring", guid),
                }
            }
            self.delete_vertices(ctx, &vertices)
        })?;

        self.notify(&response, false);
        Ok(response)
    }

    pub fn delete_by_unique_attributes(
        &self,
        request: &RequestContext,
        type_name: &str,
        unique_attributes: &HashMap<String, Value>,
    ) -> Result<MutationResponse> {
        if unique_attributes.is_empty() {
            return Err(RepositoryError::EntityByUniqueAttributesNotFound {
                type_name: type_name.to_string(),
                attributes: GraphHelper::unique_attribute_values(unique_attributes),
            });
        }
        let entity_type = self.registry.entity_type(type_name)?;

        let response = self.scope().run(request.clone(), |ctx| {
            let mut found = find_by_unique_attributes(ctx, entity_type, unique_attributes);
            // the match may change until its guid is locked
            while let Some(vertex) = found {
                let guid = vertex_guid(ctx, vertex)?;
                ctx.lock(&[guid.as_str()]);
                ctx.evict_vertex(vertex);

                found = find_by_unique_attributes(ctx, entity_type, unique_attributes);
                if found == Some(vertex) {
                    return self.delete_vertices(ctx, &[vertex]);
                }
                debug!("delete: {} changed while waiting for its lock, looking up again", guid);
            }

            debug!(
                "delete: no {} with {}, ignoring",
                type_name,
                GraphHelper::unique_attribute_values(unique_attributes)
            );
            Ok(MutationResponse::new())
        })?;

        self.notify(&response, false);
        Ok(response)
    }

    fn delete_vertices(&self, ctx: &mut TransactionContext<'_>, vertices: &[VertexId]) -> Result<MutationResponse> {
        let mut response = MutationResponse::new();
        if !vertices.is_empty() {
            self.delete_handler.delete_entities(ctx, vertices)?;
        }
        self.mapper
            .add_side_effect_headers(ctx, &mut response, EntityOperation::Update)?;
        Ok(response)
    }

    pub fn add_classifications(
        &self,
        request: &RequestContext,
        guid: &str,
        classifications: &[Classification],
    ) -> Result<()> {
        self.add_classification_to_entities(request, &[guid.to_string()], classifications)
    }

    /// Attaches one classification to every entity in `guids`
    pub fn add_classification(&self, request: &RequestContext, guids: &[Guid], classification: &Classification) -> Result<()> {
        self.add_classification_to_entities(request, guids, std::slice::from_ref(classification))
    }

    fn add_classification_to_entities(
        &self,
        request: &RequestContext,
        guids: &[Guid],
        classifications: &[Classification],
    ) -> Result<()> {
        if guids.iter().any(|g| g.is_empty()) || guids.is_empty() {
            return Err(RepositoryError::InvalidParameters("guid(s) not specified".to_string()));
        }
        if classifications.is_empty() {
            return Err(RepositoryError::InvalidParameters("classification(s) not specified".to_string()));
        }

        let response = self.scope().run(request.clone(), |ctx| {
            ctx.lock(guids);
            let validator = EntityValidator::new(&self.registry);
            let context = EntityMutationContext::default();
            let mut response = MutationResponse::new();

            for guid in guids {
                let vertex = self.retriever.entity_vertex(ctx, guid)?;
                let type_name = GraphHelper::type_name(ctx, vertex).unwrap_or_default();
                let current = GraphHelper::trait_names(ctx, vertex);

                let mut validated = Vec::with_capacity(classifications.len());
                for classification in classifications {
                    if current.contains(&classification.type_name) {
                        return Err(RepositoryError::ClassificationAlreadyAssociated {
                            guid: guid.clone(),
                            classification: classification.type_name.clone(),
                        });
                    }
                    validated.push(validator.validate_classification(classification, &type_name)?);
                }

                self.mapper.add_classifications(ctx, &context, vertex, &validated)?;
                response.add_entity(EntityOperation::Update, self.retriever.to_header(ctx, vertex, &[])?);
            }
            Ok(response)
        })?;

        self.notify(&response, false);
        Ok(())
    }

    /// Merges the given attributes into classifications already attached to the entity
    pub fn update_classifications(
        &self,
        request: &RequestContext,
        guid: &str,
        classifications: &[Classification],
    ) -> Result<()> {
        if guid.is_empty() {
            return Err(RepositoryError::InvalidParameters("guid not specified".to_string()));
        }
        if classifications.is_empty() {
            return Err(RepositoryError::InvalidParameters("classification(s) not specified".to_string()));
        }

        let response = self.scope().run(request.clone(), |ctx| {
            ctx.lock(&[guid]);
            let vertex = self.retriever.entity_vertex(ctx, guid)?;
            let type_name = GraphHelper::type_name(ctx, vertex).unwrap_or_default();
            let validator = EntityValidator::new(&self.registry);

            let mut merged = Vec::with_capacity(classifications.len());
            for classification in classifications {
                let mut current = self.retriever.classification(ctx, guid, &classification.type_name)?;
                current.attributes.extend(classification.attributes.clone());
                current.entity_guid = None;
                merged.push(validator.validate_classification(&current, &type_name)?);
            }

            self.mapper
                .update_classifications(ctx, &EntityMutationContext::default(), vertex, &merged)?;
            let mut response = MutationResponse::new();
            response.add_entity(EntityOperation::Update, self.retriever.to_header(ctx, vertex, &[])?);
            Ok(response)
        })?;

        self.notify(&response, false);
        Ok(())
    }

    pub fn delete_classification(&self, request: &RequestContext, guid: &str, classification_name: &str) -> Result<()> {
        self.delete_classifications(request, guid, &[classification_name.to_string()])
    }

    pub fn delete_classifications(&self, request: &RequestContext, guid: &str, names: &[String]) -> Result<()> {
        if guid.is_empty() {
            return Err(RepositoryError::InvalidParameters("guid not specified".to_string()));
        }
        if names.is_empty() {
            return Err(RepositoryError::InvalidParameters("classification(s) not specified".to_string()));
        }

        let response = self.scope().run(request.clone(), |ctx| {
            ctx.lock(&[guid]);
            let vertex = self.retriever.entity_vertex(ctx, guid)?;
            self.mapper.delete_classifications(ctx, vertex, names)?;

            let mut response = MutationResponse::new();
            response.add_entity(EntityOperation::Update, self.retriever.to_header(ctx, vertex, &[])?);
            Ok(response)
        })?;

        self.notify(&response, false);
        Ok(())
    }

    pub fn get_classification(&self, request: &RequestContext, guid: &str, name: &str) -> Result<Classification> {
        self.scope()
            .run(request.clone(), |ctx| self.retriever.classification(ctx, guid, name))
    }

    pub fn get_classifications(&self, request: &RequestContext, guid: &str) -> Result<Vec<Classification>> {
        self.scope().run(request.clone(), |ctx| {
            let vertex = self.retriever.entity_vertex(ctx, guid)?;
            self.retriever.classifications(ctx, vertex)
        })
    }

    /// Connects two existing entities with an edge of the relationship type
    pub fn create_relationship(&self, request: &RequestContext, relationship: &Relationship) -> Result<Relationship> {
        let def = self.registry.relationship_def(&relationship.type_name)?;
        for name in relationship.attributes.keys() {
            if !def.attribute_defs.iter().any(|a| a.name == *name) {
                return Err(RepositoryError::UnknownAttribute {
                    type_name: def.name.clone(),
                    attribute: name.clone(),
                });
            }
        }

        self.scope().run(request.clone(), |ctx| {
            let end1 = self.resolve_vertex(ctx, &relationship.end1)?;
            let end2 = self.resolve_vertex(ctx, &relationship.end2)?;
            let end1_guid = vertex_guid(ctx, end1)?;
            let end2_guid = vertex_guid(ctx, end2)?;
            ctx.lock(&[end1_guid.as_str(), end2_guid.as_str()]);

            for (vertex, expected) in [(end1, &def.end1.type_name), (end2, &def.end2.type_name)] {
                let actual = GraphHelper::type_name(ctx, vertex).unwrap_or_default();
                let matches = self
                    .registry
                    .find_entity_type(&actual)
                    .map_or(false, |t| t.is_sub_type_of(expected));
                if !matches {
                    return Err(RepositoryError::TypeMismatch {
                        expected: expected.clone(),
                        found: actual,
                    });
                }
            }

            let edge = GraphHelper::add_edge(ctx, end1, end2, &def.edge_label())?;
            let graph = ctx.graph_mut();
            graph.set_edge_property(edge, RELATIONSHIP_GUID_PROPERTY, Value::from(generate_guid()))?;
            graph.set_edge_property(edge, RELATIONSHIP_TYPE_PROPERTY, Value::from(def.name.clone()))?;
            for (name, value) in &relationship.attributes {
                match value {
                    AttrValue::Primitive(v) if !v.is_null() => graph.set_edge_property(edge, name, v.clone())?,
                    AttrValue::Primitive(_) => {}
                    other => {
                        return Err(RepositoryError::TypeMismatch {
                            expected: format!("primitive value for {}.{}", def.name, name),
                            found: format!("{:?}", other),
                        })
                    }
                }
            }
            GraphHelper::update_modification_metadata(ctx, end1)?;
            GraphHelper::update_modification_metadata(ctx, end2)?;

            let info = ctx
                .graph()
                .edge(edge)
                .ok_or_else(|| RepositoryError::Internal(format!("edge {} vanished", edge)))?;
            self.retriever.to_relationship(ctx, &info)
        })
    }

    pub fn get_relationship_by_guid(&self, request: &RequestContext, guid: &str) -> Result<Relationship> {
        self.scope()
            .run(request.clone(), |ctx| self.retriever.relationship_by_guid(ctx, guid))
    }

    pub fn check_state(&self, request: &RequestContext, check: &CheckStateRequest) -> Result<CheckStateResult> {
        self.scope().run(request.clone(), |ctx| {
            if check.fix_issues {
                ctx.lock(check.entity_guids.as_slice());
            }
            self.checker.check_state(ctx, check)
        })
    }

    fn vertex_by_unique_attributes(
        &self,
        ctx: &mut TransactionContext<'_>,
        type_name: &str,
        unique_attributes: &HashMap<String, Value>,
    ) -> Result<VertexId> {
        let entity_type = self.registry.entity_type(type_name)?;
        find_by_unique_attributes(ctx, entity_type, unique_attributes).ok_or_else(|| {
            RepositoryError::EntityByUniqueAttributesNotFound {
                type_name: type_name.to_string(),
                attributes: GraphHelper::unique_attribute_values(unique_attributes),
            }
        })
    }

    fn resolve_vertex(&self, ctx: &mut TransactionContext<'_>, id: &ObjectId) -> Result<VertexId> {
        if let Some(guid) = id.guid() {
            return self.retriever.entity_vertex(ctx, guid);
        }
        if id.unique_attributes.is_empty() {
            return Err(RepositoryError::InvalidObjectId(format!(
                "{} has neither guid nor unique attributes",
                id.type_name
            )));
        }
        self.vertex_by_unique_attributes(ctx, &id.type_name, &id.unique_attributes)
    }

    fn resolve_guid(&self, ctx: &mut TransactionContext<'_>, id: &ObjectId) -> Result<Guid> {
        let vertex = self.resolve_vertex(ctx, id)?;
        vertex_guid(ctx, vertex)
    }
}

fn vertex_guid(ctx: &mut TransactionContext<'_>, vertex: VertexId) -> Result<Guid> {
    GraphHelper::guid(ctx, vertex).ok_or_else(|| RepositoryError::Internal(format!("vertex {} has no guid", vertex)))
}
