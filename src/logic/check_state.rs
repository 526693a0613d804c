use crate::error::Result;
use crate::logic::graph_helper::{GraphHelper, SUPER_TYPES_PROPERTY, TYPE_NAME_PROPERTY};
use crate::logic::transaction::TransactionContext;
use crate::model::{CheckStateRequest, CheckStateResult, EntityState, EntityStateKind, Status, TypeRegistry};
use crate::store::VertexId;
use log::{debug, info};
use serde_json::Value;
use std::sync::Arc;

/// Audits entity vertices for inconsistencies between their trait names and
/// attached classification edges, optionally repairing them
pub struct EntityStateChecker {
    registry: Arc<TypeRegistry>,
}

impl EntityStateChecker {
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        Self { registry }
    }

    pub fn check_state(&self, ctx: &mut TransactionContext<'_>, request: &CheckStateRequest) -> Result<CheckStateResult> {
        let mut result = CheckStateResult::default();
        let mut scanned: Vec<VertexId> = Vec::new();

        for guid in &request.entity_guids {
            match GraphHelper::find_vertex_by_guid(ctx, guid) {
                Some(vertex) => {
                    if !scanned.contains(&vertex) {
                        scanned.push(vertex);
                        result.record(self.check_entity(ctx, vertex, request.fix_issues)?);
                    }
                }
                None => result.record(EntityState {
                    guid: guid.clone(),
                    type_name: String::new(),
                    state: EntityStateKind::NotFixed,
                    issues: vec!["entity not found".to_string()],
                }),
            }
        }

        for type_name in &request.entity_types {
            self.registry.entity_type(type_name)?;
            let value = Value::from(type_name.as_str());
            let mut vertices = ctx.graph().query_vertices(TYPE_NAME_PROPERTY, &value);
            vertices.extend(ctx.graph().query_vertices(SUPER_TYPES_PROPERTY, &value));
            for vertex in vertices {
                // classification vertices share the super type property
                if GraphHelper::guid(ctx, vertex).is_none() || scanned.contains(&vertex) {
                    continue;
                }
                scanned.push(vertex);
                result.record(self.check_entity(ctx, vertex, request.fix_issues)?);
            }
        }

        info!(
            "check state: scanned={} ok={} fixed={} partially fixed={} not fixed={}",
            result.entities_scanned,
            result.entities_ok,
            result.entities_fixed,
            result.entities_partially_fixed,
            result.entities_not_fixed
        );
        Ok(result)
    }

    fn check_entity(&self, ctx: &mut TransactionContext<'_>, vertex: VertexId, fix_issues: bool) -> Result<EntityState> {
        let guid = GraphHelper::guid(ctx, vertex).unwrap_or_default();
        let type_name = GraphHelper::type_name(ctx, vertex).unwrap_or_default();
        let mut unfixable = Vec::new();
        let mut fixable = Vec::new();

        if type_name.is_empty() || self.registry.find_entity_type(&type_name).is_none() {
            unfixable.push(format!("unknown type '{}'", type_name));
        }

        let trait_names = GraphHelper::trait_names(ctx, vertex);
        let mut attached: Vec<String> = Vec::new();
        let entity_active = GraphHelper::status(ctx, vertex) == Status::Active;
        for edge in GraphHelper::classification_edges(ctx, vertex) {
            if entity_active && GraphHelper::edge_status(ctx, edge.id) == Status::Deleted {
                continue;
            }
            match GraphHelper::type_name(ctx, edge.in_vertex) {
                Some(name) if !attached.contains(&name) => attached.push(name),
                Some(_) => {}
                None => unfixable.push(format!("classification vertex {} has no type", edge.in_vertex)),
            }
        }

        for name in &attached {
            if !trait_names.contains(name) {
                fixable.push(format!("classification {} attached but missing from trait names", name));
            }
        }
        for name in &trait_names {
            if !attached.contains(name) {
                fixable.push(format!("trait name {} has no classification attached", name));
            }
        }

        let state = match (fixable.is_empty(), unfixable.is_empty(), fix_issues) {
            (true, true, _) => EntityStateKind::Ok,
            (false, _, true) => {
                let repaired: Vec<String> = trait_names
                    .iter()
                    .filter(|n| attached.contains(n))
                    .chain(attached.iter().filter(|n| !trait_names.contains(n)))
                    .cloned()
                    .collect();
                GraphHelper::set_trait_names(ctx, vertex, &repaired)?;
                GraphHelper::update_modification_metadata(ctx, vertex)?;
                debug!("repaired trait names of {}: {:?}", guid, repaired);
                if unfixable.is_empty() {
                    EntityStateKind::Fixed
                } else {
                    EntityStateKind::PartiallyFixed
                }
            }
            _ => EntityStateKind::NotFixed,
        };

        let mut issues = unfixable;
        issues.extend(fixable);
        Ok(EntityState {
            guid,
            type_name,
            state,
            issues,
        })
    }
}
