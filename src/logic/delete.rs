use crate::config::DeleteMode;
use crate::error::Result;
use crate::logic::graph_helper::GraphHelper;
use crate::logic::retriever::EntityGraphRetriever;
use crate::logic::transaction::TransactionContext;
use crate::model::{Attribute, AttributeType, Status, TypeCategory, TypeRegistry};
use crate::store::{Direction, EdgeInfo, VertexId};
use log::debug;
use serde_json::Value;
use std::sync::Arc;

/// Removes entities and references from the graph
pub trait DeleteHandler: Send + Sync {
    /// Deletes the entities, everything they own, and the references other
    /// entities hold to them. Headers of deleted entities are recorded on `ctx`
    /// before anything changes.
    fn delete_entities(&self, ctx: &mut TransactionContext<'_>, vertices: &[VertexId]) -> Result<()>;

    /// Deletes the reference carried by `edge`. Struct, classification and owned
    /// entity targets are deleted with it; for other references the inverse
    /// reference on the target is removed.
    ///
    /// Returns whether the reference is gone for good. When it is not, callers
    /// keep the edge in their collection.
    fn delete_edge_reference(
        &self,
        ctx: &mut TransactionContext<'_>,
        edge: &EdgeInfo,
        category: TypeCategory,
        is_owned: bool,
        force: bool,
    ) -> Result<bool>;

    fn mode(&self) -> DeleteMode;
}

/// Soft mode marks vertices and edges DELETED; hard mode removes them
pub struct GraphDeleteHandler {
    registry: Arc<TypeRegistry>,
    retriever: EntityGraphRetriever,
    mode: DeleteMode,
}

impl GraphDeleteHandler {
    pub fn new(registry: Arc<TypeRegistry>, mode: DeleteMode) -> Self {
        Self {
            retriever: EntityGraphRetriever::new(Arc::clone(&registry)),
            registry,
            mode,
        }
    }

    fn is_soft(&self) -> bool {
        self.mode == DeleteMode::Soft
    }

    /// The vertex followed by every active entity it owns, transitively
    fn collect_owned_vertices(
        &self,
        ctx: &mut TransactionContext<'_>,
        vertex: VertexId,
        collected: &mut Vec<VertexId>,
    ) -> Result<()> {
        if collected.contains(&vertex) {
            return Ok(());
        }
        collected.push(vertex);

        let Some(type_name) = GraphHelper::type_name(ctx, vertex) else {
            return Ok(());
        };
        let entity_type = self.registry.entity_type(&type_name)?;
        for attribute in entity_type.attributes() {
            if !attribute.is_owned_ref() || attribute.is_soft_ref() || !is_object_id_reference(&attribute.attr_type) {
                continue;
            }
            for edge in active_reference_edges(ctx, vertex, attribute) {
                if GraphHelper::status(ctx, edge.in_vertex) == Status::Active {
                    self.collect_owned_vertices(ctx, edge.in_vertex, collected)?;
                }
            }
        }
        Ok(())
    }

    fn delete_entity_vertex(&self, ctx: &mut TransactionContext<'_>, vertex: VertexId, batch: &[VertexId]) -> Result<()> {
        let details = GraphHelper::vertex_details(ctx, vertex);
        debug!("deleting {}", details);

        if let Some(type_name) = GraphHelper::type_name(ctx, vertex) {
            let entity_type = self.registry.entity_type(&type_name)?;
            for attribute in entity_type.attributes() {
                if attribute.is_soft_ref() || !element_or_self(&attribute.attr_type).is_reference() {
                    continue;
                }
                let is_struct = matches!(element_or_self(&attribute.attr_type), AttributeType::Struct(_));
                for edge in active_reference_edges(ctx, vertex, attribute) {
                    self.remove_or_mark_edge(ctx, &edge, false)?;
                    if is_struct {
                        self.delete_struct_vertex(ctx, edge.in_vertex, false)?;
                    }
                }
            }
        }

        for edge in GraphHelper::classification_edges(ctx, vertex) {
            if GraphHelper::edge_status(ctx, edge.id) == Status::Active {
                self.remove_or_mark_edge(ctx, &edge, false)?;
                self.delete_struct_vertex(ctx, edge.in_vertex, false)?;
            }
        }

        for edge in ctx.graph().edges(vertex, Direction::In, None) {
            if GraphHelper::edge_status(ctx, edge.id) == Status::Deleted || batch.contains(&edge.out_vertex) {
                continue;
            }
            if GraphHelper::status(ctx, edge.out_vertex) == Status::Deleted {
                continue;
            }
            let attribute = self.attribute_for_edge(ctx, &edge);
            self.remove_reference_from_referrer(ctx, edge.out_vertex, attribute.as_ref(), &edge)?;
        }

        if self.is_soft() {
            for edge in ctx.graph().edges(vertex, Direction::Both, None) {
                if GraphHelper::edge_status(ctx, edge.id) == Status::Active {
                    self.remove_or_mark_edge(ctx, &edge, false)?;
                }
            }
            GraphHelper::set_status(ctx, vertex, Status::Deleted)?;
            GraphHelper::update_modification_metadata(ctx, vertex)?;
        } else {
            ctx.graph_mut().remove_vertex(vertex)?;
            ctx.evict_vertex(vertex);
        }
        Ok(())
    }

    /// Struct and classification vertices, with the structs nested in them
    fn delete_struct_vertex(&self, ctx: &mut TransactionContext<'_>, vertex: VertexId, force: bool) -> Result<()> {
        if !ctx.graph().vertex_exists(vertex) {
            return Ok(());
        }
        for edge in ctx.graph().edges(vertex, Direction::Out, None) {
            if !edge.label.starts_with("__") {
                continue;
            }
            let nested_is_struct = GraphHelper::guid(ctx, edge.in_vertex).is_none();
            self.remove_or_mark_edge(ctx, &edge, force)?;
            if nested_is_struct {
                self.delete_struct_vertex(ctx, edge.in_vertex, force)?;
            }
        }

        if self.is_soft() && !force {
            GraphHelper::set_status(ctx, vertex, Status::Deleted)?;
            GraphHelper::update_modification_metadata(ctx, vertex)
        } else {
            ctx.graph_mut().remove_vertex(vertex)?;
            ctx.evict_vertex(vertex);
            Ok(())
        }
    }

    fn remove_or_mark_edge(&self, ctx: &mut TransactionContext<'_>, edge: &EdgeInfo, force: bool) -> Result<()> {
        if ctx.graph().edge(edge.id).is_none() {
            return Ok(());
        }
        if self.is_soft() && !force {
            GraphHelper::set_edge_status(ctx, edge.id, Status::Deleted)?;
            GraphHelper::update_edge_modification_metadata(ctx, edge.id)
        } else {
            ctx.graph_mut().remove_edge(edge.id)?;
            ctx.evict_edge(edge.id);
            Ok(())
        }
    }

    /// Attribute of the out vertex's type that wrote `edge`
    fn attribute_for_edge(&self, ctx: &TransactionContext<'_>, edge: &EdgeInfo) -> Option<Attribute> {
        let type_name = GraphHelper::type_name(ctx, edge.out_vertex)?;
        let attributes = match self.registry.find_entity_type(&type_name) {
            Some(entity_type) => entity_type.attributes(),
            None => self
                .registry
                .struct_type(&type_name)
                .or_else(|_| self.registry.classification_type(&type_name))
                .ok()?
                .attributes(),
        };
        attributes
            .iter()
            .find(|a| {
                a.edge_label == edge.label
                    || (a.category() == TypeCategory::Map
                        && edge
                            .label
                            .strip_prefix(a.edge_label.as_str())
                            .map_or(false, |rest| rest.starts_with('.')))
            })
            .cloned()
    }

    /// Drops the referrer's reference along `edge`. Collection entries are
    /// only rewritten in hard mode; soft mode leaves the deleted edge listed.
    fn remove_reference_from_referrer(
        &self,
        ctx: &mut TransactionContext<'_>,
        referrer: VertexId,
        attribute: Option<&Attribute>,
        edge: &EdgeInfo,
    ) -> Result<()> {
        if let (Some(attribute), false) = (attribute, self.is_soft()) {
            let edge_id = Value::from(edge.id.to_string());
            match attribute.category() {
                TypeCategory::Array => {
                    let remaining: Vec<Value> = GraphHelper::edge_id_list(ctx, referrer, &attribute.vertex_property)
                        .into_iter()
                        .filter(|id| *id != edge.id)
                        .map(|id| Value::from(id.to_string()))
                        .collect();
                    GraphHelper::set_list_property(ctx, referrer, &attribute.vertex_property, remaining)?;
                }
                TypeCategory::Map => {
                    let keys = GraphHelper::map_keys(ctx, referrer, &attribute.vertex_property);
                    let mut remaining = Vec::with_capacity(keys.len());
                    for key in keys {
                        let property = GraphHelper::map_key_property(&attribute.vertex_property, &key);
                        if ctx.graph().vertex_property(referrer, &property).as_ref() == Some(&edge_id) {
                            ctx.graph_mut().remove_vertex_property(referrer, &property)?;
                        } else {
                            remaining.push(Value::from(key));
                        }
                    }
                    GraphHelper::set_list_property(ctx, referrer, &attribute.vertex_property, remaining)?;
                }
                _ => {}
            }
        }

        self.remove_or_mark_edge(ctx, edge, false)?;

        if let Some(guid) = GraphHelper::guid(ctx, referrer) {
            GraphHelper::update_modification_metadata(ctx, referrer)?;
            ctx.record_entity_update(&guid);
        }
        Ok(())
    }

    /// Removes the inverse of the forward reference `edge`
    fn delete_inverse_reference(&self, ctx: &mut TransactionContext<'_>, edge: &EdgeInfo) -> Result<()> {
        let Some(attribute) = self.attribute_for_edge(ctx, edge) else {
            return Ok(());
        };
        let Some(inverse_name) = attribute.inverse_ref() else {
            return Ok(());
        };
        let Some(target_type) = GraphHelper::type_name(ctx, edge.in_vertex) else {
            return Ok(());
        };
        let Some(inverse) = self
            .registry
            .find_entity_type(&target_type)
            .and_then(|t| t.attribute(inverse_name))
            .cloned()
        else {
            return Ok(());
        };

        for inverse_edge in active_reference_edges(ctx, edge.in_vertex, &inverse) {
            if inverse_edge.in_vertex == edge.out_vertex {
                self.remove_reference_from_referrer(ctx, edge.in_vertex, Some(&inverse), &inverse_edge)?;
            }
        }
        Ok(())
    }
}

impl DeleteHandler for GraphDeleteHandler {
    fn delete_entities(&self, ctx: &mut TransactionContext<'_>, vertices: &[VertexId]) -> Result<()> {
        let mut batch = Vec::new();
        for &vertex in vertices {
            if !ctx.graph().vertex_exists(vertex) {
                continue;
            }
            if GraphHelper::status(ctx, vertex) == Status::Deleted {
                let details = GraphHelper::vertex_details(ctx, vertex);
                debug!("skipping deletion of {} as it is already deleted", details);
                continue;
            }
            self.collect_owned_vertices(ctx, vertex, &mut batch)?;
        }

        for &vertex in &batch {
            let mut header = self.retriever.to_header(ctx, vertex, &[])?;
            header.status = Status::Deleted;
            ctx.record_entity_delete(header);
        }

        for &vertex in &batch {
            self.delete_entity_vertex(ctx, vertex, &batch)?;
        }
        Ok(())
    }

    fn delete_edge_reference(
        &self,
        ctx: &mut TransactionContext<'_>,
        edge: &EdgeInfo,
        category: TypeCategory,
        is_owned: bool,
        force: bool,
    ) -> Result<bool> {
        debug!("deleting reference {} ({}, owned={}, force={})", edge.label, category, is_owned, force);

        match category {
            TypeCategory::Struct | TypeCategory::Classification => {
                self.remove_or_mark_edge(ctx, edge, force)?;
                self.delete_struct_vertex(ctx, edge.in_vertex, force)?;
            }
            TypeCategory::ObjectId if is_owned => {
                if GraphHelper::status(ctx, edge.in_vertex) == Status::Active {
                    self.delete_entities(ctx, &[edge.in_vertex])?;
                }
                self.remove_or_mark_edge(ctx, edge, false)?;
            }
            _ => {
                self.delete_inverse_reference(ctx, edge)?;
                self.remove_or_mark_edge(ctx, edge, false)?;
            }
        }

        Ok(!self.is_soft() || force)
    }

    fn mode(&self) -> DeleteMode {
        self.mode
    }
}

fn element_or_self(attr_type: &AttributeType) -> &AttributeType {
    attr_type.element_type().unwrap_or(attr_type)
}

fn is_object_id_reference(attr_type: &AttributeType) -> bool {
    matches!(element_or_self(attr_type), AttributeType::ObjectId(_))
}

/// Active edges written for `attribute`: single references, array elements and map entries
fn active_reference_edges(ctx: &mut TransactionContext<'_>, vertex: VertexId, attribute: &Attribute) -> Vec<EdgeInfo> {
    let map_prefix = format!("{}.", attribute.edge_label);
    let edges: Vec<EdgeInfo> = ctx
        .graph()
        .edges(vertex, Direction::Out, None)
        .into_iter()
        .filter(|e| e.label == attribute.edge_label || e.label.starts_with(&map_prefix))
        .collect();
    edges
        .into_iter()
        .filter(|e| GraphHelper::edge_status(ctx, e.id) == Status::Active)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::locks::LockCoordinator;
    use crate::logic::transaction::{RequestContext, TransactionScope};
    use crate::model::{AttributeDef, Cardinality, EntityDef, TypesDef};
    use crate::store::InMemoryGraph;
    use serde_json::json;

    fn registry() -> Arc<TypeRegistry> {
        Arc::new(
            TypeRegistry::new(TypesDef {
                entity_defs: vec![
                    EntityDef {
                        name: "Table".into(),
                        super_types: vec![],
                        attribute_defs: vec![
                            AttributeDef::new("name", "string"),
                            AttributeDef::new("columns", "array<Column>")
                                .owned()
                                .inverse_of("table")
                                .cardinality(Cardinality::List),
                        ],
                    },
                    EntityDef {
                        name: "Column".into(),
                        super_types: vec![],
                        attribute_defs: vec![
                            AttributeDef::new("name", "string"),
                            AttributeDef::new("table", "Table").inverse_of("columns"),
                        ],
                    },
                ],
                ..Default::default()
            })
            .unwrap(),
        )
    }

    /// Table with one column; returns (table, column, columns edge)
    fn table_with_column(ctx: &mut TransactionContext<'_>) -> Result<(VertexId, VertexId, EdgeInfo)> {
        let table = GraphHelper::create_vertex(ctx, "Table", &[])?;
        ctx.graph_mut().set_vertex_property(table, "__guid", json!("t1"))?;
        let column = GraphHelper::create_vertex(ctx, "Column", &[])?;
        ctx.graph_mut().set_vertex_property(column, "__guid", json!("c1"))?;

        let edge_id = GraphHelper::add_edge(ctx, table, column, "__Table.columns")?;
        ctx.graph_mut()
            .set_vertex_property(table, "Table.columns", json!([edge_id.to_string()]))?;
        GraphHelper::add_edge(ctx, column, table, "__Column.table")?;
        let edge = ctx.graph().edge(edge_id).unwrap();
        Ok((table, column, edge))
    }

    #[test]
    fn test_soft_delete_marks_and_records_referrer() {
        let graph = InMemoryGraph::new();
        let locks = LockCoordinator::new();
        let handler = GraphDeleteHandler::new(registry(), DeleteMode::Soft);

        TransactionScope::new(&graph, &locks)
            .run(RequestContext::new("tester"), |ctx| {
                let (table, column, edge) = table_with_column(ctx)?;
                handler.delete_entities(ctx, &[column])?;

                assert_eq!(GraphHelper::status(ctx, column), Status::Deleted);
                assert_eq!(GraphHelper::edge_status(ctx, edge.id), Status::Deleted);
                assert_eq!(GraphHelper::edge_id_list(ctx, table, "Table.columns"), vec![edge.id]);
                assert_eq!(ctx.deleted_entities()[0].guid, "c1");
                assert_eq!(ctx.updated_guids(), &["t1".to_string()]);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_hard_delete_of_owner_cascades() {
        let graph = InMemoryGraph::new();
        let locks = LockCoordinator::new();
        let handler = GraphDeleteHandler::new(registry(), DeleteMode::Hard);

        TransactionScope::new(&graph, &locks)
            .run(RequestContext::new("tester"), |ctx| {
                let (table, _, _) = table_with_column(ctx)?;
                handler.delete_entities(ctx, &[table])?;

                let deleted: Vec<&str> = ctx.deleted_entities().iter().map(|h| h.guid.as_str()).collect();
                assert_eq!(deleted, vec!["t1", "c1"]);
                assert!(ctx.updated_guids().is_empty());
                Ok(())
            })
            .unwrap();
        assert_eq!(graph.vertex_count(), 0);
        assert_eq!(graph.edge_count(), 0);
    }

    #[test]
    fn test_edge_reference_result_depends_on_mode_and_force() {
        for (mode, force, expected) in [
            (DeleteMode::Soft, false, false),
            (DeleteMode::Soft, true, true),
            (DeleteMode::Hard, false, true),
        ] {
            let graph = InMemoryGraph::new();
            let locks = LockCoordinator::new();
            let handler = GraphDeleteHandler::new(registry(), mode);

            TransactionScope::new(&graph, &locks)
                .run(RequestContext::new("tester"), |ctx| {
                    let (_, column, _) = table_with_column(ctx)?;
                    let back = GraphHelper::active_edge_for_label(ctx, column, "__Column.table").unwrap();
                    let gone = handler.delete_edge_reference(ctx, &back, TypeCategory::ObjectId, false, force)?;
                    assert_eq!(gone, expected);
                    Ok(())
                })
                .unwrap();
        }
    }

    #[test]
    fn test_removing_forward_reference_removes_inverse() {
        let graph = InMemoryGraph::new();
        let locks = LockCoordinator::new();
        let handler = GraphDeleteHandler::new(registry(), DeleteMode::Hard);

        TransactionScope::new(&graph, &locks)
            .run(RequestContext::new("tester"), |ctx| {
                let (table, column, _) = table_with_column(ctx)?;
                let back = GraphHelper::active_edge_for_label(ctx, column, "__Column.table").unwrap();
                handler.delete_edge_reference(ctx, &back, TypeCategory::ObjectId, false, true)?;

                assert!(GraphHelper::edge_id_list(ctx, table, "Table.columns").is_empty());
                assert!(ctx.graph().edges(table, Direction::Out, Some("__Table.columns")).is_empty());
                assert_eq!(ctx.updated_guids(), &["t1".to_string()]);
                Ok(())
            })
            .unwrap();
    }
}
