//! Property keys, encodings and edge helpers shared by the mapper, retriever
//! and delete handler. Every label the mapper writes is read back through here.

use crate::config::GraphConfig;
use crate::error::{RepositoryError, Result};
use crate::logic::transaction::TransactionContext;
use crate::model::{Guid, Status};
use crate::store::{Direction, EdgeId, EdgeInfo, VertexId};
use itertools::Itertools;
use log::{debug, info};
use serde_json::Value;
use std::collections::HashMap;

pub const TYPE_NAME_PROPERTY: &str = "__typeName";
pub const SUPER_TYPES_PROPERTY: &str = "__superTypeNames";
pub const GUID_PROPERTY: &str = "__guid";
pub const STATE_PROPERTY: &str = "__state";
pub const VERSION_PROPERTY: &str = "__version";
pub const CREATED_BY_PROPERTY: &str = "__createdBy";
pub const MODIFIED_BY_PROPERTY: &str = "__modifiedBy";
pub const TIMESTAMP_PROPERTY: &str = "__timestamp";
pub const MODIFICATION_TIMESTAMP_PROPERTY: &str = "__modificationTimestamp";
pub const TRAIT_NAMES_PROPERTY: &str = "__traitNames";
pub const CLASSIFICATION_ENTITY_GUID_PROPERTY: &str = "__classificationEntityGuid";
pub const RELATIONSHIP_GUID_PROPERTY: &str = "_r__guid";
pub const RELATIONSHIP_TYPE_PROPERTY: &str = "_r__typeName";

pub struct GraphHelper;

impl GraphHelper {
    pub fn guid(ctx: &mut TransactionContext<'_>, vertex: VertexId) -> Option<Guid> {
        if let Some(guid) = ctx.cached_guid(vertex) {
            return Some(guid.clone());
        }
        let guid = ctx
            .graph()
            .vertex_property(vertex, GUID_PROPERTY)
            .and_then(|v| v.as_str().map(str::to_string))?;
        ctx.cache_guid(vertex, guid.clone());
        Some(guid)
    }

    pub fn type_name(ctx: &TransactionContext<'_>, vertex: VertexId) -> Option<String> {
        ctx.graph()
            .vertex_property(vertex, TYPE_NAME_PROPERTY)
            .and_then(|v| v.as_str().map(str::to_string))
    }

    /// Vertices without a state property count as active
    pub fn status(ctx: &mut TransactionContext<'_>, vertex: VertexId) -> Status {
        if let Some(status) = ctx.cached_vertex_status(vertex) {
            return status;
        }
        let status = read_status(ctx.graph().vertex_property(vertex, STATE_PROPERTY));
        ctx.cache_vertex_status(vertex, status);
        status
    }

    pub fn edge_status(ctx: &mut TransactionContext<'_>, edge: EdgeId) -> Status {
        if let Some(status) = ctx.cached_edge_status(edge) {
            return status;
        }
        let status = read_status(ctx.graph().edge_property(edge, STATE_PROPERTY));
        ctx.cache_edge_status(edge, status);
        status
    }

    pub fn set_status(ctx: &mut TransactionContext<'_>, vertex: VertexId, status: Status) -> Result<()> {
        ctx.graph_mut()
            .set_vertex_property(vertex, STATE_PROPERTY, Value::from(status.as_str()))?;
        ctx.cache_vertex_status(vertex, status);
        Ok(())
    }

    pub fn set_edge_status(ctx: &mut TransactionContext<'_>, edge: EdgeId, status: Status) -> Result<()> {
        ctx.graph_mut()
            .set_edge_property(edge, STATE_PROPERTY, Value::from(status.as_str()))?;
        ctx.cache_edge_status(edge, status);
        Ok(())
    }

    pub fn long_property(ctx: &TransactionContext<'_>, vertex: VertexId, key: &str) -> Option<i64> {
        ctx.graph().vertex_property(vertex, key).and_then(|v| v.as_i64())
    }

    pub fn string_property(ctx: &TransactionContext<'_>, vertex: VertexId, key: &str) -> Option<String> {
        ctx.graph()
            .vertex_property(vertex, key)
            .and_then(|v| v.as_str().map(str::to_string))
    }

    pub fn find_vertex_by_guid(ctx: &mut TransactionContext<'_>, guid: &str) -> Option<VertexId> {
        let vertex = ctx
            .graph()
            .query_vertices(GUID_PROPERTY, &Value::from(guid))
            .into_iter()
            .next()?;
        ctx.cache_guid(vertex, guid.to_string());
        Some(vertex)
    }

    /// New vertex for an entity, struct or classification instance
    pub fn create_vertex(
        ctx: &mut TransactionContext<'_>,
        type_name: &str,
        super_types: &[String],
    ) -> Result<VertexId> {
        let now = ctx.request.request_time_millis();
        let user = ctx.request.user.clone();
        let graph = ctx.graph_mut();

        let vertex = graph.add_vertex()?;
        graph.set_vertex_property(vertex, TYPE_NAME_PROPERTY, Value::from(type_name))?;
        if !super_types.is_empty() {
            graph.set_vertex_property(vertex, SUPER_TYPES_PROPERTY, Value::from(super_types.to_vec()))?;
        }
        graph.set_vertex_property(vertex, STATE_PROPERTY, Value::from(Status::Active.as_str()))?;
        graph.set_vertex_property(vertex, VERSION_PROPERTY, Value::from(0))?;
        graph.set_vertex_property(vertex, TIMESTAMP_PROPERTY, Value::from(now))?;
        graph.set_vertex_property(vertex, MODIFICATION_TIMESTAMP_PROPERTY, Value::from(now))?;
        graph.set_vertex_property(vertex, CREATED_BY_PROPERTY, Value::from(user.clone()))?;
        graph.set_vertex_property(vertex, MODIFIED_BY_PROPERTY, Value::from(user))?;
        ctx.cache_vertex_status(vertex, Status::Active);
        Ok(vertex)
    }

    pub fn update_modification_metadata(ctx: &mut TransactionContext<'_>, vertex: VertexId) -> Result<()> {
        let now = ctx.request.request_time_millis();
        let user = ctx.request.user.clone();
        let graph = ctx.graph_mut();
        graph.set_vertex_property(vertex, MODIFICATION_TIMESTAMP_PROPERTY, Value::from(now))?;
        graph.set_vertex_property(vertex, MODIFIED_BY_PROPERTY, Value::from(user))?;
        Ok(())
    }

    pub fn update_edge_modification_metadata(ctx: &mut TransactionContext<'_>, edge: EdgeId) -> Result<()> {
        let now = ctx.request.request_time_millis();
        let user = ctx.request.user.clone();
        let graph = ctx.graph_mut();
        graph.set_edge_property(edge, MODIFICATION_TIMESTAMP_PROPERTY, Value::from(now))?;
        graph.set_edge_property(edge, MODIFIED_BY_PROPERTY, Value::from(user))?;
        Ok(())
    }

    /// Adds an active edge stamped with creation metadata
    pub fn add_edge(
        ctx: &mut TransactionContext<'_>,
        out_vertex: VertexId,
        in_vertex: VertexId,
        label: &str,
    ) -> Result<EdgeId> {
        let now = ctx.request.request_time_millis();
        let user = ctx.request.user.clone();
        let graph = ctx.graph_mut();

        let edge = graph.add_edge(out_vertex, in_vertex, label)?;
        graph.set_edge_property(edge, STATE_PROPERTY, Value::from(Status::Active.as_str()))?;
        graph.set_edge_property(edge, TIMESTAMP_PROPERTY, Value::from(now))?;
        graph.set_edge_property(edge, MODIFICATION_TIMESTAMP_PROPERTY, Value::from(now))?;
        graph.set_edge_property(edge, CREATED_BY_PROPERTY, Value::from(user.clone()))?;
        graph.set_edge_property(edge, MODIFIED_BY_PROPERTY, Value::from(user))?;
        ctx.cache_edge_status(edge, Status::Active);
        debug!("added edge {} {} -> {}", label, out_vertex, in_vertex);
        Ok(edge)
    }

    /// Returns the active `label` edge from `out_vertex` to `in_vertex`, creating
    /// it if needed. Creation failures are retried `edge_retries` times.
    pub fn get_or_create_edge(
        ctx: &mut TransactionContext<'_>,
        config: &GraphConfig,
        out_vertex: VertexId,
        in_vertex: VertexId,
        label: &str,
    ) -> Result<EdgeId> {
        let attempts = config.edge_retries.max(1);
        retry_with_sleep(attempts, config.retry_sleep(), |_| {
            let existing = ctx
                .graph()
                .edges(in_vertex, Direction::In, Some(label))
                .into_iter()
                .filter(|e| e.out_vertex == out_vertex)
                .map(|e| e.id)
                .collect::<Vec<_>>();
            for edge in existing {
                if Self::edge_status(ctx, edge) == Status::Active {
                    return Ok(edge);
                }
            }
            Self::add_edge(ctx, out_vertex, in_vertex, label)
        })
        .map_err(|e| {
            RepositoryError::Internal(format!(
                "could not create edge {} from {} to {}: {}",
                label, out_vertex, in_vertex, e
            ))
        })
    }

    /// The active `label` edge leaving `vertex`; otherwise the most recently
    /// modified deleted one
    pub fn edge_for_label(ctx: &mut TransactionContext<'_>, vertex: VertexId, label: &str) -> Option<EdgeInfo> {
        let edges = ctx.graph().edges(vertex, Direction::Out, Some(label));
        let mut latest_deleted: Option<(i64, EdgeInfo)> = None;

        for edge in edges {
            match Self::edge_status(ctx, edge.id) {
                Status::Active => return Some(edge),
                Status::Deleted => {
                    let modified = ctx
                        .graph()
                        .edge_property(edge.id, MODIFICATION_TIMESTAMP_PROPERTY)
                        .and_then(|v| v.as_i64())
                        .unwrap_or(0);
                    if latest_deleted.as_ref().map_or(true, |(ts, _)| modified >= *ts) {
                        latest_deleted = Some((modified, edge));
                    }
                }
            }
        }

        latest_deleted.map(|(_, edge)| edge)
    }

    pub fn active_edge_for_label(ctx: &mut TransactionContext<'_>, vertex: VertexId, label: &str) -> Option<EdgeInfo> {
        Self::edge_for_label(ctx, vertex, label).filter(|e| Self::edge_status(ctx, e.id) == Status::Active)
    }

    pub fn trait_names(ctx: &TransactionContext<'_>, vertex: VertexId) -> Vec<String> {
        string_list(ctx.graph().vertex_property(vertex, TRAIT_NAMES_PROPERTY))
    }

    pub fn set_trait_names(ctx: &mut TransactionContext<'_>, vertex: VertexId, names: &[String]) -> Result<()> {
        if names.is_empty() {
            ctx.graph_mut().remove_vertex_property(vertex, TRAIT_NAMES_PROPERTY)
        } else {
            ctx.graph_mut()
                .set_vertex_property(vertex, TRAIT_NAMES_PROPERTY, Value::from(names.to_vec()))
        }
    }

    pub fn super_type_names(ctx: &TransactionContext<'_>, vertex: VertexId) -> Vec<String> {
        string_list(ctx.graph().vertex_property(vertex, SUPER_TYPES_PROPERTY))
    }

    /// Label of the edge attaching a classification vertex to an entity of `entity_type`
    pub fn classification_edge_label(entity_type: &str, classification_name: &str) -> String {
        format!("{}.{}", entity_type, classification_name)
    }

    /// Active classification edge for `classification_name` on the entity vertex
    pub fn classification_edge(
        ctx: &mut TransactionContext<'_>,
        entity_vertex: VertexId,
        classification_name: &str,
    ) -> Option<EdgeInfo> {
        let entity_type = Self::type_name(ctx, entity_vertex)?;
        let label = Self::classification_edge_label(&entity_type, classification_name);
        Self::active_edge_for_label(ctx, entity_vertex, &label)
    }

    /// Every classification edge leaving the entity vertex, deleted ones included
    pub fn classification_edges(ctx: &TransactionContext<'_>, entity_vertex: VertexId) -> Vec<EdgeInfo> {
        let Some(entity_type) = Self::type_name(ctx, entity_vertex) else {
            return Vec::new();
        };
        let prefix = format!("{}.", entity_type);
        ctx.graph()
            .edges(entity_vertex, Direction::Out, None)
            .into_iter()
            .filter(|e| e.label.starts_with(&prefix))
            .collect()
    }

    pub fn edge_id_list(ctx: &TransactionContext<'_>, vertex: VertexId, key: &str) -> Vec<EdgeId> {
        string_list(ctx.graph().vertex_property(vertex, key))
            .iter()
            .filter_map(|s| EdgeId::parse(s))
            .collect()
    }

    pub fn set_list_property(ctx: &mut TransactionContext<'_>, vertex: VertexId, key: &str, values: Vec<Value>) -> Result<()> {
        if values.is_empty() {
            ctx.graph_mut().remove_vertex_property(vertex, key)
        } else {
            ctx.graph_mut().set_vertex_property(vertex, key, Value::Array(values))
        }
    }

    pub fn map_key_property(base_property: &str, key: &str) -> String {
        format!("{}.{}", base_property, key)
    }

    pub fn map_keys(ctx: &TransactionContext<'_>, vertex: VertexId, base_property: &str) -> Vec<String> {
        string_list(ctx.graph().vertex_property(vertex, base_property))
    }

    pub fn encode_soft_reference(type_name: &str, guid: &str) -> String {
        format!("{}:{}", type_name, guid)
    }

    pub fn decode_soft_reference(value: &str) -> Option<(String, Guid)> {
        let (type_name, guid) = value.split_once(':')?;
        if type_name.is_empty() || guid.is_empty() {
            return None;
        }
        Some((type_name.to_string(), guid.to_string()))
    }

    /// Readable identification of a vertex for log and error messages
    pub fn vertex_details(ctx: &mut TransactionContext<'_>, vertex: VertexId) -> String {
        let type_name = Self::type_name(ctx, vertex).unwrap_or_default();
        let guid = Self::guid(ctx, vertex).unwrap_or_default();
        let status = Self::status(ctx, vertex);
        format!("{}[type={}, guid={}, state={}]", vertex, type_name, guid, status)
    }

    pub fn unique_attribute_values(values: &HashMap<String, Value>) -> String {
        format!("{{{}}}", values.iter().map(|(k, v)| format!("{}={}", k, v)).sorted().join(", "))
    }
}

fn read_status(value: Option<Value>) -> Status {
    value
        .as_ref()
        .and_then(|v| v.as_str())
        .and_then(Status::parse)
        .unwrap_or(Status::Active)
}

fn string_list(value: Option<Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        Some(Value::String(s)) => vec![s],
        _ => Vec::new(),
    }
}

/// Runs `op` up to `attempts` times, sleeping between failed attempts.
/// The error of the final attempt is returned.
pub fn retry_with_sleep<T>(
    attempts: u32,
    sleep: std::time::Duration,
    mut op: impl FnMut(u32) -> Result<T>,
) -> Result<T> {
    let mut attempt = 1;
    loop {
        match op(attempt) {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= attempts => return Err(e),
            Err(e) => {
                info!("attempt {} of {} failed: {}; retrying in {:?}", attempt, attempts, e, sleep);
                std::thread::sleep(sleep);
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::locks::LockCoordinator;
    use crate::logic::transaction::{RequestContext, TransactionScope};
    use crate::store::InMemoryGraph;
    use std::time::Duration;

    fn fast_retries(retries: u32) -> GraphConfig {
        GraphConfig {
            edge_retries: retries,
            retry_sleep_ms: 1,
        }
    }

    #[test]
    fn test_retry_with_sleep_stops_after_bound() {
        let mut calls = 0;
        let result: Result<()> = retry_with_sleep(3, Duration::from_millis(1), |_| {
            calls += 1;
            Err(RepositoryError::Transient("busy".into()))
        });
        assert!(result.is_err());
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_get_or_create_edge_retries_transient_failures() {
        let graph = InMemoryGraph::new();
        let locks = LockCoordinator::new();
        let scope = TransactionScope::new(&graph, &locks);

        scope
            .run(RequestContext::new("tester"), |ctx| {
                let a = GraphHelper::create_vertex(ctx, "Table", &[])?;
                let b = GraphHelper::create_vertex(ctx, "Column", &[])?;

                graph.fail_next_edge_writes(2);
                let edge = GraphHelper::get_or_create_edge(ctx, &fast_retries(3), a, b, "__Table.columns")?;
                let again = GraphHelper::get_or_create_edge(ctx, &fast_retries(3), a, b, "__Table.columns")?;
                assert_eq!(edge, again);

                graph.fail_next_edge_writes(3);
                let err = GraphHelper::get_or_create_edge(ctx, &fast_retries(3), b, a, "__Column.table")
                    .unwrap_err();
                assert!(matches!(err, RepositoryError::Internal(_)));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_edge_for_label_prefers_active_then_latest_deleted() {
        let graph = InMemoryGraph::new();
        let locks = LockCoordinator::new();
        let scope = TransactionScope::new(&graph, &locks);

        scope
            .run(RequestContext::new("tester"), |ctx| {
                let a = GraphHelper::create_vertex(ctx, "Table", &[])?;
                let b = GraphHelper::create_vertex(ctx, "SerDe", &[])?;
                let c = GraphHelper::create_vertex(ctx, "SerDe", &[])?;

                let old = GraphHelper::add_edge(ctx, a, b, "__Table.serde")?;
                GraphHelper::set_edge_status(ctx, old, Status::Deleted)?;
                ctx.graph_mut()
                    .set_edge_property(old, MODIFICATION_TIMESTAMP_PROPERTY, Value::from(10))?;
                let newer = GraphHelper::add_edge(ctx, a, c, "__Table.serde")?;
                GraphHelper::set_edge_status(ctx, newer, Status::Deleted)?;
                ctx.graph_mut()
                    .set_edge_property(newer, MODIFICATION_TIMESTAMP_PROPERTY, Value::from(20))?;

                assert_eq!(GraphHelper::edge_for_label(ctx, a, "__Table.serde").map(|e| e.id), Some(newer));
                assert!(GraphHelper::active_edge_for_label(ctx, a, "__Table.serde").is_none());

                let active = GraphHelper::add_edge(ctx, a, b, "__Table.serde")?;
                assert_eq!(GraphHelper::edge_for_label(ctx, a, "__Table.serde").map(|e| e.id), Some(active));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_soft_reference_encoding() {
        let encoded = GraphHelper::encode_soft_reference("Db", "g-1");
        assert_eq!(encoded, "Db:g-1");
        assert_eq!(
            GraphHelper::decode_soft_reference(&encoded),
            Some(("Db".to_string(), "g-1".to_string()))
        );
        assert_eq!(GraphHelper::decode_soft_reference("no-separator"), None);
    }
}
