use crate::error::{RepositoryError, Result};
use crate::store::traits::{Direction, EdgeId, EdgeInfo, Graph, GraphTransaction, VertexId};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

#[derive(Debug, Clone, Default)]
struct VertexData {
    properties: HashMap<String, Value>,
    out_edges: BTreeSet<EdgeId>,
    in_edges: BTreeSet<EdgeId>,
}

#[derive(Debug, Clone)]
struct EdgeData {
    label: String,
    out_vertex: VertexId,
    in_vertex: VertexId,
    properties: HashMap<String, Value>,
}

#[derive(Debug, Default)]
struct GraphState {
    next_id: u64,
    vertices: BTreeMap<VertexId, VertexData>,
    edges: BTreeMap<EdgeId, EdgeData>,
}

impl GraphState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn insert_edge(&mut self, id: EdgeId, data: EdgeData) -> Result<()> {
        let out_vertex = data.out_vertex;
        let in_vertex = data.in_vertex;
        if !self.vertices.contains_key(&out_vertex) || !self.vertices.contains_key(&in_vertex) {
            return Err(RepositoryError::Internal(format!(
                "cannot add edge {} between {} and {}: vertex missing",
                data.label, out_vertex, in_vertex
            )));
        }
        if let Some(v) = self.vertices.get_mut(&out_vertex) {
            v.out_edges.insert(id);
        }
        if let Some(v) = self.vertices.get_mut(&in_vertex) {
            v.in_edges.insert(id);
        }
        self.edges.insert(id, data);
        Ok(())
    }

    fn take_edge(&mut self, id: EdgeId) -> Option<EdgeData> {
        let data = self.edges.remove(&id)?;
        if let Some(v) = self.vertices.get_mut(&data.out_vertex) {
            v.out_edges.remove(&id);
        }
        if let Some(v) = self.vertices.get_mut(&data.in_vertex) {
            v.in_edges.remove(&id);
        }
        Some(data)
    }
}

/// Inverse of one write, replayed on rollback
#[derive(Debug)]
enum UndoOp {
    RemoveVertex(VertexId),
    RestoreVertex(VertexId, HashMap<String, Value>),
    RestoreVertexProperty(VertexId, String, Option<Value>),
    RemoveEdge(EdgeId),
    RestoreEdge(EdgeId, EdgeData),
    RestoreEdgeProperty(EdgeId, String, Option<Value>),
}

/// Thread-safe in-memory property graph.
///
/// Writes are applied immediately and logged; `rollback` replays the log backwards.
/// Isolation between concurrent transactions comes from the entity locks held by callers.
#[derive(Debug, Default)]
pub struct InMemoryGraph {
    state: RwLock<GraphState>,
    max_string_length: Option<usize>,
    failing_edge_writes: AtomicU32,
    commits: AtomicU64,
    rollbacks: AtomicU64,
}

impl InMemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject string property values longer than `max` with a transient error,
    /// like stores that cap the length of indexed keys
    pub fn with_max_string_length(mut self, max: usize) -> Self {
        self.max_string_length = Some(max);
        self
    }

    /// Make the next `count` edge creations fail with a transient error
    pub fn fail_next_edge_writes(&self, count: u32) {
        self.failing_edge_writes.store(count, Ordering::SeqCst);
    }

    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn rollback_count(&self) -> u64 {
        self.rollbacks.load(Ordering::SeqCst)
    }

    pub fn vertex_count(&self) -> usize {
        self.state.read().vertices.len()
    }

    pub fn edge_count(&self) -> usize {
        self.state.read().edges.len()
    }

    fn check_value(&self, key: &str, value: &Value) -> Result<()> {
        if let (Some(max), Value::String(s)) = (self.max_string_length, value) {
            if s.len() > max {
                return Err(RepositoryError::Transient(format!(
                    "value of property {} is {} bytes, store limit is {}",
                    key,
                    s.len(),
                    max
                )));
            }
        }
        Ok(())
    }
}

impl Graph for InMemoryGraph {
    fn begin(&self) -> Box<dyn GraphTransaction + '_> {
        Box::new(InMemoryTransaction {
            graph: self,
            undo: Vec::new(),
            finished: false,
        })
    }
}

pub struct InMemoryTransaction<'g> {
    graph: &'g InMemoryGraph,
    undo: Vec<UndoOp>,
    finished: bool,
}

fn property_matches(property: &Value, value: &Value) -> bool {
    match property {
        Value::Array(items) if !value.is_array() => items.contains(value),
        _ => property == value,
    }
}

impl InMemoryTransaction<'_> {
    fn replay_undo(&mut self) {
        let mut state = self.graph.state.write();
        while let Some(op) = self.undo.pop() {
            match op {
                UndoOp::RemoveVertex(id) => {
                    state.vertices.remove(&id);
                }
                UndoOp::RestoreVertex(id, properties) => {
                    state.vertices.insert(
                        id,
                        VertexData {
                            properties,
                            ..Default::default()
                        },
                    );
                }
                UndoOp::RestoreVertexProperty(id, key, previous) => {
                    if let Some(vertex) = state.vertices.get_mut(&id) {
                        match previous {
                            Some(value) => vertex.properties.insert(key, value),
                            None => vertex.properties.remove(&key),
                        };
                    }
                }
                UndoOp::RemoveEdge(id) => {
                    state.take_edge(id);
                }
                UndoOp::RestoreEdge(id, data) => {
                    if let Err(e) = state.insert_edge(id, data) {
                        log::error!("rollback could not restore edge {}: {}", id, e);
                    }
                }
                UndoOp::RestoreEdgeProperty(id, key, previous) => {
                    if let Some(edge) = state.edges.get_mut(&id) {
                        match previous {
                            Some(value) => edge.properties.insert(key, value),
                            None => edge.properties.remove(&key),
                        };
                    }
                }
            }
        }
    }
}

impl GraphTransaction for InMemoryTransaction<'_> {
    fn add_vertex(&mut self) -> Result<VertexId> {
        let mut state = self.graph.state.write();
        let id = VertexId(state.next_id());
        state.vertices.insert(id, VertexData::default());
        self.undo.push(UndoOp::RemoveVertex(id));
        Ok(id)
    }

    fn remove_vertex(&mut self, vertex: VertexId) -> Result<()> {
        let mut state = self.graph.state.write();
        let incident: Vec<EdgeId> = match state.vertices.get(&vertex) {
            Some(v) => v.out_edges.iter().chain(v.in_edges.iter()).copied().collect(),
            None => return Ok(()),
        };
        for edge in incident {
            if let Some(data) = state.take_edge(edge) {
                self.undo.push(UndoOp::RestoreEdge(edge, data));
            }
        }
        if let Some(data) = state.vertices.remove(&vertex) {
            self.undo.push(UndoOp::RestoreVertex(vertex, data.properties));
        }
        Ok(())
    }

    fn vertex_exists(&self, vertex: VertexId) -> bool {
        self.graph.state.read().vertices.contains_key(&vertex)
    }

    fn vertex_property(&self, vertex: VertexId, key: &str) -> Option<Value> {
        self.graph
            .state
            .read()
            .vertices
            .get(&vertex)
            .and_then(|v| v.properties.get(key).cloned())
    }

    fn set_vertex_property(&mut self, vertex: VertexId, key: &str, value: Value) -> Result<()> {
        self.graph.check_value(key, &value)?;
        let mut state = self.graph.state.write();
        let data = state
            .vertices
            .get_mut(&vertex)
            .ok_or_else(|| RepositoryError::Internal(format!("vertex {} does not exist", vertex)))?;
        let previous = data.properties.insert(key.to_string(), value);
        self.undo
            .push(UndoOp::RestoreVertexProperty(vertex, key.to_string(), previous));
        Ok(())
    }

    fn remove_vertex_property(&mut self, vertex: VertexId, key: &str) -> Result<()> {
        let mut state = self.graph.state.write();
        if let Some(data) = state.vertices.get_mut(&vertex) {
            if let Some(previous) = data.properties.remove(key) {
                self.undo
                    .push(UndoOp::RestoreVertexProperty(vertex, key.to_string(), Some(previous)));
            }
        }
        Ok(())
    }

    fn vertex_property_keys(&self, vertex: VertexId) -> Vec<String> {
        self.graph
            .state
            .read()
            .vertices
            .get(&vertex)
            .map(|v| v.properties.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn add_edge(&mut self, out_vertex: VertexId, in_vertex: VertexId, label: &str) -> Result<EdgeId> {
        let pending = self.graph.failing_edge_writes.load(Ordering::SeqCst);
        if pending > 0 {
            self.graph
                .failing_edge_writes
                .store(pending - 1, Ordering::SeqCst);
            return Err(RepositoryError::Transient(format!(
                "edge {} from {} to {} rejected",
                label, out_vertex, in_vertex
            )));
        }

        let mut state = self.graph.state.write();
        let id = EdgeId(state.next_id());
        state.insert_edge(
            id,
            EdgeData {
                label: label.to_string(),
                out_vertex,
                in_vertex,
                properties: HashMap::new(),
            },
        )?;
        self.undo.push(UndoOp::RemoveEdge(id));
        Ok(id)
    }

    fn remove_edge(&mut self, edge: EdgeId) -> Result<()> {
        let mut state = self.graph.state.write();
        if let Some(data) = state.take_edge(edge) {
            self.undo.push(UndoOp::RestoreEdge(edge, data));
        }
        Ok(())
    }

    fn edge(&self, edge: EdgeId) -> Option<EdgeInfo> {
        self.graph.state.read().edges.get(&edge).map(|e| EdgeInfo {
            id: edge,
            label: e.label.clone(),
            out_vertex: e.out_vertex,
            in_vertex: e.in_vertex,
        })
    }

    fn edge_property(&self, edge: EdgeId, key: &str) -> Option<Value> {
        self.graph
            .state
            .read()
            .edges
            .get(&edge)
            .and_then(|e| e.properties.get(key).cloned())
    }

    fn set_edge_property(&mut self, edge: EdgeId, key: &str, value: Value) -> Result<()> {
        self.graph.check_value(key, &value)?;
        let mut state = self.graph.state.write();
        let data = state
            .edges
            .get_mut(&edge)
            .ok_or_else(|| RepositoryError::Internal(format!("edge {} does not exist", edge)))?;
        let previous = data.properties.insert(key.to_string(), value);
        self.undo
            .push(UndoOp::RestoreEdgeProperty(edge, key.to_string(), previous));
        Ok(())
    }

    fn edges(&self, vertex: VertexId, direction: Direction, label: Option<&str>) -> Vec<EdgeInfo> {
        let state = self.graph.state.read();
        let Some(data) = state.vertices.get(&vertex) else {
            return Vec::new();
        };
        let ids: BTreeSet<EdgeId> = match direction {
            Direction::Out => data.out_edges.clone(),
            Direction::In => data.in_edges.clone(),
            Direction::Both => data.out_edges.union(&data.in_edges).copied().collect(),
        };
        ids.into_iter()
            .filter_map(|id| {
                let e = state.edges.get(&id)?;
                if label.map_or(true, |l| l == e.label) {
                    Some(EdgeInfo {
                        id,
                        label: e.label.clone(),
                        out_vertex: e.out_vertex,
                        in_vertex: e.in_vertex,
                    })
                } else {
                    None
                }
            })
            .collect()
    }

    fn query_vertices(&self, key: &str, value: &Value) -> Vec<VertexId> {
        self.graph
            .state
            .read()
            .vertices
            .iter()
            .filter(|(_, v)| v.properties.get(key).map_or(false, |p| property_matches(p, value)))
            .map(|(id, _)| *id)
            .collect()
    }

    fn query_vertices_in(&self, key: &str, values: &[Value]) -> Vec<VertexId> {
        self.graph
            .state
            .read()
            .vertices
            .iter()
            .filter(|(_, v)| {
                v.properties
                    .get(key)
                    .map_or(false, |p| values.iter().any(|value| property_matches(p, value)))
            })
            .map(|(id, _)| *id)
            .collect()
    }

    fn query_edges(&self, key: &str, value: &Value) -> Vec<EdgeId> {
        self.graph
            .state
            .read()
            .edges
            .iter()
            .filter(|(_, e)| e.properties.get(key).map_or(false, |p| property_matches(p, value)))
            .map(|(id, _)| *id)
            .collect()
    }

    fn commit(&mut self) -> Result<()> {
        self.undo.clear();
        self.finished = true;
        self.graph.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.replay_undo();
        self.finished = true;
        self.graph.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for InMemoryTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished && !self.undo.is_empty() {
            log::warn!("transaction dropped without commit; rolling back {} writes", self.undo.len());
            self.replay_undo();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rollback_restores_previous_state() {
        let graph = InMemoryGraph::new();
        let (a, b) = {
            let mut tx = graph.begin();
            let a = tx.add_vertex().unwrap();
            let b = tx.add_vertex().unwrap();
            tx.set_vertex_property(a, "name", json!("a")).unwrap();
            tx.commit().unwrap();
            (a, b)
        };

        let mut tx = graph.begin();
        tx.set_vertex_property(a, "name", json!("changed")).unwrap();
        let e = tx.add_edge(a, b, "ref").unwrap();
        tx.set_edge_property(e, "state", json!("ACTIVE")).unwrap();
        tx.remove_vertex(b).unwrap();
        tx.rollback().unwrap();

        let tx = graph.begin();
        assert_eq!(tx.vertex_property(a, "name"), Some(json!("a")));
        assert!(tx.vertex_exists(b));
        assert!(tx.edges(a, Direction::Out, None).is_empty());
        assert_eq!(graph.rollback_count(), 1);
    }

    #[test]
    fn test_remove_vertex_restores_incident_edges_on_rollback() {
        let graph = InMemoryGraph::new();
        let mut tx = graph.begin();
        let a = tx.add_vertex().unwrap();
        let b = tx.add_vertex().unwrap();
        let e = tx.add_edge(a, b, "ref").unwrap();
        tx.commit().unwrap();

        let mut tx = graph.begin();
        tx.remove_vertex(b).unwrap();
        assert!(tx.edge(e).is_none());
        tx.rollback().unwrap();

        let tx = graph.begin();
        assert_eq!(tx.edges(a, Direction::Out, Some("ref"))[0].in_vertex, b);
        assert_eq!(tx.edges(b, Direction::In, None).len(), 1);
    }

    #[test]
    fn test_query_matches_list_membership() {
        let graph = InMemoryGraph::new();
        let mut tx = graph.begin();
        let a = tx.add_vertex().unwrap();
        tx.set_vertex_property(a, "traits", json!(["PII", "Sensitive"])).unwrap();
        tx.commit().unwrap();

        let tx = graph.begin();
        assert_eq!(tx.query_vertices("traits", &json!("PII")), vec![a]);
        assert_eq!(tx.query_vertices_in("traits", &[json!("X"), json!("Sensitive")]), vec![a]);
        assert!(tx.query_vertices("traits", &json!("Other")).is_empty());
    }

    #[test]
    fn test_injected_edge_failures_are_transient() {
        let graph = InMemoryGraph::new();
        let mut tx = graph.begin();
        let a = tx.add_vertex().unwrap();
        graph.fail_next_edge_writes(1);
        let err = tx.add_edge(a, a, "self").unwrap_err();
        assert!(matches!(err, RepositoryError::Transient(_)));
        assert!(tx.add_edge(a, a, "self").is_ok());
    }

    #[test]
    fn test_string_length_limit() {
        let graph = InMemoryGraph::new().with_max_string_length(4);
        let mut tx = graph.begin();
        let a = tx.add_vertex().unwrap();
        assert!(tx.set_vertex_property(a, "k", json!("abcd")).is_ok());
        assert!(tx.set_vertex_property(a, "k", json!("abcde")).is_err());
    }
}
