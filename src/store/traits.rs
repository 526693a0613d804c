use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VertexId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EdgeId(pub u64);

impl fmt::Display for VertexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl EdgeId {
    /// Inverse of `to_string`; edge ids are stored in list properties as strings
    pub fn parse(value: &str) -> Option<Self> {
        value.parse().ok().map(EdgeId)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Out,
    In,
    Both,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeInfo {
    pub id: EdgeId,
    pub label: String,
    pub out_vertex: VertexId,
    pub in_vertex: VertexId,
}

impl EdgeInfo {
    /// The end of this edge that is not `vertex`
    pub fn other_end(&self, vertex: VertexId) -> VertexId {
        if self.out_vertex == vertex {
            self.in_vertex
        } else {
            self.out_vertex
        }
    }
}

/// A property graph store
pub trait Graph: Send + Sync {
    /// Start a unit of work against the graph
    fn begin(&self) -> Box<dyn GraphTransaction + '_>;
}

/// Vertex/edge CRUD inside one unit of work
pub trait GraphTransaction {
    fn add_vertex(&mut self) -> Result<VertexId>;
    /// Also removes every edge incident to the vertex
    fn remove_vertex(&mut self, vertex: VertexId) -> Result<()>;
    fn vertex_exists(&self, vertex: VertexId) -> bool;

    fn vertex_property(&self, vertex: VertexId, key: &str) -> Option<Value>;
    fn set_vertex_property(&mut self, vertex: VertexId, key: &str, value: Value) -> Result<()>;
    fn remove_vertex_property(&mut self, vertex: VertexId, key: &str) -> Result<()>;
    fn vertex_property_keys(&self, vertex: VertexId) -> Vec<String>;

    fn add_edge(&mut self, out_vertex: VertexId, in_vertex: VertexId, label: &str) -> Result<EdgeId>;
    fn remove_edge(&mut self, edge: EdgeId) -> Result<()>;
    fn edge(&self, edge: EdgeId) -> Option<EdgeInfo>;

    fn edge_property(&self, edge: EdgeId, key: &str) -> Option<Value>;
    fn set_edge_property(&mut self, edge: EdgeId, key: &str, value: Value) -> Result<()>;

    /// Edges incident to `vertex`, optionally restricted to one label, in creation order
    fn edges(&self, vertex: VertexId, direction: Direction, label: Option<&str>) -> Vec<EdgeInfo>;

    /// Vertices whose property equals `value`; list-valued properties match on membership
    fn query_vertices(&self, key: &str, value: &Value) -> Vec<VertexId>;
    /// Vertices whose property equals any of `values`
    fn query_vertices_in(&self, key: &str, values: &[Value]) -> Vec<VertexId>;
    fn query_edges(&self, key: &str, value: &Value) -> Vec<EdgeId>;

    fn commit(&mut self) -> Result<()>;
    fn rollback(&mut self) -> Result<()>;
}
