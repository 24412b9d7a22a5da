use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{LibError, Result};
use crate::graph::{EdgeReference, GraphPort};
use crate::models::{normalize_id, RelationDirection, VertexRecord};
use crate::traversal::{AuthTraversalOutcome, TraversalSpec};

#[derive(Debug, Clone, PartialEq, Eq)]
struct EdgeRecord {
    out_id: String,
    relation: String,
    in_id: String,
    is_auth_check: bool,
}

#[derive(Default)]
struct GraphState {
    vertices: BTreeMap<String, VertexRecord>,
    edges: Vec<EdgeRecord>,
}

/// In-memory graph backend. Reference implementation of the traversal
/// contract and the crate's test fixture. The lock guard scopes each call;
/// it is released on every exit path.
#[derive(Default, Clone)]
pub struct MemoryGraph {
    state: Arc<RwLock<GraphState>>,
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn vertex_count(&self) -> usize {
        self.state.read().await.vertices.len()
    }

    pub async fn edge_count(&self) -> usize {
        self.state.read().await.edges.len()
    }
}

fn resolve_endpoints<'a>(
    from: &'a str,
    direction: RelationDirection,
    to: &'a str,
) -> (&'a str, &'a str) {
    match direction {
        RelationDirection::Out => (from, to),
        RelationDirection::In => (to, from),
    }
}

#[async_trait]
impl GraphPort for MemoryGraph {
    async fn get_vertices(&self, ids: &[String]) -> Result<Vec<VertexRecord>> {
        let state = self.state.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| state.vertices.get(&normalize_id(id)).cloned())
            .collect())
    }

    async fn add_vertex(&self, mut vertex: VertexRecord) -> Result<()> {
        vertex.id = normalize_id(&vertex.id);
        let mut state = self.state.write().await;
        state.vertices.insert(vertex.id.clone(), vertex);
        Ok(())
    }

    async fn remove_vertex(&self, id: &str) -> Result<()> {
        let id = normalize_id(id);
        let mut state = self.state.write().await;
        state.vertices.remove(&id);
        state
            .edges
            .retain(|edge| edge.out_id != id && edge.in_id != id);
        Ok(())
    }

    async fn add_edge(
        &self,
        from: &str,
        relation: &str,
        direction: RelationDirection,
        to: &str,
        is_auth_check: bool,
    ) -> Result<()> {
        let (out_id, in_id) = resolve_endpoints(from, direction, to);
        let record = EdgeRecord {
            out_id: normalize_id(out_id),
            relation: normalize_id(relation),
            in_id: normalize_id(in_id),
            is_auth_check,
        };
        let mut state = self.state.write().await;
        if !state.vertices.contains_key(&record.out_id)
            || !state.vertices.contains_key(&record.in_id)
        {
            return Err(LibError::graph(
                "Edge endpoint does not exist",
                anyhow!("edge {} -[{}]-> {} has a missing endpoint", record.out_id, record.relation, record.in_id),
            ));
        }
        if !state.edges.contains(&record) {
            state.edges.push(record);
        }
        Ok(())
    }

    async fn remove_edge(
        &self,
        from: &str,
        relation: &str,
        direction: RelationDirection,
        to: &str,
    ) -> Result<()> {
        let (out_id, in_id) = resolve_endpoints(from, direction, to);
        let (out_id, in_id) = (normalize_id(out_id), normalize_id(in_id));
        let relation = normalize_id(relation);
        let mut state = self.state.write().await;
        state.edges.retain(|edge| {
            !(edge.out_id == out_id && edge.in_id == in_id && edge.relation == relation)
        });
        Ok(())
    }

    async fn edge_exists(
        &self,
        from: &str,
        relation: &str,
        direction: RelationDirection,
        to: &str,
    ) -> Result<bool> {
        let (out_id, in_id) = resolve_endpoints(from, direction, to);
        let (out_id, in_id) = (normalize_id(out_id), normalize_id(in_id));
        let relation = normalize_id(relation);
        let state = self.state.read().await;
        Ok(state.edges.iter().any(|edge| {
            edge.out_id == out_id && edge.in_id == in_id && edge.relation == relation
        }))
    }

    async fn get_edges(&self, id: &str) -> Result<Vec<EdgeReference>> {
        let id = normalize_id(id);
        let state = self.state.read().await;
        let mut references = Vec::new();
        for edge in &state.edges {
            if edge.out_id == id {
                references.push(EdgeReference {
                    relation: edge.relation.clone(),
                    direction: RelationDirection::Out,
                    other_id: edge.in_id.clone(),
                    is_auth_check: edge.is_auth_check,
                });
            } else if edge.in_id == id {
                references.push(EdgeReference {
                    relation: edge.relation.clone(),
                    direction: RelationDirection::In,
                    other_id: edge.out_id.clone(),
                    is_auth_check: edge.is_auth_check,
                });
            }
        }
        Ok(references)
    }

    async fn run_authorization_traversal(
        &self,
        spec: &TraversalSpec,
    ) -> Result<AuthTraversalOutcome> {
        let state = self.state.read().await;

        // Adjacency over auth-checked edges only.
        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
        for edge in state.edges.iter().filter(|e| e.is_auth_check) {
            adjacency
                .entry(edge.out_id.as_str())
                .or_default()
                .push(edge.in_id.as_str());
        }

        let mut outcome = AuthTraversalOutcome::default();
        for start in spec.start_ids() {
            if !state.vertices.contains_key(start) {
                continue;
            }
            outcome.record_exists(start);

            // Simple-path walk: a visited set per start vertex means no vertex
            // is entered twice, so cycles terminate without authorizing.
            let mut visited: HashSet<&str> = HashSet::new();
            visited.insert(start.as_str());
            let mut frontier: VecDeque<(&str, usize)> = VecDeque::new();
            frontier.push_back((start.as_str(), 0));

            while let Some((vertex, depth)) = frontier.pop_front() {
                if spec.is_claimed(vertex) {
                    outcome.record_authorized_path(start, vertex);
                    // Branch is bounded by arrival at a claimed path.
                    continue;
                }
                if depth >= spec.max_depth() {
                    continue;
                }
                if let Some(next) = adjacency.get(vertex) {
                    for candidate in next {
                        if visited.insert(*candidate) {
                            frontier.push_back((*candidate, depth + 1));
                        }
                    }
                }
            }
        }

        Ok(outcome)
    }
}
