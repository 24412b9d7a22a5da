use async_trait::async_trait;

use crate::error::Result;
use crate::models::{RelationDirection, RelationMap, RelationTarget, VertexRecord};
use crate::traversal::{AuthTraversalOutcome, TraversalSpec};

/// One edge as seen from a given vertex.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeReference {
    pub relation: String,
    pub direction: RelationDirection,
    pub other_id: String,
    pub is_auth_check: bool,
}

/// Boundary to the property-graph engine. Implementations own connection
/// acquisition and must release it on every exit path; callers treat each
/// method as one atomic round trip.
#[async_trait]
pub trait GraphPort: Send + Sync {
    async fn get_vertices(&self, ids: &[String]) -> Result<Vec<VertexRecord>>;

    async fn add_vertex(&self, vertex: VertexRecord) -> Result<()>;

    async fn remove_vertex(&self, id: &str) -> Result<()>;

    /// Writes one edge. `direction` is from the perspective of `from`: `out`
    /// persists `from -> to`, `in` persists `to -> from`. The `is_auth_check`
    /// flag is fixed at write time from the schema and never recomputed.
    async fn add_edge(
        &self,
        from: &str,
        relation: &str,
        direction: RelationDirection,
        to: &str,
        is_auth_check: bool,
    ) -> Result<()>;

    async fn remove_edge(
        &self,
        from: &str,
        relation: &str,
        direction: RelationDirection,
        to: &str,
    ) -> Result<()>;

    async fn edge_exists(
        &self,
        from: &str,
        relation: &str,
        direction: RelationDirection,
        to: &str,
    ) -> Result<bool>;

    /// Single combined existence + authorized-path traversal. Kept atomic so
    /// the existence check and the path walk cannot race a concurrent
    /// mutation between round trips.
    async fn run_authorization_traversal(
        &self,
        spec: &TraversalSpec,
    ) -> Result<AuthTraversalOutcome>;

    /// Edges incident to `id`, reported from its perspective.
    async fn get_edges(&self, id: &str) -> Result<Vec<EdgeReference>>;

    async fn get_vertex(&self, id: &str) -> Result<Option<VertexRecord>> {
        let ids = vec![id.to_string()];
        Ok(self.get_vertices(&ids).await?.into_iter().next())
    }
}

/// Writes every edge in a relation map, preserving the `is_auth_check` flag
/// fixed by the marking pass.
pub async fn persist_relation_edges(
    graph: &dyn GraphPort,
    id: &str,
    relations: &RelationMap,
) -> Result<()> {
    for (direction, name, targets) in relations.iter() {
        for target in targets {
            graph
                .add_edge(id, name, direction, &target.id, target.is_auth_check)
                .await?;
        }
    }
    Ok(())
}

/// Reassembles direction-keyed relation maps from a vertex's incident edges,
/// split into group references (hierarchy paths) and device references.
pub async fn collect_relations(
    graph: &dyn GraphPort,
    id: &str,
) -> Result<(RelationMap, RelationMap)> {
    let mut groups = RelationMap::default();
    let mut devices = RelationMap::default();
    for edge in graph.get_edges(id).await? {
        let target = RelationTarget {
            id: edge.other_id.clone(),
            is_auth_check: edge.is_auth_check,
        };
        // Group references are hierarchy paths; device ids never start with '/'.
        if edge.other_id.starts_with('/') {
            groups.insert(edge.direction, &edge.relation, target);
        } else {
            devices.insert(edge.direction, &edge.relation, target);
        }
    }
    Ok((groups, devices))
}
