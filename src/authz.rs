use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::anyhow;

use crate::claims::{AccessLevel, RequestContext};
use crate::error::{LibError, Result};
use crate::graph::GraphPort;
use crate::models::{DeviceId, GroupPath, RelationMap, RelationsByName};
use crate::template::Template;
use crate::traversal::TraversalSpec;

/// Fine-grained access control over the asset graph. Authorization is decided
/// by one atomic traversal: each target must exist, and must reach one of the
/// caller's claimed hierarchy paths over auth-checked edges.
pub struct AuthorizationService {
    graph: Arc<dyn GraphPort>,
    enabled: bool,
}

impl AuthorizationService {
    pub fn new(graph: Arc<dyn GraphPort>, enabled: bool) -> Self {
        Self { graph, enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// All-or-nothing check: any missing target fails the whole request with
    /// a not-found error; any unauthorized target fails it with a
    /// not-authorized error. Returns silently on success.
    pub async fn authorization_check(
        &self,
        ctx: &RequestContext,
        device_ids: &[DeviceId],
        group_paths: &[GroupPath],
        required: AccessLevel,
    ) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        let mut combined: BTreeSet<String> = BTreeSet::new();
        combined.extend(device_ids.iter().map(|id| id.as_str().to_string()));
        combined.extend(group_paths.iter().map(|p| p.as_str().to_string()));
        if combined.is_empty() {
            return Ok(());
        }

        let claims = ctx.claims();
        let claimed_paths = claims.list_paths();
        let ids: Vec<String> = combined.iter().cloned().collect();
        let spec = TraversalSpec::authorization(&ids).with_claimed_paths(&claimed_paths);
        let outcome = self.graph.run_authorization_traversal(&spec).await?;

        if outcome.exists.len() != combined.len() {
            let missing: Vec<String> = combined
                .iter()
                .filter(|id| !outcome.exists.contains(*id))
                .cloned()
                .collect();
            tracing::warn!(?missing, "authorization check found missing targets");
            return Err(LibError::targets_not_found(missing));
        }

        // A backend returning rows for vertices we never asked about is a
        // data inconsistency; refuse the whole request.
        for key in outcome.authorized_paths.keys() {
            if !combined.contains(key) {
                tracing::warn!(target = %key, "traversal returned an unrequested target");
                return Err(LibError::not_authorized(anyhow!(
                    "traversal returned unrequested target {key}"
                )));
            }
        }

        let sufficient = combined
            .iter()
            .filter(|id| {
                outcome
                    .authorized_paths
                    .get(*id)
                    .is_some_and(|paths| {
                        paths
                            .iter()
                            .any(|path| claims.has_access_for_path(path, required))
                    })
            })
            .count();

        if sufficient != combined.len() {
            tracing::warn!(
                required = %required,
                requested = combined.len(),
                sufficient,
                "authorization check refused"
            );
            return Err(LibError::not_authorized(anyhow!(
                "{} of {} targets lack {} access",
                combined.len() - sufficient,
                combined.len(),
                required
            )));
        }

        tracing::debug!(targets = combined.len(), required = %required, "authorization check passed");
        Ok(())
    }
}

/// Sets `is_auth_check` in place on every target whose resolved labels match
/// an auth-identifying relation rule. `auth_types_by_relation` comes from
/// [`Template::auth_relations`] for the direction being marked.
pub fn mark_identifying_auth(
    targets_by_relation: &mut RelationsByName,
    labels_by_id: &BTreeMap<String, Vec<String>>,
    auth_types_by_relation: &BTreeMap<String, BTreeSet<String>>,
) {
    for (relation, targets) in targets_by_relation.iter_mut() {
        let Some(auth_types) = auth_types_by_relation.get(relation) else {
            continue;
        };
        for target in targets.iter_mut() {
            let matches = labels_by_id
                .get(&target.id)
                .is_some_and(|labels| labels.iter().any(|label| auth_types.contains(label)));
            if matches {
                target.is_auth_check = true;
            }
        }
    }
}

/// Marks both directions of a relation map against the template's
/// auth-identifying rules. Runs before persistence whenever FGAC is enabled.
pub fn mark_auth_edges(
    relations: &mut RelationMap,
    labels_by_id: &BTreeMap<String, Vec<String>>,
    template: &Template,
) {
    for direction in crate::models::RelationDirection::all() {
        let auth_types = template.auth_relations(direction);
        if auth_types.is_empty() {
            continue;
        }
        mark_identifying_auth(relations.direction_mut(direction), labels_by_id, &auth_types);
    }
}
