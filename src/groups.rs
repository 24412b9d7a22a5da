use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::anyhow;
use serde_json::{json, Value};

use crate::authz::{mark_auth_edges, AuthorizationService};
use crate::claims::{AccessLevel, RequestContext};
use crate::config::ServiceConfig;
use crate::error::{LibError, RelationFailure, Result};
use crate::events::{fire_and_log, ChangeEvent, EventEmitter, EventKind, ObjectType};
use crate::graph::{collect_relations, persist_relation_edges, GraphPort};
use crate::models::{
    normalize_id, strip_unprintable, Attributes, BulkResult, Category, Group, GroupPath, NewGroup,
    RelationDirection, RelationMap, RelationTarget, VertexRecord,
};
use crate::profile::{apply_to_group, fetch_profile, ProfileStore};
use crate::template::{Template, TemplateRegistry};
use crate::validation::{
    ensure_relation_capacity, ensure_relations_valid, ensure_schema_valid,
    validate_relationships_by_ids, validate_relationships_by_path, validate_subtype, Operation,
};

const ATTR_CATEGORY: &str = "category";
const ATTR_NAME: &str = "name";
const ATTR_PARENT_PATH: &str = "parentPath";

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupUpdate {
    pub group_path: GroupPath,
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(default)]
    pub profile_id: Option<String>,
}

pub struct GroupsService {
    graph: Arc<dyn GraphPort>,
    templates: Arc<dyn TemplateRegistry>,
    profiles: Arc<dyn ProfileStore>,
    authz: Arc<AuthorizationService>,
    events: Arc<dyn EventEmitter>,
    config: ServiceConfig,
}

impl GroupsService {
    pub fn new(
        graph: Arc<dyn GraphPort>,
        templates: Arc<dyn TemplateRegistry>,
        profiles: Arc<dyn ProfileStore>,
        authz: Arc<AuthorizationService>,
        events: Arc<dyn EventEmitter>,
        config: ServiceConfig,
    ) -> Self {
        Self {
            graph,
            templates,
            profiles,
            authz,
            events,
            config,
        }
    }

    pub async fn get(&self, ctx: &RequestContext, group_path: &GroupPath) -> Result<Group> {
        self.authz
            .authorization_check(ctx, &[], std::slice::from_ref(group_path), AccessLevel::Read)
            .await?;

        let vertex = self
            .graph
            .get_vertex(group_path.as_str())
            .await?
            .ok_or_else(|| LibError::group_not_found(group_path.as_str()))?;
        let (groups, _) = collect_relations(self.graph.as_ref(), group_path.as_str()).await?;
        Ok(assemble_group(group_path, &vertex, groups))
    }

    /// Create flow: the group path is derived from `parent_path` and the
    /// sanitized name; the implicit parent edge carries the auth-check flag
    /// whenever FGAC is enabled, which is what makes subtree claims inherit.
    pub async fn create(&self, ctx: &RequestContext, mut group: NewGroup) -> Result<GroupPath> {
        if let Some(profile_id) = group.profile_id.clone() {
            let profile =
                fetch_profile(self.profiles.as_ref(), &group.template_id, &profile_id).await?;
            apply_to_group(&mut group, &profile);
        }

        let parent_path = GroupPath::new(group.parent_path.as_str());
        let name = normalize_id(&strip_unprintable(&group.name));
        if name.is_empty() {
            return Err(LibError::invalid(
                "Group name is required",
                anyhow!("empty group name under {parent_path}"),
            ));
        }
        let group_path = parent_path.child(&name);

        let parent_vertex = self.graph.get_vertex(parent_path.as_str()).await?;
        let has_parent_vertex = parent_vertex.is_some();
        if parent_path.as_str() != "/" && !has_parent_vertex {
            return Err(LibError::group_not_found(parent_path.as_str()));
        }

        // The group itself does not exist yet; authorize over the parent and
        // any related groups.
        let mut related: Vec<GroupPath> = group
            .groups
            .target_ids()
            .into_iter()
            .map(|id| GroupPath::new(&id))
            .collect();
        if has_parent_vertex {
            related.push(parent_path.clone());
        }
        self.authz
            .authorization_check(ctx, &[], &related, AccessLevel::Create)
            .await?;

        // Create never upserts; an occupied path is refused outright.
        if self.graph.get_vertex(group_path.as_str()).await?.is_some() {
            return Err(LibError::group_exists(group_path.as_str()));
        }

        let template = self
            .templates
            .get_published_template(&group.template_id, Category::Group)
            .await?
            .ok_or_else(|| LibError::template_not_found(&group.template_id))?;

        let mut parent_relations = RelationMap::default();
        if has_parent_vertex {
            parent_relations.insert(
                RelationDirection::Out,
                &self.config.group_parent_relation,
                RelationTarget::new(parent_path.as_str()),
            );
        }

        // Bound outside the join so the borrow outlives the polled futures.
        let device_relations = RelationMap::default();
        let (schema, relations, parent_ok) = tokio::join!(
            async { validate_subtype(&template, &group.attributes, Operation::Create) },
            validate_relationships_by_ids(
                &template,
                &group.groups,
                &device_relations,
                self.graph.as_ref(),
            ),
            validate_relationships_by_path(
                &template,
                &parent_relations,
                self.graph.as_ref(),
                self.config.strict_parent_relations,
            ),
        );
        let relations = relations?;
        ensure_schema_valid(schema)?;
        ensure_relations_valid(&relations)?;
        if !parent_ok? {
            return Err(LibError::relation_validation(vec![RelationFailure {
                relation: self.config.group_parent_relation.clone(),
                target: parent_path.as_str().to_string(),
                message: "parent group's type is not permitted for this relation".to_string(),
            }]));
        }

        if self.authz.is_enabled() {
            mark_auth_edges(&mut group.groups, &relations.group_labels, &template);
        }

        self.graph
            .add_vertex(group_vertex(&group_path, &parent_path, &group, &template))
            .await?;
        if has_parent_vertex {
            // The hierarchy edge feeds the authorization walk.
            self.graph
                .add_edge(
                    group_path.as_str(),
                    &self.config.group_parent_relation,
                    RelationDirection::Out,
                    parent_path.as_str(),
                    self.authz.is_enabled(),
                )
                .await?;
        }
        persist_relation_edges(self.graph.as_ref(), group_path.as_str(), &group.groups).await?;

        tracing::debug!(group_path = %group_path, template_id = %template.template_id, "group created");
        fire_and_log(
            self.events.as_ref(),
            ChangeEvent::new(ObjectType::Group, group_path.as_str(), EventKind::Create)
                .with_payload(json!({"templateId": template.template_id, "parentPath": parent_path.as_str()})),
        )
        .await;

        Ok(group_path)
    }

    /// Template is resolved from the stored label; updates can never change a
    /// group's type.
    pub async fn update(&self, ctx: &RequestContext, mut update: GroupUpdate) -> Result<()> {
        self.authz
            .authorization_check(
                ctx,
                &[],
                std::slice::from_ref(&update.group_path),
                AccessLevel::Update,
            )
            .await?;

        let mut vertex = self
            .graph
            .get_vertex(update.group_path.as_str())
            .await?
            .ok_or_else(|| LibError::group_not_found(update.group_path.as_str()))?;
        let template = self.resolve_stored_template(&vertex).await?;

        if let Some(profile_id) = update.profile_id.clone() {
            let profile =
                fetch_profile(self.profiles.as_ref(), &template.template_id, &profile_id).await?;
            crate::profile::merge_attributes(&mut update.attributes, &profile.attributes);
        }

        ensure_schema_valid(validate_subtype(
            &template,
            &update.attributes,
            Operation::Update,
        ))?;

        for (key, value) in &update.attributes {
            vertex.attributes.insert(
                key.clone(),
                serde_json::to_value(value).unwrap_or(Value::Null),
            );
        }
        let group_path = update.group_path.clone();
        self.graph.add_vertex(vertex).await?;

        tracing::debug!(group_path = %group_path, "group updated");
        fire_and_log(
            self.events.as_ref(),
            ChangeEvent::new(ObjectType::Group, group_path.as_str(), EventKind::Modify),
        )
        .await;
        Ok(())
    }

    pub async fn delete(&self, ctx: &RequestContext, group_path: &GroupPath) -> Result<()> {
        self.authz
            .authorization_check(
                ctx,
                &[],
                std::slice::from_ref(group_path),
                AccessLevel::Delete,
            )
            .await?;
        if self.graph.get_vertex(group_path.as_str()).await?.is_none() {
            return Err(LibError::group_not_found(group_path.as_str()));
        }
        self.graph.remove_vertex(group_path.as_str()).await?;

        tracing::debug!(group_path = %group_path, "group deleted");
        fire_and_log(
            self.events.as_ref(),
            ChangeEvent::new(ObjectType::Group, group_path.as_str(), EventKind::Delete),
        )
        .await;
        Ok(())
    }

    /// Group-to-group attachment. No-op when the edge already exists.
    pub async fn attach_to_group(
        &self,
        ctx: &RequestContext,
        source_path: &GroupPath,
        relation: &str,
        direction: RelationDirection,
        target_path: &GroupPath,
    ) -> Result<()> {
        self.authz
            .authorization_check(
                ctx,
                &[],
                &[source_path.clone(), target_path.clone()],
                AccessLevel::Update,
            )
            .await?;

        let vertex = self
            .graph
            .get_vertex(source_path.as_str())
            .await?
            .ok_or_else(|| LibError::group_not_found(source_path.as_str()))?;
        if self.graph.get_vertex(target_path.as_str()).await?.is_none() {
            return Err(LibError::group_not_found(target_path.as_str()));
        }

        if self
            .graph
            .edge_exists(source_path.as_str(), relation, direction, target_path.as_str())
            .await?
        {
            return Ok(());
        }

        let template = self.resolve_stored_template(&vertex).await?;
        ensure_relation_capacity(
            &template,
            source_path.as_str(),
            relation,
            direction,
            self.graph.as_ref(),
        )
        .await?;
        let mut groups = RelationMap::default();
        groups.insert(direction, relation, RelationTarget::new(target_path.as_str()));
        let outcome = validate_relationships_by_ids(
            &template,
            &groups,
            &RelationMap::default(),
            self.graph.as_ref(),
        )
        .await?;
        ensure_relations_valid(&outcome)?;

        if self.authz.is_enabled() {
            mark_auth_edges(&mut groups, &outcome.group_labels, &template);
        }
        persist_relation_edges(self.graph.as_ref(), source_path.as_str(), &groups).await?;

        self.fire_modify(source_path.as_str(), relation, target_path.as_str())
            .await;
        Ok(())
    }

    pub async fn detach_from_group(
        &self,
        ctx: &RequestContext,
        source_path: &GroupPath,
        relation: &str,
        direction: RelationDirection,
        target_path: &GroupPath,
    ) -> Result<()> {
        self.authz
            .authorization_check(
                ctx,
                &[],
                &[source_path.clone(), target_path.clone()],
                AccessLevel::Update,
            )
            .await?;

        if self.graph.get_vertex(source_path.as_str()).await?.is_none() {
            return Err(LibError::group_not_found(source_path.as_str()));
        }
        if self.graph.get_vertex(target_path.as_str()).await?.is_none() {
            return Err(LibError::group_not_found(target_path.as_str()));
        }
        if !self
            .graph
            .edge_exists(source_path.as_str(), relation, direction, target_path.as_str())
            .await?
        {
            return Ok(());
        }

        self.graph
            .remove_edge(source_path.as_str(), relation, direction, target_path.as_str())
            .await?;
        self.fire_modify(source_path.as_str(), relation, target_path.as_str())
            .await;
        Ok(())
    }

    pub async fn create_bulk(&self, ctx: &RequestContext, groups: Vec<NewGroup>) -> BulkResult {
        let mut result = BulkResult::default();
        for group in groups {
            let id = GroupPath::new(group.parent_path.as_str())
                .child(&group.name)
                .as_str()
                .to_string();
            match self.create(ctx, group).await {
                Ok(_) => result.record_success(),
                Err(err) => {
                    tracing::warn!(group_path = %id, error = %err, "bulk create item failed");
                    result.record_failure(&id, err.to_string());
                }
            }
        }
        result
    }

    pub async fn update_bulk(&self, ctx: &RequestContext, updates: Vec<GroupUpdate>) -> BulkResult {
        let mut result = BulkResult::default();
        for update in updates {
            let id = update.group_path.as_str().to_string();
            match self.update(ctx, update).await {
                Ok(()) => result.record_success(),
                Err(err) => {
                    tracing::warn!(group_path = %id, error = %err, "bulk update item failed");
                    result.record_failure(&id, err.to_string());
                }
            }
        }
        result
    }

    async fn resolve_stored_template(&self, vertex: &VertexRecord) -> Result<Template> {
        let label = vertex
            .labels
            .first()
            .ok_or_else(|| LibError::template_not_found("<unlabeled>"))?;
        self.templates
            .get_published_template(label, Category::Group)
            .await?
            .ok_or_else(|| LibError::template_not_found(label))
    }

    async fn fire_modify(&self, group_path: &str, relation: &str, other: &str) {
        fire_and_log(
            self.events.as_ref(),
            ChangeEvent::new(ObjectType::Group, group_path, EventKind::Modify)
                .with_payload(json!({"relation": relation, "target": other})),
        )
        .await;
    }
}

fn group_vertex(
    group_path: &GroupPath,
    parent_path: &GroupPath,
    group: &NewGroup,
    template: &Template,
) -> VertexRecord {
    let mut vertex_attributes: BTreeMap<String, Value> = group
        .attributes
        .iter()
        .map(|(k, v)| (k.clone(), serde_json::to_value(v).unwrap_or(Value::Null)))
        .collect();
    vertex_attributes.insert(
        ATTR_CATEGORY.to_string(),
        Value::String(Category::Group.as_value().to_string()),
    );
    vertex_attributes.insert(
        ATTR_NAME.to_string(),
        Value::String(normalize_id(&strip_unprintable(&group.name))),
    );
    vertex_attributes.insert(
        ATTR_PARENT_PATH.to_string(),
        Value::String(parent_path.as_str().to_string()),
    );
    VertexRecord {
        id: group_path.as_str().to_string(),
        labels: vec![template.template_id.clone()],
        attributes: vertex_attributes,
    }
}

fn assemble_group(group_path: &GroupPath, vertex: &VertexRecord, groups: RelationMap) -> Group {
    let name = vertex
        .attributes
        .get(ATTR_NAME)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let parent_path = vertex
        .attributes
        .get(ATTR_PARENT_PATH)
        .and_then(|v| v.as_str())
        .map(GroupPath::new)
        .unwrap_or_else(GroupPath::root);
    let attributes = vertex
        .attributes
        .iter()
        .filter(|(key, _)| {
            !matches!(key.as_str(), ATTR_CATEGORY | ATTR_NAME | ATTR_PARENT_PATH)
        })
        .filter_map(|(key, value)| {
            serde_json::from_value(value.clone())
                .ok()
                .map(|v| (key.clone(), v))
        })
        .collect();
    Group {
        group_path: group_path.clone(),
        name,
        parent_path,
        template_id: vertex.labels.first().cloned().unwrap_or_default(),
        category: Category::Group,
        attributes,
        groups,
    }
}
