use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Value};

use crate::authz::{mark_auth_edges, AuthorizationService};
use crate::claims::{AccessLevel, RequestContext};
use crate::config::ServiceConfig;
use crate::error::{LibError, Result};
use crate::events::{fire_and_log, ChangeEvent, EventEmitter, EventKind, ObjectType};
use crate::graph::{collect_relations, persist_relation_edges, GraphPort};
use crate::models::{
    Attributes, BulkResult, Category, Device, DeviceId, DeviceState, GroupPath, NewDevice,
    RelationDirection, RelationMap, RelationTarget, VertexRecord,
};
use crate::profile::{apply_to_device, fetch_profile, ProfileStore};
use crate::template::{Template, TemplateRegistry};
use crate::validation::{
    ensure_relation_capacity, ensure_relations_valid, ensure_schema_valid,
    validate_relationships_by_ids, validate_subtype, Operation,
};

const ATTR_CATEGORY: &str = "category";
const ATTR_STATE: &str = "state";

/// Attribute patch for an existing device. The template cannot change on
/// update; it is resolved from the stored vertex label.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceUpdate {
    pub device_id: DeviceId,
    #[serde(default)]
    pub state: Option<DeviceState>,
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(default)]
    pub profile_id: Option<String>,
}

pub struct DevicesService {
    graph: Arc<dyn GraphPort>,
    templates: Arc<dyn TemplateRegistry>,
    profiles: Arc<dyn ProfileStore>,
    authz: Arc<AuthorizationService>,
    events: Arc<dyn EventEmitter>,
    config: ServiceConfig,
}

impl DevicesService {
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

    pub async fn get(&self, ctx: &RequestContext, device_id: &DeviceId) -> Result<Device> {
        self.authz
            .authorization_check(ctx, std::slice::from_ref(device_id), &[], AccessLevel::Read)
            .await?;

        let vertex = self
            .graph
            .get_vertex(device_id.as_str())
            .await?
            .ok_or_else(|| LibError::device_not_found(device_id.as_str()))?;
        let (groups, devices) = collect_relations(self.graph.as_ref(), device_id.as_str()).await?;
        Ok(assemble_device(device_id, &vertex, groups, devices))
    }

    /// Create flow: profile merge, id sanitation, default relation, authz `C`
    /// over related ids, template fetch, concurrent schema + relationship
    /// validation, FGAC marking, persistence, create event.
    pub async fn create(&self, ctx: &RequestContext, mut device: NewDevice) -> Result<DeviceId> {
        if device.category == Category::Group {
            return Err(LibError::invalid(
                "Devices cannot be created under the group category",
                anyhow::anyhow!("category group on device create"),
            ));
        }

        if let Some(profile_id) = device.profile_id.clone() {
            let profile =
                fetch_profile(self.profiles.as_ref(), &device.template_id, &profile_id).await?;
            apply_to_device(&mut device, &profile);
        }

        let device_id = DeviceId::sanitized(device.device_id.as_str());

        if device.groups.is_empty() && device.devices.is_empty() {
            if let Some(default_parent) = &self.config.default_device_parent {
                device.groups.insert(
                    RelationDirection::Out,
                    &default_parent.relation,
                    RelationTarget::new(default_parent.group_path.as_str()),
                );
            }
        }

        // The device itself does not exist yet; authorize over related ids.
        let (related_devices, related_groups) =
            related_ids(&[&device.groups, &device.devices]);
        self.authz
            .authorization_check(ctx, &related_devices, &related_groups, AccessLevel::Create)
            .await?;

        // Create never upserts; an occupied id is refused outright.
        if self.graph.get_vertex(device_id.as_str()).await?.is_some() {
            return Err(LibError::device_exists(device_id.as_str()));
        }

        let state = device.state.unwrap_or(self.config.default_device_state);

        let template = self
            .templates
            .get_published_template(&device.template_id, device.category)
            .await?
            .ok_or_else(|| LibError::template_not_found(&device.template_id))?;

        // Independent checks; fire both, await both.
        let (schema, relations) = tokio::join!(
            async { validate_subtype(&template, &device.attributes, Operation::Create) },
            validate_relationships_by_ids(
                &template,
                &device.groups,
                &device.devices,
                self.graph.as_ref(),
            ),
        );
        let relations = relations?;
        ensure_schema_valid(schema)?;
        ensure_relations_valid(&relations)?;

        if self.authz.is_enabled() {
            mark_auth_edges(&mut device.groups, &relations.group_labels, &template);
            mark_auth_edges(&mut device.devices, &relations.device_labels, &template);
        }

        self.graph
            .add_vertex(device_vertex(&device_id, &template, state, &device.attributes))
            .await?;
        persist_relation_edges(self.graph.as_ref(), device_id.as_str(), &device.groups).await?;
        persist_relation_edges(self.graph.as_ref(), device_id.as_str(), &device.devices).await?;

        tracing::debug!(device_id = %device_id, template_id = %template.template_id, "device created");
        fire_and_log(
            self.events.as_ref(),
            ChangeEvent::new(ObjectType::Device, device_id.as_str(), EventKind::Create)
                .with_payload(json!({"templateId": template.template_id, "state": state})),
        )
        .await;

        Ok(device_id)
    }

    /// Update flow: authz `U` including self; template resolved from the
    /// stored label so updates can never change the device's type.
    pub async fn update(&self, ctx: &RequestContext, mut update: DeviceUpdate) -> Result<()> {
        self.authz
            .authorization_check(
                ctx,
                std::slice::from_ref(&update.device_id),
                &[],
                AccessLevel::Update,
            )
            .await?;

        let mut vertex = self
            .graph
            .get_vertex(update.device_id.as_str())
            .await?
            .ok_or_else(|| LibError::device_not_found(update.device_id.as_str()))?;
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
        if let Some(state) = update.state {
            vertex.attributes.insert(
                ATTR_STATE.to_string(),
                serde_json::to_value(state).unwrap_or(Value::Null),
            );
        }
        let device_id = update.device_id.clone();
        self.graph.add_vertex(vertex).await?;

        tracing::debug!(device_id = %device_id, "device updated");
        fire_and_log(
            self.events.as_ref(),
            ChangeEvent::new(ObjectType::Device, device_id.as_str(), EventKind::Modify),
        )
        .await;
        Ok(())
    }

    pub async fn delete(&self, ctx: &RequestContext, device_id: &DeviceId) -> Result<()> {
        self.authz
            .authorization_check(
                ctx,
                std::slice::from_ref(device_id),
                &[],
                AccessLevel::Delete,
            )
            .await?;
        if self.graph.get_vertex(device_id.as_str()).await?.is_none() {
            return Err(LibError::device_not_found(device_id.as_str()));
        }
        self.graph.remove_vertex(device_id.as_str()).await?;

        tracing::debug!(device_id = %device_id, "device deleted");
        fire_and_log(
            self.events.as_ref(),
            ChangeEvent::new(ObjectType::Device, device_id.as_str(), EventKind::Delete),
        )
        .await;
        Ok(())
    }

    /// Attaches `device_id` to a group. No-op when the edge already exists;
    /// the relation must be declared by the device's template and permit the
    /// group's resolved type.
    pub async fn attach_to_group(
        &self,
        ctx: &RequestContext,
        device_id: &DeviceId,
        relation: &str,
        direction: RelationDirection,
        group_path: &GroupPath,
    ) -> Result<()> {
        self.authz
            .authorization_check(
                ctx,
                std::slice::from_ref(device_id),
                std::slice::from_ref(group_path),
                AccessLevel::Update,
            )
            .await?;

        let vertex = self
            .graph
            .get_vertex(device_id.as_str())
            .await?
            .ok_or_else(|| LibError::device_not_found(device_id.as_str()))?;
        if self.graph.get_vertex(group_path.as_str()).await?.is_none() {
            return Err(LibError::group_not_found(group_path.as_str()));
        }

        if self
            .graph
            .edge_exists(device_id.as_str(), relation, direction, group_path.as_str())
            .await?
        {
            return Ok(());
        }

        let template = self.resolve_stored_template(&vertex).await?;
        ensure_relation_capacity(
            &template,
            device_id.as_str(),
            relation,
            direction,
            self.graph.as_ref(),
        )
        .await?;
        let mut groups = RelationMap::default();
        groups.insert(direction, relation, RelationTarget::new(group_path.as_str()));
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
        persist_relation_edges(self.graph.as_ref(), device_id.as_str(), &groups).await?;

        self.fire_modify(device_id.as_str(), relation, group_path.as_str())
            .await;
        Ok(())
    }

    pub async fn detach_from_group(
        &self,
        ctx: &RequestContext,
        device_id: &DeviceId,
        relation: &str,
        direction: RelationDirection,
        group_path: &GroupPath,
    ) -> Result<()> {
        self.authz
            .authorization_check(
                ctx,
                std::slice::from_ref(device_id),
                std::slice::from_ref(group_path),
                AccessLevel::Update,
            )
            .await?;

        if self.graph.get_vertex(device_id.as_str()).await?.is_none() {
            return Err(LibError::device_not_found(device_id.as_str()));
        }
        if self.graph.get_vertex(group_path.as_str()).await?.is_none() {
            return Err(LibError::group_not_found(group_path.as_str()));
        }
        if !self
            .graph
            .edge_exists(device_id.as_str(), relation, direction, group_path.as_str())
            .await?
        {
            return Ok(());
        }

        self.graph
            .remove_edge(device_id.as_str(), relation, direction, group_path.as_str())
            .await?;
        self.fire_modify(device_id.as_str(), relation, group_path.as_str())
            .await;
        Ok(())
    }

    pub async fn attach_to_device(
        &self,
        ctx: &RequestContext,
        device_id: &DeviceId,
        relation: &str,
        direction: RelationDirection,
        other_id: &DeviceId,
    ) -> Result<()> {
        self.authz
            .authorization_check(
                ctx,
                &[device_id.clone(), other_id.clone()],
                &[],
                AccessLevel::Update,
            )
            .await?;

        let vertex = self
            .graph
            .get_vertex(device_id.as_str())
            .await?
            .ok_or_else(|| LibError::device_not_found(device_id.as_str()))?;
        if self.graph.get_vertex(other_id.as_str()).await?.is_none() {
            return Err(LibError::device_not_found(other_id.as_str()));
        }

        if self
            .graph
            .edge_exists(device_id.as_str(), relation, direction, other_id.as_str())
            .await?
        {
            return Ok(());
        }

        let template = self.resolve_stored_template(&vertex).await?;
        ensure_relation_capacity(
            &template,
            device_id.as_str(),
            relation,
            direction,
            self.graph.as_ref(),
        )
        .await?;
        let mut devices = RelationMap::default();
        devices.insert(direction, relation, RelationTarget::new(other_id.as_str()));
        let outcome = validate_relationships_by_ids(
            &template,
            &RelationMap::default(),
            &devices,
            self.graph.as_ref(),
        )
        .await?;
        ensure_relations_valid(&outcome)?;

        if self.authz.is_enabled() {
            mark_auth_edges(&mut devices, &outcome.device_labels, &template);
        }
        persist_relation_edges(self.graph.as_ref(), device_id.as_str(), &devices).await?;

        self.fire_modify(device_id.as_str(), relation, other_id.as_str())
            .await;
        Ok(())
    }

    pub async fn detach_from_device(
        &self,
        ctx: &RequestContext,
        device_id: &DeviceId,
        relation: &str,
        direction: RelationDirection,
        other_id: &DeviceId,
    ) -> Result<()> {
        self.authz
            .authorization_check(
                ctx,
                &[device_id.clone(), other_id.clone()],
                &[],
                AccessLevel::Update,
            )
            .await?;

        if self.graph.get_vertex(device_id.as_str()).await?.is_none() {
            return Err(LibError::device_not_found(device_id.as_str()));
        }
        if self.graph.get_vertex(other_id.as_str()).await?.is_none() {
            return Err(LibError::device_not_found(other_id.as_str()));
        }
        if !self
            .graph
            .edge_exists(device_id.as_str(), relation, direction, other_id.as_str())
            .await?
        {
            return Ok(());
        }

        self.graph
            .remove_edge(device_id.as_str(), relation, direction, other_id.as_str())
            .await?;
        self.fire_modify(device_id.as_str(), relation, other_id.as_str())
            .await;
        Ok(())
    }

    /// Per-item isolation: one device's failure never aborts the rest.
    pub async fn create_bulk(
        &self,
        ctx: &RequestContext,
        devices: Vec<NewDevice>,
    ) -> BulkResult {
        let mut result = BulkResult::default();
        for device in devices {
            let id = device.device_id.as_str().to_string();
            match self.create(ctx, device).await {
                Ok(_) => result.record_success(),
                Err(err) => {
                    tracing::warn!(device_id = %id, error = %err, "bulk create item failed");
                    result.record_failure(&id, err.to_string());
                }
            }
        }
        result
    }

    pub async fn update_bulk(
        &self,
        ctx: &RequestContext,
        updates: Vec<DeviceUpdate>,
    ) -> BulkResult {
        let mut result = BulkResult::default();
        for update in updates {
            let id = update.device_id.as_str().to_string();
            match self.update(ctx, update).await {
                Ok(()) => result.record_success(),
                Err(err) => {
                    tracing::warn!(device_id = %id, error = %err, "bulk update item failed");
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
        let category = vertex
            .attributes
            .get(ATTR_CATEGORY)
            .and_then(|v| v.as_str())
            .and_then(Category::from_value)
            .unwrap_or(Category::Device);
        self.templates
            .get_published_template(label, category)
            .await?
            .ok_or_else(|| LibError::template_not_found(label))
    }

    async fn fire_modify(&self, device_id: &str, relation: &str, other: &str) {
        fire_and_log(
            self.events.as_ref(),
            ChangeEvent::new(ObjectType::Device, device_id, EventKind::Modify)
                .with_payload(json!({"relation": relation, "target": other})),
        )
        .await;
    }
}

/// Splits relation targets into device ids and group paths for authorization.
fn related_ids(maps: &[&RelationMap]) -> (Vec<DeviceId>, Vec<GroupPath>) {
    let mut devices = Vec::new();
    let mut groups = Vec::new();
    for map in maps {
        for id in map.target_ids() {
            if id.starts_with('/') {
                groups.push(GroupPath::new(&id));
            } else {
                devices.push(DeviceId::new(&id));
            }
        }
    }
    (devices, groups)
}

fn device_vertex(
    device_id: &DeviceId,
    template: &Template,
    state: DeviceState,
    attributes: &Attributes,
) -> VertexRecord {
    let mut vertex_attributes: BTreeMap<String, Value> = attributes
        .iter()
        .map(|(k, v)| (k.clone(), serde_json::to_value(v).unwrap_or(Value::Null)))
        .collect();
    vertex_attributes.insert(
        ATTR_CATEGORY.to_string(),
        Value::String(template.category.as_value().to_string()),
    );
    vertex_attributes.insert(
        ATTR_STATE.to_string(),
        serde_json::to_value(state).unwrap_or(Value::Null),
    );
    VertexRecord {
        id: device_id.as_str().to_string(),
        labels: vec![template.template_id.clone()],
        attributes: vertex_attributes,
    }
}

fn assemble_device(
    device_id: &DeviceId,
    vertex: &VertexRecord,
    groups: RelationMap,
    devices: RelationMap,
) -> Device {
    let category = vertex
        .attributes
        .get(ATTR_CATEGORY)
        .and_then(|v| v.as_str())
        .and_then(Category::from_value)
        .unwrap_or(Category::Device);
    let state = vertex
        .attributes
        .get(ATTR_STATE)
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default();
    let attributes = vertex
        .attributes
        .iter()
        .filter(|(key, _)| key.as_str() != ATTR_CATEGORY && key.as_str() != ATTR_STATE)
        .filter_map(|(key, value)| {
            serde_json::from_value(value.clone())
                .ok()
                .map(|v| (key.clone(), v))
        })
        .collect();
    Device {
        device_id: device_id.clone(),
        template_id: vertex.labels.first().cloned().unwrap_or_default(),
        category,
        state,
        attributes,
        groups,
        devices,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claims::Claims;
    use crate::config::DefaultDeviceParent;
    use crate::events::CollectingEmitter;
    use crate::memory::MemoryGraph;
    use crate::profile::{InMemoryProfileStore, Profile};
    use crate::template::{AttributeSpec, AttributeType, InMemoryTemplateRegistry, RelationRule};

    struct Fixture {
        service: DevicesService,
        graph: Arc<MemoryGraph>,
        profiles: Arc<InMemoryProfileStore>,
        events: CollectingEmitter,
    }

    async fn fixture(config: ServiceConfig) -> Fixture {
        let graph = Arc::new(MemoryGraph::new());
        let templates = Arc::new(InMemoryTemplateRegistry::new());
        let profiles = Arc::new(InMemoryProfileStore::new());
        let events = CollectingEmitter::new();
        let authz = Arc::new(AuthorizationService::new(
            graph.clone(),
            config.authorization_enabled,
        ));

        templates
            .create_published(
                Template::new("edgedevice", Category::Device)
                    .with_attribute("firmware", AttributeSpec::required(AttributeType::String))
                    .with_attribute("port", AttributeSpec::optional(AttributeType::Number))
                    .with_relation(
                        RelationDirection::Out,
                        "located_at",
                        RelationRule::to(&["site"]).one().identifying_auth(),
                    )
                    .with_relation(
                        RelationDirection::Out,
                        "connected_to",
                        RelationRule::to(&["edgedevice"]),
                    ),
            )
            .await;

        // Site hierarchy the devices hang off: /site-a -> /region.
        for (id, label) in [("/site-a", "site"), ("/site-b", "site"), ("/region", "region")] {
            graph
                .add_vertex(VertexRecord {
                    id: id.to_string(),
                    labels: vec![label.to_string()],
                    attributes: BTreeMap::new(),
                })
                .await
                .expect("add vertex");
        }
        graph
            .add_edge("/site-a", "parent", RelationDirection::Out, "/region", true)
            .await
            .expect("add edge");

        let service = DevicesService::new(
            graph.clone(),
            templates,
            profiles.clone(),
            authz,
            Arc::new(events.clone()),
            config,
        );
        Fixture {
            service,
            graph,
            profiles,
            events,
        }
    }

    fn ctx(encoded: &[&str]) -> RequestContext {
        RequestContext::new(Claims::from_encoded(encoded).expect("valid claims"))
    }

    fn new_device(id: &str) -> NewDevice {
        let mut groups = RelationMap::default();
        groups.insert(
            RelationDirection::Out,
            "located_at",
            RelationTarget::new("/site-a"),
        );
        NewDevice {
            device_id: id.into(),
            template_id: "edgedevice".to_string(),
            category: Category::Device,
            state: None,
            attributes: serde_json::from_str(r#"{"firmware":"1.0"}"#).expect("attrs"),
            groups,
            devices: RelationMap::default(),
            profile_id: None,
        }
    }

    #[tokio::test]
    async fn create_persists_vertex_and_auth_marked_edge() {
        let f = fixture(ServiceConfig::default()).await;
        let id = f
            .service
            .create(&ctx(&["/region:CR"]), new_device("Device-001"))
            .await
            .expect("create");
        assert_eq!(id.as_str(), "device-001");

        let device = f
            .service
            .get(&ctx(&["/region:R"]), &id)
            .await
            .expect("get after create");
        assert_eq!(device.template_id, "edgedevice");
        assert_eq!(device.state, DeviceState::Unprovisioned);
        // Edge to /site-a was auth-marked, so the authorization walk above
        // could reach /region through it.
        assert!(device.groups.outgoing["located_at"][0].is_auth_check);

        let events = f.events.events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, EventKind::Create);
    }

    #[tokio::test]
    async fn create_fails_schema_validation_before_persisting() {
        let f = fixture(ServiceConfig::default()).await;
        let mut device = new_device("d1");
        device.attributes.clear();
        let err = f
            .service
            .create(&ctx(&["/region:C"]), device)
            .await
            .expect_err("missing required firmware");
        assert_eq!(err.code, "schema_validation_failed");
        assert!(f.graph.get_vertex("d1").await.expect("lookup").is_none());
        assert!(f.events.events().await.is_empty());
    }

    #[tokio::test]
    async fn create_without_claims_on_related_group_is_refused() {
        let f = fixture(ServiceConfig::default()).await;
        let err = f
            .service
            .create(&ctx(&["/other:C"]), new_device("d1"))
            .await
            .expect_err("no claim over /site-a's hierarchy");
        assert_eq!(err.code, "not_authorized");
    }

    #[tokio::test]
    async fn create_applies_default_parent_when_no_relations_given() {
        let mut config = ServiceConfig::default();
        config.default_device_parent = Some(DefaultDeviceParent {
            relation: "located_at".to_string(),
            group_path: GroupPath::new("/site-a"),
        });
        let f = fixture(config).await;

        let mut device = new_device("d1");
        device.groups = RelationMap::default();
        f.service
            .create(&ctx(&["/region:CR"]), device)
            .await
            .expect("create with default parent");
        assert!(f
            .graph
            .edge_exists("d1", "located_at", RelationDirection::Out, "/site-a")
            .await
            .expect("edge lookup"));
    }

    #[tokio::test]
    async fn create_merges_profile_defaults() {
        let f = fixture(ServiceConfig::default()).await;
        f.profiles
            .put(Profile {
                profile_id: "standard".to_string(),
                template_id: "edgedevice".to_string(),
                attributes: serde_json::from_str(r#"{"firmware":"9.9","port":443}"#)
                    .expect("attrs"),
                groups: RelationMap::default(),
                devices: RelationMap::default(),
            })
            .await;

        let mut device = new_device("d1");
        device.profile_id = Some("standard".to_string());
        let id = f
            .service
            .create(&ctx(&["/region:CR"]), device)
            .await
            .expect("create");

        let fetched = f.service.get(&ctx(&["/region:R"]), &id).await.expect("get");
        // Entity's firmware wins; profile's port fills the gap.
        assert_eq!(
            fetched.attributes["firmware"],
            crate::models::AttributeValue::String("1.0".to_string())
        );
        assert!(matches!(
            fetched.attributes["port"],
            crate::models::AttributeValue::Number(_)
        ));
    }

    #[tokio::test]
    async fn create_with_unknown_profile_fails() {
        let f = fixture(ServiceConfig::default()).await;
        let mut device = new_device("d1");
        device.profile_id = Some("ghost".to_string());
        let err = f
            .service
            .create(&ctx(&["/region:C"]), device)
            .await
            .expect_err("profile does not exist");
        assert_eq!(err.code, "profile_not_found");
    }

    #[tokio::test]
    async fn update_patches_attributes_and_state() {
        let f = fixture(ServiceConfig::default()).await;
        let id = f
            .service
            .create(&ctx(&["/region:CRU"]), new_device("d1"))
            .await
            .expect("create");

        f.service
            .update(
                &ctx(&["/region:U"]),
                DeviceUpdate {
                    device_id: id.clone(),
                    state: Some(DeviceState::Active),
                    attributes: serde_json::from_str(r#"{"port":8883}"#).expect("attrs"),
                    profile_id: None,
                },
            )
            .await
            .expect("update");

        let device = f.service.get(&ctx(&["/region:R"]), &id).await.expect("get");
        assert_eq!(device.state, DeviceState::Active);
        assert!(matches!(
            device.attributes["port"],
            crate::models::AttributeValue::Number(_)
        ));
    }

    #[tokio::test]
    async fn update_rejects_undeclared_attribute() {
        let f = fixture(ServiceConfig::default()).await;
        let id = f
            .service
            .create(&ctx(&["/region:CRU"]), new_device("d1"))
            .await
            .expect("create");
        let err = f
            .service
            .update(
                &ctx(&["/region:U"]),
                DeviceUpdate {
                    device_id: id,
                    state: None,
                    attributes: serde_json::from_str(r#"{"color":"red"}"#).expect("attrs"),
                    profile_id: None,
                },
            )
            .await
            .expect_err("color is not in the template");
        assert_eq!(err.code, "schema_validation_failed");
    }

    #[tokio::test]
    async fn attach_rejects_disallowed_target_label_and_persists_nothing() {
        let f = fixture(ServiceConfig::default()).await;
        let id = f
            .service
            .create(&ctx(&["/region:CRU"]), new_device("d1"))
            .await
            .expect("create");

        // /region's label is "region"; located_at only permits "site".
        let err = f
            .service
            .attach_to_group(
                &ctx(&["/region:U"]),
                &id,
                "located_at",
                RelationDirection::Out,
                &GroupPath::new("/region"),
            )
            .await
            .expect_err("region is not a permitted target");
        assert_eq!(err.code, "relation_validation_failed");
        assert!(!f
            .graph
            .edge_exists("d1", "located_at", RelationDirection::Out, "/region")
            .await
            .expect("edge lookup"));
    }

    #[tokio::test]
    async fn create_refuses_duplicate_id() {
        let f = fixture(ServiceConfig::default()).await;
        f.service
            .create(&ctx(&["/region:CR"]), new_device("d1"))
            .await
            .expect("create");

        let mut second = new_device("d1");
        second.attributes = serde_json::from_str(r#"{"firmware":"2.0"}"#).expect("attrs");
        let err = f
            .service
            .create(&ctx(&["/region:CR"]), second)
            .await
            .expect_err("d1 already exists");
        assert_eq!(err.code, "device_already_exists");

        // The stored vertex is untouched by the refused create.
        let device = f
            .service
            .get(&ctx(&["/region:R"]), &DeviceId::new("d1"))
            .await
            .expect("get");
        assert_eq!(
            device.attributes["firmware"],
            crate::models::AttributeValue::String("1.0".to_string())
        );
    }

    #[tokio::test]
    async fn attach_refuses_second_target_on_single_relation() {
        let f = fixture(ServiceConfig::default()).await;
        let id = f
            .service
            .create(&ctx(&["/region:CRU"]), new_device("d1"))
            .await
            .expect("create");

        // located_at permits one target and d1 already points at /site-a.
        let err = f
            .service
            .attach_to_group(
                &ctx(&["/site-a:U", "/site-b:U"]),
                &id,
                "located_at",
                RelationDirection::Out,
                &GroupPath::new("/site-b"),
            )
            .await
            .expect_err("located_at is already occupied");
        assert_eq!(err.code, "relation_validation_failed");
        assert!(!f
            .graph
            .edge_exists("d1", "located_at", RelationDirection::Out, "/site-b")
            .await
            .expect("edge lookup"));
        assert!(f
            .graph
            .edge_exists("d1", "located_at", RelationDirection::Out, "/site-a")
            .await
            .expect("edge lookup"));
    }

    #[tokio::test]
    async fn attach_is_idempotent() {
        let f = fixture(ServiceConfig::default()).await;
        let id = f
            .service
            .create(&ctx(&["/region:CRU"]), new_device("d1"))
            .await
            .expect("create");
        let edges_before = f.graph.edge_count().await;

        f.service
            .attach_to_group(
                &ctx(&["/region:U"]),
                &id,
                "located_at",
                RelationDirection::Out,
                &GroupPath::new("/site-a"),
            )
            .await
            .expect("attach over existing edge is a no-op");
        assert_eq!(f.graph.edge_count().await, edges_before);
    }

    #[tokio::test]
    async fn detach_removes_edge_and_emits_modify() {
        let f = fixture(ServiceConfig::default()).await;
        let id = f
            .service
            .create(&ctx(&["/region:CRUD", "/site-a:CRUD"]), new_device("d1"))
            .await
            .expect("create");

        f.service
            .detach_from_group(
                &ctx(&["/site-a:U", "/region:U"]),
                &id,
                "located_at",
                RelationDirection::Out,
                &GroupPath::new("/site-a"),
            )
            .await
            .expect("detach");
        assert!(!f
            .graph
            .edge_exists("d1", "located_at", RelationDirection::Out, "/site-a")
            .await
            .expect("edge lookup"));
        let events = f.events.events().await;
        assert_eq!(events.last().expect("events").event, EventKind::Modify);
    }

    #[tokio::test]
    async fn device_to_device_attach_validates_schema() {
        let f = fixture(ServiceConfig::default()).await;
        let a = f
            .service
            .create(&ctx(&["/region:CRU"]), new_device("d1"))
            .await
            .expect("create d1");
        let b = f
            .service
            .create(&ctx(&["/region:CRU"]), new_device("d2"))
            .await
            .expect("create d2");

        f.service
            .attach_to_device(
                &ctx(&["/region:U"]),
                &a,
                "connected_to",
                RelationDirection::Out,
                &b,
            )
            .await
            .expect("declared device relation");
        assert!(f
            .graph
            .edge_exists("d1", "connected_to", RelationDirection::Out, "d2")
            .await
            .expect("edge lookup"));
    }

    #[tokio::test]
    async fn bulk_create_isolates_failures() {
        let f = fixture(ServiceConfig::default()).await;
        let mut bad = new_device("device2");
        bad.attributes.clear();

        let result = f
            .service
            .create_bulk(
                &ctx(&["/region:CR"]),
                vec![new_device("device1"), bad, new_device("device3")],
            )
            .await;

        assert_eq!(result.success, 2);
        assert_eq!(result.failed, 1);
        assert_eq!(result.total, 3);
        assert!(result.errors["device2"].contains("schema_validation_failed"));
    }

    #[tokio::test]
    async fn disabled_fgac_skips_auth_marking() {
        let mut config = ServiceConfig::default();
        config.authorization_enabled = false;
        let f = fixture(config).await;

        let id = f
            .service
            .create(&RequestContext::unrestricted(), new_device("d1"))
            .await
            .expect("create without FGAC");
        let device = f
            .service
            .get(&RequestContext::unrestricted(), &id)
            .await
            .expect("get");
        assert!(!device.groups.outgoing["located_at"][0].is_auth_check);
    }
}
