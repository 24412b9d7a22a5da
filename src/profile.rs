use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{LibError, Result};
use crate::models::{normalize_id, Attributes, NewDevice, NewGroup, RelationDirection, RelationMap};

/// Named defaults mergeable onto a new or updated entity of a template.
/// `devices` applies to device profiles only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub profile_id: String,
    pub template_id: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: Attributes,
    #[serde(default, skip_serializing_if = "RelationMap::is_empty")]
    pub groups: RelationMap,
    #[serde(default, skip_serializing_if = "RelationMap::is_empty")]
    pub devices: RelationMap,
}

#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn get(&self, template_id: &str, profile_id: &str) -> Result<Option<Profile>>;
}

/// Fetch wrapper that turns a missing profile into the not-found error.
pub async fn fetch_profile(
    store: &dyn ProfileStore,
    template_id: &str,
    profile_id: &str,
) -> Result<Profile> {
    store
        .get(template_id, profile_id)
        .await?
        .ok_or_else(|| LibError::profile_not_found(template_id, profile_id))
}

#[derive(Default)]
pub struct InMemoryProfileStore {
    profiles: Arc<RwLock<BTreeMap<(String, String), Profile>>>,
}

impl InMemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put(&self, profile: Profile) {
        let key = (
            normalize_id(&profile.template_id),
            normalize_id(&profile.profile_id),
        );
        self.profiles.write().await.insert(key, profile);
    }
}

#[async_trait]
impl ProfileStore for InMemoryProfileStore {
    async fn get(&self, template_id: &str, profile_id: &str) -> Result<Option<Profile>> {
        let key = (normalize_id(template_id), normalize_id(profile_id));
        Ok(self.profiles.read().await.get(&key).cloned())
    }
}

/// Adds profile default attributes for keys the entity does not set. Entity
/// values always win.
pub fn merge_attributes(entity: &mut Attributes, profile: &Attributes) {
    for (key, value) in profile {
        entity.entry(key.clone()).or_insert_with(|| value.clone());
    }
}

/// Key-level relation merge: the entity's target list fully replaces the
/// profile's for the same relation name (never concatenated); profile keys
/// absent from the entity are retained. Empty lists are pruned afterwards.
pub fn merge_relation_map(entity: &mut RelationMap, profile: &RelationMap) {
    for direction in RelationDirection::all() {
        let defaults = profile.direction(direction);
        let onto = entity.direction_mut(direction);
        for (name, targets) in defaults {
            onto.entry(name.clone()).or_insert_with(|| targets.clone());
        }
    }
    entity.prune_empty();
}

/// Pure merge of a device payload with its profile. Callers fetch the profile
/// first; nothing here does I/O.
pub fn apply_to_device(device: &mut NewDevice, profile: &Profile) {
    merge_attributes(&mut device.attributes, &profile.attributes);
    merge_relation_map(&mut device.groups, &profile.groups);
    merge_relation_map(&mut device.devices, &profile.devices);
}

pub fn apply_to_group(group: &mut NewGroup, profile: &Profile) {
    merge_attributes(&mut group.attributes, &profile.attributes);
    merge_relation_map(&mut group.groups, &profile.groups);
}
