use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lowercases and trims an identifier. Idempotent.
pub fn normalize_id(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Drops non-printable (control) characters. Applied once, at entity creation.
pub fn strip_unprintable(raw: &str) -> String {
    raw.chars().filter(|c| !c.is_control()).collect()
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    #[default]
    Device,
    Group,
    Component,
}

impl Category {
    pub const fn as_value(self) -> &'static str {
        match self {
            Category::Device => "device",
            Category::Group => "group",
            Category::Component => "component",
        }
    }

    pub fn from_value(value: &str) -> Option<Self> {
        match value {
            "device" => Some(Category::Device),
            "group" => Some(Category::Group),
            "component" => Some(Category::Component),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    #[default]
    Unprovisioned,
    Active,
    Decommissioned,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String")]
pub struct DeviceId(pub String);

impl DeviceId {
    /// Normalized id. Device ids are case-insensitive and stored lowercase.
    pub fn new(raw: &str) -> Self {
        Self(normalize_id(raw))
    }

    /// Normalized id with non-printable characters removed. Creation-time only.
    pub fn sanitized(raw: &str) -> Self {
        Self(normalize_id(&strip_unprintable(raw)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DeviceId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self::new(s))
    }
}

impl From<String> for DeviceId {
    fn from(value: String) -> Self {
        Self::new(&value)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String")]
pub struct GroupPath(pub String);

impl GroupPath {
    /// Normalized hierarchy path. Paths are case-insensitive and stored lowercase.
    pub fn new(raw: &str) -> Self {
        Self(normalize_id(raw))
    }

    /// Normalized path with non-printable characters removed. Creation-time only.
    pub fn sanitized(raw: &str) -> Self {
        Self(normalize_id(&strip_unprintable(raw)))
    }

    pub fn root() -> Self {
        Self("/".to_string())
    }

    /// Child path under `self`: `/parent` + `name` -> `/parent/name`.
    pub fn child(&self, name: &str) -> Self {
        let name = normalize_id(&strip_unprintable(name));
        let base = self.0.trim_end_matches('/');
        Self(format!("{base}/{name}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for GroupPath {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self::new(s))
    }
}

impl From<String> for GroupPath {
    fn from(value: String) -> Self {
        Self::new(&value)
    }
}

impl From<&str> for GroupPath {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Attribute values are typed once at the boundary; merge and validation logic
/// never inspects raw strings for embedded JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    Json(Value),
}

pub type Attributes = BTreeMap<String, AttributeValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationDirection {
    In,
    Out,
}

impl RelationDirection {
    pub const fn all() -> [RelationDirection; 2] {
        [RelationDirection::In, RelationDirection::Out]
    }

    pub const fn as_value(self) -> &'static str {
        match self {
            RelationDirection::In => "in",
            RelationDirection::Out => "out",
        }
    }
}

/// A single related-entity reference. `is_auth_check` starts false on inbound
/// payloads and is set by the FGAC marking pass before persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationTarget {
    pub id: String,
    #[serde(default)]
    pub is_auth_check: bool,
}

impl RelationTarget {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: normalize_id(&id.into()),
            is_auth_check: false,
        }
    }
}

pub type RelationsByName = BTreeMap<String, Vec<RelationTarget>>;

/// Direction-keyed relation map: `in`/`out` -> relation name -> ordered targets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationMap {
    #[serde(default, rename = "in", skip_serializing_if = "BTreeMap::is_empty")]
    pub incoming: RelationsByName,
    #[serde(default, rename = "out", skip_serializing_if = "BTreeMap::is_empty")]
    pub outgoing: RelationsByName,
}

impl RelationMap {
    pub fn direction(&self, direction: RelationDirection) -> &RelationsByName {
        match direction {
            RelationDirection::In => &self.incoming,
            RelationDirection::Out => &self.outgoing,
        }
    }

    pub fn direction_mut(&mut self, direction: RelationDirection) -> &mut RelationsByName {
        match direction {
            RelationDirection::In => &mut self.incoming,
            RelationDirection::Out => &mut self.outgoing,
        }
    }

    pub fn insert(&mut self, direction: RelationDirection, name: &str, target: RelationTarget) {
        self.direction_mut(direction)
            .entry(normalize_id(name))
            .or_default()
            .push(target);
    }

    pub fn is_empty(&self) -> bool {
        self.incoming.is_empty() && self.outgoing.is_empty()
    }

    /// All (direction, relation name, targets) triples.
    pub fn iter(
        &self,
    ) -> impl Iterator<Item = (RelationDirection, &str, &[RelationTarget])> + '_ {
        RelationDirection::all().into_iter().flat_map(move |dir| {
            self.direction(dir)
                .iter()
                .map(move |(name, targets)| (dir, name.as_str(), targets.as_slice()))
        })
    }

    /// Every distinct target id across both directions.
    pub fn target_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .iter()
            .flat_map(|(_, _, targets)| targets.iter().map(|t| t.id.clone()))
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Drops empty target lists. Run after profile merge.
    pub fn prune_empty(&mut self) {
        self.incoming.retain(|_, targets| !targets.is_empty());
        self.outgoing.retain(|_, targets| !targets.is_empty());
    }
}

/// Inbound device payload. Ids are normalized on deserialization, sanitized at
/// create time by the service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewDevice {
    pub device_id: DeviceId,
    pub template_id: String,
    #[serde(default)]
    pub category: Category,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<DeviceState>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: Attributes,
    #[serde(default, skip_serializing_if = "RelationMap::is_empty")]
    pub groups: RelationMap,
    #[serde(default, skip_serializing_if = "RelationMap::is_empty")]
    pub devices: RelationMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub device_id: DeviceId,
    pub template_id: String,
    pub category: Category,
    pub state: DeviceState,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: Attributes,
    #[serde(default, skip_serializing_if = "RelationMap::is_empty")]
    pub groups: RelationMap,
    #[serde(default, skip_serializing_if = "RelationMap::is_empty")]
    pub devices: RelationMap,
}

/// Inbound group payload. `group_path` is derived by the service from
/// `parent_path` and `name`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewGroup {
    pub name: String,
    pub parent_path: GroupPath,
    pub template_id: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: Attributes,
    #[serde(default, skip_serializing_if = "RelationMap::is_empty")]
    pub groups: RelationMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub group_path: GroupPath,
    pub name: String,
    pub parent_path: GroupPath,
    pub template_id: String,
    pub category: Category,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: Attributes,
    #[serde(default, skip_serializing_if = "RelationMap::is_empty")]
    pub groups: RelationMap,
}

/// A vertex as returned by the graph port.
#[derive(Debug, Clone, PartialEq)]
pub struct VertexRecord {
    pub id: String,
    pub labels: Vec<String>,
    pub attributes: BTreeMap<String, Value>,
}

/// Per-item outcome of a bulk operation. One item's failure never aborts the
/// rest of the batch.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkResult {
    pub success: u32,
    pub failed: u32,
    pub total: u32,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub errors: BTreeMap<String, String>,
}

impl BulkResult {
    pub fn record_success(&mut self) {
        self.success += 1;
        self.total += 1;
    }

    pub fn record_failure(&mut self, id: &str, message: String) {
        self.failed += 1;
        self.total += 1;
        self.errors.insert(id.to_string(), message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_is_idempotent() {
        let once = normalize_id("  MyDevice001 ");
        let twice = normalize_id(&once);
        assert_eq!(once, "mydevice001");
        assert_eq!(once, twice);
    }

    #[test]
    fn sanitized_strips_control_characters() {
        let id = DeviceId::sanitized("Edge\u{0007}Device\n01");
        assert_eq!(id.as_str(), "edgedevice01");
    }

    #[test]
    fn deserialized_ids_are_normalized() {
        let id: DeviceId = serde_json::from_str("\"MixedCase01\"").expect("valid id");
        assert_eq!(id.as_str(), "mixedcase01");
    }

    #[test]
    fn child_path_joins_with_single_separator() {
        assert_eq!(GroupPath::new("/parent").child("Group001").as_str(), "/parent/group001");
        assert_eq!(GroupPath::root().child("top").as_str(), "/top");
        assert_eq!(GroupPath::new("/a/b/").child("c").as_str(), "/a/b/c");
    }

    #[test]
    fn prune_empty_drops_empty_target_lists() {
        let mut map = RelationMap::default();
        map.insert(RelationDirection::Out, "linked_to", RelationTarget::new("/site/a"));
        map.outgoing.insert("orphaned".to_string(), Vec::new());
        map.incoming.insert("stale".to_string(), Vec::new());
        map.prune_empty();
        assert_eq!(map.outgoing.len(), 1);
        assert!(map.incoming.is_empty());
    }

    #[test]
    fn relation_map_iterates_both_directions() {
        let mut map = RelationMap::default();
        map.insert(RelationDirection::In, "manages", RelationTarget::new("d1"));
        map.insert(RelationDirection::Out, "located_at", RelationTarget::new("/g1"));
        let triples: Vec<_> = map.iter().collect();
        assert_eq!(triples.len(), 2);
        assert_eq!(map.target_ids(), vec!["/g1".to_string(), "d1".to_string()]);
    }

    #[test]
    fn attribute_values_deserialize_untagged() {
        let attrs: Attributes = serde_json::from_str(
            r#"{"firmware":"1.2.3","port":443,"enabled":true,"meta":{"a":1},"none":null}"#,
        )
        .expect("valid attributes");
        assert!(matches!(attrs["firmware"], AttributeValue::String(_)));
        assert!(matches!(attrs["port"], AttributeValue::Number(_)));
        assert!(matches!(attrs["enabled"], AttributeValue::Bool(true)));
        assert!(matches!(attrs["meta"], AttributeValue::Json(_)));
        assert!(matches!(attrs["none"], AttributeValue::Null));
    }
}
