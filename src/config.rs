use crate::models::{DeviceState, GroupPath};

/// Optional relation attached to a new device when the payload carries none.
#[derive(Debug, Clone)]
pub struct DefaultDeviceParent {
    pub relation: String,
    pub group_path: GroupPath,
}

/// Service wiring knobs. Passed by value into the entity services; no global
/// configuration registry.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Master switch for fine-grained access control. When false, every
    /// authorization check is a no-op and no edges are auth-marked.
    pub authorization_enabled: bool,
    /// When true, group parent relations are type-checked against the
    /// template schema. Default permissive.
    pub strict_parent_relations: bool,
    /// Relation + group attached to a new device that declares no relations.
    pub default_device_parent: Option<DefaultDeviceParent>,
    /// Initial state for devices created without one.
    pub default_device_state: DeviceState,
    /// Relation name used for the implicit group -> parent edge.
    pub group_parent_relation: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            authorization_enabled: true,
            strict_parent_relations: false,
            default_device_parent: None,
            default_device_state: DeviceState::Unprovisioned,
            group_parent_relation: "parent".to_string(),
        }
    }
}
