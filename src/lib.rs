pub mod authz;
pub mod claims;
pub mod config;
pub mod devices;
pub mod error;
pub mod events;
pub mod graph;
pub mod groups;
pub mod memory;
pub mod models;
pub mod profile;
pub mod template;
pub mod traversal;
pub mod validation;

pub mod prelude {
    pub use crate::authz::{mark_auth_edges, mark_identifying_auth, AuthorizationService};
    pub use crate::claims::{AccessLevel, Claims, RequestContext};
    pub use crate::config::{DefaultDeviceParent, ServiceConfig};
    pub use crate::devices::{DeviceUpdate, DevicesService};
    pub use crate::error::{ErrorDetails, ErrorKind, LibError, Result};
    pub use crate::events::{ChangeEvent, CollectingEmitter, EventEmitter, EventKind, ObjectType};
    pub use crate::graph::{EdgeReference, GraphPort};
    pub use crate::groups::{GroupUpdate, GroupsService};
    pub use crate::memory::MemoryGraph;
    pub use crate::models::{
        AttributeValue, Attributes, BulkResult, Category, Device, DeviceId, DeviceState, Group,
        GroupPath, NewDevice, NewGroup, RelationDirection, RelationMap, RelationTarget,
        VertexRecord,
    };
    pub use crate::profile::{InMemoryProfileStore, Profile, ProfileStore};
    pub use crate::template::{
        AttributeSpec, AttributeType, Cardinality, InMemoryTemplateRegistry, RelationRule,
        Template, TemplateRegistry, TemplateStatus,
    };
    pub use crate::traversal::{AuthTraversalOutcome, TraversalSpec};
    pub use crate::validation::{
        validate_relationships_by_ids, validate_relationships_by_path, validate_subtype,
        Operation, RelationValidation, SchemaValidation,
    };
}
