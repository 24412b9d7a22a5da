use anyhow::anyhow;

pub type Result<T> = std::result::Result<T, LibError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Graph,
    NotAuthorized,
    InvalidInput,
    NotFound,
    Unknown,
}

/// Structured diagnostics attached to validation and authorization failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorDetails {
    MissingTargets { ids: Vec<String> },
    SchemaFailures { failures: Vec<SchemaFailure> },
    RelationFailures { failures: Vec<RelationFailure> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaFailure {
    pub field: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationFailure {
    pub relation: String,
    pub target: String,
    pub message: String,
}

#[derive(Debug)]
pub struct LibError {
    pub kind: ErrorKind,
    pub code: &'static str,
    pub public: &'static str,
    pub details: Option<ErrorDetails>,
    pub source: anyhow::Error,
}

impl LibError {
    pub fn graph(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::Graph,
            code: "graph_error",
            public,
            details: None,
            source,
        }
    }

    pub fn not_authorized(source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::NotAuthorized,
            code: "not_authorized",
            public: "Caller is not authorized for one or more targets",
            details: None,
            source,
        }
    }

    pub fn targets_not_found(missing: Vec<String>) -> Self {
        Self {
            kind: ErrorKind::NotFound,
            code: "targets_not_found",
            public: "One or more targets do not exist",
            source: anyhow!("missing targets: {missing:?}"),
            details: Some(ErrorDetails::MissingTargets { ids: missing }),
        }
    }

    pub fn device_exists(device_id: &str) -> Self {
        Self {
            kind: ErrorKind::InvalidInput,
            code: "device_already_exists",
            public: "A device with this ID already exists",
            details: None,
            source: anyhow!("device {device_id} already exists"),
        }
    }

    pub fn group_exists(group_path: &str) -> Self {
        Self {
            kind: ErrorKind::InvalidInput,
            code: "group_already_exists",
            public: "A group with this path already exists",
            details: None,
            source: anyhow!("group {group_path} already exists"),
        }
    }

    pub fn device_not_found(device_id: &str) -> Self {
        Self {
            kind: ErrorKind::NotFound,
            code: "device_not_found",
            public: "Device does not exist",
            details: None,
            source: anyhow!("device {device_id} not found"),
        }
    }

    pub fn group_not_found(group_path: &str) -> Self {
        Self {
            kind: ErrorKind::NotFound,
            code: "group_not_found",
            public: "Group does not exist",
            details: None,
            source: anyhow!("group {group_path} not found"),
        }
    }

    pub fn template_not_found(template_id: &str) -> Self {
        Self {
            kind: ErrorKind::NotFound,
            code: "template_not_found",
            public: "No published template with this ID",
            details: None,
            source: anyhow!("template {template_id} not found or not published"),
        }
    }

    pub fn profile_not_found(template_id: &str, profile_id: &str) -> Self {
        Self {
            kind: ErrorKind::NotFound,
            code: "profile_not_found",
            public: "No profile with this ID for the entity's template",
            details: None,
            source: anyhow!("profile {profile_id} not found for template {template_id}"),
        }
    }

    pub fn schema_validation(failures: Vec<SchemaFailure>) -> Self {
        Self {
            kind: ErrorKind::InvalidInput,
            code: "schema_validation_failed",
            public: "Entity attributes do not conform to the template schema",
            source: anyhow!("schema validation failed: {failures:?}"),
            details: Some(ErrorDetails::SchemaFailures { failures }),
        }
    }

    pub fn relation_validation(failures: Vec<RelationFailure>) -> Self {
        Self {
            kind: ErrorKind::InvalidInput,
            code: "relation_validation_failed",
            public: "One or more relations are not permitted by the template schema",
            source: anyhow!("relation validation failed: {failures:?}"),
            details: Some(ErrorDetails::RelationFailures { failures }),
        }
    }

    pub fn invalid(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::InvalidInput,
            code: "invalid_input",
            public,
            details: None,
            source,
        }
    }

    pub fn unknown(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::Unknown,
            code: "unknown_error",
            public,
            details: None,
            source,
        }
    }

    pub fn message(public: &'static str) -> Self {
        Self::unknown(public, anyhow!(public))
    }
}

impl std::fmt::Display for LibError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.public, self.code)
    }
}

impl std::error::Error for LibError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}
