use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::Result;
use crate::models::{normalize_id, Category, RelationDirection};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TemplateStatus {
    #[default]
    Draft,
    Published,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AttributeType {
    #[default]
    String,
    Number,
    Boolean,
    Json,
}

/// Declared attribute: its type and whether it must be present on create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeSpec {
    #[serde(rename = "type")]
    pub attr_type: AttributeType,
    #[serde(default)]
    pub required: bool,
}

impl AttributeSpec {
    pub fn required(attr_type: AttributeType) -> Self {
        Self {
            attr_type,
            required: true,
        }
    }

    pub fn optional(attr_type: AttributeType) -> Self {
        Self {
            attr_type,
            required: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Cardinality {
    One,
    #[default]
    Many,
}

/// What a relation name may point at, and whether edges written under it feed
/// the authorization hierarchy walk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationRule {
    pub targets: BTreeSet<String>,
    #[serde(default)]
    pub cardinality: Cardinality,
    #[serde(default)]
    pub identifying_auth: bool,
}

impl RelationRule {
    pub fn to<S: AsRef<str>>(targets: &[S]) -> Self {
        Self {
            targets: targets.iter().map(|t| normalize_id(t.as_ref())).collect(),
            cardinality: Cardinality::Many,
            identifying_auth: false,
        }
    }

    pub fn one(mut self) -> Self {
        self.cardinality = Cardinality::One;
        self
    }

    pub fn identifying_auth(mut self) -> Self {
        self.identifying_auth = true;
        self
    }

    pub fn permits_target(&self, template_id: &str) -> bool {
        self.targets.contains(&normalize_id(template_id))
    }
}

/// Per-direction relation declarations for a template.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationSchema {
    #[serde(default, rename = "in", skip_serializing_if = "BTreeMap::is_empty")]
    pub incoming: BTreeMap<String, RelationRule>,
    #[serde(default, rename = "out", skip_serializing_if = "BTreeMap::is_empty")]
    pub outgoing: BTreeMap<String, RelationRule>,
}

impl RelationSchema {
    pub fn direction(&self, direction: RelationDirection) -> &BTreeMap<String, RelationRule> {
        match direction {
            RelationDirection::In => &self.incoming,
            RelationDirection::Out => &self.outgoing,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    pub template_id: String,
    pub category: Category,
    #[serde(default)]
    pub status: TemplateStatus,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, AttributeSpec>,
    #[serde(default)]
    pub relations: RelationSchema,
}

impl Template {
    pub fn new(template_id: &str, category: Category) -> Self {
        Self {
            template_id: normalize_id(template_id),
            category,
            status: TemplateStatus::Draft,
            attributes: BTreeMap::new(),
            relations: RelationSchema::default(),
        }
    }

    pub fn with_attribute(mut self, name: &str, spec: AttributeSpec) -> Self {
        self.attributes.insert(name.to_string(), spec);
        self
    }

    pub fn with_relation(
        mut self,
        direction: RelationDirection,
        name: &str,
        rule: RelationRule,
    ) -> Self {
        match direction {
            RelationDirection::In => self.relations.incoming.insert(normalize_id(name), rule),
            RelationDirection::Out => self.relations.outgoing.insert(normalize_id(name), rule),
        };
        self
    }

    pub fn relation_rule(
        &self,
        direction: RelationDirection,
        name: &str,
    ) -> Option<&RelationRule> {
        self.relations.direction(direction).get(&normalize_id(name))
    }

    /// Relation names flagged auth-identifying for `direction`, each with the
    /// target template types the flag applies to. Consumed by the FGAC
    /// edge-marking pass.
    pub fn auth_relations(
        &self,
        direction: RelationDirection,
    ) -> BTreeMap<String, BTreeSet<String>> {
        self.relations
            .direction(direction)
            .iter()
            .filter(|(_, rule)| rule.identifying_auth)
            .map(|(name, rule)| (name.clone(), rule.targets.clone()))
            .collect()
    }
}

/// Schema/template registry boundary. Only published templates are visible to
/// validation.
#[async_trait]
pub trait TemplateRegistry: Send + Sync {
    async fn get_published_template(
        &self,
        template_id: &str,
        category: Category,
    ) -> Result<Option<Template>>;
}

/// In-memory registry with the create -> publish lifecycle. Serves tests and
/// embedded deployments.
#[derive(Default)]
pub struct InMemoryTemplateRegistry {
    templates: Arc<RwLock<BTreeMap<(String, Category), Template>>>,
}

impl InMemoryTemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(&self, template: Template) {
        let key = (template.template_id.clone(), template.category);
        self.templates.write().await.insert(key, template);
    }

    pub async fn publish(&self, template_id: &str, category: Category) -> bool {
        let key = (normalize_id(template_id), category);
        match self.templates.write().await.get_mut(&key) {
            Some(template) => {
                template.status = TemplateStatus::Published;
                true
            }
            None => false,
        }
    }

    /// Create and immediately publish. Test convenience.
    pub async fn create_published(&self, mut template: Template) {
        template.status = TemplateStatus::Published;
        self.create(template).await;
    }
}

#[async_trait]
impl TemplateRegistry for InMemoryTemplateRegistry {
    async fn get_published_template(
        &self,
        template_id: &str,
        category: Category,
    ) -> Result<Option<Template>> {
        let key = (normalize_id(template_id), category);
        let templates = self.templates.read().await;
        Ok(templates
            .get(&key)
            .filter(|t| t.status == TemplateStatus::Published)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site_template() -> Template {
        Template::new("edgedevice", Category::Device)
            .with_attribute("firmware", AttributeSpec::required(AttributeType::String))
            .with_relation(
                RelationDirection::Out,
                "located_at",
                RelationRule::to(&["site"]).identifying_auth(),
            )
            .with_relation(
                RelationDirection::Out,
                "connected_to",
                RelationRule::to(&["edgedevice"]),
            )
    }

    #[tokio::test]
    async fn unpublished_templates_are_invisible() {
        let registry = InMemoryTemplateRegistry::new();
        registry.create(site_template()).await;

        let fetched = registry
            .get_published_template("edgeDevice", Category::Device)
            .await
            .expect("registry lookup");
        assert!(fetched.is_none());

        assert!(registry.publish("edgedevice", Category::Device).await);
        let fetched = registry
            .get_published_template("edgedevice", Category::Device)
            .await
            .expect("registry lookup");
        assert_eq!(fetched.expect("published").status, TemplateStatus::Published);
    }

    #[tokio::test]
    async fn templates_never_cross_categories() {
        let registry = InMemoryTemplateRegistry::new();
        registry.create_published(site_template()).await;

        let fetched = registry
            .get_published_template("edgedevice", Category::Group)
            .await
            .expect("registry lookup");
        assert!(fetched.is_none());
    }

    #[test]
    fn auth_relations_filters_to_flagged_rules() {
        let template = site_template();
        let auth = template.auth_relations(RelationDirection::Out);
        assert_eq!(auth.len(), 1);
        assert!(auth["located_at"].contains("site"));
        assert!(template.auth_relations(RelationDirection::In).is_empty());
    }

    #[test]
    fn relation_rule_lookup_is_case_insensitive() {
        let template = site_template();
        let rule = template
            .relation_rule(RelationDirection::Out, "Located_At")
            .expect("declared relation");
        assert!(rule.permits_target("Site"));
        assert!(!rule.permits_target("region"));
        assert!(template
            .relation_rule(RelationDirection::Out, "undeclared")
            .is_none());
    }
}
