use std::collections::BTreeMap;

use crate::error::{LibError, RelationFailure, Result, SchemaFailure};
use crate::graph::GraphPort;
use crate::models::{normalize_id, Attributes, AttributeValue, RelationDirection, RelationMap};
use crate::template::{AttributeType, Cardinality, Template};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
    Update,
}

#[derive(Debug, Clone, Default)]
pub struct SchemaValidation {
    pub is_valid: bool,
    pub failures: Vec<SchemaFailure>,
}

/// Checks entity attributes against the template's declared schema. On
/// `Create` every required field must be present; on `Update` only supplied
/// fields are checked. Supplied fields must be declared and type-correct.
pub fn validate_subtype(
    template: &Template,
    attributes: &Attributes,
    operation: Operation,
) -> SchemaValidation {
    let mut failures = Vec::new();

    if operation == Operation::Create {
        for (field, spec) in &template.attributes {
            if spec.required && !attributes.contains_key(field) {
                failures.push(SchemaFailure {
                    field: field.clone(),
                    message: "required attribute is missing".to_string(),
                });
            }
        }
    }

    for (field, value) in attributes {
        match template.attributes.get(field) {
            None => failures.push(SchemaFailure {
                field: field.clone(),
                message: "attribute is not declared by the template".to_string(),
            }),
            Some(spec) => {
                if !value_matches(value, spec.attr_type) {
                    failures.push(SchemaFailure {
                        field: field.clone(),
                        message: format!("expected {:?} value", spec.attr_type),
                    });
                }
            }
        }
    }

    SchemaValidation {
        is_valid: failures.is_empty(),
        failures,
    }
}

fn value_matches(value: &AttributeValue, expected: AttributeType) -> bool {
    match (expected, value) {
        // Null is accepted anywhere; required-ness is a presence check.
        (_, AttributeValue::Null) => true,
        (AttributeType::String, AttributeValue::String(_)) => true,
        (AttributeType::Number, AttributeValue::Number(_)) => true,
        (AttributeType::Boolean, AttributeValue::Bool(_)) => true,
        (AttributeType::Json, AttributeValue::Json(_)) => true,
        _ => false,
    }
}

pub fn ensure_schema_valid(outcome: SchemaValidation) -> Result<()> {
    if outcome.is_valid {
        Ok(())
    } else {
        Err(LibError::schema_validation(outcome.failures))
    }
}

/// Labels resolved per target id, split by target kind. The label maps feed
/// the FGAC edge-marking pass after validation succeeds.
#[derive(Debug, Clone, Default)]
pub struct RelationValidation {
    pub is_valid: bool,
    pub group_labels: BTreeMap<String, Vec<String>>,
    pub device_labels: BTreeMap<String, Vec<String>>,
    pub failures: Vec<RelationFailure>,
}

/// Validates every relation in `groups` and `devices` against the template:
/// the relation name must be declared for its direction, each target must
/// exist, and each target's resolved label must be among the rule's permitted
/// types.
pub async fn validate_relationships_by_ids(
    template: &Template,
    groups: &RelationMap,
    devices: &RelationMap,
    graph: &dyn GraphPort,
) -> Result<RelationValidation> {
    let mut outcome = RelationValidation::default();

    let group_labels =
        check_relation_map(template, groups, graph, &mut outcome.failures).await?;
    let device_labels =
        check_relation_map(template, devices, graph, &mut outcome.failures).await?;

    outcome.group_labels = group_labels;
    outcome.device_labels = device_labels;
    outcome.is_valid = outcome.failures.is_empty();
    Ok(outcome)
}

async fn check_relation_map(
    template: &Template,
    relations: &RelationMap,
    graph: &dyn GraphPort,
    failures: &mut Vec<RelationFailure>,
) -> Result<BTreeMap<String, Vec<String>>> {
    let target_ids = relations.target_ids();
    let mut labels_by_id: BTreeMap<String, Vec<String>> = BTreeMap::new();
    if !target_ids.is_empty() {
        for vertex in graph.get_vertices(&target_ids).await? {
            labels_by_id.insert(vertex.id, vertex.labels);
        }
    }

    for (direction, name, targets) in relations.iter() {
        let rule = match template.relation_rule(direction, name) {
            Some(rule) => rule,
            None => {
                failures.push(RelationFailure {
                    relation: name.to_string(),
                    target: direction.as_value().to_string(),
                    message: "relation is not declared by the template for this direction"
                        .to_string(),
                });
                continue;
            }
        };

        if rule.cardinality == Cardinality::One && targets.len() > 1 {
            failures.push(RelationFailure {
                relation: name.to_string(),
                target: direction.as_value().to_string(),
                message: "relation permits a single target".to_string(),
            });
        }

        for target in targets {
            match labels_by_id.get(&target.id) {
                None => failures.push(RelationFailure {
                    relation: name.to_string(),
                    target: target.id.clone(),
                    message: "related entity does not exist".to_string(),
                }),
                Some(labels) => {
                    if !labels.iter().any(|label| rule.permits_target(label)) {
                        failures.push(RelationFailure {
                            relation: name.to_string(),
                            target: target.id.clone(),
                            message: "related entity's type is not permitted for this relation"
                                .to_string(),
                        });
                    }
                }
            }
        }
    }

    Ok(labels_by_id)
}

/// Attach-time guard for `Cardinality::One` relations: the stored edges are
/// consulted, not just the incoming map, so an existing target under the same
/// relation and direction refuses a second attach.
pub async fn ensure_relation_capacity(
    template: &Template,
    source_id: &str,
    relation: &str,
    direction: RelationDirection,
    graph: &dyn GraphPort,
) -> Result<()> {
    let single = template
        .relation_rule(direction, relation)
        .is_some_and(|rule| rule.cardinality == Cardinality::One);
    if !single {
        return Ok(());
    }

    let name = normalize_id(relation);
    let existing = graph
        .get_edges(source_id)
        .await?
        .into_iter()
        .find(|edge| edge.direction == direction && edge.relation == name);
    if let Some(edge) = existing {
        return Err(LibError::relation_validation(vec![RelationFailure {
            relation: name,
            target: edge.other_id,
            message: "relation permits a single target and one is already attached".to_string(),
        }]));
    }
    Ok(())
}

pub fn ensure_relations_valid(outcome: &RelationValidation) -> Result<()> {
    if outcome.is_valid {
        Ok(())
    } else {
        Err(LibError::relation_validation(outcome.failures.clone()))
    }
}

/// Path-keyed variant for group parent relations. Permissive unless
/// `strict` is set, in which case relation names must be declared and the
/// resolved label of every path target must be permitted.
pub async fn validate_relationships_by_path(
    template: &Template,
    relations: &RelationMap,
    graph: &dyn GraphPort,
    strict: bool,
) -> Result<bool> {
    if !strict {
        return Ok(true);
    }
    let outcome =
        validate_relationships_by_ids(template, relations, &RelationMap::default(), graph).await?;
    Ok(outcome.is_valid)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::graph::GraphPort;
    use crate::memory::MemoryGraph;
    use crate::models::{Category, RelationDirection, RelationTarget, VertexRecord};
    use crate::template::{AttributeSpec, RelationRule};

    fn template() -> Template {
        Template::new("edgedevice", Category::Device)
            .with_attribute("firmware", AttributeSpec::required(AttributeType::String))
            .with_attribute("port", AttributeSpec::optional(AttributeType::Number))
            .with_relation(
                RelationDirection::Out,
                "located_at",
                RelationRule::to(&["site"]).one().identifying_auth(),
            )
            .with_relation(
                RelationDirection::In,
                "manages",
                RelationRule::to(&["gateway"]),
            )
    }

    fn attrs(json: &str) -> Attributes {
        serde_json::from_str(json).expect("valid attributes")
    }

    #[test]
    fn create_requires_all_required_fields() {
        let outcome = validate_subtype(&template(), &attrs(r#"{"port":1}"#), Operation::Create);
        assert!(!outcome.is_valid);
        assert_eq!(outcome.failures[0].field, "firmware");
    }

    #[test]
    fn update_checks_only_supplied_fields() {
        let outcome = validate_subtype(&template(), &attrs(r#"{"port":1}"#), Operation::Update);
        assert!(outcome.is_valid);
    }

    #[test]
    fn undeclared_and_mistyped_attributes_are_rejected() {
        let outcome = validate_subtype(
            &template(),
            &attrs(r#"{"firmware":"1.0","port":"not-a-number","color":"red"}"#),
            Operation::Create,
        );
        assert!(!outcome.is_valid);
        let fields: Vec<&str> = outcome.failures.iter().map(|f| f.field.as_str()).collect();
        assert!(fields.contains(&"port"));
        assert!(fields.contains(&"color"));
    }

    async fn seeded_graph() -> MemoryGraph {
        let graph = MemoryGraph::new();
        for (id, label) in [("/site-a", "site"), ("/region", "region"), ("gw1", "gateway")] {
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
    }

    fn relation(direction: RelationDirection, name: &str, targets: &[&str]) -> RelationMap {
        let mut map = RelationMap::default();
        for target in targets {
            map.insert(direction, name, RelationTarget::new(*target));
        }
        map
    }

    #[tokio::test]
    async fn accepts_declared_relation_with_permitted_target() {
        let graph = seeded_graph().await;
        let groups = relation(RelationDirection::Out, "located_at", &["/site-a"]);
        let outcome = validate_relationships_by_ids(
            &template(),
            &groups,
            &RelationMap::default(),
            &graph,
        )
        .await
        .expect("validation");
        assert!(outcome.is_valid);
        assert_eq!(outcome.group_labels["/site-a"], ["site"]);
    }

    #[tokio::test]
    async fn rejects_undeclared_relation_name() {
        let graph = seeded_graph().await;
        let groups = relation(RelationDirection::Out, "linked_to", &["/site-a"]);
        let outcome = validate_relationships_by_ids(
            &template(),
            &groups,
            &RelationMap::default(),
            &graph,
        )
        .await
        .expect("validation");
        assert!(!outcome.is_valid);
        assert_eq!(outcome.failures[0].relation, "linked_to");
    }

    #[tokio::test]
    async fn rejects_disallowed_target_type() {
        let graph = seeded_graph().await;
        let groups = relation(RelationDirection::Out, "located_at", &["/region"]);
        let outcome = validate_relationships_by_ids(
            &template(),
            &groups,
            &RelationMap::default(),
            &graph,
        )
        .await
        .expect("validation");
        assert!(!outcome.is_valid);
        assert_eq!(outcome.failures[0].target, "/region");
    }

    #[tokio::test]
    async fn rejects_missing_target_and_cardinality_overflow() {
        let graph = seeded_graph().await;
        let groups = relation(
            RelationDirection::Out,
            "located_at",
            &["/site-a", "/ghost"],
        );
        let outcome = validate_relationships_by_ids(
            &template(),
            &groups,
            &RelationMap::default(),
            &graph,
        )
        .await
        .expect("validation");
        assert!(!outcome.is_valid);
        assert!(outcome
            .failures
            .iter()
            .any(|f| f.message.contains("single target")));
        assert!(outcome.failures.iter().any(|f| f.target == "/ghost"));
    }

    #[tokio::test]
    async fn device_relations_resolve_into_device_labels() {
        let graph = seeded_graph().await;
        let devices = relation(RelationDirection::In, "manages", &["gw1"]);
        let outcome = validate_relationships_by_ids(
            &template(),
            &RelationMap::default(),
            &devices,
            &graph,
        )
        .await
        .expect("validation");
        assert!(outcome.is_valid);
        assert_eq!(outcome.device_labels["gw1"], ["gateway"]);
    }

    #[tokio::test]
    async fn capacity_guard_blocks_occupied_single_relations() {
        let graph = seeded_graph().await;
        graph
            .add_vertex(VertexRecord {
                id: "d1".to_string(),
                labels: vec!["edgedevice".to_string()],
                attributes: BTreeMap::new(),
            })
            .await
            .expect("add vertex");
        graph
            .add_edge("d1", "located_at", RelationDirection::Out, "/site-a", true)
            .await
            .expect("add edge");

        // located_at is One and already holds /site-a.
        let err = ensure_relation_capacity(
            &template(),
            "d1",
            "located_at",
            RelationDirection::Out,
            &graph,
        )
        .await
        .expect_err("single relation is occupied");
        assert_eq!(err.code, "relation_validation_failed");

        // manages is Many; no amount of existing edges blocks it.
        ensure_relation_capacity(&template(), "d1", "manages", RelationDirection::In, &graph)
            .await
            .expect("many relation has no capacity limit");
    }

    #[tokio::test]
    async fn path_validation_is_permissive_by_default() {
        let graph = seeded_graph().await;
        let parents = relation(RelationDirection::Out, "anything_at_all", &["/region"]);
        let valid = validate_relationships_by_path(&template(), &parents, &graph, false)
            .await
            .expect("validation");
        assert!(valid);

        let valid = validate_relationships_by_path(&template(), &parents, &graph, true)
            .await
            .expect("validation");
        assert!(!valid);
    }
}
