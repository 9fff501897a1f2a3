use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};
use uuid::Uuid;

use crate::utils::NonEmptyVec;

const BASE_CREDENTIAL_TYPE: &str = "VerifiableCredential";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresentationDefinition {
    pub id: String,
    pub input_descriptors: Vec<InputDescriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct InputDescriptor {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,
    /// Either typed [Constraints] or a verbatim override from the workflow step.
    pub constraints: Json,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Constraints {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<ConstraintsField>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_disclosure: Option<ConstraintsLimitDisclosure>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConstraintsField {
    pub path: NonEmptyVec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<Json>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub optional: Option<bool>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConstraintsLimitDisclosure {
    Required,
    Preferred,
}

impl PresentationDefinition {
    /// Derive a presentation definition from a VC-API `QueryByExample` presentation request.
    ///
    /// Every credential query becomes one input descriptor constrained on the example's
    /// credential types. When `constraints_override` is set it replaces the constraints of
    /// every descriptor.
    pub fn from_request(request: &Json, constraints_override: Option<&Json>) -> Self {
        let input_descriptors = credential_queries(request)
            .into_iter()
            .map(|query| {
                let constraints = match constraints_override {
                    Some(constraints) => constraints.clone(),
                    None => json!(type_constraints(query)),
                };
                InputDescriptor {
                    id: Uuid::new_v4().to_string(),
                    name: None,
                    purpose: query
                        .get("reason")
                        .and_then(Json::as_str)
                        .map(ToOwned::to_owned),
                    constraints,
                }
            })
            .collect();

        Self {
            id: Uuid::new_v4().to_string(),
            input_descriptors,
            name: None,
            purpose: None,
        }
    }
}

/// `query` and `credentialQuery` may each be a single object or an array.
fn credential_queries(request: &Json) -> Vec<&Json> {
    fn one_or_many(value: &Json) -> Vec<&Json> {
        match value {
            Json::Array(items) => items.iter().collect(),
            Json::Null => vec![],
            item => vec![item],
        }
    }

    request
        .get("query")
        .map(one_or_many)
        .unwrap_or_default()
        .into_iter()
        .filter(|query| {
            query
                .get("type")
                .and_then(Json::as_str)
                .map_or(true, |t| t == "QueryByExample")
        })
        .flat_map(|query| {
            query
                .get("credentialQuery")
                .map(one_or_many)
                .unwrap_or_default()
        })
        .collect()
}

fn type_constraints(query: &Json) -> Constraints {
    let types: Vec<&str> = match query.pointer("/example/type") {
        Some(Json::String(t)) => vec![t.as_str()],
        Some(Json::Array(ts)) => ts.iter().filter_map(Json::as_str).collect(),
        _ => vec![],
    };

    let fields: Vec<ConstraintsField> = types
        .into_iter()
        .filter(|t| *t != BASE_CREDENTIAL_TYPE)
        .map(|t| {
            let mut path = NonEmptyVec::new("$.type".to_owned());
            path.push("$.vc.type".to_owned());
            ConstraintsField {
                path,
                filter: Some(json!({
                    "type": "array",
                    "contains": { "type": "string", "const": t }
                })),
                optional: None,
            }
        })
        .collect();

    Constraints {
        fields: (!fields.is_empty()).then_some(fields),
        limit_disclosure: None,
    }
}
