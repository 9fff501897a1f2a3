use std::fmt::Debug;

use anyhow::{anyhow, Context, Result};
use jsonschema::JSONSchema;
use serde_json::Value as Json;
use serde_json_path::JsonPath;

use crate::core::{claims::credentials, workflow::BranchCondition};

/// Decides whether a verified presentation selects a branch of the step graph.
pub trait BranchPredicate: Debug + Send + Sync {
    fn matches(&self, condition: &BranchCondition, presentation: &Json) -> Result<bool>;
}

/// Evaluates a [BranchCondition] like a presentation-exchange constraint field: the branch
/// matches when any presented credential has a value at one of the paths that passes the
/// filter.
#[derive(Debug, Clone, Copy, Default)]
pub struct FieldConstraintPredicate;

impl BranchPredicate for FieldConstraintPredicate {
    fn matches(&self, condition: &BranchCondition, presentation: &Json) -> Result<bool> {
        let validator = condition
            .filter
            .as_ref()
            .map(|filter| {
                JSONSchema::compile(filter).map_err(|e| anyhow!("invalid branch filter: {e}"))
            })
            .transpose()?;
        let candidates = credentials(presentation);

        for path in condition.path.iter() {
            let expression =
                JsonPath::parse(path).with_context(|| format!("invalid branch path `{path}`"))?;
            for credential in &candidates {
                let found = expression.query(credential).all().into_iter().any(|value| {
                    validator
                        .as_ref()
                        .map_or(true, |validator| validator.is_valid(value))
                });
                if found {
                    return Ok(true);
                }
            }
        }

        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn condition(value: Json) -> BranchCondition {
        serde_json::from_value(value).unwrap()
    }

    fn license() -> Json {
        json!({
            "verifiableCredential": [{
                "type": ["VerifiableCredential", "Iso18013DriversLicenseCredential"],
                "credentialSubject": { "age_over_21": true }
            }]
        })
    }

    #[test]
    fn filter_selects_on_credential_type() {
        let when = condition(json!({
            "path": ["$.vc.type", "$.type"],
            "filter": { "type": "array", "contains": { "const": "Iso18013DriversLicenseCredential" } }
        }));
        assert!(FieldConstraintPredicate.matches(&when, &license()).unwrap());

        let other = condition(json!({
            "path": ["$.type"],
            "filter": { "type": "array", "contains": { "const": "EmployeeCredential" } }
        }));
        assert!(!FieldConstraintPredicate.matches(&other, &license()).unwrap());
    }

    #[test]
    fn path_without_filter_checks_presence() {
        let present = condition(json!({ "path": ["$.credentialSubject.age_over_21"] }));
        assert!(FieldConstraintPredicate.matches(&present, &license()).unwrap());
        let absent = condition(json!({ "path": ["$.credentialSubject.email"] }));
        assert!(!FieldConstraintPredicate.matches(&absent, &license()).unwrap());
    }

    #[test]
    fn invalid_path_is_an_error() {
        let broken = condition(json!({ "path": ["$["] }));
        assert!(FieldConstraintPredicate.matches(&broken, &license()).is_err());
    }
}
