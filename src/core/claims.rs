//! Extraction of id_token claims and audit fields from a verified presentation.
//!
//! Rule paths are either JSONPath expressions (starting with `$`) evaluated against each
//! presented credential, or dotted paths relative to the credential's `credentialSubject`.
//! Extraction never mutates the payload.

use serde_json::{Map, Number, Value as Json};
use serde_json_path::JsonPath;
use time::{
    format_description::well_known::Rfc3339, macros::format_description, Date, OffsetDateTime,
};

use super::relying_party::{AuditField, AuditFieldType, ClaimRule};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClaimError {
    #[error("claim `{rule}` has no value at `{path}`")]
    MissingClaim { rule: String, path: String },
    #[error("claim `{rule}` at `{path}` is not a valid {expected:?} value")]
    TypeMismatch {
        rule: String,
        path: String,
        expected: AuditFieldType,
    },
    #[error("claim `{rule}` has an invalid path `{path}`: {reason}")]
    InvalidPath {
        rule: String,
        path: String,
        reason: String,
    },
}

impl ClaimError {
    pub fn rule(&self) -> &str {
        match self {
            ClaimError::MissingClaim { rule, .. }
            | ClaimError::TypeMismatch { rule, .. }
            | ClaimError::InvalidPath { rule, .. } => rule,
        }
    }
}

/// The result of running a relying party's rules over one presentation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    /// id_token claims keyed by [ClaimRule::name].
    pub claims: Map<String, Json>,
    /// Audit values keyed by [AuditField::id].
    pub audit: Map<String, Json>,
    /// Id_token claims that could not be extracted from this presentation. They may still be
    /// supplied by another step of the exchange.
    pub missing_claims: Vec<ClaimError>,
    /// Audit fields that could not be extracted. Reported only.
    pub missing_audit: Vec<ClaimError>,
}

pub fn extract(payload: &Json, claims: &[ClaimRule], audit_fields: &[AuditField]) -> Extraction {
    let credentials = credentials(payload);
    let mut extraction = Extraction::default();

    for rule in claims {
        match find(&credentials, &rule.name, &rule.path) {
            Ok(value) => {
                extraction.claims.insert(rule.name.clone(), value.clone());
            }
            Err(e) => extraction.missing_claims.push(e),
        }
    }

    for field in audit_fields {
        let typed = find(&credentials, &field.id, &field.path)
            .and_then(|value| coerce(field, value));
        match typed {
            Ok(value) => {
                extraction.audit.insert(field.id.clone(), value);
            }
            Err(e) => {
                if field.required {
                    tracing::debug!("required audit field missing: {e}");
                }
                extraction.missing_audit.push(e)
            }
        }
    }

    extraction
}

/// The credentials of a presentation, or the payload itself when it is not a presentation.
pub(crate) fn credentials(payload: &Json) -> Vec<&Json> {
    let embedded = payload
        .get("verifiableCredential")
        .or_else(|| payload.pointer("/vp/verifiableCredential"));
    match embedded {
        Some(Json::Array(items)) => items.iter().filter(|c| c.is_object()).collect(),
        Some(credential @ Json::Object(_)) => vec![credential],
        Some(_) => vec![],
        None => vec![payload],
    }
}

fn compile(rule: &str, path: &str) -> Result<JsonPath, ClaimError> {
    let expression = if path.starts_with('$') {
        path.to_owned()
    } else {
        path.split('.')
            .filter(|segment| !segment.is_empty())
            .fold("$.credentialSubject".to_owned(), |acc, segment| {
                format!("{acc}['{}']", segment.replace('\\', "\\\\").replace('\'', "\\'"))
            })
    };
    JsonPath::parse(&expression).map_err(|e| ClaimError::InvalidPath {
        rule: rule.to_owned(),
        path: path.to_owned(),
        reason: e.to_string(),
    })
}

fn find<'a>(credentials: &[&'a Json], rule: &str, path: &str) -> Result<&'a Json, ClaimError> {
    let expression = compile(rule, path)?;
    credentials
        .iter()
        .find_map(|&credential| {
            expression
                .query(credential)
                .first()
                .filter(|value| !value.is_null())
        })
        .ok_or_else(|| ClaimError::MissingClaim {
            rule: rule.to_owned(),
            path: path.to_owned(),
        })
}

fn coerce(field: &AuditField, value: &Json) -> Result<Json, ClaimError> {
    let mismatch = || ClaimError::TypeMismatch {
        rule: field.id.clone(),
        path: field.path.clone(),
        expected: field.field_type,
    };

    match (field.field_type, value) {
        (AuditFieldType::Text, Json::String(_)) => Ok(value.clone()),
        (AuditFieldType::Text, Json::Number(n)) => Ok(Json::String(n.to_string())),
        (AuditFieldType::Text, Json::Bool(b)) => Ok(Json::String(b.to_string())),
        (AuditFieldType::Number, Json::Number(_)) => Ok(value.clone()),
        (AuditFieldType::Number, Json::String(s)) => {
            let s = s.trim();
            if let Ok(i) = s.parse::<i64>() {
                return Ok(Json::Number(i.into()));
            }
            s.parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Json::Number)
                .ok_or_else(mismatch)
        }
        (AuditFieldType::Date, Json::String(s)) => {
            let calendar = format_description!("[year]-[month]-[day]");
            if Date::parse(s, &calendar).is_ok() || OffsetDateTime::parse(s, &Rfc3339).is_ok() {
                Ok(value.clone())
            } else {
                Err(mismatch())
            }
        }
        _ => Err(mismatch()),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn presentation() -> Json {
        json!({
            "type": ["VerifiablePresentation"],
            "verifiableCredential": [{
                "type": ["VerifiableCredential", "Iso18013DriversLicenseCredential"],
                "issuer": "did:web:dmv.example.gov",
                "credentialSubject": {
                    "id": "did:example:holder",
                    "driversLicense": {
                        "document_number": "542426814",
                        "birth_date": "1998-08-28",
                        "height": "170",
                        "family name": "TURNER"
                    }
                }
            }]
        })
    }

    fn claim(name: &str, path: &str) -> ClaimRule {
        ClaimRule {
            name: name.into(),
            path: path.into(),
        }
    }

    fn audit(id: &str, path: &str, field_type: AuditFieldType, required: bool) -> AuditField {
        AuditField {
            id: id.into(),
            name: id.into(),
            path: path.into(),
            field_type,
            required,
        }
    }

    #[test]
    fn dotted_and_jsonpath_rules() {
        let payload = presentation();
        let extraction = extract(
            &payload,
            &[
                claim("dl_number", "driversLicense.document_number"),
                claim("issuer", "$.issuer"),
                claim("family_name", "driversLicense.family name"),
            ],
            &[],
        );
        assert!(extraction.missing_claims.is_empty());
        assert_eq!(extraction.claims["dl_number"], "542426814");
        assert_eq!(extraction.claims["issuer"], "did:web:dmv.example.gov");
        assert_eq!(extraction.claims["family_name"], "TURNER");
    }

    #[test]
    fn extracted_value_is_unchanged() {
        let payload = json!({ "credentialSubject": { "nested": { "value": [1, {"a": true}] } } });
        let before = payload.clone();
        let extraction = extract(&payload, &[claim("v", "nested.value")], &[]);
        assert_eq!(extraction.claims["v"], json!([1, {"a": true}]));
        assert_eq!(payload, before);
    }

    #[test]
    fn missing_required_claim_is_reported() {
        let payload = presentation();
        let extraction = extract(&payload, &[claim("email", "email")], &[]);
        assert!(!extraction.missing_claims.is_empty());
        assert_eq!(
            extraction.missing_claims,
            vec![ClaimError::MissingClaim {
                rule: "email".into(),
                path: "email".into()
            }]
        );
        assert_eq!(payload, presentation());
    }

    #[test]
    fn audit_fields_are_typed_and_partial() {
        let payload = presentation();
        let extraction = extract(
            &payload,
            &[],
            &[
                audit("birth_date", "driversLicense.birth_date", AuditFieldType::Date, true),
                audit("height", "driversLicense.height", AuditFieldType::Number, false),
                audit("number", "driversLicense.document_number", AuditFieldType::Text, true),
                audit("bad_date", "driversLicense.document_number", AuditFieldType::Date, false),
                audit("absent", "driversLicense.eye_color", AuditFieldType::Text, false),
            ],
        );
        assert!(extraction.missing_claims.is_empty());
        assert_eq!(extraction.audit["birth_date"], "1998-08-28");
        assert_eq!(extraction.audit["height"], 170);
        assert_eq!(extraction.audit["number"], "542426814");
        let missing: Vec<&str> = extraction.missing_audit.iter().map(ClaimError::rule).collect();
        assert_eq!(missing, ["bad_date", "absent"]);
    }

    #[test]
    fn invalid_jsonpath_is_reported() {
        let payload = presentation();
        let extraction = extract(&payload, &[claim("broken", "$[")], &[]);
        assert!(matches!(
            extraction.missing_claims[0],
            ClaimError::InvalidPath { .. }
        ));
    }
}
