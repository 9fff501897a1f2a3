use serde::{Deserialize, Serialize};

use super::workflow::Workflow;

const DEFAULT_ID_TOKEN_EXPIRY_SECONDS: u64 = 3600;

/// A relying party (connected application) and the workflow that verifies its users.
///
/// Read-only at exchange time.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelyingParty {
    pub client_id: String,
    pub workflow: Workflow,
    /// Claims to extract into the id_token.
    #[serde(default)]
    pub claims: Vec<ClaimRule>,
    /// Fields to retain for audit purposes.
    #[serde(default)]
    pub audit_fields: Vec<AuditField>,
    #[serde(default = "default_id_token_expiry")]
    pub id_token_expiry_seconds: u64,
}

fn default_id_token_expiry() -> u64 {
    DEFAULT_ID_TOKEN_EXPIRY_SECONDS
}

/// Maps a location in the presented credential onto an id_token property.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClaimRule {
    /// id_token property destination.
    pub name: String,
    /// JSONPath (when starting with `$`) or a dotted path from `credentialSubject`.
    pub path: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditField {
    pub id: String,
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub field_type: AuditFieldType,
    #[serde(default)]
    pub required: bool,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuditFieldType {
    Text,
    Number,
    Date,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_configured_relying_party() {
        let rp: RelyingParty = serde_path_to_error::deserialize(json!({
            "clientId": "dmv",
            "workflow": {
                "type": "native",
                "id": "z1A32xJZGqBeAEcMq5bxRY",
                "initialStep": "waiting",
                "steps": {
                    "waiting": {
                        "createChallenge": true,
                        "verifiablePresentationRequest": "{\"query\":{\"type\":\"QueryByExample\"}}"
                    }
                }
            },
            "claims": [{ "name": "dl_number", "path": "driversLicense.document_number" }],
            "auditFields": [{
                "type": "date",
                "id": "birth_date",
                "name": "Date of Birth",
                "path": "$.credentialSubject.birthDate",
                "required": true
            }]
        }))
        .map_err(|e| e.path().to_string())
        .unwrap();

        assert_eq!(rp.id_token_expiry_seconds, 3600);
        assert_eq!(rp.workflow.id(), "z1A32xJZGqBeAEcMq5bxRY");
        assert_eq!(rp.audit_fields[0].field_type, AuditFieldType::Date);
    }
}
