use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as Json;

use crate::config::BaseUrl;

pub use self::native::{BranchCondition, NativeWorkflow, Step, StepBranches, StepGraph};

pub mod native;

/// How an exchange's steps are driven, as configured for a relying party.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Workflow {
    /// A self-hosted step graph.
    #[serde(rename = "native")]
    Native(NativeWorkflow),
    /// A remote VC-API exchange service.
    #[serde(rename = "vc-api")]
    VcApi(VcApiWorkflow),
    /// Microsoft Entra Verified ID.
    #[serde(rename = "microsoft-entra-verified-id")]
    MicrosoftEntraVerifiedId(EntraWorkflow),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WorkflowKind {
    Native,
    VcApi,
    MicrosoftEntraVerifiedId,
}

impl Workflow {
    pub fn id(&self) -> &str {
        match self {
            Workflow::Native(w) => &w.id,
            Workflow::VcApi(w) => &w.id,
            Workflow::MicrosoftEntraVerifiedId(w) => &w.id,
        }
    }

    pub fn kind(&self) -> WorkflowKind {
        match self {
            Workflow::Native(_) => WorkflowKind::Native,
            Workflow::VcApi(_) => WorkflowKind::VcApi,
            Workflow::MicrosoftEntraVerifiedId(_) => WorkflowKind::MicrosoftEntraVerifiedId,
        }
    }
}

impl WorkflowKind {
    /// Whether the holder's client needs a session-scoped bearer token for subsequent step
    /// calls. Only natively driven exchanges are served by this service directly.
    pub fn issues_access_token(&self) -> bool {
        matches!(self, WorkflowKind::Native)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VcApiWorkflow {
    pub id: String,
    /// Exchanger endpoint of the remote VC-API service.
    pub base_url: BaseUrl,
    /// Bearer capability for the remote exchanger.
    pub capability: String,
    /// Authenticates the relying party to this service; never forwarded.
    #[serde(skip_serializing)]
    pub client_secret: String,
    #[serde(default)]
    pub create_challenge: bool,
    #[serde(default, deserialize_with = "embedded_json")]
    pub verifiable_presentation_request: Option<Json>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntraWorkflow {
    pub id: String,
    pub api_base_url: BaseUrl,
    pub api_login_base_url: BaseUrl,
    pub api_client_id: String,
    #[serde(skip_serializing)]
    pub api_client_secret: String,
    pub api_tenant_id: String,
    pub verifier_did: String,
    pub verifier_name: String,
    pub accepted_credential_type: String,
    #[serde(default)]
    pub accepted_credential_issuers: Vec<String>,
    #[serde(default)]
    pub validate_linked_domain: bool,
    #[serde(default)]
    pub allow_revoked_credentials: bool,
    /// Presentation purpose shown to the holder.
    #[serde(default)]
    pub purpose: Option<String>,
}

/// Accept a JSON document either inline or embedded in a string, as configuration files
/// commonly carry presentation requests as serialized JSON.
pub(crate) fn embedded_json<'de, D>(deserializer: D) -> Result<Option<Json>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Json>::deserialize(deserializer)? {
        None | Some(Json::Null) => Ok(None),
        Some(Json::String(s)) => serde_json::from_str(&s)
            .map(Some)
            .map_err(serde::de::Error::custom),
        Some(value) => Ok(Some(value)),
    }
}
