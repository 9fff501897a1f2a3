use std::{collections::HashMap, sync::Arc};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as Json};
use time::{Duration, OffsetDateTime};
use tokio::sync::Mutex;

use crate::core::{
    util::{form_request, json_request, json_response, AsyncHttpClient},
    workflow::{EntraWorkflow, Workflow, WorkflowKind},
};

use super::{
    wrong_workflow, AdapterError, InitiateContext, Initiation, StepContext, StepOutcome,
    WorkflowAdapter, REMOTE_STEP,
};

/// Scope granting access to the Verified ID request service.
pub const VERIFIED_ID_SCOPE: &str = "3db474b9-6a0c-4840-96ac-1fceb342124f/.default";

/// Path, relative to the service base, at which Entra delivers presentation callbacks.
pub const CALLBACK_PATH: &str = "callbacks/entra";

/// Tokens are refreshed this long before they expire.
const TOKEN_REFRESH_MARGIN: Duration = Duration::seconds(60);

/// Delegates exchanges to Microsoft Entra Verified ID.
///
/// The holder's wallet talks to Entra directly; Entra reports progress through callbacks,
/// which are handed to [verify_and_consume](WorkflowAdapter::verify_and_consume) as the
/// payload.
#[derive(Debug, Clone)]
pub struct EntraAdapter {
    client: Arc<dyn AsyncHttpClient + Send + Sync>,
    tokens: Arc<Mutex<HashMap<String, CachedToken>>>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: OffsetDateTime,
}

#[derive(Serialize)]
struct TokenRequest<'a> {
    client_id: &'a str,
    client_secret: &'a str,
    scope: &'a str,
    grant_type: &'a str,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedRequest {
    request_id: String,
    url: String,
    #[serde(default)]
    expiry: Option<i64>,
}

/// Body of an Entra presentation callback.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Callback {
    request_id: String,
    request_status: String,
    state: String,
    #[serde(default)]
    verified_credentials_data: Vec<VerifiedCredentialData>,
    #[serde(default)]
    error: Option<Json>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifiedCredentialData {
    issuer: String,
    #[serde(rename = "type")]
    types: Vec<String>,
    #[serde(default)]
    claims: Map<String, Json>,
}

impl EntraAdapter {
    pub fn new(client: Arc<dyn AsyncHttpClient + Send + Sync>) -> Self {
        Self {
            client,
            tokens: Default::default(),
        }
    }

    /// An access token for the workflow's tenant, fetched with the client credentials grant
    /// unless a cached one is still fresh.
    ///
    /// The cache lock is never held across the token request.
    async fn access_token(&self, workflow: &EntraWorkflow) -> Result<String> {
        let key = format!("{}/{}", workflow.api_tenant_id, workflow.api_client_id);
        let now = OffsetDateTime::now_utc();
        let cached = self
            .tokens
            .lock()
            .await
            .get(&key)
            .filter(|cached| cached.expires_at > now + TOKEN_REFRESH_MARGIN)
            .map(|cached| cached.access_token.clone());
        if let Some(token) = cached {
            return Ok(token);
        }

        let endpoint = workflow
            .api_login_base_url
            .join(&format!("{}/oauth2/v2.0/token", workflow.api_tenant_id))
            .context("unable to build token endpoint")?;
        let request = form_request(
            endpoint.as_str(),
            &TokenRequest {
                client_id: &workflow.api_client_id,
                client_secret: &workflow.api_client_secret,
                scope: VERIFIED_ID_SCOPE,
                grant_type: "client_credentials",
            },
        )?;
        let response = self.client.execute(request).await?;
        let token: TokenResponse =
            json_response(&response).context("unable to obtain access token")?;
        let expires_at = now
            .checked_add(Duration::seconds(token.expires_in))
            .with_context(|| format!("token lifetime of {}s is out of range", token.expires_in))?;

        self.tokens.lock().await.insert(
            key,
            CachedToken {
                access_token: token.access_token.clone(),
                expires_at,
            },
        );
        Ok(token.access_token)
    }

    async fn create_request(&self, workflow: &EntraWorkflow, body: &Json) -> Result<CreatedRequest> {
        let token = self.access_token(workflow).await?;
        let endpoint = workflow
            .api_base_url
            .join("verifiableCredentials/createPresentationRequest")
            .context("unable to build presentation request endpoint")?;
        let request = json_request("POST", endpoint.as_str(), &token, body)?;
        let response = self.client.execute(request).await?;
        json_response(&response).context("unable to create presentation request")
    }
}

fn workflow<'a>(workflow: &'a Workflow) -> Result<&'a EntraWorkflow, AdapterError> {
    match workflow {
        Workflow::MicrosoftEntraVerifiedId(w) => Ok(w),
        other => Err(wrong_workflow(WorkflowKind::MicrosoftEntraVerifiedId, other)),
    }
}

/// Present the credentials Entra verified in the shape of a verifiable presentation.
fn presentation(credentials: Vec<VerifiedCredentialData>) -> Json {
    let credentials: Vec<Json> = credentials
        .into_iter()
        .map(|credential| {
            json!({
                "type": credential.types,
                "issuer": credential.issuer,
                "credentialSubject": credential.claims,
            })
        })
        .collect();
    json!({
        "type": ["VerifiablePresentation"],
        "verifiableCredential": credentials,
    })
}

#[async_trait]
impl WorkflowAdapter for EntraAdapter {
    async fn initiate(&self, ctx: InitiateContext<'_>) -> Result<Initiation, AdapterError> {
        let workflow = workflow(&ctx.relying_party.workflow)?;
        let callback = ctx
            .base
            .join(CALLBACK_PATH)
            .map_err(|e| AdapterError::Configuration(format!("invalid callback url: {e}")))?;

        let mut requested = json!({
            "type": workflow.accepted_credential_type,
            "acceptedIssuers": workflow.accepted_credential_issuers,
            "configuration": {
                "validation": {
                    "allowRevoked": workflow.allow_revoked_credentials,
                    "validateLinkedDomain": workflow.validate_linked_domain,
                }
            }
        });
        if let Some(purpose) = &workflow.purpose {
            requested["purpose"] = purpose.as_str().into();
        }

        let body = json!({
            "authority": workflow.verifier_did,
            "includeQRCode": false,
            "includeReceipt": false,
            "registration": { "clientName": workflow.verifier_name },
            "callback": { "url": callback.as_str(), "state": ctx.challenge },
            "requestedCredentials": [requested],
        });

        let created = self
            .create_request(workflow, &body)
            .await
            .map_err(AdapterError::Transport)?;
        tracing::debug!(
            workflow = %workflow.id,
            exchange = %ctx.exchange_id,
            request_id = %created.request_id,
            "created Entra presentation request"
        );

        Ok(Initiation {
            step: REMOTE_STEP.to_owned(),
            presentation_request: json!({
                "url": created.url,
                "requestId": created.request_id,
                "expiry": created.expiry,
            }),
            requires_challenge: true,
            backend_reference: Some(created.request_id),
        })
    }

    async fn verify_and_consume(
        &self,
        ctx: StepContext<'_>,
        payload: &Json,
    ) -> Result<StepOutcome, AdapterError> {
        workflow(&ctx.relying_party.workflow)?;
        let callback = Callback::deserialize(payload)
            .map_err(|e| AdapterError::Rejected(format!("malformed callback: {e}")))?;

        if ctx.exchange.challenge.as_deref() != Some(callback.state.as_str()) {
            return Err(AdapterError::ChallengeMismatch);
        }
        if ctx.exchange.backend_reference.as_deref() != Some(callback.request_id.as_str()) {
            return Err(AdapterError::Rejected(format!(
                "callback is for request `{}`",
                callback.request_id
            )));
        }

        match callback.request_status.as_str() {
            "request_retrieved" => Ok(StepOutcome::Waiting),
            "presentation_verified" => Ok(StepOutcome::Verified {
                presentation: presentation(callback.verified_credentials_data),
                next: None,
            }),
            "presentation_error" => Err(AdapterError::Rejected(
                callback
                    .error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "presentation_error".into()),
            )),
            other => Err(AdapterError::Rejected(format!(
                "unrecognized request status `{other}`"
            ))),
        }
    }
}
