use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use http::header::LOCATION;
use serde_json::{json, Map, Value as Json};
use url::Url;

use crate::core::{
    util::{base_request, json_request, json_response, AsyncHttpClient},
    workflow::{VcApiWorkflow, Workflow, WorkflowKind},
};

use super::{
    wrong_workflow, AdapterError, InitiateContext, Initiation, StepContext, StepOutcome,
    WorkflowAdapter, REMOTE_STEP,
};

/// Delegates exchanges to a remote VC-API exchanger, authenticating with the workflow's
/// capability. Progress is observed by polling the remote exchange.
#[derive(Debug, Clone)]
pub struct VcApiAdapter {
    client: Arc<dyn AsyncHttpClient + Send + Sync>,
}

impl VcApiAdapter {
    pub fn new(client: Arc<dyn AsyncHttpClient + Send + Sync>) -> Self {
        Self { client }
    }

    async fn create_remote(
        &self,
        workflow: &VcApiWorkflow,
        body: &Json,
    ) -> anyhow::Result<Url> {
        let endpoint = workflow
            .base_url
            .join("exchanges")
            .context("unable to build exchanges endpoint")?;
        let request = json_request("POST", endpoint.as_str(), &workflow.capability, body)?;
        let response = self.client.execute(request).await?;

        let status = response.status();
        if !status.is_success() {
            let body = String::from_utf8_lossy(response.body());
            bail!("exchange creation was unsuccessful (status: {status}): {body}")
        }

        if let Some(location) = response.headers().get(LOCATION) {
            let location = location.to_str().context("invalid Location header")?;
            return endpoint
                .join(location)
                .context("invalid remote exchange location");
        }

        let created: Json = json_response(&response)?;
        let id = created
            .get("id")
            .and_then(Json::as_str)
            .ok_or_else(|| anyhow!("response carries neither a Location header nor an id"))?;
        match Url::parse(id) {
            Ok(location) => Ok(location),
            Err(_) => workflow
                .base_url
                .join(&format!("exchanges/{id}"))
                .context("invalid remote exchange id"),
        }
    }

    async fn fetch_remote(&self, workflow: &VcApiWorkflow, location: &str) -> anyhow::Result<Json> {
        let request = base_request()
            .method("GET")
            .uri(location)
            .header(
                http::header::AUTHORIZATION,
                format!("Bearer {}", workflow.capability),
            )
            .body(Vec::new())
            .context("unable to construct request")?;
        let response = self.client.execute(request).await?;
        json_response(&response)
    }
}

fn workflow<'a>(workflow: &'a Workflow) -> Result<&'a VcApiWorkflow, AdapterError> {
    match workflow {
        Workflow::VcApi(w) => Ok(w),
        other => Err(wrong_workflow(WorkflowKind::VcApi, other)),
    }
}

/// The first presentation recorded in the remote exchange's results.
fn remote_presentation(exchange: &Json) -> Option<&Json> {
    exchange
        .pointer("/variables/results")?
        .as_object()?
        .values()
        .find_map(|result| result.get("verifiablePresentation"))
}

fn proof_challenge(presentation: &Json) -> Option<&str> {
    match presentation.get("proof")? {
        Json::Array(proofs) => proofs
            .iter()
            .find_map(|proof| proof.get("challenge").and_then(Json::as_str)),
        proof => proof.get("challenge").and_then(Json::as_str),
    }
}

#[async_trait]
impl WorkflowAdapter for VcApiAdapter {
    async fn initiate(&self, ctx: InitiateContext<'_>) -> Result<Initiation, AdapterError> {
        let workflow = workflow(&ctx.relying_party.workflow)?;

        let mut variables = Map::new();
        if workflow.create_challenge {
            variables.insert("challenge".into(), ctx.challenge.into());
        }
        if let Some(request) = &workflow.verifiable_presentation_request {
            variables.insert("verifiablePresentationRequest".into(), request.clone());
        }
        let body = json!({ "ttl": ctx.ttl, "variables": variables });

        let location = self
            .create_remote(workflow, &body)
            .await
            .map_err(AdapterError::Transport)?;
        tracing::debug!(
            workflow = %workflow.id,
            exchange = %ctx.exchange_id,
            "created remote exchange at {location}"
        );

        Ok(Initiation {
            step: REMOTE_STEP.to_owned(),
            presentation_request: json!({
                "exchangeUrl": location.as_str(),
                "protocols": { "vcapi": location.as_str() },
            }),
            requires_challenge: workflow.create_challenge,
            backend_reference: Some(location.into()),
        })
    }

    async fn verify_and_consume(
        &self,
        ctx: StepContext<'_>,
        _payload: &Json,
    ) -> Result<StepOutcome, AdapterError> {
        let workflow = workflow(&ctx.relying_party.workflow)?;
        let Some(location) = &ctx.exchange.backend_reference else {
            return Err(AdapterError::Configuration(
                "exchange has no remote location".into(),
            ));
        };

        let body = self
            .fetch_remote(workflow, location)
            .await
            .map_err(AdapterError::Transport)?;
        let remote = body.get("exchange").unwrap_or(&body);
        let state = remote.get("state").and_then(Json::as_str).unwrap_or_default();

        match state {
            "pending" | "active" => Ok(StepOutcome::Waiting),
            "complete" => {
                let presentation = remote_presentation(remote).ok_or_else(|| {
                    AdapterError::Rejected("remote exchange completed without a presentation".into())
                })?;
                if let Some(expected) = &ctx.exchange.challenge {
                    if proof_challenge(presentation) != Some(expected.as_str()) {
                        return Err(AdapterError::ChallengeMismatch);
                    }
                }
                Ok(StepOutcome::Verified {
                    presentation: presentation.clone(),
                    next: None,
                })
            }
            "invalid" | "failed" => Err(AdapterError::Rejected(format!(
                "remote exchange is {state}"
            ))),
            other => Err(AdapterError::Transport(anyhow!(
                "unrecognized remote exchange state `{other}`"
            ))),
        }
    }
}
