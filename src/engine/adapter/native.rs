use std::{fmt::Debug, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value as Json};

use crate::{
    config::BaseUrl,
    core::{
        presentation_definition::PresentationDefinition,
        workflow::{native::StepNode, StepGraph, Workflow, WorkflowKind},
    },
};

use super::{
    wrong_workflow, AdapterError, BranchPredicate, InitiateContext, Initiation, NextStep,
    StepContext, StepOutcome, WorkflowAdapter,
};

/// Cryptographic verification of a submitted presentation.
///
/// Proof formats and suites are the implementor's concern. An `Err` means the verifier could
/// not reach a verdict and is treated as transient.
#[async_trait]
pub trait PresentationVerifier: Debug + Send + Sync {
    async fn verify(&self, payload: &Json, domain: &str) -> Result<Verification>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verification {
    Verified(VerifiedPresentation),
    /// The proof did not hold. `challenge` is the challenge found in the presentation, when it
    /// could be decoded far enough to read one.
    Rejected {
        reason: String,
        challenge: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedPresentation {
    /// The decoded presentation.
    pub presentation: Json,
    /// The challenge bound into the presentation's proof, if any.
    pub challenge: Option<String>,
}

/// Drives a self-hosted [StepGraph].
#[derive(Debug, Clone)]
pub struct NativeAdapter {
    verifier: Arc<dyn PresentationVerifier>,
    predicate: Arc<dyn BranchPredicate>,
}

impl NativeAdapter {
    pub fn new(
        verifier: Arc<dyn PresentationVerifier>,
        predicate: Arc<dyn BranchPredicate>,
    ) -> Self {
        Self {
            verifier,
            predicate,
        }
    }

    fn graph(workflow: &Workflow) -> Result<StepGraph, AdapterError> {
        let Workflow::Native(native) = workflow else {
            return Err(wrong_workflow(WorkflowKind::Native, workflow));
        };
        StepGraph::build(native).map_err(|e| AdapterError::Configuration(e.to_string()))
    }

    /// The first branch of `node` whose condition holds for `presentation`.
    fn resolve_branch<'g>(
        &self,
        node: &'g StepNode,
        presentation: &Json,
    ) -> Result<Option<&'g str>, AdapterError> {
        for branch in &node.branches {
            let selected = match &branch.when {
                None => true,
                Some(condition) => self
                    .predicate
                    .matches(condition, presentation)
                    .map_err(|e| AdapterError::Configuration(format!("{e:#}")))?,
            };
            if selected {
                return Ok(Some(&branch.target));
            }
        }
        Ok(None)
    }
}

/// The `domain` every native presentation must be bound to.
pub(crate) fn domain(base: &BaseUrl) -> &str {
    base.as_str().trim_end_matches('/')
}

fn presentation_request(node: &StepNode, challenge: Option<&str>, base: &BaseUrl) -> Json {
    let mut request = node
        .verifiable_presentation_request
        .clone()
        .unwrap_or_else(|| json!({}));
    if let Json::Object(fields) = &mut request {
        if let Some(challenge) = challenge {
            fields.insert("challenge".into(), challenge.into());
        }
        fields.insert("domain".into(), domain(base).into());
    }
    let definition =
        PresentationDefinition::from_request(&request, node.constraints_override.as_ref());

    json!({
        "verifiablePresentationRequest": request,
        "presentationDefinition": definition,
    })
}

#[async_trait]
impl WorkflowAdapter for NativeAdapter {
    async fn initiate(&self, ctx: InitiateContext<'_>) -> Result<Initiation, AdapterError> {
        let graph = Self::graph(&ctx.relying_party.workflow)?;
        let unreachable = graph.unreachable();
        if !unreachable.is_empty() {
            tracing::warn!(
                workflow = ctx.relying_party.workflow.id(),
                "workflow has unreachable steps: {unreachable:?}"
            );
        }

        let step = graph.initial();
        let node = graph
            .step(step)
            .ok_or_else(|| AdapterError::Configuration(format!("step `{step}` is not defined")))?;
        let challenge = node.create_challenge.then_some(ctx.challenge);

        Ok(Initiation {
            step: step.to_owned(),
            presentation_request: presentation_request(node, challenge, ctx.base),
            requires_challenge: node.create_challenge,
            backend_reference: None,
        })
    }

    async fn verify_and_consume(
        &self,
        ctx: StepContext<'_>,
        payload: &Json,
    ) -> Result<StepOutcome, AdapterError> {
        let graph = Self::graph(&ctx.relying_party.workflow)?;
        let current = &ctx.exchange.step;
        let node = graph.step(current).ok_or_else(|| {
            AdapterError::Configuration(format!("step `{current}` is not defined"))
        })?;

        let verification = self
            .verifier
            .verify(payload, domain(ctx.base))
            .await
            .map_err(AdapterError::Transport)?;

        // A stale challenge is reported as such even when the proof itself fails.
        if let Some(expected) = &ctx.exchange.challenge {
            let presented = match &verification {
                Verification::Verified(verified) => verified.challenge.as_deref(),
                Verification::Rejected { challenge: None, .. } => Some(expected.as_str()),
                Verification::Rejected { challenge, .. } => challenge.as_deref(),
            };
            if presented != Some(expected.as_str()) {
                return Err(AdapterError::ChallengeMismatch);
            }
        }

        let verified = match verification {
            Verification::Verified(verified) => verified,
            Verification::Rejected { reason, .. } => return Err(AdapterError::Rejected(reason)),
        };

        let next = match self.resolve_branch(node, &verified.presentation)? {
            None => None,
            Some(target) => {
                let next = graph.step(target).ok_or_else(|| {
                    AdapterError::Configuration(format!("step `{target}` is not defined"))
                })?;
                let challenge = next.create_challenge.then_some(ctx.next_challenge);
                Some(NextStep {
                    step: target.to_owned(),
                    presentation_request: presentation_request(next, challenge, ctx.base),
                    requires_challenge: next.create_challenge,
                })
            }
        };

        Ok(StepOutcome::Verified {
            presentation: verified.presentation,
            next,
        })
    }
}
