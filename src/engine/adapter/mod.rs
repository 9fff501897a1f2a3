//! Workflow backends behind one contract.
//!
//! An adapter never writes exchange state. The engine calls it with everything it needs up
//! front, then commits the outcome with a single conditional update.

use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;
use serde_json::Value as Json;
use uuid::Uuid;

use crate::{
    config::BaseUrl,
    core::{
        exchange::Exchange,
        relying_party::RelyingParty,
        util::AsyncHttpClient,
        workflow::{Workflow, WorkflowKind},
    },
};

pub use self::{
    branch::{BranchPredicate, FieldConstraintPredicate},
    entra::EntraAdapter,
    native::{NativeAdapter, PresentationVerifier, Verification, VerifiedPresentation},
    vc_api::VcApiAdapter,
};

pub mod branch;
pub mod entra;
pub mod native;
pub mod vc_api;

/// Name of the single step of remotely driven workflows.
pub const REMOTE_STEP: &str = "waiting";

/// Inputs for starting an exchange.
#[derive(Debug, Clone, Copy)]
pub struct InitiateContext<'a> {
    pub exchange_id: Uuid,
    pub relying_party: &'a RelyingParty,
    /// Challenge to embed if the first step requires one.
    pub challenge: &'a str,
    pub base: &'a BaseUrl,
    pub ttl: u64,
}

/// Inputs for verifying the current step of an exchange.
#[derive(Debug, Clone, Copy)]
pub struct StepContext<'a> {
    pub exchange: &'a Exchange,
    pub relying_party: &'a RelyingParty,
    /// Challenge to embed if the next step requires one.
    pub next_challenge: &'a str,
    pub base: &'a BaseUrl,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Initiation {
    pub step: String,
    pub presentation_request: Json,
    pub requires_challenge: bool,
    pub backend_reference: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The backend has not received a presentation yet.
    Waiting,
    Verified {
        presentation: Json,
        /// `None` when the workflow is finished.
        next: Option<NextStep>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct NextStep {
    pub step: String,
    pub presentation_request: Json,
    pub requires_challenge: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("presented challenge does not match")]
    ChallengeMismatch,
    /// The backend definitively refused the presentation.
    #[error("presentation rejected: {0}")]
    Rejected(String),
    #[error("backend unavailable: {0:#}")]
    Transport(anyhow::Error),
    #[error("{0}")]
    Configuration(String),
}

impl AdapterError {
    pub fn is_definitive(&self) -> bool {
        matches!(
            self,
            AdapterError::ChallengeMismatch | AdapterError::Rejected(_)
        )
    }
}

/// One implementation of the exchange contract per [WorkflowKind].
#[async_trait]
pub trait WorkflowAdapter: Debug + Send + Sync {
    /// Start an exchange. Remote backends are called, nothing is stored.
    async fn initiate(&self, ctx: InitiateContext<'_>) -> Result<Initiation, AdapterError>;

    /// Verify a presentation for the exchange's current step and resolve what follows.
    async fn verify_and_consume(
        &self,
        ctx: StepContext<'_>,
        payload: &Json,
    ) -> Result<StepOutcome, AdapterError>;
}

/// The adapters an engine dispatches to, selected by the relying party's workflow type.
#[derive(Debug)]
pub(crate) struct Adapters {
    native: Option<NativeAdapter>,
    vc_api: VcApiAdapter,
    entra: EntraAdapter,
}

impl Adapters {
    pub(crate) fn new(
        http_client: Arc<dyn AsyncHttpClient + Send + Sync>,
        native: Option<NativeAdapter>,
    ) -> Self {
        Self {
            native,
            vc_api: VcApiAdapter::new(http_client.clone()),
            entra: EntraAdapter::new(http_client),
        }
    }

    pub(crate) fn get(&self, kind: WorkflowKind) -> Option<&dyn WorkflowAdapter> {
        match kind {
            WorkflowKind::Native => self.native.as_ref().map(|a| a as &dyn WorkflowAdapter),
            WorkflowKind::VcApi => Some(&self.vc_api),
            WorkflowKind::MicrosoftEntraVerifiedId => Some(&self.entra),
        }
    }
}

pub(crate) fn wrong_workflow(expected: WorkflowKind, workflow: &Workflow) -> AdapterError {
    AdapterError::Configuration(format!(
        "expected a {expected:?} workflow, found {:?}",
        workflow.kind()
    ))
}
