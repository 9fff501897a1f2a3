use std::{collections::BTreeMap, future::Future, sync::Arc};

use anyhow::{anyhow, bail, Result};
use serde_json::{Map, Value as Json};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    config::{Config, FailurePolicy},
    core::{
        challenge::{ChallengeGenerator, RandomChallenge},
        claims,
        exchange::{Audience, Exchange, ExchangeState, ExchangeView, StepResult, Variables},
        relying_party::RelyingParty,
        util::{AsyncHttpClient, ReqwestClient},
        workflow::WorkflowKind,
    },
    error::ExchangeError,
};

use adapter::{
    AdapterError, Adapters, BranchPredicate, FieldConstraintPredicate, InitiateContext,
    NativeAdapter, PresentationVerifier, StepContext, StepOutcome, WorkflowAdapter,
};
use session::{SessionStore, StoreError};

pub mod adapter;
pub mod session;

/// Reason recorded on exchanges that outlived their TTL.
pub const EXPIRED_REASON: &str = "expired";

const INVALIDATE_ATTEMPTS: usize = 3;

/// Drives exchanges through their relying party's workflow.
///
/// The engine keeps no exchange state of its own: every read and write goes through the
/// [SessionStore], so any number of engines may serve the same exchanges.
#[derive(Debug, Clone)]
pub struct Engine {
    config: Arc<Config>,
    relying_parties: Arc<BTreeMap<String, RelyingParty>>,
    /// Workflow id to client id.
    workflows: Arc<BTreeMap<String, String>>,
    session_store: Arc<dyn SessionStore + Send + Sync>,
    adapters: Arc<Adapters>,
    challenges: Arc<dyn ChallengeGenerator + Send + Sync>,
}

/// A newly created exchange, as returned to the relying party.
#[derive(Debug, Clone, PartialEq)]
pub struct CreatedExchange {
    pub id: Uuid,
    pub sequence: u64,
    pub step: String,
    pub challenge: Option<String>,
    /// Session-scoped bearer token for the holder's client, for natively driven workflows.
    pub access_token: Option<String>,
    pub presentation_request: Json,
}

/// Claims to issue in the relying party's id_token once an exchange completes.
#[derive(Debug, Clone, PartialEq)]
pub struct IdTokenClaims {
    pub claims: Map<String, Json>,
    pub expires_in: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AdvanceOutcome {
    /// The step was verified and the exchange moved on to another step.
    Next { exchange: ExchangeView },
    /// The last step was verified.
    Complete {
        exchange: ExchangeView,
        claims: IdTokenClaims,
    },
    /// A remote backend has nothing to report yet. Nothing was written.
    Waiting { exchange: ExchangeView },
}

impl Engine {
    /// Build a new engine.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    /// Start an exchange for the relying party identified by `client_id`.
    ///
    /// The workflow backend is contacted before anything is stored: if it fails, no exchange
    /// exists afterwards.
    pub async fn create_exchange(&self, client_id: &str) -> Result<CreatedExchange, ExchangeError> {
        let relying_party =
            self.relying_parties
                .get(client_id)
                .ok_or_else(|| ExchangeError::ConfigurationError {
                    workflow: client_id.to_owned(),
                    reason: "no relying party is registered under this client id".into(),
                })?;
        let workflow_id = relying_party.workflow.id();
        let kind = relying_party.workflow.kind();
        let adapter = self.adapter(workflow_id, kind)?;

        let id = Uuid::new_v4();
        let challenge = self.challenges.generate();
        let ttl = self.config.exchange_ttl_seconds;

        let initiation = self
            .bounded(adapter.initiate(InitiateContext {
                exchange_id: id,
                relying_party,
                challenge: &challenge,
                base: &self.config.base,
                ttl,
            }))
            .await
            .map_err(|e| match e {
                AdapterError::Configuration(reason) => ExchangeError::ConfigurationError {
                    workflow: workflow_id.to_owned(),
                    reason,
                },
                e => ExchangeError::VerificationFailed {
                    id,
                    step: String::new(),
                    reason: format!("{e:#}"),
                },
            })?;

        let now = OffsetDateTime::now_utc();
        let exchange = Exchange {
            id,
            sequence: 0,
            ttl,
            created_at: now,
            updated_at: now,
            state: ExchangeState::Pending,
            step: initiation.step,
            variables: Variables::default(),
            challenge: initiation.requires_challenge.then_some(challenge),
            workflow_id: workflow_id.to_owned(),
            access_token: kind
                .issues_access_token()
                .then(|| self.challenges.generate()),
            presentation_request: initiation.presentation_request,
            backend_reference: initiation.backend_reference,
            reason: None,
        };

        self.session_store
            .create(exchange.clone())
            .await
            .map_err(|e| store_error(e, id, 0))?;
        tracing::info!(exchange = %id, workflow = workflow_id, step = %exchange.step, "exchange created");

        Ok(CreatedExchange {
            id,
            sequence: exchange.sequence,
            step: exchange.step,
            challenge: exchange.challenge,
            access_token: exchange.access_token,
            presentation_request: exchange.presentation_request,
        })
    }

    /// The current state of an exchange, as visible to `audience`.
    ///
    /// An exchange past its TTL is reported as [Expired](ExchangeError::Expired). If it was
    /// still pending it is closed as `invalid` on the way.
    pub async fn get_exchange(
        &self,
        id: Uuid,
        audience: Audience,
    ) -> Result<ExchangeView, ExchangeError> {
        let exchange = self.load(id).await?;
        if exchange.is_expired() {
            self.expire(&exchange).await;
            return Err(ExchangeError::Expired { id });
        }
        Ok(exchange.view(audience))
    }

    /// Submit a presentation for the exchange's current step.
    ///
    /// Every backend call happens against the state observed at `expected_sequence`; the
    /// resulting transition is then committed with one conditional update, so concurrent
    /// callers observing the same sequence cannot both succeed.
    pub async fn advance(
        &self,
        id: Uuid,
        expected_sequence: u64,
        payload: &Json,
    ) -> Result<AdvanceOutcome, ExchangeError> {
        let exchange = self.load(id).await?;

        if exchange.state.is_terminal() {
            return Err(ExchangeError::InvalidState {
                id,
                state: exchange.state,
                operation: "advance",
            });
        }
        if exchange.is_expired() {
            self.expire(&exchange).await;
            return Err(ExchangeError::Expired { id });
        }
        if exchange.sequence != expected_sequence {
            return Err(ExchangeError::Conflict {
                id,
                expected: expected_sequence,
            });
        }
        if exchange.variables.contains(&exchange.step) {
            return Err(ExchangeError::InvalidState {
                id,
                state: exchange.state,
                operation: "revisit step",
            });
        }

        let relying_party = match self.relying_party_for(&exchange.workflow_id) {
            Ok(relying_party) => relying_party,
            Err(e) => {
                self.terminalize(&exchange, e.to_string()).await;
                return Err(e);
            }
        };
        let adapter = self.adapter(&exchange.workflow_id, relying_party.workflow.kind())?;

        let next_challenge = self.challenges.generate();
        let outcome = self
            .bounded(adapter.verify_and_consume(
                StepContext {
                    exchange: &exchange,
                    relying_party,
                    next_challenge: &next_challenge,
                    base: &self.config.base,
                },
                payload,
            ))
            .await;

        let (presentation, next) = match outcome {
            Ok(StepOutcome::Waiting) => {
                tracing::debug!(exchange = %id, step = %exchange.step, "backend is still waiting");
                return Ok(AdvanceOutcome::Waiting {
                    exchange: exchange.view(Audience::Public),
                });
            }
            Ok(StepOutcome::Verified { presentation, next }) => (presentation, next),
            Err(e) => return Err(self.adapter_failure(&exchange, e).await),
        };

        let extraction = claims::extract(
            &presentation,
            &relying_party.claims,
            &relying_party.audit_fields,
        );
        for missing in &extraction.missing_audit {
            tracing::debug!(exchange = %id, "audit field not recorded: {missing}");
        }

        let mut variables = exchange.variables.clone();
        variables
            .insert(StepResult {
                step: exchange.step.clone(),
                presentation,
                claims: extraction.claims,
                audit: extraction.audit,
                missing: extraction
                    .missing_claims
                    .iter()
                    .chain(&extraction.missing_audit)
                    .map(|e| e.rule().to_owned())
                    .collect(),
                completed_at: OffsetDateTime::now_utc(),
            })
            .map_err(|_| ExchangeError::InvalidState {
                id,
                state: exchange.state,
                operation: "revisit step",
            })?;

        match next {
            Some(next) => {
                if variables.contains(&next.step) {
                    return Err(ExchangeError::InvalidState {
                        id,
                        state: exchange.state,
                        operation: "revisit step",
                    });
                }
                let challenge = next.requires_challenge.then_some(next_challenge);
                let committed = self
                    .commit(&exchange, move |e| {
                        e.step = next.step;
                        e.challenge = challenge;
                        e.presentation_request = next.presentation_request;
                        e.variables = variables;
                    })
                    .await?;
                tracing::info!(
                    exchange = %id,
                    from = %exchange.step,
                    to = %committed.step,
                    "exchange advanced"
                );
                Ok(AdvanceOutcome::Next {
                    exchange: committed.view(Audience::Public),
                })
            }
            None => {
                // Claims may be gathered over several steps; all must be present at the end.
                let claims = variables.claims();
                let missing: Vec<_> = extraction
                    .missing_claims
                    .into_iter()
                    .filter(|e| !claims.contains_key(e.rule()))
                    .collect();
                if !missing.is_empty() {
                    return Err(ExchangeError::IncompleteClaims {
                        id,
                        step: exchange.step.clone(),
                        missing,
                    });
                }
                let claims = IdTokenClaims {
                    claims,
                    expires_in: relying_party.id_token_expiry_seconds,
                };
                let committed = self
                    .commit(&exchange, move |e| {
                        e.state = ExchangeState::Complete;
                        e.challenge = None;
                        e.variables = variables;
                    })
                    .await?;
                tracing::info!(exchange = %id, step = %exchange.step, "exchange complete");
                Ok(AdvanceOutcome::Complete {
                    exchange: committed.view(Audience::Public),
                    claims,
                })
            }
        }
    }

    /// Close a pending exchange as `invalid`.
    ///
    /// Invalidating an `invalid` exchange is a no-op; a `complete` exchange cannot be
    /// invalidated.
    pub async fn invalidate(&self, id: Uuid, reason: &str) -> Result<ExchangeView, ExchangeError> {
        for _ in 0..INVALIDATE_ATTEMPTS {
            let exchange = self.load(id).await?;
            match exchange.state {
                ExchangeState::Invalid => return Ok(exchange.view(Audience::RelyingParty)),
                ExchangeState::Complete => {
                    return Err(ExchangeError::InvalidState {
                        id,
                        state: exchange.state,
                        operation: "invalidate",
                    })
                }
                ExchangeState::Pending => {}
            }

            let reason = reason.to_owned();
            match self
                .session_store
                .conditional_update(id, exchange.sequence, invalidation(reason))
                .await
            {
                Ok(committed) => {
                    tracing::info!(exchange = %id, "exchange invalidated");
                    return Ok(committed.view(Audience::RelyingParty));
                }
                // Someone else wrote in between; look again.
                Err(StoreError::Conflict { .. }) => continue,
                Err(e) => return Err(store_error(e, id, exchange.sequence)),
            }
        }

        Err(ExchangeError::Conflict {
            id,
            expected: self.load(id).await?.sequence,
        })
    }

    async fn load(&self, id: Uuid) -> Result<Exchange, ExchangeError> {
        self.session_store
            .get(id)
            .await
            .map_err(|e| store_error(e, id, 0))
    }

    async fn commit(
        &self,
        exchange: &Exchange,
        mutator: impl FnOnce(&mut Exchange) + Send + 'static,
    ) -> Result<Exchange, ExchangeError> {
        self.session_store
            .conditional_update(exchange.id, exchange.sequence, Box::new(mutator))
            .await
            .map_err(|e| store_error(e, exchange.id, exchange.sequence))
    }

    async fn expire(&self, exchange: &Exchange) {
        if exchange.state == ExchangeState::Pending {
            tracing::info!(exchange = %exchange.id, "exchange expired");
            self.terminalize(exchange, EXPIRED_REASON.to_owned()).await;
        }
    }

    /// Close an exchange as `invalid`, conditioned on the sequence it was observed at.
    ///
    /// Losing the race means another writer already moved the exchange on, which is fine.
    async fn terminalize(&self, exchange: &Exchange, reason: String) {
        let result = self
            .session_store
            .conditional_update(exchange.id, exchange.sequence, invalidation(reason))
            .await;
        match result {
            Ok(_) => {}
            Err(StoreError::Conflict { .. } | StoreError::NotFound(_)) => {
                tracing::debug!(exchange = %exchange.id, "exchange was closed concurrently")
            }
            Err(e) => tracing::warn!(exchange = %exchange.id, "failed to close exchange: {e:#}"),
        }
    }

    async fn adapter_failure(&self, exchange: &Exchange, error: AdapterError) -> ExchangeError {
        let id = exchange.id;
        let step = exchange.step.clone();
        match error {
            AdapterError::ChallengeMismatch => {
                tracing::warn!(exchange = %id, step = %step, "challenge mismatch");
                ExchangeError::ChallengeMismatch { id, step }
            }
            AdapterError::Rejected(reason) => {
                tracing::info!(exchange = %id, step = %step, "presentation rejected: {reason}");
                if self.config.failure_policy == FailurePolicy::Invalidate {
                    self.terminalize(exchange, reason.clone()).await;
                }
                ExchangeError::VerificationFailed { id, step, reason }
            }
            AdapterError::Transport(e) => {
                tracing::warn!(exchange = %id, step = %step, "backend unavailable: {e:#}");
                ExchangeError::VerificationFailed {
                    id,
                    step,
                    reason: format!("{e:#}"),
                }
            }
            AdapterError::Configuration(reason) => {
                tracing::warn!(exchange = %id, step = %step, "workflow misconfigured: {reason}");
                self.terminalize(exchange, reason.clone()).await;
                ExchangeError::ConfigurationError {
                    workflow: exchange.workflow_id.clone(),
                    reason,
                }
            }
        }
    }

    fn relying_party_for(&self, workflow_id: &str) -> Result<&RelyingParty, ExchangeError> {
        self.workflows
            .get(workflow_id)
            .and_then(|client_id| self.relying_parties.get(client_id))
            .ok_or_else(|| ExchangeError::ConfigurationError {
                workflow: workflow_id.to_owned(),
                reason: "workflow is no longer configured".into(),
            })
    }

    fn adapter(
        &self,
        workflow_id: &str,
        kind: WorkflowKind,
    ) -> Result<&dyn WorkflowAdapter, ExchangeError> {
        self.adapters
            .get(kind)
            .ok_or_else(|| ExchangeError::ConfigurationError {
                workflow: workflow_id.to_owned(),
                reason: format!("no backend is available for {kind:?} workflows"),
            })
    }

    /// Run an adapter call under the configured timeout.
    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, AdapterError>>,
    ) -> Result<T, AdapterError> {
        let timeout = self.config.adapter_timeout();
        tokio::time::timeout(timeout, call)
            .await
            .unwrap_or_else(|_| {
                Err(AdapterError::Transport(anyhow!(
                    "backend did not respond within {timeout:?}"
                )))
            })
    }
}

fn invalidation(reason: String) -> session::Mutator {
    Box::new(move |e: &mut Exchange| {
        e.state = ExchangeState::Invalid;
        e.challenge = None;
        e.reason = Some(reason);
    })
}

fn store_error(error: StoreError, id: Uuid, expected: u64) -> ExchangeError {
    match error {
        StoreError::NotFound(id) => ExchangeError::NotFound { id },
        StoreError::Conflict { .. } => ExchangeError::Conflict { id, expected },
        StoreError::AlreadyExists { id } => {
            ExchangeError::Store(anyhow!("exchange {id} already exists"))
        }
        StoreError::Backend(e) => ExchangeError::Store(e),
    }
}

/// Builder struct for [Engine].
#[derive(Debug, Clone, Default)]
pub struct EngineBuilder {
    config: Option<Config>,
    session_store: Option<Arc<dyn SessionStore + Send + Sync>>,
    http_client: Option<Arc<dyn AsyncHttpClient + Send + Sync>>,
    verifier: Option<Arc<dyn PresentationVerifier>>,
    predicate: Option<Arc<dyn BranchPredicate>>,
    challenges: Option<Arc<dyn ChallengeGenerator + Send + Sync>>,
}

impl EngineBuilder {
    /// Build the engine.
    pub fn build(self) -> Result<Engine> {
        let Self {
            config,
            session_store,
            http_client,
            verifier,
            predicate,
            challenges,
        } = self;

        let Some(config) = config else {
            bail!("config is required, see `with_config`")
        };

        let Some(session_store) = session_store else {
            bail!("session store is required, see `with_session_store`")
        };

        let mut relying_parties = BTreeMap::new();
        let mut workflows = BTreeMap::new();
        for relying_party in &config.relying_parties {
            let client_id = relying_party.client_id.clone();
            let workflow_id = relying_party.workflow.id().to_owned();
            if workflows.insert(workflow_id.clone(), client_id.clone()).is_some() {
                bail!("workflow id `{workflow_id}` is used by more than one relying party")
            }
            if relying_parties
                .insert(client_id.clone(), relying_party.clone())
                .is_some()
            {
                bail!("client id `{client_id}` is registered more than once")
            }
        }

        let needs_native = relying_parties
            .values()
            .any(|rp| rp.workflow.kind() == WorkflowKind::Native);
        let native = match verifier {
            Some(verifier) => Some(NativeAdapter::new(
                verifier,
                predicate.unwrap_or_else(|| Arc::new(FieldConstraintPredicate)),
            )),
            None if needs_native => bail!(
                "presentation verifier is required for native workflows, see `with_presentation_verifier`"
            ),
            None => None,
        };

        let http_client: Arc<dyn AsyncHttpClient + Send + Sync> = match http_client {
            Some(client) => client,
            None => Arc::new(ReqwestClient::new(config.adapter_timeout())?),
        };

        Ok(Engine {
            relying_parties: Arc::new(relying_parties),
            workflows: Arc::new(workflows),
            session_store,
            adapters: Arc::new(Adapters::new(http_client, native)),
            challenges: challenges.unwrap_or_else(|| Arc::new(RandomChallenge)),
            config: Arc::new(config),
        })
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the [SessionStore] that the [Engine] will use to keep exchanges across requests.
    pub fn with_session_store(
        mut self,
        session_store: Arc<dyn SessionStore + Send + Sync>,
    ) -> Self {
        self.session_store = Some(session_store);
        self
    }

    /// Set the client used to reach remote workflow backends. Defaults to [ReqwestClient].
    pub fn with_http_client(mut self, http_client: Arc<dyn AsyncHttpClient + Send + Sync>) -> Self {
        self.http_client = Some(http_client);
        self
    }

    /// Set the verifier of presentations submitted to native workflows.
    pub fn with_presentation_verifier(mut self, verifier: Arc<dyn PresentationVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Set how native workflows choose between branches. Defaults to
    /// [FieldConstraintPredicate].
    pub fn with_branch_predicate(mut self, predicate: Arc<dyn BranchPredicate>) -> Self {
        self.predicate = Some(predicate);
        self
    }

    pub fn with_challenge_generator(
        mut self,
        challenges: Arc<dyn ChallengeGenerator + Send + Sync>,
    ) -> Self {
        self.challenges = Some(challenges);
        self
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::config::BaseUrl;

    use super::{session::MemoryStore, *};

    fn config(relying_parties: Json) -> Config {
        let mut config = Config::new(BaseUrl::try_from("https://verifier.example.com").unwrap());
        config.relying_parties = serde_json::from_value(relying_parties).unwrap();
        config
    }

    #[test]
    fn builder_requires_collaborators() {
        let err = Engine::builder().build().unwrap_err();
        assert!(err.to_string().contains("with_config"));

        let native = json!([{
            "clientId": "dmv",
            "workflow": { "type": "native", "id": "w", "initialStep": "a", "steps": { "a": {} } }
        }]);
        let err = Engine::builder()
            .with_config(config(native))
            .with_session_store(Arc::new(MemoryStore::default()))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("with_presentation_verifier"));
    }

    #[test]
    fn workflow_ids_must_be_unique() {
        let duplicated = json!([
            {
                "clientId": "one",
                "workflow": { "type": "vc-api", "id": "w", "baseUrl": "https://a.example.com", "capability": "c", "clientSecret": "s" }
            },
            {
                "clientId": "two",
                "workflow": { "type": "vc-api", "id": "w", "baseUrl": "https://b.example.com", "capability": "c", "clientSecret": "s" }
            }
        ]);
        let err = Engine::builder()
            .with_config(config(duplicated))
            .with_session_store(Arc::new(MemoryStore::default()))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("more than one relying party"));
    }
}
