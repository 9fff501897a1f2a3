use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use time::{format_description::well_known::Rfc3339, Duration, OffsetDateTime, PrimitiveDateTime};
use uuid::Uuid;

pub use exchange_frontend::{ExchangeState, ExchangeView};

/// One session of a credential presentation.
///
/// Exchanges are owned by the [SessionStore](crate::engine::session::SessionStore); `sequence`
/// is only ever advanced by the store when a conditional update commits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Exchange {
    pub id: Uuid,
    pub sequence: u64,
    /// Seconds after `created_at` at which the exchange expires.
    pub ttl: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    pub state: ExchangeState,
    pub step: String,
    pub variables: Variables,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub challenge: Option<String>,
    pub workflow_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    /// Presentation request of the current step.
    pub presentation_request: Json,
    /// Remote exchange location (VC-API) or request id (Entra).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_reference: Option<String>,
    /// Why the exchange reached its terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Exchange {
    /// Saturates at the latest representable instant for TTLs beyond the calendar.
    pub fn expires_at(&self) -> OffsetDateTime {
        let ttl = Duration::seconds(self.ttl.min(i64::MAX as u64) as i64);
        self.created_at
            .checked_add(ttl)
            .unwrap_or_else(|| PrimitiveDateTime::MAX.assume_utc())
    }

    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        now > self.expires_at()
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(OffsetDateTime::now_utc())
    }

    /// Project the exchange for a caller. Internal fields are withheld from public callers.
    pub fn view(&self, audience: Audience) -> ExchangeView {
        let privileged = audience == Audience::RelyingParty;
        ExchangeView {
            id: self.id.to_string(),
            workflow_id: self.workflow_id.clone(),
            sequence: self.sequence,
            state: self.state,
            step: self.step.clone(),
            ttl: self.ttl,
            created_at: self
                .created_at
                .format(&Rfc3339)
                .unwrap_or_else(|_| self.created_at.unix_timestamp().to_string()),
            challenge: self.challenge.clone(),
            presentation_request: self.presentation_request.clone(),
            reason: self.reason.clone(),
            access_token: privileged.then(|| self.access_token.clone()).flatten(),
            variables: privileged.then(|| self.variables.to_json()),
        }
    }
}

/// Who is asking for an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    /// The holder's client or any unauthenticated caller.
    Public,
    /// The owning relying party's authenticated backend channel.
    RelyingParty,
}

/// Per-step results of an exchange, in completion order.
///
/// Append-only: a step name, once recorded, is never overwritten.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<StepResult>", into = "Vec<StepResult>")]
pub struct Variables(Vec<StepResult>);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("step `{0}` has already been recorded")]
pub struct StepAlreadyRecorded(pub String);

impl Variables {
    pub fn insert(&mut self, result: StepResult) -> Result<(), StepAlreadyRecorded> {
        if self.contains(&result.step) {
            return Err(StepAlreadyRecorded(result.step));
        }
        self.0.push(result);
        Ok(())
    }

    pub fn contains(&self, step: &str) -> bool {
        self.0.iter().any(|r| r.step == step)
    }

    pub fn get(&self, step: &str) -> Option<&StepResult> {
        self.0.iter().find(|r| r.step == step)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StepResult> {
        self.0.iter()
    }

    /// The merged id_token claims of every recorded step, later steps taking precedence.
    pub fn claims(&self) -> Map<String, Json> {
        self.0.iter().fold(Map::new(), |mut acc, r| {
            acc.extend(r.claims.clone());
            acc
        })
    }

    /// A JSON object keyed by step name.
    pub fn to_json(&self) -> Json {
        Json::Object(
            self.0
                .iter()
                .map(|r| (r.step.clone(), serde_json::to_value(r).unwrap_or_default()))
                .collect(),
        )
    }
}

impl TryFrom<Vec<StepResult>> for Variables {
    type Error = StepAlreadyRecorded;

    fn try_from(results: Vec<StepResult>) -> Result<Self, Self::Error> {
        let mut variables = Variables::default();
        for result in results {
            variables.insert(result)?;
        }
        Ok(variables)
    }
}

impl From<Variables> for Vec<StepResult> {
    fn from(Variables(results): Variables) -> Self {
        results
    }
}

/// What an exchange recorded when a step was verified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub step: String,
    /// The verified presentation, as returned by the backend.
    pub presentation: Json,
    pub claims: Map<String, Json>,
    pub audit: Map<String, Json>,
    /// Rule ids that could not be extracted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub completed_at: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn result(step: &str, claims: Json) -> StepResult {
        StepResult {
            step: step.into(),
            presentation: json!({}),
            claims: serde_json::from_value(claims).unwrap(),
            audit: Map::new(),
            missing: vec![],
            completed_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    fn exchange() -> Exchange {
        let now = OffsetDateTime::now_utc();
        Exchange {
            id: Uuid::new_v4(),
            sequence: 3,
            ttl: 900,
            created_at: now,
            updated_at: now,
            state: ExchangeState::Pending,
            step: "a".into(),
            variables: Variables::default(),
            challenge: Some("c".into()),
            workflow_id: "w".into(),
            access_token: Some("secret-token".into()),
            presentation_request: json!({}),
            backend_reference: None,
            reason: None,
        }
    }

    #[test]
    fn variables_are_append_only() {
        let mut variables = Variables::default();
        variables.insert(result("a", json!({"x": 1}))).unwrap();
        variables.insert(result("b", json!({"x": 2, "y": 3}))).unwrap();
        assert_eq!(
            variables.insert(result("a", json!({}))),
            Err(StepAlreadyRecorded("a".into()))
        );
        assert_eq!(variables.len(), 2);
        assert_eq!(Json::Object(variables.claims()), json!({"x": 2, "y": 3}));

        let steps: Vec<&str> = variables.iter().map(|r| r.step.as_str()).collect();
        assert_eq!(steps, ["a", "b"]);
    }

    #[test]
    fn json_keeps_recording_order() {
        let mut variables = Variables::default();
        variables.insert(result("zeta", json!({}))).unwrap();
        variables.insert(result("alpha", json!({}))).unwrap();
        let json = variables.to_json();
        let keys: Vec<&str> = json.as_object().unwrap().keys().map(String::as_str).collect();
        assert_eq!(keys, ["zeta", "alpha"]);
    }

    #[test]
    fn duplicate_steps_do_not_deserialize() {
        let a = serde_json::to_value(result("a", json!({}))).unwrap();
        assert!(serde_json::from_value::<Variables>(json!([a.clone(), a])).is_err());
    }

    #[test]
    fn public_view_withholds_internal_fields() {
        let exchange = exchange();
        let public = exchange.view(Audience::Public);
        assert_eq!(public.access_token, None);
        assert_eq!(public.variables, None);

        let private = exchange.view(Audience::RelyingParty);
        assert_eq!(private.access_token.as_deref(), Some("secret-token"));
        assert_eq!(private.variables, Some(json!({})));
    }

    #[test]
    fn expiry_is_measured_from_creation() {
        let exchange = exchange();
        assert!(!exchange.is_expired_at(exchange.created_at + Duration::seconds(900)));
        assert!(exchange.is_expired_at(exchange.created_at + Duration::seconds(901)));
    }

    #[test]
    fn huge_ttl_never_expires() {
        let mut exchange = exchange();
        exchange.ttl = u64::MAX;
        assert_eq!(exchange.expires_at(), PrimitiveDateTime::MAX.assume_utc());
        assert!(!exchange.is_expired());
    }

    #[test]
    fn round_trips_through_storage_format() {
        let exchange = exchange();
        let stored = serde_json::to_value(&exchange).unwrap();
        assert_eq!(stored["state"], "pending");
        assert!(stored.get("backendReference").is_none());
        let mut restored: Exchange = serde_json::from_value(stored).unwrap();
        restored.created_at = exchange.created_at;
        restored.updated_at = exchange.updated_at;
        assert_eq!(restored, exchange);
    }
}
