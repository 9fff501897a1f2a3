//! Exchange data structures that are needed on the frontend, without all of the other
//! dependencies that can cause compilation issues with web targets.
use core::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// State of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeState {
    /// The exchange is waiting on the holder (or a remote backend) to present.
    Pending,
    /// Every step of the workflow has been verified.
    Complete,
    /// The exchange expired, was invalidated, or failed verification for good.
    Invalid,
}

impl ExchangeState {
    /// Whether the state admits no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExchangeState::Complete | ExchangeState::Invalid)
    }
}

impl fmt::Display for ExchangeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExchangeState::Pending => "pending",
            ExchangeState::Complete => "complete",
            ExchangeState::Invalid => "invalid",
        };
        f.write_str(s)
    }
}

/// Externally-visible projection of an exchange.
///
/// `access_token` and `variables` are only populated for the owning relying party's
/// authenticated backend channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeView {
    pub id: String,
    pub workflow_id: String,
    pub sequence: u64,
    pub state: ExchangeState,
    pub step: String,
    pub ttl: u64,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub challenge: Option<String>,
    /// The presentation request of the current step.
    pub presentation_request: Json,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variables: Option<Json>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(ExchangeState::Complete).unwrap(),
            Json::String("complete".into())
        );
        assert!(ExchangeState::Invalid.is_terminal());
        assert!(!ExchangeState::Pending.is_terminal());
    }
}
