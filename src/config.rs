use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::core::relying_party::RelyingParty;

const DEFAULT_EXCHANGE_TTL_SECONDS: u64 = 900;
const DEFAULT_ADAPTER_TIMEOUT_MS: u64 = 10_000;

/// Engine configuration.
///
/// Relying parties are expected to have passed static validation before they reach the engine.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Public base URL of this service, used as the presentation `domain` and to build
    /// callback URLs for remote backends.
    pub base: BaseUrl,
    #[serde(default = "default_exchange_ttl")]
    pub exchange_ttl_seconds: u64,
    #[serde(default = "default_adapter_timeout")]
    pub adapter_timeout_ms: u64,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    #[serde(default)]
    pub relying_parties: Vec<RelyingParty>,
}

impl Config {
    pub fn new(base: BaseUrl) -> Self {
        Self {
            base,
            exchange_ttl_seconds: DEFAULT_EXCHANGE_TTL_SECONDS,
            adapter_timeout_ms: DEFAULT_ADAPTER_TIMEOUT_MS,
            failure_policy: FailurePolicy::default(),
            relying_parties: Vec::new(),
        }
    }

    pub fn adapter_timeout(&self) -> Duration {
        Duration::from_millis(self.adapter_timeout_ms)
    }
}

fn default_exchange_ttl() -> u64 {
    DEFAULT_EXCHANGE_TTL_SECONDS
}

fn default_adapter_timeout() -> u64 {
    DEFAULT_ADAPTER_TIMEOUT_MS
}

/// What happens to an exchange when a backend definitively rejects a presentation.
///
/// Timeouts and transport failures are never definitive and always leave the exchange
/// `pending`.
#[derive(Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Keep the exchange pending so the holder can try again within the TTL.
    #[default]
    Retry,
    /// Terminalize the exchange as `invalid`.
    Invalidate,
}

/// A url that is always a base (can be safely join()'ed with further path elements without
/// mangling).
#[derive(Deserialize, Serialize, Debug, Clone, Hash, PartialEq, Eq)]
#[serde(try_from = "String")]
pub struct BaseUrl(Url);

impl std::ops::Deref for BaseUrl {
    type Target = Url;

    fn deref(&self) -> &Url {
        &self.0
    }
}

impl TryFrom<String> for BaseUrl {
    type Error = url::ParseError;

    fn try_from(mut url: String) -> Result<Self, Self::Error> {
        // Make URL a base.
        if !url.ends_with('/') {
            url += "/"
        }
        url.parse().map(Self)
    }
}

impl TryFrom<&str> for BaseUrl {
    type Error = url::ParseError;

    fn try_from(url: &str) -> Result<Self, Self::Error> {
        Self::try_from(url.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn base_url_joins_without_mangling() {
        let base = BaseUrl::try_from("https://verifier.example.com/api").unwrap();
        assert_eq!(
            base.join("callbacks/entra").unwrap().as_str(),
            "https://verifier.example.com/api/callbacks/entra"
        );
    }

    #[test]
    fn base_url_serializes_as_string() {
        let base = BaseUrl::try_from("https://exchanger.example.com/workflows/w1").unwrap();
        let value = serde_json::to_value(&base).unwrap();
        assert_eq!(value, json!("https://exchanger.example.com/workflows/w1/"));
        assert_eq!(serde_json::from_value::<BaseUrl>(value).unwrap(), base);
    }

    #[test]
    fn defaults_apply() {
        let config: Config = serde_json::from_value(json!({
            "base": "https://verifier.example.com"
        }))
        .unwrap();
        assert_eq!(config.exchange_ttl_seconds, 900);
        assert_eq!(config.adapter_timeout(), Duration::from_secs(10));
        assert_eq!(config.failure_policy, FailurePolicy::Retry);
        assert!(config.relying_parties.is_empty());
    }
}
