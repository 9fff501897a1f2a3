use std::{
    fmt,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use http::{Request, Response};
use opencred_exchange::{
    config::{BaseUrl, Config},
    core::util::AsyncHttpClient,
    engine::{
        adapter::{PresentationVerifier, Verification, VerifiedPresentation},
        session::MemoryStore,
    },
    Engine,
};
use serde_json::{json, Value as Json};

pub const BASE: &str = "https://verifier.example.com";

/// Verifies payloads of the form
/// `{ "challenge": .., "presentation": .., "reject": .., "delayMs": .. }`.
///
/// `reject` makes the verifier refuse the presentation, `delayMs` makes it slow.
#[derive(Debug, Default)]
pub struct MockVerifier;

#[async_trait]
impl PresentationVerifier for MockVerifier {
    async fn verify(&self, payload: &Json, domain: &str) -> Result<Verification> {
        assert_eq!(domain, BASE);
        if let Some(delay) = payload["delayMs"].as_u64() {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let challenge = payload["challenge"].as_str().map(ToOwned::to_owned);
        if let Some(reason) = payload["reject"].as_str() {
            return Ok(Verification::Rejected {
                reason: reason.to_owned(),
                challenge,
            });
        }
        Ok(Verification::Verified(VerifiedPresentation {
            presentation: payload["presentation"].clone(),
            challenge,
        }))
    }
}

type Handler = Box<dyn Fn(&Request<Vec<u8>>) -> Response<Vec<u8>> + Send + Sync>;

/// Stands in for remote workflow backends.
pub struct MockHttpClient {
    handler: Handler,
    pub requests: Mutex<Vec<Request<Vec<u8>>>>,
}

impl MockHttpClient {
    pub fn new(
        handler: impl Fn(&Request<Vec<u8>>) -> Response<Vec<u8>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            handler: Box::new(handler),
            requests: Mutex::new(Vec::new()),
        }
    }
}

impl fmt::Debug for MockHttpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockHttpClient").finish_non_exhaustive()
    }
}

#[async_trait]
impl AsyncHttpClient for MockHttpClient {
    async fn execute(&self, request: Request<Vec<u8>>) -> Result<Response<Vec<u8>>> {
        let response = (self.handler)(&request);
        self.requests.lock().unwrap().push(request);
        Ok(response)
    }
}

pub fn json_response(status: u16, body: Json) -> Response<Vec<u8>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(serde_json::to_vec(&body).unwrap())
        .unwrap()
}

/// A drivers license credential presentation.
pub fn license(document_number: &str) -> Json {
    json!({
        "type": ["VerifiablePresentation"],
        "verifiableCredential": [{
            "type": ["VerifiableCredential", "Iso18013DriversLicenseCredential"],
            "issuer": "did:web:dmv.example.gov",
            "credentialSubject": {
                "driversLicense": {
                    "document_number": document_number,
                    "birth_date": "1998-08-28"
                }
            }
        }]
    })
}

pub fn relying_parties() -> Json {
    json!([
        {
            "clientId": "dmv",
            "workflow": {
                "type": "native",
                "id": "dmv-workflow",
                "initialStep": "a",
                "steps": {
                    "a": {
                        "createChallenge": true,
                        "verifiablePresentationRequest": {
                            "query": {
                                "type": "QueryByExample",
                                "credentialQuery": {
                                    "reason": "Please present your drivers license.",
                                    "example": { "type": ["VerifiableCredential", "Iso18013DriversLicenseCredential"] }
                                }
                            }
                        },
                        "steps": { "b": {} }
                    },
                    "b": {}
                }
            },
            "claims": [{ "name": "dl_number", "path": "driversLicense.document_number" }],
            "auditFields": [{
                "type": "date",
                "id": "birth_date",
                "name": "Date of Birth",
                "path": "driversLicense.birth_date",
                "required": true
            }],
            "idTokenExpirySeconds": 600
        },
        {
            "clientId": "remote",
            "workflow": {
                "type": "vc-api",
                "id": "remote-workflow",
                "baseUrl": "https://exchanger.example.com/workflows/w1",
                "capability": "zcap-bearer",
                "clientSecret": "never-sent",
                "createChallenge": true
            },
            "claims": [{ "name": "dl_number", "path": "driversLicense.document_number" }]
        },
        {
            "clientId": "entra",
            "workflow": {
                "type": "microsoft-entra-verified-id",
                "id": "entra-workflow",
                "apiBaseUrl": "https://verifiedid.did.msidentity.com/v1.0",
                "apiLoginBaseUrl": "https://login.microsoftonline.com",
                "apiClientId": "app",
                "apiClientSecret": "app-secret",
                "apiTenantId": "tenant",
                "verifierDid": "did:web:verifier.example.com",
                "verifierName": "Example Verifier",
                "acceptedCredentialType": "VerifiedEmployee"
            },
            "claims": [{ "name": "email", "path": "mail" }]
        }
    ])
}

pub fn config() -> Config {
    let mut config = Config::new(BaseUrl::try_from(BASE).unwrap());
    config.relying_parties = serde_json::from_value(relying_parties()).unwrap();
    config
}

/// An engine over `store`, with remote backends answered by `http_client`.
pub fn engine_with(config: Config, store: MemoryStore, http_client: Arc<MockHttpClient>) -> Engine {
    Engine::builder()
        .with_config(config)
        .with_session_store(Arc::new(store))
        .with_http_client(http_client)
        .with_presentation_verifier(Arc::new(MockVerifier))
        .build()
        .unwrap()
}

/// An engine whose remote backends are unreachable.
pub fn engine(store: MemoryStore) -> Engine {
    engine_with(
        config(),
        store,
        Arc::new(MockHttpClient::new(|_| json_response(503, json!({})))),
    )
}
