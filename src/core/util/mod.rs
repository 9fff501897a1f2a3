use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use http::{
    header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE},
    Request, Response,
};
use serde::{de::DeserializeOwned, Serialize};

/// Generic HTTP client.
///
/// A trait is used here so remote workflow backends can be exercised without a network, and to
/// facilitate native HTTP/TLS stacks on constrained targets.
#[async_trait]
pub trait AsyncHttpClient: std::fmt::Debug {
    async fn execute(&self, request: Request<Vec<u8>>) -> Result<Response<Vec<u8>>>;
}

pub(crate) fn base_request() -> http::request::Builder {
    Request::builder().header(ACCEPT, "application/json")
}

pub(crate) fn json_request<T: Serialize>(
    method: &str,
    uri: &str,
    bearer: &str,
    body: &T,
) -> Result<Request<Vec<u8>>> {
    base_request()
        .method(method)
        .uri(uri)
        .header(AUTHORIZATION, format!("Bearer {bearer}"))
        .header(CONTENT_TYPE, "application/json")
        .body(serde_json::to_vec(body).context("unable to serialize request body")?)
        .context("unable to construct request")
}

pub(crate) fn form_request<T: Serialize>(uri: &str, body: &T) -> Result<Request<Vec<u8>>> {
    base_request()
        .method("POST")
        .uri(uri)
        .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(
            serde_urlencoded::to_string(body)
                .context("unable to encode form body")?
                .into_bytes(),
        )
        .context("unable to construct request")
}

/// Parse a successful JSON response, failing with the body on any other status.
pub(crate) fn json_response<T: DeserializeOwned>(response: &Response<Vec<u8>>) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        let body = String::from_utf8_lossy(response.body());
        bail!("request was unsuccessful (status: {status}): {body}")
    }
    serde_json::from_slice(response.body()).context("failed to parse response body")
}

#[derive(Debug)]
pub struct ReqwestClient(reqwest::Client);

impl AsRef<reqwest::Client> for ReqwestClient {
    fn as_ref(&self) -> &reqwest::Client {
        &self.0
    }
}

impl ReqwestClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(timeout)
            .build()
            .context("unable to build http_client")
            .map(Self)
    }
}

#[async_trait]
impl AsyncHttpClient for ReqwestClient {
    async fn execute(&self, request: Request<Vec<u8>>) -> Result<Response<Vec<u8>>> {
        let response = self
            .0
            .execute(request.try_into().context("unable to convert request")?)
            .await
            .context("http request failed")?;

        let mut builder = Response::builder()
            .status(response.status())
            .version(response.version());

        builder
            .headers_mut()
            .context("unable to set headers")?
            .extend(response.headers().clone());

        builder
            .body(
                response
                    .bytes()
                    .await
                    .context("failed to extract response body")?
                    .to_vec(),
            )
            .context("unable to construct response")
    }
}


#[cfg(test)]
mod test {
    use http::Response;
    use serde_json::{json, Value as Json};

    use super::*;

    #[test]
    fn builds_authorized_json_requests() {
        let request = json_request("POST", "https://example.com/x", "cap", &json!({"a": 1})).unwrap();
        assert_eq!(request.headers()[AUTHORIZATION], "Bearer cap");
        assert_eq!(request.headers()[CONTENT_TYPE], "application/json");
        assert_eq!(request.body(), br#"{"a":1}"#);
    }

    #[test]
    fn rejects_unsuccessful_responses() {
        let response = Response::builder()
            .status(502)
            .body(b"upstream down".to_vec())
            .unwrap();
        let err = json_response::<Json>(&response).unwrap_err();
        assert!(err.to_string().contains("upstream down"));
    }
}
