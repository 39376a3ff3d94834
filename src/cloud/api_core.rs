//! Thin synchronous HTTP layer used by [`crate::cloud::hub::HubController`].
//!
//! Grounded directly on `spotflow::cloud::api_core`: a `ureq` agent built
//! with an explicit `native_tls` connector, `RequestError` distinguishing a
//! non-2xx status (with optional RFC 7807 problem details) from a transport
//! failure, and `log::debug!` around each call. Generalized from PUT/POST
//! only to the full GET/POST/PUT/DELETE set the hub and device lifecycle
//! needs (§4.2), and from a fixed `DeviceToken` scheme to a caller-supplied
//! bearer token via [`crate::auth::AuthProvider`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use http::{
    uri::{PathAndQuery, Scheme},
    Method, Uri,
};
use serde::Deserialize;
use thiserror::Error;
use ureq::{Agent, Response};

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request failed with status code {0}: {}", get_problem_title(.1))]
    Status(u16, Option<Box<ProblemDetails>>),
    #[error("request failed with transport error: {0}")]
    Transport(Box<ureq::Transport>),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RequestError {
    /// `true` for 404 responses, which the hub/device reconciliation logic
    /// treats specially (§4.2: a missing hub on sync is not an error, it's a
    /// signal to re-run `init_hub`).
    pub fn is_not_found(&self) -> bool {
        matches!(self, RequestError::Status(404, _))
    }
}

fn get_problem_title(details: &Option<Box<ProblemDetails>>) -> String {
    details
        .as_ref()
        .and_then(|d| d.title.clone())
        .unwrap_or_default()
}

#[allow(dead_code)]
#[derive(Debug, Deserialize)]
pub struct ProblemDetails {
    pub r#type: Option<String>,
    pub title: Option<String>,
    pub status: Option<u16>,
    pub detail: Option<String>,
    #[serde(flatten)]
    pub extensions: serde_json::Value,
}

/// A configured `ureq` agent plus the request timeout to apply to every call.
pub struct ApiClient {
    agent: Agent,
    timeout: Duration,
}

impl ApiClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let connector = Arc::new(
            native_tls::TlsConnector::new().context("building TLS connector for API client")?,
        );
        let agent = ureq::AgentBuilder::new().tls_connector(connector).build();
        Ok(ApiClient { agent, timeout })
    }

    pub fn get(&self, base_uri: &Uri, relative_uri: &Uri, token: &str) -> Result<Response, RequestError> {
        self.send(Method::GET, base_uri, relative_uri, token, None::<()>)
    }

    pub fn head(&self, base_uri: &Uri, relative_uri: &Uri, token: &str) -> Result<Response, RequestError> {
        self.send(Method::HEAD, base_uri, relative_uri, token, None::<()>)
    }

    pub fn post(
        &self,
        base_uri: &Uri,
        relative_uri: &Uri,
        token: &str,
        body: impl serde::Serialize,
    ) -> Result<Response, RequestError> {
        self.send(Method::POST, base_uri, relative_uri, token, Some(body))
    }

    pub fn put(
        &self,
        base_uri: &Uri,
        relative_uri: &Uri,
        token: &str,
        body: impl serde::Serialize,
    ) -> Result<Response, RequestError> {
        self.send(Method::PUT, base_uri, relative_uri, token, Some(body))
    }

    pub fn delete(&self, base_uri: &Uri, relative_uri: &Uri, token: &str) -> Result<Response, RequestError> {
        self.send(Method::DELETE, base_uri, relative_uri, token, None::<()>)
    }

    fn send(
        &self,
        method: Method,
        base_uri: &Uri,
        relative_uri: &Uri,
        token: &str,
        body: Option<impl serde::Serialize>,
    ) -> Result<Response, RequestError> {
        let authority = base_uri.authority().ok_or_else(|| {
            anyhow!("base URI {base_uri:?} does not contain an authority (e.g. 'api.example.com')")
        })?;
        let scheme = base_uri.scheme().cloned().unwrap_or(Scheme::HTTPS);
        let path = relative_uri.path_and_query();

        let uri = Uri::builder()
            .scheme(scheme)
            .authority(authority.to_owned())
            .path_and_query(
                path.cloned()
                    .unwrap_or_else(|| PathAndQuery::from_static("")),
            )
            .build()
            .with_context(|| format!("building URI from {base_uri:?} and {relative_uri:?}"))?;

        log::debug!("Sending {method} request to {uri}");

        let auth_header = format!("Bearer {token}");
        let request = self
            .agent
            .request(method.as_str(), &uri.to_string())
            .timeout(self.timeout)
            .set("Content-Type", "application/json")
            .set("Authorization", &auth_header);

        let result = match body {
            Some(body) => request.send_json(serde_json::to_value(body).map_err(|e| anyhow!(e))?),
            None => request.call(),
        };

        match result {
            Ok(response) => {
                log::debug!("Request to {uri} succeeded with status code {}", response.status());
                Ok(response)
            }
            Err(ureq::Error::Status(status, response)) => {
                let response_body = response.into_string().unwrap_or_default();
                log::debug!("Request to {uri} failed with status code {status}. Response: {response_body}");
                let problem_details = serde_json::from_str(&response_body).ok();
                Err(RequestError::Status(status, problem_details))
            }
            Err(ureq::Error::Transport(e)) => {
                log::debug!("Request to {uri} failed with transport error: {e}");
                Err(RequestError::Transport(Box::new(e)))
            }
        }
    }
}
