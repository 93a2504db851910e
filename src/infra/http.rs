//! reqwest-backed [`RemoteTransport`] for the household REST API.

use std::time::Duration;

use async_trait::async_trait;
use hearth_api_types::ErrorBody;
use reqwest::{Client, Method as HttpMethod, Url};
use serde_json::Value;
use tracing::{debug, instrument};

use super::error::InfraError;
use crate::application::error::SyncError;
use crate::application::remote::{Method, RemoteRequest, RemoteTransport};
use crate::config::RemoteSettings;

#[derive(Clone, Debug)]
pub struct HttpTransport {
    client: Client,
    base: Url,
    api_key: Option<String>,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(settings: &RemoteSettings) -> Result<Self, InfraError> {
        let client = Client::builder()
            .user_agent(Self::user_agent())
            .timeout(settings.request_timeout)
            .build()
            .map_err(|err| InfraError::transport(format!("failed to build http client: {err}")))?;
        Ok(Self {
            client,
            base: settings.base_url.clone(),
            api_key: settings.api_key.clone(),
            timeout: settings.request_timeout,
        })
    }

    pub fn user_agent() -> &'static str {
        concat!("hearth/", env!("CARGO_PKG_VERSION"))
    }

    /// Resolve `path` below the base URL, keeping any base path prefix.
    pub fn url(&self, request: &RemoteRequest) -> Result<Url, SyncError> {
        let joined = format!(
            "{}/{}",
            self.base.as_str().trim_end_matches('/'),
            request.path.trim_start_matches('/')
        );
        let mut url = Url::parse(&joined)
            .map_err(|err| SyncError::validation("path", format!("invalid request path: {err}")))?;
        if !request.query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (name, value) in &request.query {
                pairs.append_pair(name, value);
            }
        }
        Ok(url)
    }

    fn map_send_error(&self, err: reqwest::Error) -> SyncError {
        if err.is_timeout() {
            SyncError::timeout(self.timeout)
        } else {
            SyncError::network(err.to_string())
        }
    }
}

fn http_method(method: Method) -> HttpMethod {
    match method {
        Method::Get => HttpMethod::GET,
        Method::Post => HttpMethod::POST,
        Method::Patch => HttpMethod::PATCH,
        Method::Delete => HttpMethod::DELETE,
    }
}

#[async_trait]
impl RemoteTransport for HttpTransport {
    #[instrument(skip(self, request), fields(method = %request.method, path = %request.path))]
    async fn send(&self, request: RemoteRequest) -> Result<Value, SyncError> {
        let url = self.url(&request)?;
        let mut builder = self.client.request(http_method(request.method), url);
        if let Some(key) = self.api_key.as_deref() {
            builder = builder.bearer_auth(key);
        }
        if let Some(body) = request.body.as_ref() {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|err| self.map_send_error(err))?;
        let status = response.status();
        let bytes = response.bytes().await.map_err(|err| self.map_send_error(err))?;
        debug!(status = status.as_u16(), bytes = bytes.len(), "Response received");

        if !status.is_success() {
            let message = serde_json::from_slice::<ErrorBody>(&bytes)
                .map(|body| body.error)
                .unwrap_or_else(|_| {
                    status
                        .canonical_reason()
                        .unwrap_or("request failed")
                        .to_string()
                });
            return Err(SyncError::rejected(status.as_u16(), message));
        }
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes).map_err(|err| SyncError::invalid_response(err.to_string()))
    }
}
