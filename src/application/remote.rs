//! Request/response seam to the household API.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

use super::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One call against the household API. `path` is relative to the base URL.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl RemoteRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::Post, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::Patch, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::Delete, path)
    }

    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    /// Attach a JSON body.
    pub fn json<B: Serialize>(mut self, body: &B) -> Result<Self, SyncError> {
        let value = serde_json::to_value(body)
            .map_err(|err| SyncError::validation("body", err.to_string()))?;
        self.body = Some(value);
        Ok(self)
    }
}

impl fmt::Display for RemoteRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path)
    }
}

/// Sends requests to the household API.
///
/// Implementations return the decoded JSON body of a 2xx response (`Null`
/// for an empty body) and map every other outcome onto [`SyncError`].
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    async fn send(&self, request: RemoteRequest) -> Result<Value, SyncError>;
}

/// Decode a response body, treating a schema mismatch as an invalid response.
pub fn decode<T: DeserializeOwned>(body: Value) -> Result<T, SyncError> {
    serde_json::from_value(body).map_err(|err| SyncError::invalid_response(err.to_string()))
}

pub async fn fetch_json<T: DeserializeOwned>(
    remote: &dyn RemoteTransport,
    request: RemoteRequest,
) -> Result<T, SyncError> {
    decode(remote.send(request).await?)
}

/// Reusable fetcher for a fixed read request, in the shape the query client
/// registers for background refetches.
pub fn fetcher<T>(
    remote: Arc<dyn RemoteTransport>,
    request: RemoteRequest,
) -> impl Fn() -> BoxFuture<'static, Result<T, SyncError>> + Send + Sync + 'static
where
    T: DeserializeOwned + Send + 'static,
{
    move || {
        let remote = Arc::clone(&remote);
        let request = request.clone();
        async move { fetch_json(remote.as_ref(), request).await }.boxed()
    }
}
