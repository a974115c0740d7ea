//! Client for the remote document store.
//!
//! The store is a Firebase-RTDB-style REST service: JSON values addressed by
//! `/`-joined key paths, read with `GET {root}/{path}.json` and replaced
//! wholesale with `PUT {root}/{path}.json`. No retry logic lives here;
//! retries are the caller's concern (the poll loop is the retry).

use std::fmt::{self, Display};
use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::config::SessionConfig;

#[derive(Debug, Error)]
#[error("{0}")]
pub struct InvalidPathError(String);

/// A `/`-joined key sequence addressing a value in the store, relative to
/// the endpoint root. Segments are non-empty and carry no embedded `/`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorePath(Vec<String>);

impl StorePath {
    pub fn new<I, S>(segments: I) -> Result<Self, InvalidPathError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if segments.is_empty() {
            return Err(InvalidPathError(
                "path must have at least one segment".to_string(),
            ));
        }
        for segment in &segments {
            if segment.is_empty() {
                return Err(InvalidPathError(
                    "path segments must not be empty".to_string(),
                ));
            }
            if segment.contains('/') {
                return Err(InvalidPathError(format!(
                    "path segment '{segment}' must not contain '/'"
                )));
            }
        }
        Ok(Self(segments))
    }

    /// Extends this path with additional segments.
    pub fn join<I, S>(&self, segments: I) -> Result<Self, InvalidPathError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut joined = self.0.clone();
        joined.extend(segments.into_iter().map(Into::into));
        Self::new(joined)
    }
}

impl Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// The path holds no value. The store answers both 404 and 200 with a
    /// JSON `null` body for missing paths.
    #[error("no value at path")]
    NotFound,

    #[error(transparent)]
    Network(reqwest::Error),

    #[error("server replied with status: {0}")]
    Status(StatusCode),

    #[error("failed to decode response: {0}")]
    Decode(reqwest::Error),

    #[error(transparent)]
    Path(#[from] InvalidPathError),
}

/// Read/write access to path-addressed JSON values under an endpoint root.
#[derive(Clone, Debug)]
pub struct RemoteStore {
    client: reqwest::Client,
    root: String,
    timeout: Duration,
    auth_token: Option<String>,
}

impl RemoteStore {
    pub fn new(endpoint_root: &str, config: &SessionConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            root: endpoint_root.trim_end_matches('/').to_string(),
            timeout: config.request_timeout,
            auth_token: config.auth_token.clone(),
        }
    }

    fn request(&self, method: Method, path: &StorePath) -> reqwest::RequestBuilder {
        let mut request = self
            .client
            .request(method, format!("{}/{path}.json", self.root))
            .timeout(self.timeout);
        if let Some(token) = &self.auth_token {
            request = request.query(&[("auth", token)]);
        }
        request
    }

    /// Fetches the JSON value at `path`.
    pub async fn read_path(&self, path: &StorePath) -> Result<Value, StoreError> {
        let response = self
            .request(Method::GET, path)
            .send()
            .await
            .map_err(StoreError::Network)?;
        let value: Value = match response.status() {
            StatusCode::NOT_FOUND => return Err(StoreError::NotFound),
            status if !status.is_success() => return Err(StoreError::Status(status)),
            _ => response.json().await.map_err(StoreError::Decode)?,
        };
        if value.is_null() {
            return Err(StoreError::NotFound);
        }
        debug!("GET {path}");
        Ok(value)
    }

    /// Replaces the value at `path` wholesale.
    pub async fn write_path(&self, path: &StorePath, value: &Value) -> Result<(), StoreError> {
        let response = self
            .request(Method::PUT, path)
            .json(value)
            .send()
            .await
            .map_err(StoreError::Network)?;
        match response.status() {
            status if status.is_success() => {
                debug!("PUT {path}");
                Ok(())
            }
            StatusCode::NOT_FOUND => Err(StoreError::NotFound),
            status => Err(StoreError::Status(status)),
        }
    }
}
