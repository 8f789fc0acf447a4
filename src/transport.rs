use std::time::Instant;

use reqwest::blocking::{Client, RequestBuilder};
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue, USER_AGENT};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::NmdcError;

pub type QueryParams = Vec<(String, String)>;

/// Request/response seam between the API wrappers and the network.
pub trait NmdcTransport: Send + Sync {
    fn get_json(&self, path: &str, query: &[(String, String)]) -> Result<Value, NmdcError>;

    fn post_json(
        &self,
        path: &str,
        query: &[(String, String)],
        body: &Value,
    ) -> Result<Value, NmdcError>;
}

impl<T: NmdcTransport + ?Sized> NmdcTransport for &T {
    fn get_json(&self, path: &str, query: &[(String, String)]) -> Result<Value, NmdcError> {
        (**self).get_json(path, query)
    }

    fn post_json(
        &self,
        path: &str,
        query: &[(String, String)],
        body: &Value,
    ) -> Result<Value, NmdcError> {
        (**self).post_json(path, query, body)
    }
}

impl<T: NmdcTransport + ?Sized> NmdcTransport for std::sync::Arc<T> {
    fn get_json(&self, path: &str, query: &[(String, String)]) -> Result<Value, NmdcError> {
        (**self).get_json(path, query)
    }

    fn post_json(
        &self,
        path: &str,
        query: &[(String, String)],
        body: &Value,
    ) -> Result<Value, NmdcError> {
        (**self).post_json(path, query, body)
    }
}

#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(config: &ClientConfig) -> Result<Self, NmdcError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("nmdc-link-toolkit/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| NmdcError::InvalidArgument(err.to_string()))?,
        );
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .build()
            .map_err(|err| NmdcError::RemoteRequestFailed(err.to_string()))?;
        Ok(Self {
            client,
            base_url: config.base_url.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn handle_status(
        response: reqwest::blocking::Response,
    ) -> Result<reqwest::blocking::Response, NmdcError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let body = response.text().unwrap_or_default();
        if let Some(detail) = extract_detail(&body) {
            return Err(NmdcError::RemoteRequestFailed(format!(
                "NMDC API error: {detail}"
            )));
        }
        let message = if body.trim().is_empty() {
            "NMDC API request failed".to_string()
        } else {
            body
        };
        Err(NmdcError::RemoteStatus { status, message })
    }

    fn send(&self, request: RequestBuilder, url: &str) -> Result<Value, NmdcError> {
        let started = Instant::now();
        let response = request.send().map_err(|err| {
            warn!(elapsed = ?started.elapsed(), "API request failed");
            NmdcError::RemoteRequestFailed(format!("request to {url} failed: {err}"))
        })?;
        info!(
            elapsed = ?started.elapsed(),
            status = response.status().as_u16(),
            "API request completed"
        );

        let response = Self::handle_status(response)?;
        let value: Value = response
            .json()
            .map_err(|err| NmdcError::RemoteRequestFailed(format!("invalid JSON body: {err}")))?;
        debug!(body = %value, "API response");
        Ok(value)
    }
}

impl NmdcTransport for HttpTransport {
    fn get_json(&self, path: &str, query: &[(String, String)]) -> Result<Value, NmdcError> {
        let url = format!("{}{}", self.base_url, path);
        info!(url = %url, params = query.len(), "making API request");
        self.send(self.client.get(&url).query(query), &url)
    }

    fn post_json(
        &self,
        path: &str,
        query: &[(String, String)],
        body: &Value,
    ) -> Result<Value, NmdcError> {
        let url = format!("{}{}", self.base_url, path);
        info!(url = %url, params = query.len(), "making API POST request");
        debug!(body = %body, "API request payload");
        self.send(self.client.post(&url).query(query).json(body), &url)
    }
}

/// Pulls the `detail` field out of an error body, if the body is JSON and has one.
pub fn extract_detail(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    match value.get("detail")? {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}

/// Replaces status-only failures with `RemoteRequestFailed(fallback)`, keeping
/// any server detail text already carried.
pub fn remote_failure(err: NmdcError, fallback: &str) -> NmdcError {
    match err {
        NmdcError::RemoteStatus { status, .. } => {
            NmdcError::RemoteRequestFailed(format!("{fallback} (status {status})"))
        }
        other => other,
    }
}
