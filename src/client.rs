//! HTTP datasource for a Featherbone server.
//!
//! Carries model requests as plain REST calls under the configured base URL.
//! The record etag travels in an `If-Match` header.

use featherbone_core::{DataSource, DataSourceError, Method, Request};
use reqwest::header::{ACCEPT, IF_MATCH};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use thiserror::Error;

use crate::config::ClientConfig;

/// HTTP client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Unauthorized: API key required or invalid")]
    Unauthorized,

    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("Invalid response body: {0}")]
    Decode(String),
}

impl From<ClientError> for DataSourceError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Http(e) => DataSourceError::Transport(e.to_string()),
            ClientError::Decode(message) => DataSourceError::Transport(message),
            ClientError::NotFound(message) => {
                DataSourceError::status(StatusCode::NOT_FOUND.as_u16(), message)
            }
            ClientError::Conflict(message) => {
                DataSourceError::status(StatusCode::CONFLICT.as_u16(), message)
            }
            ClientError::Unauthorized => {
                DataSourceError::status(StatusCode::UNAUTHORIZED.as_u16(), "unauthorized")
            }
            ClientError::Server { status, message } => DataSourceError::status(status, message),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpDataSource {
    base_url: String,
    api_key: Option<String>,
    client: Client,
}

impl HttpDataSource {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(config.base_url.clone(), config.api_key.clone())
    }

    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key,
            client: Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Build a request with optional auth header.
    fn request_builder(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self.client.request(method, &url);
        if let Some(ref key) = self.api_key {
            req = req.bearer_auth(key);
        }
        req
    }

    /// Convert a response into JSON, mapping HTTP failures to ClientError.
    /// An empty success body becomes `null`.
    async fn handle_response(&self, response: reqwest::Response) -> Result<Value, ClientError> {
        let status = response.status();
        if status.is_success() {
            let body = response.text().await?;
            if body.trim().is_empty() {
                return Ok(Value::Null);
            }
            serde_json::from_str(&body).map_err(|e| ClientError::Decode(e.to_string()))
        } else {
            let body = response.text().await.unwrap_or_default();
            match status {
                StatusCode::NOT_FOUND => Err(ClientError::NotFound(body)),
                StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => {
                    Err(ClientError::Conflict(body))
                }
                StatusCode::UNAUTHORIZED => Err(ClientError::Unauthorized),
                _ => Err(ClientError::Server {
                    status: status.as_u16(),
                    message: body,
                }),
            }
        }
    }

    /// Send one model request.
    pub async fn send(&self, request: &Request) -> Result<Value, ClientError> {
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        };
        let mut req = self.request_builder(method, &request.path);
        if let Some(ref etag) = request.etag {
            req = req.header(IF_MATCH, etag);
        }
        if let Some(ref data) = request.data {
            req = req.json(data);
        }
        tracing::debug!(method = %request.method, path = %request.path, "request");
        let response = req.send().await?;
        self.handle_response(response).await
    }

    /// The schema payload (`feather name -> definition`).
    pub async fn fetch_catalog(&self) -> Result<Value, ClientError> {
        let response = self
            .request_builder(reqwest::Method::GET, "/settings/catalog")
            .send()
            .await?;
        let body = self.handle_response(response).await?;
        // Settings responses may wrap the payload with its etag.
        match body {
            Value::Object(mut map) if map.contains_key("etag") && map.contains_key("data") => {
                Ok(map.remove("data").unwrap_or(Value::Null))
            }
            other => Ok(other),
        }
    }

    /// Open the server-sent-events stream at `path`.
    pub async fn open_stream(&self, path: &str) -> Result<reqwest::Response, ClientError> {
        let response = self
            .request_builder(reqwest::Method::GET, path)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await?;
        match response.status() {
            status if status.is_success() => Ok(response),
            StatusCode::UNAUTHORIZED => Err(ClientError::Unauthorized),
            status => Err(ClientError::Server {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            }),
        }
    }
}

impl DataSource for HttpDataSource {
    async fn request(&self, request: Request) -> Result<Value, DataSourceError> {
        self.send(&request).await.map_err(DataSourceError::from)
    }
}
