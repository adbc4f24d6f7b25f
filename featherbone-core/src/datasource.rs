//! Request/response contract with the persistence backend.
//!
//! Model instances never talk to a transport directly. They produce a
//! [`Request`] and later absorb the outcome; a [`DataSource`] carries the
//! request in between. `featherbone` ships an HTTP implementation and
//! [`MemoryDataSource`] serves tests.

mod memory;

pub use memory::MemoryDataSource;

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
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

/// One CRUD request. `path` is relative to the service root
/// (`/data/contact/42`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub method: Method,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Version the caller last saw, for PATCH and DELETE.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

impl Request {
    fn new(method: Method, path: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            method,
            path: path.into(),
            data,
            etag: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path, None)
    }

    pub fn post(path: impl Into<String>, data: Value) -> Self {
        Self::new(Method::Post, path, Some(data))
    }

    pub fn patch(path: impl Into<String>, data: Value) -> Self {
        Self::new(Method::Patch, path, Some(data))
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::Delete, path, None)
    }

    pub fn with_etag(mut self, etag: Option<String>) -> Self {
        self.etag = etag;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DataSourceError {
    /// The backend answered with a non-success status.
    #[error("{status_code}: {message}")]
    Status { status_code: u16, message: String },

    /// The request never produced a response.
    #[error("transport failure: {0}")]
    Transport(String),
}

impl DataSourceError {
    pub const CONFLICT: u16 = 409;
    pub const NOT_FOUND: u16 = 404;

    pub fn status(status_code: u16, message: impl Into<String>) -> Self {
        Self::Status {
            status_code,
            message: message.into(),
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Status { status_code, .. } => Some(*status_code),
            Self::Transport(_) => None,
        }
    }

    /// Optimistic concurrency failure: the record changed since it was read.
    pub fn is_conflict(&self) -> bool {
        self.status_code() == Some(Self::CONFLICT)
    }
}

/// Anything able to carry a [`Request`] to the backend.
///
/// Implementations resolve to the response body, or to
/// [`DataSourceError`] on failure. The runtime is single threaded, so the
/// returned futures need not be `Send`.
#[allow(async_fn_in_trait)]
pub trait DataSource {
    async fn request(&self, request: Request) -> Result<Value, DataSourceError>;
}
