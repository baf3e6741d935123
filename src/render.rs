//! Mock response rendering.
//!
//! A mock body is one of three explicit kinds, decided when the
//! configuration is loaded:
//!
//! - a literal string,
//! - a structured JSON value, serialized at render time,
//! - an `@`-prefixed file reference, read at render time relative to the
//!   directory of the file that declared the mock.
//!
//! A missing referenced file is a [`RenderError`], never an empty body.

use crate::error::RenderError;
use crate::matcher::{MockResponse, StdioMockResponse};
use crate::pipeline::HttpResponse;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::path::{Path, PathBuf};

/// Body of a mock response.
#[derive(Debug, Clone, PartialEq)]
pub enum MockBody {
    Literal(String),
    Structured(Value),
    FileReference(PathBuf),
}

impl From<Value> for MockBody {
    fn from(value: Value) -> Self {
        match value {
            Value::String(text) => match text.strip_prefix('@') {
                Some(path) => MockBody::FileReference(PathBuf::from(path.trim())),
                None => MockBody::Literal(text),
            },
            other => MockBody::Structured(other),
        }
    }
}

impl<'de> Deserialize<'de> for MockBody {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Value::deserialize(deserializer).map(MockBody::from)
    }
}

impl Serialize for MockBody {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            MockBody::Literal(text) => serializer.serialize_str(text),
            MockBody::Structured(value) => value.serialize(serializer),
            MockBody::FileReference(path) => {
                serializer.serialize_str(&format!("@{}", path.display()))
            }
        }
    }
}

impl MockBody {
    /// Content type implied by the body kind.
    pub fn content_type(&self) -> &'static str {
        match self {
            MockBody::Literal(_) => "text/plain",
            MockBody::Structured(_) => "application/json",
            MockBody::FileReference(path) => content_type_for(path),
        }
    }

    /// Produce the body bytes.
    pub async fn render(&self, base_dir: &Path) -> Result<Vec<u8>, RenderError> {
        match self {
            MockBody::Literal(text) => Ok(text.clone().into_bytes()),
            MockBody::Structured(value) => Ok(serde_json::to_vec(value)?),
            MockBody::FileReference(path) => {
                let full = base_dir.join(path);
                tokio::fs::read(&full)
                    .await
                    .map_err(|source| RenderError::File { path: full, source })
            }
        }
    }
}

fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("json") => "application/json",
        Some("txt") => "text/plain",
        Some("html") | Some("htm") => "text/html",
        Some("xml") => "application/xml",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

/// Render an HTTP mock response.
///
/// Configured headers are kept in order. When none of them is a
/// `Content-Type`, one is derived from the body kind.
pub async fn render_response(
    response: &MockResponse,
    base_dir: &Path,
) -> Result<HttpResponse, RenderError> {
    let mut headers: Vec<(String, String)> = response
        .headers
        .iter()
        .map(|h| (h.name.clone(), h.value.clone()))
        .collect();

    let body = match &response.body {
        Some(body) => {
            if !headers
                .iter()
                .any(|(name, _)| name.eq_ignore_ascii_case("content-type"))
            {
                headers.push(("Content-Type".to_string(), body.content_type().to_string()));
            }
            body.render(base_dir).await?
        }
        None => Vec::new(),
    };

    Ok(HttpResponse {
        status: response.status_code,
        headers,
        body,
    })
}

/// Output produced for one stdio mock.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderedStdio {
    pub stdout: Option<Vec<u8>>,
    pub stderr: Option<Vec<u8>>,
}

pub async fn render_stdio(
    response: &StdioMockResponse,
    base_dir: &Path,
) -> Result<RenderedStdio, RenderError> {
    let stdout = match &response.stdout {
        Some(body) => Some(body.render(base_dir).await?),
        None => None,
    };
    let stderr = match &response.stderr {
        Some(body) => Some(body.render(base_dir).await?),
        None => None,
    };
    Ok(RenderedStdio { stdout, stderr })
}
