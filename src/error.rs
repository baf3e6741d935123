//! Error types for configuration loading, rendering and plugin dispatch.

use crate::pipeline::Phase;
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while reading, parsing and binding configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The document is not valid YAML/JSON.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// The document parsed but a value does not fit the settings model.
    #[error("{path}: {message}")]
    SchemaValidation { path: String, message: String },

    /// No configuration file, or a file the configuration refers to, exists.
    #[error("{0}")]
    ConfigurationMissing(String),

    /// A watch pattern or mock pattern failed to compile.
    #[error("invalid pattern '{pattern}': {message}")]
    PatternCompilation { pattern: String, message: String },

    /// The file exists but could not be read.
    #[error("could not read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ConfigError {
    pub(crate) fn parse(message: impl Into<String>) -> Self {
        ConfigError::Parse {
            message: message.into(),
        }
    }

    pub(crate) fn schema(path: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::SchemaValidation {
            path: path.into(),
            message: message.into(),
        }
    }

    pub(crate) fn pattern(pattern: impl Into<String>, message: impl ToString) -> Self {
        ConfigError::PatternCompilation {
            pattern: pattern.into(),
            message: message.to_string(),
        }
    }
}

/// Errors raised while rendering a mock body.
#[derive(Debug, Error)]
pub enum RenderError {
    /// A `@file` body reference could not be read.
    #[error("mock body file {} could not be read: {source}", path.display())]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize structured body: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// A failure inside one plugin's phase handler, isolated at the pipeline boundary.
#[derive(Debug, Clone, Error)]
#[error("plugin '{plugin}' failed during {phase}: {message}")]
pub struct PluginFaultError {
    pub plugin: String,
    pub phase: Phase,
    pub message: String,
}

/// A message attached to a location in the configuration, e.g.
/// `plugins[0].name` or `mocksPlugin.mocks[2].request.bodyRegex`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub path: String,
    pub message: String,
}

impl Diagnostic {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Attach an error to a path. Schema errors carry their own path, which
    /// is appended to `path`.
    pub fn from_error(path: &str, error: &ConfigError) -> Self {
        match error {
            ConfigError::SchemaValidation {
                path: inner,
                message,
            } if !inner.is_empty() && !path.is_empty() => {
                Self::new(format!("{path}.{inner}"), message.clone())
            }
            ConfigError::SchemaValidation {
                path: inner,
                message,
            } if path.is_empty() => Self::new(inner.clone(), message.clone()),
            ConfigError::SchemaValidation { message, .. } => Self::new(path, message.clone()),
            other => Self::new(path, other.to_string()),
        }
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.path, self.message)
        }
    }
}

pub type Result<T, E = ConfigError> = std::result::Result<T, E>;
