//! Dev Proxy Core
//!
//! Configuration resolution and traffic matching for a local intercepting
//! proxy used to test API-dependent applications: mocking APIs, injecting
//! faults and rewriting responses.
//!
//! # Features
//!
//! - **Configuration**: JSON (with comments) and YAML with anchors and `<<` merge keys
//! - **Flat and structured views**: one merge-resolved tree, two consistent outputs
//! - **URL watching**: `*` globs with `!` exclusions
//! - **Mock matching**: regex / fragment / catch-all precedence with `nth` occurrences
//! - **Plugin pipeline**: declared order, single responder, isolated plugin failures
//! - **Live reload**: atomic configuration swaps while exchanges are in flight
//! - **Stdio mocking**: answer stdin traffic from the same mock engine
//!
//! # Example Configuration
//!
//! ```yaml
//! $schema: https://raw.githubusercontent.com/dotnet/dev-proxy/main/schemas/v1.0.0/rc.schema.json
//! plugins:
//!   - name: MockResponsePlugin
//!     configSection: mocksPlugin
//! urlsToWatch:
//!   - https://api.example.com/*
//!   - "!https://api.example.com/health"
//! defaults: &defaults
//!   statusCode: 200
//!   headers:
//!     - name: X-Mocked
//!       value: "true"
//! mocksPlugin:
//!   mocks:
//!     - request:
//!         url: https://api.example.com/users/*
//!         method: GET
//!       response:
//!         <<: *defaults
//!         body: "@responses/user.json"
//! ```

pub mod config;
pub mod document;
pub mod error;
pub mod flatten;
pub mod matcher;
pub mod pipeline;
pub mod plugins;
pub mod reload;
pub mod render;
pub mod stdio;
pub mod urls;
pub mod validate;

pub use config::{ConfigSnapshot, ProxySettings};
pub use document::{ConfigNode, Document};
pub use error::{ConfigError, Diagnostic, PluginFaultError, RenderError};
pub use flatten::FlatConfig;
pub use matcher::{MockMatcher, OccurrenceTable, StdioMockMatcher};
pub use pipeline::{Exchange, ExchangeOutcome, HttpRequest, HttpResponse, Pipeline, Plugin};
pub use plugins::PluginRegistry;
pub use reload::{ConfigWatcher, LiveProxy};
pub use stdio::StdioMocker;
pub use urls::{UrlToWatch, UrlWatchSet};
pub use validate::{validate_config, ValidationReport};
