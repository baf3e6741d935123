//! Plugin pipeline.
//!
//! Each exchange is dispatched through the configured plugins in declared
//! order, one phase at a time. Before a plugin runs for a phase the
//! pipeline checks, in order:
//!
//! 1. the plugin declares the phase (otherwise skipped silently),
//! 2. the request URL is watched (otherwise skipped: "URL not matched"),
//! 3. for `BeforeRequest`, no earlier plugin has responded (otherwise
//!    skipped: "Response already set").
//!
//! Errors and panics inside a handler are caught here, logged and recorded
//! on the exchange. They never stop later plugins.

use crate::error::{Diagnostic, PluginFaultError};
use crate::urls::UrlWatchSet;
use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize, Serializer};
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, error, info};

pub const SKIP_URL_NOT_MATCHED: &str = "URL not matched";
pub const SKIP_RESPONSE_ALREADY_SET: &str = "Response already set";

/// Dispatch phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Phase {
    Init,
    BeforeRequest,
    BeforeResponse,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Init => "Init",
            Phase::BeforeRequest => "BeforeRequest",
            Phase::BeforeResponse => "BeforeResponse",
        };
        f.write_str(name)
    }
}

/// Phases a plugin takes part in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub on_init: bool,
    pub on_request: bool,
    pub on_response: bool,
}

impl Capabilities {
    pub fn supports(&self, phase: Phase) -> bool {
        match phase {
            Phase::Init => self.on_init,
            Phase::BeforeRequest => self.on_request,
            Phase::BeforeResponse => self.on_response,
        }
    }
}

/// Per-exchange response flags.
///
/// Both flags only ever go from `false` to `true`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseState {
    has_been_set: bool,
    has_been_modified: bool,
}

impl ResponseState {
    /// A plugin produced the response; later plugins must not respond.
    pub fn has_been_set(&self) -> bool {
        self.has_been_set
    }

    /// A plugin rewrote the response. Advisory only.
    pub fn has_been_modified(&self) -> bool {
        self.has_been_modified
    }
}

/// Lifecycle of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExchangeState {
    Unhandled,
    Mocked,
    PassedThrough,
    Modified,
    Finished,
}

/// An intercepted request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRequest {
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub body: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl HttpRequest {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }
}

/// A response to be written by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    #[serde(serialize_with = "body_as_text")]
    pub body: Vec<u8>,
}

fn body_as_text<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(body))
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    /// First header named `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Replace every header named `name` with a single value.
    pub fn set_header(&mut self, name: &str, value: &str) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.to_string()));
    }
}

/// A plugin passed over for one phase of one exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkipRecord {
    pub plugin: String,
    pub phase: Phase,
    pub reason: &'static str,
}

/// One request/response exchange, owned by the task handling it.
#[derive(Debug)]
pub struct Exchange {
    id: u64,
    request: HttpRequest,
    response: Option<HttpResponse>,
    response_state: ResponseState,
    state: ExchangeState,
    responder: Option<String>,
    modified_by: Vec<String>,
    skips: Vec<SkipRecord>,
    faults: Vec<PluginFaultError>,
    current_plugin: Option<String>,
}

impl Exchange {
    fn new(id: u64, request: HttpRequest) -> Self {
        Self {
            id,
            request,
            response: None,
            response_state: ResponseState::default(),
            state: ExchangeState::Unhandled,
            responder: None,
            modified_by: Vec::new(),
            skips: Vec::new(),
            faults: Vec::new(),
            current_plugin: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn request(&self) -> &HttpRequest {
        &self.request
    }

    pub fn response(&self) -> Option<&HttpResponse> {
        self.response.as_ref()
    }

    pub fn response_state(&self) -> ResponseState {
        self.response_state
    }

    pub fn state(&self) -> ExchangeState {
        self.state
    }

    /// Produce the response for this exchange.
    ///
    /// Returns `false`, leaving the exchange untouched, when another plugin
    /// has already responded.
    pub fn respond(&mut self, response: HttpResponse) -> bool {
        if self.response_state.has_been_set {
            return false;
        }
        self.response = Some(response);
        self.response_state.has_been_set = true;
        self.responder = self.current_plugin.clone();
        true
    }

    /// Rewrite the existing response. Returns `false` when there is none.
    pub fn modify_response(&mut self, edit: impl FnOnce(&mut HttpResponse)) -> bool {
        let Some(response) = self.response.as_mut() else {
            return false;
        };
        edit(response);
        self.response_state.has_been_modified = true;
        if let Some(plugin) = &self.current_plugin {
            if !self.modified_by.contains(plugin) {
                self.modified_by.push(plugin.clone());
            }
        }
        true
    }

    fn attach_upstream(&mut self, response: HttpResponse) {
        if self.response.is_none() {
            self.response = Some(response);
        }
    }

    /// Leave `Unhandled` for the state implied by the response flags.
    fn settle(&mut self) {
        if self.state != ExchangeState::Unhandled {
            return;
        }
        self.state = if self.response_state.has_been_set {
            ExchangeState::Mocked
        } else if self.response_state.has_been_modified {
            ExchangeState::Modified
        } else {
            ExchangeState::PassedThrough
        };
    }

    fn skip(&mut self, plugin: &str, phase: Phase, reason: &'static str) {
        debug!(plugin = %plugin, phase = %phase, url = %self.request.url, reason, "Skipping plugin");
        self.skips.push(SkipRecord {
            plugin: plugin.to_string(),
            phase,
            reason,
        });
    }

    /// Complete the exchange.
    pub fn finish(mut self) -> ExchangeOutcome {
        self.settle();
        let settled = self.state;
        ExchangeOutcome {
            id: self.id,
            state: ExchangeState::Finished,
            settled,
            response_state: self.response_state,
            response: self.response,
            responder: self.responder,
            modified_by: self.modified_by,
            skips: self.skips,
            faults: self.faults.iter().map(ToString::to_string).collect(),
        }
    }
}

/// Everything that happened to a finished exchange.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeOutcome {
    pub id: u64,
    pub state: ExchangeState,
    /// State the exchange was in before it finished
    pub settled: ExchangeState,
    pub response_state: ResponseState,
    pub response: Option<HttpResponse>,
    pub responder: Option<String>,
    pub modified_by: Vec<String>,
    pub skips: Vec<SkipRecord>,
    pub faults: Vec<String>,
}

/// A proxy plugin.
///
/// Handlers default to doing nothing; the pipeline only calls the ones
/// named in [`Plugin::capabilities`].
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    /// Prepare the plugin. An error disables it for the rest of the run.
    async fn on_init(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn before_request(&self, _exchange: &mut Exchange) -> anyhow::Result<()> {
        Ok(())
    }

    async fn before_response(&self, _exchange: &mut Exchange) -> anyhow::Result<()> {
        Ok(())
    }

    /// Configuration problems the plugin worked around.
    fn diagnostics(&self) -> Vec<Diagnostic> {
        Vec::new()
    }
}

/// A configured plugin's place in the pipeline.
#[derive(Debug)]
pub struct PluginDescriptor {
    name: String,
    declared_order: usize,
    capabilities: Capabilities,
    enabled: AtomicBool,
    urls: Option<UrlWatchSet>,
}

impl PluginDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn declared_order(&self) -> usize {
        self.declared_order
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Exclude the plugin from all further dispatch. Its position is kept.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    /// Per-plugin watch list overriding the global one.
    pub fn urls(&self) -> Option<&UrlWatchSet> {
        self.urls.as_ref()
    }
}

struct PipelineEntry {
    descriptor: PluginDescriptor,
    plugin: Box<dyn Plugin>,
}

/// Ordered plugin dispatcher.
pub struct Pipeline {
    entries: Vec<PipelineEntry>,
    urls: UrlWatchSet,
    next_exchange: AtomicU64,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field(
                "plugins",
                &self.entries.iter().map(|e| &e.descriptor).collect::<Vec<_>>(),
            )
            .field("urls", &self.urls)
            .finish()
    }
}

impl Pipeline {
    pub fn new(urls: UrlWatchSet) -> Self {
        Self {
            entries: Vec::new(),
            urls,
            next_exchange: AtomicU64::new(1),
        }
    }

    /// Append a plugin. Plugins run in the order they are added.
    pub fn push(&mut self, plugin: Box<dyn Plugin>, urls: Option<UrlWatchSet>) {
        let descriptor = PluginDescriptor {
            name: plugin.name().to_string(),
            declared_order: self.entries.len(),
            capabilities: plugin.capabilities(),
            enabled: AtomicBool::new(true),
            urls,
        };
        self.entries.push(PipelineEntry { descriptor, plugin });
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &PluginDescriptor> {
        self.entries.iter().map(|e| &e.descriptor)
    }

    pub fn urls(&self) -> &UrlWatchSet {
        &self.urls
    }

    /// Diagnostics reported by all plugins, in declared order.
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.entries
            .iter()
            .flat_map(|e| e.plugin.diagnostics())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run every plugin's `Init` handler in declared order. Plugins whose
    /// initialization fails are disabled; their faults are returned.
    pub async fn initialize(&mut self) -> Vec<PluginFaultError> {
        let mut faults = Vec::new();

        for entry in &mut self.entries {
            let descriptor = &entry.descriptor;
            if !descriptor.is_enabled() || !descriptor.capabilities.on_init {
                continue;
            }

            let result = AssertUnwindSafe(entry.plugin.on_init()).catch_unwind().await;
            if let Some(message) = failure_message(result) {
                descriptor.disable();
                error!(
                    plugin = %descriptor.name,
                    phase = %Phase::Init,
                    error = %message,
                    "Plugin failed to initialize and was disabled"
                );
                faults.push(PluginFaultError {
                    plugin: descriptor.name.clone(),
                    phase: Phase::Init,
                    message,
                });
            } else {
                debug!(plugin = %descriptor.name, "Plugin initialized");
            }
        }

        faults
    }

    /// Start an exchange.
    pub fn begin(&self, request: HttpRequest) -> Exchange {
        let id = self.next_exchange.fetch_add(1, Ordering::Relaxed);
        Exchange::new(id, request)
    }

    pub async fn before_request(&self, exchange: &mut Exchange) {
        self.dispatch(Phase::BeforeRequest, exchange).await;
    }

    pub async fn before_response(&self, exchange: &mut Exchange) {
        self.dispatch(Phase::BeforeResponse, exchange).await;
    }

    /// Run a whole exchange. `upstream` is only called when no plugin
    /// responded during `BeforeRequest`.
    pub async fn handle<F, Fut>(&self, request: HttpRequest, upstream: F) -> ExchangeOutcome
    where
        F: FnOnce(HttpRequest) -> Fut,
        Fut: Future<Output = HttpResponse>,
    {
        let mut exchange = self.begin(request);
        self.before_request(&mut exchange).await;

        if !exchange.response_state.has_been_set {
            let response = upstream(exchange.request.clone()).await;
            exchange.attach_upstream(response);
        }

        self.before_response(&mut exchange).await;
        exchange.finish()
    }

    fn is_watched(&self, descriptor: &PluginDescriptor, url: &str) -> bool {
        descriptor.urls.as_ref().unwrap_or(&self.urls).is_watched(url)
    }

    async fn dispatch(&self, phase: Phase, exchange: &mut Exchange) {
        for entry in &self.entries {
            let descriptor = &entry.descriptor;
            let name = descriptor.name.as_str();

            if !descriptor.is_enabled() {
                debug!(plugin = %name, phase = %phase, "Plugin disabled");
                continue;
            }
            if !descriptor.capabilities.supports(phase) {
                continue;
            }
            if !self.is_watched(descriptor, &exchange.request.url) {
                exchange.skip(name, phase, SKIP_URL_NOT_MATCHED);
                continue;
            }
            if phase == Phase::BeforeRequest && exchange.response_state.has_been_set {
                exchange.skip(name, phase, SKIP_RESPONSE_ALREADY_SET);
                continue;
            }

            let modified_before = exchange.modified_by.len();
            exchange.current_plugin = Some(name.to_string());

            let result = match phase {
                Phase::BeforeRequest => {
                    AssertUnwindSafe(entry.plugin.before_request(exchange))
                        .catch_unwind()
                        .await
                }
                Phase::BeforeResponse => {
                    AssertUnwindSafe(entry.plugin.before_response(exchange))
                        .catch_unwind()
                        .await
                }
                Phase::Init => Ok(Ok(())),
            };
            exchange.current_plugin = None;

            if let Some(message) = failure_message(result) {
                error!(
                    plugin = %name,
                    phase = %phase,
                    exchange = exchange.id,
                    error = %message,
                    "Plugin failed"
                );
                exchange.faults.push(PluginFaultError {
                    plugin: name.to_string(),
                    phase,
                    message,
                });
            }

            if exchange.responder.as_deref() == Some(name) && phase == Phase::BeforeRequest {
                info!(plugin = %name, url = %exchange.request.url, "Response set by plugin");
            }
            if exchange.modified_by.len() > modified_before {
                info!(plugin = %name, url = %exchange.request.url, "Response modified by plugin");
            }
        }
    }
}

fn failure_message(
    result: Result<anyhow::Result<()>, Box<dyn Any + Send>>,
) -> Option<String> {
    match result {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(format!("{e:#}")),
        Err(panic) => Some(panic_message(panic.as_ref())),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panicked: {message}")
    } else {
        "panicked".to_string()
    }
}
