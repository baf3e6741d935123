//! Plugin registry and built-in plugins.
//!
//! Plugins are looked up by name in a static registry; each entry is a
//! factory that binds the plugin's options from its configuration section.

use crate::config::{load_mocks_file, ConfigSnapshot};
use crate::error::{ConfigError, Diagnostic, PluginFaultError, Result};
use crate::flatten::FlatConfig;
use crate::matcher::{DefinitionError, MockHeader, MockMatcher, MockResponse, OccurrenceTable};
use crate::pipeline::{Capabilities, Exchange, HttpResponse, Pipeline, Plugin};
use crate::render::render_response;
use crate::urls::UrlWatchSet;
use anyhow::bail;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Everything a factory gets to build a plugin.
#[derive(Debug, Clone)]
pub struct PluginContext {
    pub name: String,
    /// Directory of the configuration file
    pub config_dir: PathBuf,
    /// Name of the options section, if configured
    pub section_name: Option<String>,
    /// Structured options (`Null` when there is no section)
    pub options: Value,
    /// Flat view of the options section
    pub flat: FlatConfig,
    pub occurrences: Arc<OccurrenceTable>,
}

impl PluginContext {
    /// Bind the options section into a typed value.
    pub fn bind<T: DeserializeOwned + Default>(&self) -> Result<T> {
        if self.options.is_null() {
            return Ok(T::default());
        }
        serde_json::from_value(self.options.clone())
            .map_err(|e| ConfigError::schema(self.section_path(), e.to_string()))
    }

    /// Diagnostic path prefix for the options section.
    pub fn section_path(&self) -> String {
        self.section_name
            .clone()
            .unwrap_or_else(|| self.name.clone())
    }
}

/// Builds a plugin from its context.
pub type PluginFactory = fn(&PluginContext) -> Result<Box<dyn Plugin>>;

/// Name to factory table.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    factories: Vec<(String, PluginFactory)>,
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the plugins that ship with the proxy.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(MockResponsePlugin::NAME, MockResponsePlugin::create);
        registry.register(RandomErrorPlugin::NAME, RandomErrorPlugin::create);
        registry.register(LatencyPlugin::NAME, LatencyPlugin::create);
        registry.register(ResponseHeadersPlugin::NAME, ResponseHeadersPlugin::create);
        registry
    }

    /// Register a factory, replacing any previous one with the same name.
    pub fn register(&mut self, name: &str, factory: PluginFactory) {
        self.factories.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.factories.push((name.to_string(), factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factory(name).is_some()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.iter().map(|(n, _)| n.as_str())
    }

    fn factory(&self, name: &str) -> Option<PluginFactory> {
        self.factories
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, f)| *f)
    }

    pub fn create(&self, context: &PluginContext) -> Result<Box<dyn Plugin>> {
        let factory = self.factory(&context.name).ok_or_else(|| {
            ConfigError::ConfigurationMissing(format!("Plugin '{}' is not registered", context.name))
        })?;
        factory(context)
    }
}

/// A pipeline built from a snapshot, plus what went wrong building it.
pub struct PipelineBuild {
    pub pipeline: Pipeline,
    pub diagnostics: Vec<Diagnostic>,
    pub faults: Vec<PluginFaultError>,
}

/// Build and initialize the pipeline for a snapshot.
///
/// Disabled entries are left out. Entries that cannot be built are left out
/// with a diagnostic. Plugins that fail to initialize keep their place but
/// stay disabled.
pub async fn build_pipeline(
    snapshot: &ConfigSnapshot,
    registry: &PluginRegistry,
    occurrences: Arc<OccurrenceTable>,
) -> PipelineBuild {
    let mut pipeline = Pipeline::new(snapshot.urls.clone());
    let mut diagnostics = Vec::new();

    let mut positions = Vec::new();

    for reference in &snapshot.settings.plugins {
        let path = format!("plugins[{}]", reference.position);
        if !reference.enabled {
            debug!(plugin = %reference.name, "Plugin disabled in configuration");
            continue;
        }

        if let Some(plugin_path) = &reference.plugin_path {
            let asset = snapshot.resolve_path(plugin_path);
            if !asset.exists() {
                warn!(plugin = %reference.name, path = %asset.display(), "Plugin path does not exist");
                diagnostics.push(Diagnostic::new(
                    format!("{path}.pluginPath"),
                    format!("Plugin file not found: {}", asset.display()),
                ));
            }
        }

        let (options, flat) = match &reference.config_section {
            Some(section) => (
                snapshot.section(section).cloned().unwrap_or(Value::Null),
                snapshot.flat_section(section),
            ),
            None => (Value::Null, FlatConfig::default()),
        };

        let context = PluginContext {
            name: reference.name.clone(),
            config_dir: snapshot.base_dir.clone(),
            section_name: reference.config_section.clone(),
            options,
            flat,
            occurrences: Arc::clone(&occurrences),
        };

        let plugin = match registry.create(&context) {
            Ok(plugin) => plugin,
            Err(e) => {
                warn!(plugin = %reference.name, error = %e, "Skipping plugin");
                diagnostics.push(Diagnostic::from_error(&path, &e));
                continue;
            }
        };

        let urls = match &reference.urls_to_watch {
            Some(patterns) => {
                let (urls, errors) = UrlWatchSet::compile_lenient(patterns);
                for e in &errors {
                    warn!(plugin = %reference.name, error = %e, "Skipping watch pattern");
                    diagnostics.push(Diagnostic::from_error(&format!("{path}.urlsToWatch"), e));
                }
                Some(urls)
            }
            None => None,
        };

        pipeline.push(plugin, urls);
        positions.push(reference.position);
    }

    let faults = pipeline.initialize().await;

    // Plugins are only disabled by a failed init, in declared order.
    let disabled = pipeline.descriptors().filter(|d| !d.is_enabled());
    for (descriptor, fault) in disabled.zip(&faults) {
        let position = positions
            .get(descriptor.declared_order())
            .copied()
            .unwrap_or_default();
        diagnostics.push(Diagnostic::new(
            format!("plugins[{position}]"),
            format!("Failed to initialize '{}': {}", fault.plugin, fault.message),
        ));
    }
    diagnostics.extend(pipeline.diagnostics());

    info!(
        plugins = pipeline.len(),
        enabled = pipeline.descriptors().filter(|d| d.is_enabled()).count(),
        "Plugin pipeline ready"
    );

    PipelineBuild {
        pipeline,
        diagnostics,
        faults,
    }
}

fn definition_diagnostics(prefix: &str, errors: &[DefinitionError]) -> Vec<Diagnostic> {
    errors
        .iter()
        .map(|e| {
            let path = e.path(prefix);
            let message = e.message();
            warn!(path = %path, error = %message, "Skipping mock");
            Diagnostic::new(path, message)
        })
        .collect()
}

/// Options of [`MockResponsePlugin`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MockResponseOptions {
    /// Raw definitions, bound one by one when compiled
    #[serde(default)]
    pub mocks: Vec<Value>,
    #[serde(default)]
    pub mocks_file: Option<String>,
    #[serde(default)]
    pub block_unmocked_requests: bool,
}

struct MockSet {
    matcher: MockMatcher,
    /// Directory `@file` bodies resolve against
    base_dir: PathBuf,
}

/// Answers watched requests with configured mock responses.
pub struct MockResponsePlugin {
    name: String,
    options: MockResponseOptions,
    config_dir: PathBuf,
    occurrences: Arc<OccurrenceTable>,
    sets: Vec<MockSet>,
    diagnostics: Vec<Diagnostic>,
}

impl MockResponsePlugin {
    pub const NAME: &'static str = "MockResponsePlugin";

    fn create(context: &PluginContext) -> Result<Box<dyn Plugin>> {
        Ok(Box::new(Self::new(context)?))
    }

    pub fn new(context: &PluginContext) -> Result<Self> {
        let options: MockResponseOptions = context.bind()?;
        let section = context.section_path();

        let scope = format!("{}:inline", context.name);
        let (matcher, errors) =
            MockMatcher::compile_values(&options.mocks, &scope, &context.occurrences);
        let diagnostics = definition_diagnostics(&format!("{section}.mocks"), &errors);

        let mut sets = Vec::new();
        if !matcher.is_empty() {
            sets.push(MockSet {
                matcher,
                base_dir: context.config_dir.clone(),
            });
        }

        Ok(Self {
            name: context.name.clone(),
            options,
            config_dir: context.config_dir.clone(),
            occurrences: Arc::clone(&context.occurrences),
            sets,
            diagnostics,
        })
    }

    async fn load_file(&mut self, relative: &str) -> Result<()> {
        let path = self.config_dir.join(relative);
        let mocks = load_mocks_file(&path).await?;

        let scope = format!("{}:{}", self.name, path.display());
        let (matcher, errors) = MockMatcher::compile_values(&mocks, &scope, &self.occurrences);
        self.diagnostics
            .extend(definition_diagnostics(&format!("{relative}: mocks"), &errors));

        info!(plugin = %self.name, file = %path.display(), mocks = matcher.len(), "Loaded mocks");
        let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        self.sets.push(MockSet { matcher, base_dir });
        Ok(())
    }
}

#[async_trait]
impl Plugin for MockResponsePlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            on_init: true,
            on_request: true,
            on_response: false,
        }
    }

    async fn on_init(&mut self) -> anyhow::Result<()> {
        if let Some(file) = self.options.mocks_file.clone() {
            self.load_file(&file).await?;
        }
        Ok(())
    }

    async fn before_request(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        let request = exchange.request();

        for set in &self.sets {
            let Some(hit) =
                set.matcher
                    .find_match(&request.method, &request.url, request.body.as_deref())
            else {
                continue;
            };

            info!(
                plugin = %self.name,
                mock = hit.index,
                occurrence = ?hit.occurrence,
                url = %request.url,
                "Mock fired"
            );
            let response = render_response(&hit.definition.response, &set.base_dir).await?;
            exchange.respond(response);
            return Ok(());
        }

        if self.options.block_unmocked_requests {
            let body = json!({
                "error": {
                    "message": format!("No mock response found for {} {}", request.method, request.url),
                }
            });
            info!(plugin = %self.name, url = %request.url, "Blocking unmocked request");
            let mut response = HttpResponse::new(502);
            response.set_header("Content-Type", "application/json");
            response.body = serde_json::to_vec(&body)?;
            exchange.respond(response);
        } else {
            debug!(plugin = %self.name, url = %request.url, "No mock matched");
        }

        Ok(())
    }

    fn diagnostics(&self) -> Vec<Diagnostic> {
        self.diagnostics.clone()
    }
}

/// Options of [`RandomErrorPlugin`].
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RandomErrorOptions {
    /// Failure probability in percent
    #[serde(default = "default_rate")]
    pub rate: u8,
    #[serde(default)]
    pub errors: Vec<MockResponse>,
}

fn default_rate() -> u8 {
    50
}

impl Default for RandomErrorOptions {
    fn default() -> Self {
        Self {
            rate: default_rate(),
            errors: Vec::new(),
        }
    }
}

/// Fails a share of watched requests with one of the configured errors.
pub struct RandomErrorPlugin {
    name: String,
    options: RandomErrorOptions,
    config_dir: PathBuf,
}

impl RandomErrorPlugin {
    pub const NAME: &'static str = "RandomErrorPlugin";

    fn create(context: &PluginContext) -> Result<Box<dyn Plugin>> {
        let options: RandomErrorOptions = context.bind()?;
        if options.rate > 100 {
            return Err(ConfigError::schema(
                format!("{}.rate", context.section_path()),
                format!("rate must be between 0 and 100, got {}", options.rate),
            ));
        }
        Ok(Box::new(Self {
            name: context.name.clone(),
            options,
            config_dir: context.config_dir.clone(),
        }))
    }

    fn pick_error(&self) -> Option<&MockResponse> {
        use rand::Rng;
        if self.options.errors.is_empty() {
            return None;
        }
        let mut rng = rand::thread_rng();
        if rng.gen_range(0..100u8) >= self.options.rate {
            return None;
        }
        let index = rng.gen_range(0..self.options.errors.len());
        self.options.errors.get(index)
    }
}

#[async_trait]
impl Plugin for RandomErrorPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            on_init: true,
            on_request: true,
            on_response: false,
        }
    }

    async fn on_init(&mut self) -> anyhow::Result<()> {
        if self.options.errors.is_empty() {
            bail!("no errors configured");
        }
        Ok(())
    }

    async fn before_request(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        let Some(error) = self.pick_error() else {
            return Ok(());
        };

        info!(plugin = %self.name, status = error.status_code, url = %exchange.request().url, "Failing request");
        let response = render_response(error, &self.config_dir).await?;
        exchange.respond(response);
        Ok(())
    }
}

/// Delays responses by a random duration between `minMs` and `maxMs`.
#[derive(Debug)]
pub struct LatencyPlugin {
    name: String,
    min_ms: u64,
    max_ms: u64,
}

impl LatencyPlugin {
    pub const NAME: &'static str = "LatencyPlugin";

    fn create(context: &PluginContext) -> Result<Box<dyn Plugin>> {
        let section = context.section_path();
        let read = |key: &str| -> Result<u64> {
            match context.flat.get(key) {
                None => Ok(0),
                Some(raw) => raw.trim().parse().map_err(|_| {
                    ConfigError::schema(
                        format!("{section}.{key}"),
                        format!("expected a non-negative number of milliseconds, got '{raw}'"),
                    )
                }),
            }
        };
        Ok(Box::new(Self {
            name: context.name.clone(),
            min_ms: read("minMs")?,
            max_ms: read("maxMs")?,
        }))
    }

    /// Delay to apply to one response.
    pub fn calculate(&self) -> u64 {
        if self.max_ms > self.min_ms {
            use rand::Rng;
            let mut rng = rand::thread_rng();
            return rng.gen_range(self.min_ms..=self.max_ms);
        }
        self.min_ms
    }
}

#[async_trait]
impl Plugin for LatencyPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            on_init: false,
            on_request: false,
            on_response: true,
        }
    }

    async fn before_response(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        let delay_ms = self.calculate();
        if delay_ms > 0 {
            debug!(plugin = %self.name, exchange = exchange.id(), delay_ms, "Applying delay");
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
        Ok(())
    }
}

/// Options of [`ResponseHeadersPlugin`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponseHeadersOptions {
    #[serde(default)]
    pub headers: Vec<MockHeader>,
}

/// Adds or replaces headers on every watched response.
#[derive(Debug)]
pub struct ResponseHeadersPlugin {
    name: String,
    headers: Vec<MockHeader>,
}

impl ResponseHeadersPlugin {
    pub const NAME: &'static str = "ResponseHeadersPlugin";

    fn create(context: &PluginContext) -> Result<Box<dyn Plugin>> {
        let options: ResponseHeadersOptions = context.bind()?;
        Ok(Box::new(Self {
            name: context.name.clone(),
            headers: options.headers,
        }))
    }
}

#[async_trait]
impl Plugin for ResponseHeadersPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            on_init: false,
            on_request: false,
            on_response: true,
        }
    }

    async fn before_response(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        if self.headers.is_empty() {
            return Ok(());
        }
        exchange.modify_response(|response| {
            for header in &self.headers {
                response.set_header(&header.name, &header.value);
            }
        });
        Ok(())
    }
}
