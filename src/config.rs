//! Proxy configuration: file resolution, typed settings and snapshots.

use crate::document::{Document, DocumentFormat};
use crate::error::{ConfigError, Diagnostic, Result};
use crate::flatten::FlatConfig;
use crate::urls::UrlWatchSet;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, warn};

/// Configuration file names, in lookup order.
pub const CONFIG_FILE_NAMES: [&str; 4] = [
    "devproxyrc.jsonc",
    "devproxyrc.json",
    "devproxyrc.yaml",
    "devproxyrc.yml",
];

/// Project-local configuration directory.
pub const CONFIG_SUBDIR: &str = ".devproxy";

/// Folder under the platform data directory.
pub const APP_DATA_DIR: &str = "dev-proxy";

/// Log verbosity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Information,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Information => "information",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        }
    }

    pub fn to_tracing(self) -> tracing::Level {
        match self {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Information => tracing::Level::INFO,
            LogLevel::Warning => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "information" | "info" => Ok(LogLevel::Information),
            "warning" | "warn" => Ok(LogLevel::Warning),
            "error" => Ok(LogLevel::Error),
            other => Err(format!(
                "unknown log level '{other}', expected one of trace, debug, information, warning, error"
            )),
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, String> {
        value.parse()
    }
}

impl From<LogLevel> for String {
    fn from(level: LogLevel) -> Self {
        level.as_str().to_string()
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A plugin entry in the `plugins` list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginReference {
    pub name: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Plugin assembly/library path, relative to the config file
    #[serde(default)]
    pub plugin_path: Option<String>,

    /// Root key holding the plugin's options
    #[serde(default)]
    pub config_section: Option<String>,

    /// Overrides the global watch list for this plugin
    #[serde(default)]
    pub urls_to_watch: Option<Vec<String>>,

    /// Index in the configured `plugins` list
    #[serde(skip)]
    pub position: usize,
}

fn default_true() -> bool {
    true
}

/// Top-level proxy settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxySettings {
    #[serde(rename = "$schema")]
    pub schema: Option<String>,
    pub plugins: Vec<PluginReference>,
    pub urls_to_watch: Vec<String>,
    pub port: u16,
    pub api_port: u16,
    pub ip_address: String,
    pub log_level: LogLevel,
    pub record: bool,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            schema: None,
            plugins: Vec::new(),
            urls_to_watch: Vec::new(),
            port: 8000,
            api_port: 8897,
            ip_address: "127.0.0.1".to_string(),
            log_level: LogLevel::default(),
            record: false,
        }
    }
}

impl ProxySettings {
    /// Bind settings from a structured document.
    ///
    /// Each setting, each plugin entry and each watch pattern is bound on
    /// its own. A value that does not fit keeps its default and is reported.
    pub fn bind(document: &Value) -> (Self, Vec<ConfigError>) {
        let mut settings = Self::default();
        let mut errors = Vec::new();

        let Some(root) = document.as_object() else {
            if !document.is_null() {
                errors.push(ConfigError::schema("", "configuration root must be an object"));
            }
            return (settings, errors);
        };

        bind_field(root, "$schema", &mut settings.schema, &mut errors);
        bind_field(root, "port", &mut settings.port, &mut errors);
        bind_field(root, "apiPort", &mut settings.api_port, &mut errors);
        bind_field(root, "ipAddress", &mut settings.ip_address, &mut errors);
        bind_field(root, "logLevel", &mut settings.log_level, &mut errors);
        bind_field(root, "record", &mut settings.record, &mut errors);

        if let Some((key, value)) = field(root, "plugins") {
            match value {
                Value::Array(items) => {
                    for (index, item) in items.iter().enumerate() {
                        match serde_json::from_value::<PluginReference>(item.clone()) {
                            Ok(mut plugin) => {
                                plugin.position = index;
                                settings.plugins.push(plugin);
                            }
                            Err(e) => errors.push(ConfigError::schema(
                                format!("{key}[{index}]"),
                                e.to_string(),
                            )),
                        }
                    }
                }
                Value::Null => {}
                _ => errors.push(ConfigError::schema(key, "expected an array of plugins")),
            }
        }

        if let Some((key, value)) = field(root, "urlsToWatch") {
            match value {
                Value::Array(items) => {
                    for (index, item) in items.iter().enumerate() {
                        match item {
                            Value::String(url) => settings.urls_to_watch.push(url.clone()),
                            other => errors.push(ConfigError::schema(
                                format!("{key}[{index}]"),
                                format!("expected a string, found {}", json_kind(other)),
                            )),
                        }
                    }
                }
                Value::Null => {}
                _ => errors.push(ConfigError::schema(key, "expected an array of URLs")),
            }
        }

        (settings, errors)
    }
}

/// Top-level field lookup, ignoring key case.
pub(crate) fn field<'a>(map: &'a Map<String, Value>, name: &str) -> Option<(&'a str, &'a Value)> {
    map.iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(key, value)| (key.as_str(), value))
}

fn bind_field<T: DeserializeOwned>(
    map: &Map<String, Value>,
    name: &str,
    target: &mut T,
    errors: &mut Vec<ConfigError>,
) {
    let Some((key, value)) = field(map, name) else {
        return;
    };
    match serde_json::from_value::<T>(value.clone()) {
        Ok(bound) => *target = bound,
        Err(e) => errors.push(ConfigError::schema(key, e.to_string())),
    }
}

pub(crate) fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Candidate configuration files in lookup order.
pub fn config_file_candidates(current_dir: &Path, data_dir: Option<&Path>) -> Vec<PathBuf> {
    let mut dirs = vec![current_dir.to_path_buf(), current_dir.join(CONFIG_SUBDIR)];
    if let Some(data_dir) = data_dir {
        dirs.push(data_dir.join(APP_DATA_DIR));
    }

    dirs.iter()
        .flat_map(|dir| CONFIG_FILE_NAMES.iter().map(move |name| dir.join(name)))
        .collect()
}

/// Resolve the configuration file from the process environment.
pub fn resolve_config_file(explicit: Option<&Path>) -> Result<PathBuf> {
    let current_dir = std::env::current_dir().map_err(|source| ConfigError::Io {
        path: PathBuf::from("."),
        source,
    })?;
    let data_dir = dirs::data_dir();
    resolve_config_file_in(explicit, &current_dir, data_dir.as_deref())
}

/// Resolve the configuration file. An explicit path must exist; otherwise
/// the first existing candidate wins.
pub fn resolve_config_file_in(
    explicit: Option<&Path>,
    current_dir: &Path,
    data_dir: Option<&Path>,
) -> Result<PathBuf> {
    if let Some(path) = explicit {
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            current_dir.join(path)
        };
        if path.is_file() {
            return Ok(path);
        }
        return Err(ConfigError::ConfigurationMissing(format!(
            "Configuration file {} does not exist",
            path.display()
        )));
    }

    let candidates = config_file_candidates(current_dir, data_dir);
    if let Some(found) = candidates.iter().find(|c| c.is_file()) {
        debug!(path = %found.display(), "Using configuration file");
        return Ok(found.clone());
    }

    let looked_in = candidates
        .iter()
        .map(|c| c.display().to_string())
        .collect::<Vec<_>>()
        .join(", ");
    Err(ConfigError::ConfigurationMissing(format!(
        "No configuration file found. Looked in: {looked_in}"
    )))
}

async fn read_text(path: &Path) -> Result<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => Ok(text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(
            ConfigError::ConfigurationMissing(format!("File {} does not exist", path.display())),
        ),
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Load the raw `mocks` list from a mocks file (`{ "mocks": [...] }`).
/// Elements are left unbound so one bad mock can be skipped on its own.
pub async fn load_mocks_file(path: &Path) -> Result<Vec<Value>> {
    let text = read_text(path).await?;
    let document = Document::parse(&text, DocumentFormat::from_path(path))?.to_json();

    let mocks = document
        .as_object()
        .and_then(|root| field(root, "mocks"))
        .map(|(_, value)| value.clone())
        .unwrap_or(Value::Array(Vec::new()));

    match mocks {
        Value::Array(items) => Ok(items),
        Value::Null => Ok(Vec::new()),
        other => Err(ConfigError::schema(
            format!("{}: mocks", path.display()),
            format!("expected a list, found {}", json_kind(&other)),
        )),
    }
}

/// One immutable load of the configuration.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub path: PathBuf,
    /// Directory that relative paths in the configuration resolve against
    pub base_dir: PathBuf,
    pub flat: FlatConfig,
    pub document: Value,
    pub settings: ProxySettings,
    pub urls: UrlWatchSet,
    /// Settings and patterns that were skipped
    pub warnings: Vec<Diagnostic>,
}

impl ConfigSnapshot {
    /// Read and parse a configuration file.
    pub async fn load(path: &Path) -> Result<Self> {
        let text = read_text(path).await?;
        Self::from_text(path, &text)
    }

    /// Build a snapshot from file contents. Fails only when the text cannot
    /// be parsed; everything else degrades to warnings.
    pub fn from_text(path: &Path, text: &str) -> Result<Self> {
        let parsed = Document::parse(text, DocumentFormat::from_path(path))?;
        let flat = parsed.flatten();
        let document = parsed.to_json();

        let (settings, bind_errors) = ProxySettings::bind(&document);
        let mut warnings: Vec<Diagnostic> = bind_errors
            .iter()
            .map(|e| Diagnostic::from_error("", e))
            .collect();

        let (urls, url_errors) = UrlWatchSet::compile_lenient(&settings.urls_to_watch);
        warnings.extend(url_errors.iter().map(|e| Diagnostic::from_error("urlsToWatch", e)));

        for warning in &warnings {
            warn!(path = %warning.path, "Skipping setting: {}", warning.message);
        }

        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        Ok(Self {
            path: path.to_path_buf(),
            base_dir,
            flat,
            document,
            settings,
            urls,
            warnings,
        })
    }

    /// Structured value of a top-level section, ignoring key case.
    pub fn section(&self, name: &str) -> Option<&Value> {
        self.document
            .as_object()
            .and_then(|root| field(root, name))
            .map(|(_, value)| value)
    }

    /// Flat view of a top-level section.
    pub fn flat_section(&self, name: &str) -> FlatConfig {
        self.flat.section(name)
    }

    /// Resolve a path from the configuration against its directory.
    pub fn resolve_path(&self, relative: &str) -> PathBuf {
        self.base_dir.join(relative)
    }
}
