//! Configuration validation.
//!
//! Runs every check a live proxy would otherwise degrade around and
//! reports all of them at once. Anything that would make the proxy skip a
//! plugin, pattern or mock is an error here.

use crate::config::{field, json_kind, resolve_config_file, ConfigSnapshot};
use crate::document::DocumentFormat;
use crate::error::{ConfigError, Diagnostic};
use crate::matcher::OccurrenceTable;
use crate::plugins::{build_pipeline, PluginRegistry};
use crate::stdio::{StdioMocker, STDIO_SECTION};
use crate::urls::UrlToWatch;
use serde::Serialize;
use serde_json::Value;
use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;

/// Exit code for an invalid configuration.
pub const EXIT_INVALID: i32 = 2;

/// Result of validating one configuration file.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub valid: bool,
    pub config_file: Option<String>,
    /// Names of enabled plugins
    pub plugins: Vec<String>,
    pub urls_to_watch: Vec<String>,
    pub errors: Vec<Diagnostic>,
    pub warnings: Vec<Diagnostic>,
}

impl ValidationReport {
    fn error(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.errors.push(Diagnostic::new(path, message));
    }

    fn warning(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.warnings.push(Diagnostic::new(path, message));
    }

    fn finish(mut self) -> Self {
        self.valid = self.errors.is_empty();
        self
    }

    pub fn exit_code(&self) -> i32 {
        if self.valid {
            0
        } else {
            EXIT_INVALID
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        if self.valid {
            out.push_str("\u{2713} Configuration is valid\n");
        } else {
            out.push_str("\u{2717} Configuration is invalid\n");
        }

        if let Some(file) = &self.config_file {
            let _ = writeln!(out, "  Config file: {file}");
        }
        if !self.plugins.is_empty() {
            let _ = writeln!(out, "  Plugins: {} loaded", self.plugins.len());
        }
        if !self.urls_to_watch.is_empty() {
            let count = self.urls_to_watch.len();
            let plural = if count == 1 { "" } else { "s" };
            let _ = writeln!(out, "  URLs to watch: {count} pattern{plural}");
        }

        for (title, messages) in [("Errors", &self.errors), ("Warnings", &self.warnings)] {
            if messages.is_empty() {
                continue;
            }
            let _ = writeln!(out, "\n{title}:");
            for message in messages {
                let _ = writeln!(out, "  - {message}");
            }
        }
        out
    }
}

/// Resolve and validate the configuration.
pub async fn validate_config(explicit: Option<&Path>, registry: &PluginRegistry) -> ValidationReport {
    match resolve_config_file(explicit) {
        Ok(path) => validate_file(&path, registry).await,
        Err(e) => {
            let mut report = ValidationReport::default();
            let message = match explicit {
                Some(path) => format!("Configuration file '{}' not found", path.display()),
                None => e.to_string(),
            };
            report.error("configFile", message);
            report.finish()
        }
    }
}

/// Validate one configuration file.
pub async fn validate_file(path: &Path, registry: &PluginRegistry) -> ValidationReport {
    let mut report = ValidationReport {
        config_file: Some(path.display().to_string()),
        ..Default::default()
    };

    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) => {
            report.error("configFile", format!("Could not read configuration file: {e}"));
            return report.finish();
        }
    };

    let snapshot = match ConfigSnapshot::from_text(path, &text) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            let message = match (DocumentFormat::from_path(path), e) {
                (DocumentFormat::Yaml, ConfigError::Parse { message }) => {
                    format!("Invalid YAML: {message}")
                }
                (_, ConfigError::Parse { message }) => format!("Invalid configuration: {message}"),
                (_, other) => format!("Invalid configuration: {other}"),
            };
            report.error("configFile", message);
            return report.finish();
        }
    };

    check_structure(&snapshot.document, &mut report);

    // Plugin and URL entries were already reported by the structure checks
    report.errors.extend(snapshot.warnings.iter().cloned().filter(|diagnostic| {
        let path = diagnostic.path.to_ascii_lowercase();
        !path.starts_with("plugins") && !path.starts_with("urlstowatch")
    }));

    let occurrences = Arc::new(OccurrenceTable::new());
    let build = build_pipeline(&snapshot, registry, Arc::clone(&occurrences)).await;
    report.errors.extend(build.diagnostics);

    if snapshot.section(STDIO_SECTION).is_some() {
        let mocker = StdioMocker::load(&snapshot, &occurrences).await;
        report.errors.extend(mocker.diagnostics().iter().cloned());
    }

    report.finish()
}

/// Checks on the raw document, independent of binding.
fn check_structure(document: &Value, report: &mut ValidationReport) {
    let Some(root) = document.as_object() else {
        report.error("configFile", "Configuration root must be an object");
        return;
    };

    match field(root, "$schema") {
        Some((_, Value::String(url))) if !url.is_empty() => {}
        _ => report.warning("$schema", "No schema URL found, skipping schema validation"),
    }

    match field(root, "plugins") {
        Some((_, Value::Array(plugins))) => check_plugins(plugins, report),
        _ => report.error("plugins", "No plugins configured"),
    }

    match field(root, "urlsToWatch") {
        Some((_, Value::Array(urls))) => check_urls(urls, report),
        _ => report.warning("urlsToWatch", "No URLs to watch configured"),
    }
}

fn check_plugins(plugins: &[Value], report: &mut ValidationReport) {
    let mut has_enabled = false;

    for (i, plugin) in plugins.iter().enumerate() {
        let Some(plugin) = plugin.as_object() else {
            report.error(
                format!("plugins[{i}]"),
                format!("Invalid plugin definition: expected an object, found {}", json_kind(plugin)),
            );
            continue;
        };

        let name = match plugin.get("name") {
            Some(Value::String(name)) if !name.is_empty() => name.clone(),
            _ => {
                report.error(format!("plugins[{i}].name"), "Plugin name is required");
                continue;
            }
        };

        let enabled = match plugin.get("enabled") {
            None => true,
            Some(Value::Bool(enabled)) => *enabled,
            Some(other) => {
                report.error(
                    format!("plugins[{i}]"),
                    format!("Invalid plugin definition: enabled must be a boolean, found {}", json_kind(other)),
                );
                continue;
            }
        };

        if enabled {
            has_enabled = true;
            report.plugins.push(name);
        }
    }

    if !has_enabled {
        report.error("plugins", "No enabled plugins found");
    }
}

fn check_urls(urls: &[Value], report: &mut ValidationReport) {
    for (i, url) in urls.iter().enumerate() {
        let Value::String(pattern) = url else {
            report.error(
                format!("urlsToWatch[{i}]"),
                format!("Expected a string but got {}", json_kind(url)),
            );
            continue;
        };

        if pattern.is_empty() {
            report.warning(format!("urlsToWatch[{i}]"), "Empty URL pattern");
            continue;
        }

        report.urls_to_watch.push(pattern.clone());
        if let Err(e) = UrlToWatch::new(pattern) {
            let message = match e {
                ConfigError::PatternCompilation { message, .. } => message,
                other => other.to_string(),
            };
            report.error(
                format!("urlsToWatch[{i}]"),
                format!("Invalid URL pattern '{pattern}': {message}"),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    async fn validate(path: &Path) -> ValidationReport {
        validate_file(path, &PluginRegistry::with_builtins()).await
    }

    #[tokio::test]
    async fn test_valid_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "devproxyrc.json",
            r#"{
                "$schema": "https://example.com/rc.schema.json",
                "plugins": [
                    { "name": "MockResponsePlugin", "configSection": "mocksPlugin" },
                    { "name": "LatencyPlugin", "enabled": false }
                ],
                "urlsToWatch": ["https://api.example.com/*", "!https://api.example.com/health"],
                "mocksPlugin": { "mocks": [] }
            }"#,
        );

        let report = validate(&path).await;
        assert!(report.valid, "{:?}", report.errors);
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.plugins, vec!["MockResponsePlugin"]);
        assert_eq!(report.urls_to_watch.len(), 2);
        assert!(report.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "devproxyrc.yaml", "plugins: [unclosed\n");

        let report = validate(&path).await;
        assert!(!report.valid);
        assert_eq!(report.exit_code(), EXIT_INVALID);
        assert_eq!(report.errors[0].path, "configFile");
        assert!(report.errors[0].message.starts_with("Invalid YAML"));
    }

    #[tokio::test]
    async fn test_structural_checks() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "devproxyrc.json",
            r#"{
                "port": "eighty",
                "plugins": [
                    { "enabled": true },
                    { "name": "Mystery" },
                    { "name": "MockResponsePlugin", "enabled": false }
                ],
                "urlsToWatch": [42, "", "https://ok/*"]
            }"#,
        );

        let report = validate(&path).await;
        let errors: Vec<_> = report
            .errors
            .iter()
            .map(|d| (d.path.as_str(), d.message.as_str()))
            .collect();

        assert!(errors.contains(&("plugins[0].name", "Plugin name is required")));
        assert!(errors.contains(&("urlsToWatch[0]", "Expected a string but got a number")));
        assert!(errors.iter().any(|(path, _)| *path == "port"));
        assert!(errors
            .iter()
            .any(|(path, message)| *path == "plugins[1]" && message.contains("not registered")));
        assert!(!errors.iter().any(|(path, _)| *path == "plugins"));

        let warnings: Vec<_> = report.warnings.iter().map(|d| d.path.as_str()).collect();
        assert_eq!(warnings, vec!["$schema", "urlsToWatch[1]"]);
        assert_eq!(report.plugins, vec!["Mystery"]);
    }

    #[tokio::test]
    async fn test_no_plugins() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "devproxyrc.json", "{}");
        let report = validate(&path).await;
        assert_eq!(report.errors[0], Diagnostic::new("plugins", "No plugins configured"));
        assert!(report.warnings.iter().any(|w| w.path == "urlsToWatch"));

        let path = write(dir.path(), "devproxyrc.json", r#"{ "plugins": [] }"#);
        let report = validate(&path).await;
        assert_eq!(report.errors[0], Diagnostic::new("plugins", "No enabled plugins found"));
    }

    #[tokio::test]
    async fn test_bad_mock_pattern_is_reported_with_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "devproxyrc.yaml",
            r#"
$schema: https://example.com/rc.schema.json
plugins:
  - name: MockResponsePlugin
    configSection: mocksPlugin
urlsToWatch: ["https://api.example.com/*"]
mocksPlugin:
  mocks:
    - request: { url: "https://api.example.com/*" }
    - request: { url: "https://api.example.com/*" }
    - request: { bodyRegex: "[a-" }
stdioMocks:
  mocks:
    - request: { nth: 0 }
"#,
        );

        let report = validate(&path).await;
        let paths: Vec<_> = report.errors.iter().map(|d| d.path.as_str()).collect();
        assert_eq!(
            paths,
            vec!["mocksPlugin.mocks[2].request.bodyRegex", "stdioMocks.mocks[0].request.nth"]
        );
    }

    #[tokio::test]
    async fn test_missing_explicit_file() {
        let report = validate_config(
            Some(Path::new("/definitely/not/here.json")),
            &PluginRegistry::with_builtins(),
        )
        .await;
        assert!(!report.valid);
        assert_eq!(report.config_file, None);
        assert_eq!(
            report.errors[0].message,
            "Configuration file '/definitely/not/here.json' not found"
        );
    }

    #[test]
    fn test_render_text() {
        let mut report = ValidationReport {
            config_file: Some("devproxyrc.json".to_string()),
            urls_to_watch: vec!["https://a/*".to_string()],
            ..Default::default()
        };
        report.warning("$schema", "No schema URL found, skipping schema validation");
        let report = report.finish();

        let text = report.render_text();
        assert!(text.starts_with("\u{2713} Configuration is valid"));
        assert!(text.contains("URLs to watch: 1 pattern\n"));
        assert!(text.contains("  - $schema: No schema URL found"));

        let json: Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(json["valid"], true);
        assert_eq!(json["configFile"], "devproxyrc.json");
        assert_eq!(json["warnings"][0]["path"], "$schema");
    }
}
