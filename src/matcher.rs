//! Mock matching for HTTP requests and stdio traffic.
//!
//! Definitions are evaluated in declared order. For each candidate the
//! content rule is applied top-down:
//!
//! 1. a configured `bodyRegex` alone decides (any `bodyFragment` is ignored),
//! 2. otherwise a configured `bodyFragment` is tested as a case-insensitive
//!    substring,
//! 3. otherwise the definition matches unconditionally.
//!
//! A definition with `nth` counts every structural match and fires only on
//! the `nth` one, never again. The first definition that matches and is
//! allowed to fire wins.

use crate::error::ConfigError;
use crate::render::MockBody;
use crate::urls::compile_glob;
use dashmap::DashMap;
use regex::{Regex, RegexBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Response header in a mock definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MockHeader {
    pub name: String,
    pub value: String,
}

/// Request side of an HTTP mock.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MockRequest {
    /// URL to match; `*` matches any sequence of characters
    #[serde(default)]
    pub url: Option<String>,

    /// HTTP method, compared case-insensitively
    #[serde(default = "default_method")]
    pub method: String,

    /// Case-insensitive substring of the request body
    #[serde(default)]
    pub body_fragment: Option<String>,

    /// Case-insensitive regex over the request body; takes precedence over `body_fragment`
    #[serde(default)]
    pub body_regex: Option<String>,

    /// Fire only on this (1-based) structural match
    #[serde(default)]
    pub nth: Option<u32>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl Default for MockRequest {
    fn default() -> Self {
        Self {
            url: None,
            method: default_method(),
            body_fragment: None,
            body_regex: None,
            nth: None,
        }
    }
}

/// Response side of an HTTP mock.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MockResponse {
    #[serde(default = "default_status")]
    pub status_code: u16,

    #[serde(default)]
    pub headers: Vec<MockHeader>,

    #[serde(default)]
    pub body: Option<MockBody>,
}

fn default_status() -> u16 {
    200
}

impl Default for MockResponse {
    fn default() -> Self {
        Self {
            status_code: default_status(),
            headers: Vec::new(),
            body: None,
        }
    }
}

/// An HTTP mock definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MockDefinition {
    #[serde(default)]
    pub request: MockRequest,
    #[serde(default)]
    pub response: MockResponse,
}

/// Request side of a stdio mock.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StdioMockRequest {
    #[serde(default)]
    pub body_fragment: Option<String>,
    #[serde(default)]
    pub body_regex: Option<String>,
    #[serde(default)]
    pub nth: Option<u32>,
}

/// Output of a stdio mock.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StdioMockResponse {
    #[serde(default)]
    pub stdout: Option<MockBody>,
    #[serde(default)]
    pub stderr: Option<MockBody>,
}

/// A stdio mock definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StdioMockDefinition {
    #[serde(default)]
    pub request: StdioMockRequest,
    #[serde(default)]
    pub response: StdioMockResponse,
}

/// Process-wide occurrence counters, keyed by definition identity.
///
/// Counters are created on first use. Recompiling a definition with the
/// same identity against the same table picks up its existing counter.
/// [`OccurrenceTable::prune`] drops counters no compiled definition holds.
#[derive(Debug, Default)]
pub struct OccurrenceTable {
    counters: DashMap<String, Arc<AtomicU64>>,
}

impl OccurrenceTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, identity: &str) -> Arc<AtomicU64> {
        self.counters
            .entry(identity.to_string())
            .or_default()
            .value()
            .clone()
    }

    /// Remove counters held only by the table. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let before = self.counters.len();
        self.counters.retain(|_, counter| Arc::strong_count(counter) > 1);
        before.saturating_sub(self.counters.len())
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

/// A problem with one definition found while compiling it.
#[derive(Debug)]
pub struct DefinitionError {
    /// Position of the definition in its list
    pub index: usize,
    /// Offending field, relative to the definition (e.g. `request.bodyRegex`)
    pub field: &'static str,
    pub error: ConfigError,
}

impl DefinitionError {
    /// Configuration path of the offending value, under the list's `prefix`.
    pub fn path(&self, prefix: &str) -> String {
        if self.field.is_empty() {
            format!("{prefix}[{}]", self.index)
        } else {
            format!("{prefix}[{}].{}", self.index, self.field)
        }
    }

    pub fn message(&self) -> String {
        match &self.error {
            ConfigError::SchemaValidation { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

/// Bind raw definitions one element at a time. Elements that do not fit
/// are reported at their own index and left out; the rest keep their
/// declared position.
pub fn bind_definitions<T: DeserializeOwned>(
    values: &[Value],
) -> (Vec<(usize, T)>, Vec<DefinitionError>) {
    let mut definitions = Vec::with_capacity(values.len());
    let mut errors = Vec::new();

    for (index, value) in values.iter().enumerate() {
        match serde_json::from_value(value.clone()) {
            Ok(definition) => definitions.push((index, definition)),
            Err(e) => errors.push(DefinitionError {
                index,
                field: "",
                error: ConfigError::schema("", e.to_string()),
            }),
        }
    }

    (definitions, errors)
}

enum Fire {
    Yes(Option<u64>),
    No(u64),
}

/// Structural content rule shared by HTTP and stdio mocks.
#[derive(Debug)]
struct ContentRule {
    regex: Option<Regex>,
    fragment: Option<String>,
    nth: Option<u32>,
    occurrences: Arc<AtomicU64>,
}

impl ContentRule {
    fn compile(
        fragment: Option<&str>,
        regex: Option<&str>,
        nth: Option<u32>,
        occurrences: Arc<AtomicU64>,
    ) -> Result<Self, (&'static str, ConfigError)> {
        if nth == Some(0) {
            return Err((
                "request.nth",
                ConfigError::schema("", "nth is 1-based and must be at least 1"),
            ));
        }

        let regex = match regex.filter(|r| !r.is_empty()) {
            Some(pattern) => Some(
                RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| ("request.bodyRegex", ConfigError::pattern(pattern, e)))?,
            ),
            None => None,
        };
        let fragment = fragment
            .filter(|f| !f.is_empty())
            .map(str::to_lowercase);

        Ok(Self {
            regex,
            fragment,
            nth,
            occurrences,
        })
    }

    fn is_unconditional(&self) -> bool {
        self.regex.is_none() && self.fragment.is_none()
    }

    fn matches(&self, content: &str) -> bool {
        if let Some(regex) = &self.regex {
            return regex.is_match(content);
        }
        if let Some(fragment) = &self.fragment {
            return content.to_lowercase().contains(fragment.as_str());
        }
        true
    }

    /// Count this structural match and decide whether the mock fires.
    /// The increment and the comparison happen in one atomic step.
    fn try_fire(&self) -> Fire {
        let Some(nth) = self.nth else {
            return Fire::Yes(None);
        };
        let previous = self
            .occurrences
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                Some(n.saturating_add(1))
            })
            .unwrap_or(u64::MAX);
        let seen = previous.saturating_add(1);
        if seen == u64::from(nth) {
            Fire::Yes(Some(seen))
        } else {
            Fire::No(seen)
        }
    }
}

fn identity<T: Serialize>(scope: &str, index: usize, request: &T) -> String {
    let shape = serde_json::to_string(request).unwrap_or_default();
    format!("{scope}[{index}]{shape}")
}

/// Result of matching a request against HTTP mocks.
#[derive(Debug)]
pub struct MatchResult<'a> {
    /// Declared position of the winning mock
    pub index: usize,
    pub definition: &'a MockDefinition,
    /// The occurrence that fired, for `nth` mocks
    pub occurrence: Option<u64>,
}

#[derive(Debug)]
struct CompiledMock {
    index: usize,
    definition: MockDefinition,
    url: Option<Regex>,
    method: String,
    content: ContentRule,
}

/// Compiled HTTP mocks.
#[derive(Debug, Default)]
pub struct MockMatcher {
    mocks: Vec<CompiledMock>,
}

impl MockMatcher {
    /// Compile definitions. Invalid definitions are left out and reported.
    ///
    /// `scope` distinguishes definition lists that share one occurrence
    /// table, e.g. the file they were loaded from.
    pub fn compile(
        definitions: &[MockDefinition],
        scope: &str,
        occurrences: &OccurrenceTable,
    ) -> (Self, Vec<DefinitionError>) {
        Self::compile_indexed(definitions.iter().enumerate(), scope, occurrences)
    }

    /// Bind and compile raw definitions. A malformed element is skipped and
    /// reported; it never takes the rest of the list with it.
    pub fn compile_values(
        values: &[Value],
        scope: &str,
        occurrences: &OccurrenceTable,
    ) -> (Self, Vec<DefinitionError>) {
        let (definitions, mut errors) = bind_definitions::<MockDefinition>(values);
        let (matcher, compile_errors) =
            Self::compile_indexed(definitions.iter().map(|(i, d)| (*i, d)), scope, occurrences);
        errors.extend(compile_errors);
        errors.sort_by_key(|e| e.index);
        (matcher, errors)
    }

    fn compile_indexed<'a>(
        definitions: impl IntoIterator<Item = (usize, &'a MockDefinition)>,
        scope: &str,
        occurrences: &OccurrenceTable,
    ) -> (Self, Vec<DefinitionError>) {
        let mut mocks = Vec::new();
        let mut errors = Vec::new();

        for (index, definition) in definitions {
            let request = &definition.request;

            let url = match request.url.as_deref().filter(|u| !u.is_empty()) {
                Some(pattern) => match compile_glob(pattern) {
                    Ok(regex) => Some(regex),
                    Err(e) => {
                        errors.push(DefinitionError {
                            index,
                            field: "request.url",
                            error: ConfigError::pattern(pattern, e),
                        });
                        continue;
                    }
                },
                None => None,
            };

            let counter = occurrences.counter(&identity(scope, index, request));
            let content = match ContentRule::compile(
                request.body_fragment.as_deref(),
                request.body_regex.as_deref(),
                request.nth,
                counter,
            ) {
                Ok(rule) => rule,
                Err((field, error)) => {
                    errors.push(DefinitionError {
                        index,
                        field,
                        error,
                    });
                    continue;
                }
            };

            mocks.push(CompiledMock {
                index,
                definition: definition.clone(),
                url,
                method: request.method.clone(),
                content,
            });
        }

        (Self { mocks }, errors)
    }

    /// Find the mock for a request, counting occurrences along the way.
    pub fn find_match(&self, method: &str, url: &str, body: Option<&str>) -> Option<MatchResult<'_>> {
        let content = body.unwrap_or("");

        for mock in &self.mocks {
            if !mock.method.eq_ignore_ascii_case(method) {
                continue;
            }
            if let Some(pattern) = &mock.url {
                if !pattern.is_match(url) {
                    continue;
                }
            }
            if !mock.content.matches(content) {
                continue;
            }

            match mock.content.try_fire() {
                Fire::Yes(occurrence) => {
                    return Some(MatchResult {
                        index: mock.index,
                        definition: &mock.definition,
                        occurrence,
                    });
                }
                Fire::No(seen) => {
                    debug!(mock = mock.index, seen, nth = ?mock.content.nth, "Mock matched but not on its nth occurrence");
                }
            }
        }

        None
    }

    pub fn len(&self) -> usize {
        self.mocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mocks.is_empty()
    }
}

/// Result of matching stdio content.
#[derive(Debug)]
pub struct StdioMatch<'a> {
    pub index: usize,
    pub definition: &'a StdioMockDefinition,
    pub occurrence: Option<u64>,
}

#[derive(Debug)]
struct CompiledStdioMock {
    index: usize,
    definition: StdioMockDefinition,
    content: ContentRule,
}

/// Compiled stdio mocks.
#[derive(Debug, Default)]
pub struct StdioMockMatcher {
    mocks: Vec<CompiledStdioMock>,
}

impl StdioMockMatcher {
    pub fn compile(
        definitions: &[StdioMockDefinition],
        scope: &str,
        occurrences: &OccurrenceTable,
    ) -> (Self, Vec<DefinitionError>) {
        Self::compile_indexed(definitions.iter().enumerate(), scope, occurrences)
    }

    /// Bind and compile raw definitions, skipping malformed elements.
    pub fn compile_values(
        values: &[Value],
        scope: &str,
        occurrences: &OccurrenceTable,
    ) -> (Self, Vec<DefinitionError>) {
        let (definitions, mut errors) = bind_definitions::<StdioMockDefinition>(values);
        let (matcher, compile_errors) =
            Self::compile_indexed(definitions.iter().map(|(i, d)| (*i, d)), scope, occurrences);
        errors.extend(compile_errors);
        errors.sort_by_key(|e| e.index);
        (matcher, errors)
    }

    fn compile_indexed<'a>(
        definitions: impl IntoIterator<Item = (usize, &'a StdioMockDefinition)>,
        scope: &str,
        occurrences: &OccurrenceTable,
    ) -> (Self, Vec<DefinitionError>) {
        let mut mocks = Vec::new();
        let mut errors = Vec::new();

        for (index, definition) in definitions {
            let request = &definition.request;
            let counter = occurrences.counter(&identity(scope, index, request));
            match ContentRule::compile(
                request.body_fragment.as_deref(),
                request.body_regex.as_deref(),
                request.nth,
                counter,
            ) {
                Ok(content) => mocks.push(CompiledStdioMock {
                    index,
                    definition: definition.clone(),
                    content,
                }),
                Err((field, error)) => errors.push(DefinitionError {
                    index,
                    field,
                    error,
                }),
            }
        }

        (Self { mocks }, errors)
    }

    /// Find the mock for a chunk of stdin.
    pub fn find_match(&self, chunk: &str) -> Option<StdioMatch<'_>> {
        self.select(self.mocks.iter().filter(|m| m.content.matches(chunk)))
    }

    /// Find a mock to apply before any input arrives. Only mocks without a
    /// fragment or regex take part.
    pub fn find_startup_match(&self) -> Option<StdioMatch<'_>> {
        self.select(self.mocks.iter().filter(|m| m.content.is_unconditional()))
    }

    fn select<'a>(
        &'a self,
        candidates: impl Iterator<Item = &'a CompiledStdioMock>,
    ) -> Option<StdioMatch<'a>> {
        for mock in candidates {
            match mock.content.try_fire() {
                Fire::Yes(occurrence) => {
                    return Some(StdioMatch {
                        index: mock.index,
                        definition: &mock.definition,
                        occurrence,
                    });
                }
                Fire::No(seen) => {
                    debug!(mock = mock.index, seen, "Stdio mock matched but not on its nth occurrence");
                }
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.mocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mocks.is_empty()
    }
}
