//! Configuration documents.
//!
//! Parses YAML and relaxed JSON into a [`ConfigNode`] tree, resolves YAML
//! merge keys (`<<`) and converts the result into either a flat path map
//! ([`FlatConfig`]) or a structured JSON value. Both outputs come from the
//! same merge-resolved tree, so they always agree.
//!
//! # Example
//!
//! ```yaml
//! defaults: &defaults
//!   rate: 50
//!   enabled: yes
//! errorsPlugin:
//!   <<: *defaults
//!   rate: 80
//! ```
//!
//! resolves `errorsPlugin` to `{ rate: 80, enabled: true }`.

use crate::error::{ConfigError, Result};
use crate::flatten::{self, FlatConfig};
use serde_json::{Map, Number, Value};
use std::collections::HashMap;
use std::path::Path;
use yaml_rust2::parser::{Event, MarkedEventReceiver, Parser};
use yaml_rust2::scanner::{Marker, TScalarStyle};

/// The YAML merge key.
pub const MERGE_KEY: &str = "<<";

/// Upper bound on nodes copied by alias expansion in one document.
pub const MAX_ALIAS_EXPANSION: usize = 10_000;

/// A parsed configuration node.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigNode {
    Scalar(Scalar),
    Sequence(Vec<ConfigNode>),
    /// Entries in document order. Keys are always scalars; entries with
    /// complex keys are dropped while parsing.
    Mapping(Vec<(String, ConfigNode)>),
}

/// A scalar as written in the source document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scalar {
    pub value: Option<String>,
    /// Quoted (or block) scalars are never type-coerced.
    pub quoted: bool,
}

/// A scalar after type inference.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
}

impl Scalar {
    pub fn plain(value: impl Into<String>) -> Self {
        Self {
            value: Some(value.into()),
            quoted: false,
        }
    }

    pub fn quoted(value: impl Into<String>) -> Self {
        Self {
            value: Some(value.into()),
            quoted: true,
        }
    }

    pub fn null() -> Self {
        Self {
            value: None,
            quoted: false,
        }
    }

    /// Infer the scalar's type.
    ///
    /// Only unquoted scalars are coerced: `y/yes/true/on` and `n/no/false/off`
    /// (any case) become booleans, `~`, `null` and the empty string become
    /// null, then integer and floating-point parses are attempted. Anything
    /// else stays a string.
    pub fn infer(&self) -> ScalarValue {
        let Some(value) = &self.value else {
            return ScalarValue::Null;
        };
        if self.quoted {
            return ScalarValue::String(value.clone());
        }

        match value.to_lowercase().as_str() {
            "y" | "yes" | "true" | "on" => return ScalarValue::Bool(true),
            "n" | "no" | "false" | "off" => return ScalarValue::Bool(false),
            "~" | "null" | "" => return ScalarValue::Null,
            _ => {}
        }

        if let Ok(int) = value.parse::<i64>() {
            return ScalarValue::Integer(int);
        }
        match value.parse::<f64>() {
            Ok(float) if float.is_finite() => ScalarValue::Float(float),
            _ => ScalarValue::String(value.clone()),
        }
    }

    /// String form used in [`FlatConfig`]. Boolean and null words are
    /// normalized; numbers and strings keep their source text.
    pub fn to_flat(&self) -> Option<String> {
        match self.infer() {
            ScalarValue::Null => None,
            ScalarValue::Bool(b) => Some(b.to_string()),
            ScalarValue::Integer(_) | ScalarValue::Float(_) | ScalarValue::String(_) => {
                self.value.clone()
            }
        }
    }
}

impl ScalarValue {
    pub fn to_json(&self) -> Value {
        match self {
            ScalarValue::Null => Value::Null,
            ScalarValue::Bool(b) => Value::Bool(*b),
            ScalarValue::Integer(i) => Value::Number((*i).into()),
            ScalarValue::Float(f) => Number::from_f64(*f).map_or(Value::Null, Value::Number),
            ScalarValue::String(s) => Value::String(s.clone()),
        }
    }
}

impl ConfigNode {
    /// Build a node tree from an already-parsed JSON value.
    ///
    /// JSON strings are treated as quoted scalars; numbers, booleans and
    /// null as plain scalars, so inference maps them back to themselves.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => ConfigNode::Scalar(Scalar::null()),
            Value::Bool(b) => ConfigNode::Scalar(Scalar::plain(b.to_string())),
            Value::Number(n) => ConfigNode::Scalar(Scalar::plain(n.to_string())),
            Value::String(s) => ConfigNode::Scalar(Scalar::quoted(s.clone())),
            Value::Array(items) => ConfigNode::Sequence(items.iter().map(Self::from_json).collect()),
            Value::Object(map) => ConfigNode::Mapping(
                map.iter()
                    .map(|(k, v)| (k.clone(), Self::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Structured form with scalar type inference applied.
    pub fn to_json(&self) -> Value {
        match self {
            ConfigNode::Scalar(scalar) => scalar.infer().to_json(),
            ConfigNode::Sequence(items) => Value::Array(items.iter().map(Self::to_json).collect()),
            ConfigNode::Mapping(entries) => {
                let mut map = Map::new();
                for (key, value) in entries {
                    map.insert(key.clone(), value.to_json());
                }
                Value::Object(map)
            }
        }
    }
}

/// Resolve every merge key in the tree.
///
/// Within a merge sequence later sources override earlier ones, and explicit
/// keys of a mapping override merged values regardless of where the `<<`
/// entry appears. Merge sources are resolved recursively first, so nested
/// merge keys are honoured.
pub fn resolve_merges(node: &ConfigNode) -> ConfigNode {
    match node {
        ConfigNode::Mapping(entries) => ConfigNode::Mapping(resolve_mapping(entries)),
        ConfigNode::Sequence(items) => ConfigNode::Sequence(items.iter().map(resolve_merges).collect()),
        ConfigNode::Scalar(_) => node.clone(),
    }
}

fn resolve_mapping(entries: &[(String, ConfigNode)]) -> Vec<(String, ConfigNode)> {
    let mut resolved = Vec::with_capacity(entries.len());

    for (_, value) in entries.iter().filter(|(key, _)| key == MERGE_KEY) {
        for source in merge_sources(value) {
            for (key, merged) in resolve_mapping(source) {
                upsert(&mut resolved, key, merged);
            }
        }
    }

    for (key, value) in entries.iter().filter(|(key, _)| key != MERGE_KEY) {
        upsert(&mut resolved, key.clone(), resolve_merges(value));
    }

    resolved
}

/// Mappings referenced by a merge value. Non-mapping items are ignored.
fn merge_sources(value: &ConfigNode) -> Vec<&[(String, ConfigNode)]> {
    match value {
        ConfigNode::Mapping(entries) => vec![entries.as_slice()],
        ConfigNode::Sequence(items) => items
            .iter()
            .filter_map(|item| match item {
                ConfigNode::Mapping(entries) => Some(entries.as_slice()),
                _ => None,
            })
            .collect(),
        ConfigNode::Scalar(_) => Vec::new(),
    }
}

fn upsert(entries: &mut Vec<(String, ConfigNode)>, key: String, value: ConfigNode) {
    match entries.iter_mut().find(|(existing, _)| *existing == key) {
        Some(slot) => slot.1 = value,
        None => entries.push((key, value)),
    }
}

/// Source format of a configuration document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Yaml,
    Json,
}

impl DocumentFormat {
    /// `.yaml` and `.yml` (any case) are YAML; everything else is JSON.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml") => {
                DocumentFormat::Yaml
            }
            _ => DocumentFormat::Json,
        }
    }
}

/// A parsed, merge-resolved configuration document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    root: Option<ConfigNode>,
}

impl Document {
    pub fn parse(text: &str, format: DocumentFormat) -> Result<Self> {
        match format {
            DocumentFormat::Yaml => Self::parse_yaml(text),
            DocumentFormat::Json => Self::parse_json(text),
        }
    }

    /// Parse the first YAML document in `text`.
    pub fn parse_yaml(text: &str) -> Result<Self> {
        let mut builder = TreeBuilder::default();
        let mut parser = Parser::new_from_str(text);
        parser
            .load(&mut builder, false)
            .map_err(|e| ConfigError::parse(e.to_string()))?;

        if let Some(err) = builder.error {
            return Err(err);
        }
        Ok(Self {
            root: builder.root.as_ref().map(resolve_merges),
        })
    }

    /// Parse JSON allowing comments and trailing commas.
    pub fn parse_json(text: &str) -> Result<Self> {
        let cleaned = strip_json_comments(text.trim_start_matches('\u{feff}'));
        if cleaned.trim().is_empty() {
            return Ok(Self::default());
        }

        let value: Value =
            serde_json::from_str(&cleaned).map_err(|e| ConfigError::parse(e.to_string()))?;
        Ok(Self {
            root: Some(resolve_merges(&ConfigNode::from_json(&value))),
        })
    }

    pub fn root(&self) -> Option<&ConfigNode> {
        self.root.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    pub fn flatten(&self) -> FlatConfig {
        flatten::flatten(self.root.as_ref())
    }

    /// Structured form. An empty document yields an empty object.
    pub fn to_json(&self) -> Value {
        self.root
            .as_ref()
            .map_or_else(|| Value::Object(Map::new()), ConfigNode::to_json)
    }
}

enum Frame {
    Sequence {
        anchor: usize,
        items: Vec<ConfigNode>,
    },
    Mapping {
        anchor: usize,
        entries: Vec<(String, ConfigNode)>,
        // None: expecting a key. Some(None): the key was not a scalar.
        key: Option<Option<String>>,
    },
}

impl Frame {
    fn anchor(&self) -> usize {
        match self {
            Frame::Sequence { anchor, .. } | Frame::Mapping { anchor, .. } => *anchor,
        }
    }

    fn finish(self) -> (ConfigNode, usize) {
        match self {
            Frame::Sequence { anchor, items } => (ConfigNode::Sequence(items), anchor),
            Frame::Mapping { anchor, entries, .. } => (ConfigNode::Mapping(entries), anchor),
        }
    }
}

/// Builds a [`ConfigNode`] tree from parser events.
///
/// Aliases are expanded by copying the anchored node. An alias that refers
/// to a node that is still open (an ancestor of the alias) would make the
/// tree recursive and is rejected as a parse error. So is a document whose
/// aliases copy more than [`MAX_ALIAS_EXPANSION`] nodes in total.
#[derive(Default)]
struct TreeBuilder {
    stack: Vec<Frame>,
    // Anchored node and its node count.
    anchors: HashMap<usize, (ConfigNode, usize)>,
    expanded: usize,
    root: Option<ConfigNode>,
    error: Option<ConfigError>,
}

impl TreeBuilder {
    fn is_open(&self, anchor: usize) -> bool {
        self.stack.iter().any(|frame| frame.anchor() == anchor)
    }

    fn complete(&mut self, node: ConfigNode, anchor: usize) {
        if anchor != 0 {
            self.anchors.insert(anchor, (node.clone(), node_count(&node)));
        }

        match self.stack.last_mut() {
            None => {
                if self.root.is_none() {
                    self.root = Some(node);
                }
            }
            Some(Frame::Sequence { items, .. }) => items.push(node),
            Some(Frame::Mapping { entries, key, .. }) => match key.take() {
                None => *key = Some(mapping_key(&node)),
                Some(Some(name)) => entries.push((name, node)),
                Some(None) => {}
            },
        }
    }
}

fn node_count(node: &ConfigNode) -> usize {
    match node {
        ConfigNode::Scalar(_) => 1,
        ConfigNode::Sequence(items) => 1 + items.iter().map(node_count).sum::<usize>(),
        ConfigNode::Mapping(entries) => {
            1 + entries.iter().map(|(_, node)| node_count(node)).sum::<usize>()
        }
    }
}

fn mapping_key(node: &ConfigNode) -> Option<String> {
    match node {
        ConfigNode::Scalar(scalar) => Some(scalar.value.clone().unwrap_or_default()),
        _ => None,
    }
}

impl MarkedEventReceiver for TreeBuilder {
    fn on_event(&mut self, event: Event, mark: Marker) {
        if self.error.is_some() {
            return;
        }

        match event {
            Event::Scalar(value, style, anchor, ..) => {
                let quoted = !matches!(style, TScalarStyle::Plain);
                let scalar = Scalar {
                    value: Some(value),
                    quoted,
                };
                self.complete(ConfigNode::Scalar(scalar), anchor);
            }
            Event::Alias(id) => {
                if self.is_open(id) {
                    self.error = Some(ConfigError::parse(format!(
                        "alias at line {} column {} refers to an enclosing node (merge cycle)",
                        mark.line(),
                        mark.col() + 1
                    )));
                    return;
                }
                match self.anchors.get(&id) {
                    Some((_, count)) if self.expanded + count > MAX_ALIAS_EXPANSION => {
                        self.error = Some(ConfigError::parse(format!(
                            "alias at line {} column {} expands the document past {} nodes",
                            mark.line(),
                            mark.col() + 1,
                            MAX_ALIAS_EXPANSION
                        )));
                    }
                    Some((node, count)) => {
                        self.expanded += count;
                        let node = node.clone();
                        self.complete(node, 0);
                    }
                    None => {
                        self.error = Some(ConfigError::parse(format!(
                            "unknown alias at line {} column {}",
                            mark.line(),
                            mark.col() + 1
                        )));
                    }
                }
            }
            Event::SequenceStart(anchor, ..) => self.stack.push(Frame::Sequence {
                anchor,
                items: Vec::new(),
            }),
            Event::MappingStart(anchor, ..) => self.stack.push(Frame::Mapping {
                anchor,
                entries: Vec::new(),
                key: None,
            }),
            Event::SequenceEnd | Event::MappingEnd => {
                if let Some(frame) = self.stack.pop() {
                    let (node, anchor) = frame.finish();
                    self.complete(node, anchor);
                }
            }
            _ => {}
        }
    }
}

/// Remove `//` and `/* */` comments and trailing commas outside strings.
/// Newlines inside comments are kept so parser positions stay meaningful.
fn strip_json_comments(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if in_string {
            out.push(c);
            if c == '\\' {
                if let Some(&escaped) = chars.get(i + 1) {
                    out.push(escaped);
                    i += 1;
                }
            } else if c == '"' {
                in_string = false;
            }
            i += 1;
            continue;
        }

        match (c, chars.get(i + 1)) {
            ('"', _) => {
                in_string = true;
                out.push(c);
                i += 1;
            }
            ('/', Some('/')) => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            ('/', Some('*')) => {
                i += 2;
                while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                    if chars[i] == '\n' {
                        out.push('\n');
                    }
                    i += 1;
                }
                i += 2;
                out.push(' ');
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }

    remove_trailing_commas(&out)
}

fn remove_trailing_commas(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if in_string {
            out.push(c);
            if c == '\\' {
                if let Some(&escaped) = chars.get(i + 1) {
                    out.push(escaped);
                    i += 1;
                }
            } else if c == '"' {
                in_string = false;
            }
        } else if c == ',' {
            let next = chars[i + 1..].iter().find(|ch| !ch.is_whitespace());
            if !matches!(next, Some('}') | Some(']')) {
                out.push(c);
            }
        } else {
            if c == '"' {
                in_string = true;
            }
            out.push(c);
        }
        i += 1;
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn yaml(text: &str) -> Document {
        Document::parse_yaml(text).unwrap()
    }

    #[test]
    fn test_explicit_key_overrides_merge() {
        let doc = yaml(
            r#"
base: &base
  a: 1
target:
  a: 2
  <<: *base
"#,
        );
        assert_eq!(doc.to_json()["target"]["a"], json!(2));
        assert_eq!(doc.flatten().get("target:a"), Some("2"));
    }

    #[test]
    fn test_later_merge_source_wins() {
        let doc = yaml(
            r#"
one: &one
  a: 1
  b: one
two: &two
  a: 2
target:
  <<: [*one, *two]
"#,
        );
        let target = &doc.to_json()["target"];
        assert_eq!(target["a"], json!(2));
        assert_eq!(target["b"], json!("one"));
    }

    #[test]
    fn test_nested_merge_keys() {
        let doc = yaml(
            r#"
root: &root
  level: root
  shared: root
middle: &middle
  <<: *root
  level: middle
leaf:
  <<: *middle
  own: true
"#,
        );
        let leaf = &doc.to_json()["leaf"];
        assert_eq!(leaf["level"], json!("middle"));
        assert_eq!(leaf["shared"], json!("root"));
        assert_eq!(leaf["own"], json!(true));
    }

    #[test]
    fn test_merged_mapping_inside_sequence() {
        let doc = yaml(
            r#"
defaults: &defaults
  statusCode: 200
mocks:
  - <<: *defaults
    url: https://api.example.com/a
  - <<: *defaults
    statusCode: 404
"#,
        );
        let flat = doc.flatten();
        assert_eq!(flat.get("mocks:0:statusCode"), Some("200"));
        assert_eq!(flat.get("mocks:0:url"), Some("https://api.example.com/a"));
        assert_eq!(flat.get("mocks:1:statusCode"), Some("404"));
    }

    #[test]
    fn test_scalar_coercion() {
        let doc = yaml(
            r#"
plainYes: Yes
quotedYes: "Yes"
singleQuoted: 'off'
empty:
tilde: ~
int: 42
float: 3.14
text: hello
"#,
        );
        let value = doc.to_json();
        assert_eq!(value["plainYes"], json!(true));
        assert_eq!(value["quotedYes"], json!("Yes"));
        assert_eq!(value["singleQuoted"], json!("off"));
        assert_eq!(value["empty"], Value::Null);
        assert_eq!(value["tilde"], Value::Null);
        assert_eq!(value["int"], json!(42));
        assert!(value["int"].is_i64());
        assert_eq!(value["float"], json!(3.14));
        assert_eq!(value["text"], json!("hello"));

        let flat = doc.flatten();
        assert_eq!(flat.get("plainYes"), Some("true"));
        assert_eq!(flat.get("quotedYes"), Some("Yes"));
        assert!(flat.contains("empty"));
        assert_eq!(flat.get("empty"), None);
    }

    #[test]
    fn test_scalar_inference_rules() {
        assert_eq!(Scalar::plain("ON").infer(), ScalarValue::Bool(true));
        assert_eq!(Scalar::plain("n").infer(), ScalarValue::Bool(false));
        assert_eq!(Scalar::plain("NULL").infer(), ScalarValue::Null);
        assert_eq!(Scalar::plain("").infer(), ScalarValue::Null);
        assert_eq!(Scalar::plain("-7").infer(), ScalarValue::Integer(-7));
        assert_eq!(Scalar::plain("1e3").infer(), ScalarValue::Float(1000.0));
        assert_eq!(
            Scalar::plain("NaN").infer(),
            ScalarValue::String("NaN".to_string())
        );
        assert_eq!(
            Scalar::quoted("42").infer(),
            ScalarValue::String("42".to_string())
        );
        assert_eq!(Scalar::null().infer(), ScalarValue::Null);
    }

    #[test]
    fn test_flatten_is_idempotent() {
        let text = r#"
defaults: &d
  x: 1
items:
  - <<: *d
    y: [a, b]
"#;
        let doc = yaml(text);
        assert_eq!(doc.flatten(), doc.flatten());
        assert_eq!(doc.flatten(), yaml(text).flatten());
    }

    #[test]
    fn test_sequences_flatten_by_index() {
        let doc = yaml("urlsToWatch:\n  - https://a/*\n  - '!https://a/health'\n");
        let flat = doc.flatten();
        assert_eq!(flat.get("urlsToWatch:0"), Some("https://a/*"));
        assert_eq!(flat.get("urlsToWatch:1"), Some("!https://a/health"));
        assert_eq!(
            doc.to_json()["urlsToWatch"],
            json!(["https://a/*", "!https://a/health"])
        );
    }

    #[test]
    fn test_empty_document() {
        let doc = yaml("");
        assert!(doc.is_empty());
        assert!(doc.flatten().is_empty());
        assert_eq!(doc.to_json(), json!({}));

        let doc = Document::parse_json("  \n").unwrap();
        assert!(doc.is_empty());
    }

    #[test]
    fn test_invalid_yaml_is_parse_error() {
        let err = Document::parse_yaml("key: [unclosed").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_recursive_alias_is_rejected() {
        let err = Document::parse_yaml(
            r#"
loop: &loop
  a: 1
  <<: *loop
"#,
        )
        .unwrap_err();
        match err {
            ConfigError::Parse { message } => assert!(message.contains("cycle")),
            other => panic!("Expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn test_alias_expansion_is_bounded() {
        let mut source = String::from("l0: &l0 [x, x, x, x, x, x, x, x, x, x]\n");
        for level in 1..8 {
            let prev = level - 1;
            source.push_str(&format!(
                "l{level}: &l{level} [*l{prev}, *l{prev}, *l{prev}, *l{prev}, *l{prev}, *l{prev}, *l{prev}, *l{prev}, *l{prev}, *l{prev}]\n"
            ));
        }

        let err = Document::parse_yaml(&source).unwrap_err();
        match err {
            ConfigError::Parse { message } => assert!(message.contains("expands the document")),
            other => panic!("Expected parse error, got {other:?}"),
        }

        // Ordinary reuse stays well inside the budget.
        let doc = yaml("base: &base {a: 1, b: 2}\none: *base\ntwo: *base\n");
        assert_eq!(doc.to_json()["two"], json!({"a": 1, "b": 2}));
    }

    #[test]
    fn test_only_first_yaml_document() {
        let doc = yaml("a: 1\n---\na: 2\n");
        assert_eq!(doc.to_json(), json!({"a": 1}));
    }

    #[test]
    fn test_jsonc_comments_and_trailing_commas() {
        let doc = Document::parse_json(
            r#"
// leading comment
{
  "urlsToWatch": [
    "https://api.example.com/*", // inline
  ],
  /* block
     comment */
  "note": "keep // this and /* this */",
  "rate": 50,
}
"#,
        )
        .unwrap();
        let value = doc.to_json();
        assert_eq!(value["urlsToWatch"], json!(["https://api.example.com/*"]));
        assert_eq!(value["note"], json!("keep // this and /* this */"));
        assert_eq!(value["rate"], json!(50));
    }

    #[test]
    fn test_json_strings_are_not_coerced() {
        let doc = Document::parse_json(r#"{"flag": "yes", "real": true, "n": null}"#).unwrap();
        let value = doc.to_json();
        assert_eq!(value["flag"], json!("yes"));
        assert_eq!(value["real"], json!(true));
        assert_eq!(value["n"], Value::Null);
    }

    #[test]
    fn test_invalid_json_is_parse_error() {
        let err = Document::parse_json(r#"{"a": }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_format_from_path() {
        assert_eq!(
            DocumentFormat::from_path(Path::new("devproxyrc.YML")),
            DocumentFormat::Yaml
        );
        assert_eq!(
            DocumentFormat::from_path(Path::new("devproxyrc.jsonc")),
            DocumentFormat::Json
        );
    }
}
