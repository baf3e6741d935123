//! Flat path-to-value view of a configuration document.

use crate::document::ConfigNode;
use std::collections::HashMap;
use std::str::FromStr;

/// Separator between path segments.
pub const KEY_DELIMITER: &str = ":";

/// Join a path prefix and a segment.
pub fn join_path(prefix: &str, segment: &str) -> String {
    if prefix.is_empty() {
        segment.to_string()
    } else {
        format!("{prefix}{KEY_DELIMITER}{segment}")
    }
}

/// Mapping from `:`-joined paths to string values (or null).
///
/// Mapping keys become literal segments and sequence elements their
/// zero-based index, e.g. `plugins:0:name`. Lookups are case-insensitive.
/// A `FlatConfig` is always built wholesale from a document and never
/// mutated afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlatConfig {
    entries: HashMap<String, FlatEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FlatEntry {
    path: String,
    value: Option<String>,
}

impl FlatConfig {
    fn insert(&mut self, path: String, value: Option<String>) {
        self.entries
            .insert(path.to_lowercase(), FlatEntry { path, value });
    }

    /// Value at `path`; `None` when absent or null.
    pub fn get(&self, path: &str) -> Option<&str> {
        self.entries
            .get(&path.to_lowercase())
            .and_then(|entry| entry.value.as_deref())
    }

    /// Whether `path` is present, including explicit nulls.
    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(&path.to_lowercase())
    }

    /// Parse the value at `path`. Unparseable values read as absent.
    pub fn get_parsed<T: FromStr>(&self, path: &str) -> Option<T> {
        self.get(path).and_then(|value| value.trim().parse().ok())
    }

    pub fn get_bool(&self, path: &str) -> Option<bool> {
        match self.get(path)?.to_lowercase().as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        }
    }

    /// Entries below `prefix`, with the prefix removed from their paths.
    pub fn section(&self, prefix: &str) -> FlatConfig {
        let needle = format!("{}{KEY_DELIMITER}", prefix.to_lowercase());
        let depth = prefix.split(KEY_DELIMITER).count();
        let mut section = FlatConfig::default();
        for (key, entry) in &self.entries {
            if !key.starts_with(&needle) {
                continue;
            }
            // Split by segment: lowercasing may change byte lengths.
            if let Some(rest) = entry.path.splitn(depth + 1, KEY_DELIMITER).nth(depth) {
                section.insert(rest.to_string(), entry.value.clone());
            }
        }
        section
    }

    /// Entries as `(path, value)` pairs in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.entries
            .values()
            .map(|entry| (entry.path.as_str(), entry.value.as_deref()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Flatten a merge-resolved tree. Only a mapping root produces entries.
pub fn flatten(root: Option<&ConfigNode>) -> FlatConfig {
    let mut flat = FlatConfig::default();
    if let Some(node @ ConfigNode::Mapping(_)) = root {
        flatten_into(node, "", &mut flat);
    }
    flat
}

fn flatten_into(node: &ConfigNode, prefix: &str, flat: &mut FlatConfig) {
    match node {
        ConfigNode::Mapping(entries) => {
            for (key, value) in entries {
                flatten_into(value, &join_path(prefix, key), flat);
            }
        }
        ConfigNode::Sequence(items) => {
            for (index, item) in items.iter().enumerate() {
                flatten_into(item, &join_path(prefix, &index.to_string()), flat);
            }
        }
        ConfigNode::Scalar(scalar) => flat.insert(prefix.to_string(), scalar.to_flat()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;

    fn flat(yaml: &str) -> FlatConfig {
        Document::parse_yaml(yaml).unwrap().flatten()
    }

    #[test]
    fn test_case_insensitive_lookup() {
        let config = flat("LatencyPlugin:\n  minMs: 200\n");
        assert_eq!(config.get("latencyplugin:MINMS"), Some("200"));
        assert_eq!(config.get_parsed::<u64>("latencyPlugin:minMs"), Some(200));
    }

    #[test]
    fn test_section_strips_prefix() {
        let config = flat("latencyPlugin:\n  minMs: 10\n  maxMs: 20\nother: 1\n");
        let section = config.section("LATENCYPLUGIN");
        assert_eq!(section.len(), 2);
        assert_eq!(section.get("maxMs"), Some("20"));
        assert!(section.get("other").is_none());

        let paths: Vec<_> = section.iter().map(|(path, _)| path.to_string()).collect();
        assert!(paths.contains(&"minMs".to_string()));
    }

    #[test]
    fn test_bool_and_null_values() {
        let config = flat("a: on\nb: 'on'\nc: null\n");
        assert_eq!(config.get_bool("a"), Some(true));
        assert_eq!(config.get_bool("b"), None);
        assert!(config.contains("c"));
        assert_eq!(config.get("c"), None);
    }

    #[test]
    fn test_numeric_text_is_kept_verbatim() {
        let config = flat(
            "version: 1.10\nid: 007\nbig: 12345678901234567890\nx: 1e3\nflag: Yes\nnone: ~\n",
        );
        assert_eq!(config.get("version"), Some("1.10"));
        assert_eq!(config.get("id"), Some("007"));
        assert_eq!(config.get("big"), Some("12345678901234567890"));
        assert_eq!(config.get("x"), Some("1e3"));
        assert_eq!(config.get("flag"), Some("true"));
        assert!(config.contains("none"));
        assert_eq!(config.get("none"), None);
        assert_eq!(config.get_parsed::<f64>("version"), Some(1.1));
    }

    #[test]
    fn test_section_with_non_ascii_prefix() {
        // `İ` lowercases to a longer byte sequence
        let config = flat("İzmir:\n  Depth: 3\n");
        let section = config.section("İZMIR");
        let paths: Vec<_> = section.iter().map(|(path, _)| path.to_string()).collect();
        assert_eq!(paths, vec!["Depth".to_string()]);
        assert_eq!(section.get("depth"), Some("3"));
    }

    #[test]
    fn test_scalar_root_is_ignored() {
        assert!(flat("just a string").is_empty());
    }

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("", "plugins"), "plugins");
        assert_eq!(join_path("plugins", "0"), "plugins:0");
    }
}
