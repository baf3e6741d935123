//! URL watch patterns.
//!
//! A pattern is a URL in which `*` matches any sequence of characters.
//! A leading `!` turns it into an exclusion. Patterns are matched
//! case-insensitively against the whole URL.

use crate::error::{ConfigError, Result};
use regex::{Regex, RegexBuilder};

/// Compile a `*` glob into a fully anchored, case-insensitive regex.
/// Every other character matches literally.
pub fn compile_glob(pattern: &str) -> std::result::Result<Regex, regex::Error> {
    let escaped = regex::escape(pattern).replace(r"\*", ".*");
    RegexBuilder::new(&format!("^{escaped}$"))
        .case_insensitive(true)
        .build()
}

/// One compiled watch pattern.
#[derive(Debug, Clone)]
pub struct UrlToWatch {
    pattern: String,
    negated: bool,
    regex: Regex,
}

impl UrlToWatch {
    /// Compile a raw pattern such as `https://api.example.com/*` or
    /// `!https://api.example.com/health`.
    pub fn new(raw: &str) -> Result<Self> {
        let (negated, pattern) = match raw.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, raw),
        };
        if pattern.trim().is_empty() {
            return Err(ConfigError::pattern(raw, "pattern is empty"));
        }

        let regex = compile_glob(pattern).map_err(|e| ConfigError::pattern(raw, e))?;
        Ok(Self {
            pattern: pattern.to_string(),
            negated,
            regex,
        })
    }

    /// The pattern without its `!` prefix.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn is_negated(&self) -> bool {
        self.negated
    }

    pub fn matches(&self, url: &str) -> bool {
        self.regex.is_match(url)
    }
}

/// The set of URLs a session intercepts.
///
/// Immutable once built; a reload builds a new set.
#[derive(Debug, Clone, Default)]
pub struct UrlWatchSet {
    patterns: Vec<UrlToWatch>,
}

impl UrlWatchSet {
    /// Compile all patterns, failing on the first invalid one.
    pub fn compile<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|p| UrlToWatch::new(p.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    /// Compile all patterns, skipping invalid ones and returning their errors.
    pub fn compile_lenient<I, S>(patterns: I) -> (Self, Vec<ConfigError>)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut compiled = Vec::new();
        let mut errors = Vec::new();
        for pattern in patterns {
            match UrlToWatch::new(pattern.as_ref()) {
                Ok(url) => compiled.push(url),
                Err(e) => errors.push(e),
            }
        }
        (Self { patterns: compiled }, errors)
    }

    /// A URL is watched when it matches at least one positive pattern and
    /// no negated pattern, whatever order they were declared in.
    pub fn is_watched(&self, url: &str) -> bool {
        let mut included = false;
        for pattern in &self.patterns {
            if pattern.matches(url) {
                if pattern.is_negated() {
                    return false;
                }
                included = true;
            }
        }
        included
    }

    pub fn patterns(&self) -> &[UrlToWatch] {
        &self.patterns
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negation_excludes() {
        let set = UrlWatchSet::compile([
            "https://api.example.com/*",
            "!https://api.example.com/health",
        ])
        .unwrap();
        assert!(!set.is_watched("https://api.example.com/health"));
        assert!(set.is_watched("https://api.example.com/users"));
        assert!(!set.is_watched("https://other.example.com/users"));
    }

    #[test]
    fn test_negation_is_order_independent() {
        let set = UrlWatchSet::compile([
            "!https://api.example.com/health",
            "https://api.example.com/*",
        ])
        .unwrap();
        assert!(!set.is_watched("https://api.example.com/health"));
        assert!(set.is_watched("https://api.example.com/users"));
    }

    #[test]
    fn test_case_insensitive_and_anchored() {
        let set = UrlWatchSet::compile(["https://API.example.com/v1/*"]).unwrap();
        assert!(set.is_watched("https://api.EXAMPLE.com/v1/me"));
        assert!(!set.is_watched("prefix-https://api.example.com/v1/me"));
        assert!(!set.is_watched("https://api.example.com/v2/me"));
    }

    #[test]
    fn test_regex_metacharacters_are_literal() {
        let set = UrlWatchSet::compile(["https://api.example.com/search?q=(a+b)"]).unwrap();
        assert!(set.is_watched("https://api.example.com/search?q=(a+b)"));
        assert!(!set.is_watched("https://api.example.com/searchXq=(aab)"));
    }

    #[test]
    fn test_only_negated_patterns_watch_nothing() {
        let set = UrlWatchSet::compile(["!https://api.example.com/*"]).unwrap();
        assert!(!set.is_watched("https://other.example.com/"));
        assert!(!UrlWatchSet::default().is_watched("https://api.example.com/"));
    }

    #[test]
    fn test_empty_pattern_fails_compilation() {
        let err = UrlWatchSet::compile(["https://ok/*", "!"]).unwrap_err();
        match err {
            ConfigError::PatternCompilation { pattern, .. } => assert_eq!(pattern, "!"),
            other => panic!("Expected pattern error, got {other:?}"),
        }
    }

    #[test]
    fn test_lenient_compile_skips_bad_patterns() {
        let (set, errors) = UrlWatchSet::compile_lenient(["https://ok/*", ""]);
        assert_eq!(set.patterns().len(), 1);
        assert_eq!(errors.len(), 1);
        assert!(set.is_watched("https://ok/path"));
    }
}
