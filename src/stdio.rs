//! Stdio traffic mocking.
//!
//! Mocks live in the `stdioMocks` section (inline `mocks` and/or a
//! `mocksFile`). Each chunk read from stdin is matched against them; the
//! winning mock's rendered stdout/stderr goes back to the caller.

use crate::config::{load_mocks_file, ConfigSnapshot};
use crate::error::{Diagnostic, RenderError};
use crate::matcher::{OccurrenceTable, StdioMockMatcher};
use crate::render::{render_stdio, RenderedStdio};
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const STDIO_SECTION: &str = "stdioMocks";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StdioMockOptions {
    /// Raw definitions, bound one by one when compiled
    #[serde(default)]
    pub mocks: Vec<Value>,
    #[serde(default)]
    pub mocks_file: Option<String>,
}

#[derive(Debug)]
struct StdioMockSet {
    matcher: StdioMockMatcher,
    base_dir: PathBuf,
}

/// Matches stdio chunks against the configured stdio mocks.
#[derive(Debug, Default)]
pub struct StdioMocker {
    sets: Vec<StdioMockSet>,
    diagnostics: Vec<Diagnostic>,
}

impl StdioMocker {
    /// Load stdio mocks from a snapshot. Nothing here is fatal: a bad
    /// section, a missing mocks file or an invalid definition is skipped
    /// with a diagnostic and the remaining mocks still load.
    pub async fn load(snapshot: &ConfigSnapshot, occurrences: &OccurrenceTable) -> Self {
        let mut mocker = Self::default();

        let options: StdioMockOptions = match snapshot.section(STDIO_SECTION) {
            Some(value) if !value.is_null() => match serde_json::from_value(value.clone()) {
                Ok(options) => options,
                Err(e) => {
                    mocker.skip(Diagnostic::new(STDIO_SECTION, e.to_string()));
                    return mocker;
                }
            },
            _ => StdioMockOptions::default(),
        };

        mocker.add(
            &options.mocks,
            "stdio:inline",
            &format!("{STDIO_SECTION}.mocks"),
            &snapshot.base_dir,
            occurrences,
        );

        if let Some(file) = &options.mocks_file {
            let path = snapshot.resolve_path(file);
            let mocks = match load_mocks_file(&path).await {
                Ok(mocks) => mocks,
                Err(e) => {
                    let field = format!("{STDIO_SECTION}.mocksFile");
                    mocker.skip(Diagnostic::from_error(&field, &e));
                    return mocker;
                }
            };
            let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
            mocker.add(
                &mocks,
                &format!("stdio:{}", path.display()),
                &format!("{file}: mocks"),
                &base_dir,
                occurrences,
            );
            info!(file = %path.display(), mocks = mocks.len(), "Loaded stdio mocks");
        }

        mocker
    }

    fn skip(&mut self, diagnostic: Diagnostic) {
        warn!(path = %diagnostic.path, error = %diagnostic.message, "Skipping stdio mocks");
        self.diagnostics.push(diagnostic);
    }

    fn add(
        &mut self,
        definitions: &[Value],
        scope: &str,
        prefix: &str,
        base_dir: &Path,
        occurrences: &OccurrenceTable,
    ) {
        let (matcher, errors) = StdioMockMatcher::compile_values(definitions, scope, occurrences);
        for e in errors {
            self.skip(Diagnostic::new(e.path(prefix), e.message()));
        }
        if !matcher.is_empty() {
            self.sets.push(StdioMockSet {
                matcher,
                base_dir: base_dir.to_path_buf(),
            });
        }
    }

    /// Output to emit before any input, from the first unconditional mock.
    pub async fn startup(&self) -> Result<Option<RenderedStdio>, RenderError> {
        for set in &self.sets {
            if let Some(hit) = set.matcher.find_startup_match() {
                info!(mock = hit.index, "Applying stdio mock on startup");
                return render_stdio(&hit.definition.response, &set.base_dir)
                    .await
                    .map(Some);
            }
        }
        Ok(None)
    }

    /// Output for one chunk of stdin, or `None` when no mock fires.
    pub async fn handle_chunk(
        &self,
        chunk: &str,
    ) -> Result<Option<RenderedStdio>, RenderError> {
        for set in &self.sets {
            if let Some(hit) = set.matcher.find_match(chunk) {
                info!(mock = hit.index, occurrence = ?hit.occurrence, "Stdio mock fired");
                return render_stdio(&hit.definition.response, &set.base_dir)
                    .await
                    .map(Some);
            }
        }
        debug!(len = chunk.len(), "No stdio mock matched");
        Ok(None)
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(dir: &Path, yaml: &str) -> ConfigSnapshot {
        ConfigSnapshot::from_text(&dir.join("devproxyrc.yaml"), yaml).unwrap()
    }

    #[tokio::test]
    async fn test_startup_and_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = snapshot(
            dir.path(),
            r#"
stdioMocks:
  mocks:
    - request: { bodyFragment: "tools/list", nth: 2 }
      response: { stdout: { result: [] } }
    - request: { bodyRegex: '"method":\s*"ping"' }
      response: { stdout: "pong", stderr: "logged" }
    - response: { stderr: "ready" }
"#,
        );
        let occurrences = OccurrenceTable::new();
        let mocker = StdioMocker::load(&snapshot, &occurrences).await;
        assert!(mocker.diagnostics().is_empty());

        let startup = mocker.startup().await.unwrap().unwrap();
        assert_eq!(startup.stderr.unwrap(), b"ready");

        let first = mocker
            .handle_chunk(r#"{"method": "tools/list"}"#)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.stderr.unwrap(), b"ready");

        let second = mocker
            .handle_chunk(r#"{"method": "tools/list"}"#)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.stdout.unwrap(), br#"{"result":[]}"#);

        let ping = mocker
            .handle_chunk(r#"{"METHOD": "ping"}"#)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ping.stdout.unwrap(), b"pong");
        assert_eq!(ping.stderr.unwrap(), b"logged");
    }

    #[tokio::test]
    async fn test_mocks_file_bodies_resolve_next_to_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("stdio")).unwrap();
        std::fs::write(dir.path().join("stdio/init.json"), br#"{"ok":true}"#).unwrap();
        std::fs::write(
            dir.path().join("stdio/mocks.yaml"),
            "mocks:\n  - request: {bodyFragment: initialize}\n    response: {stdout: '@init.json'}\n",
        )
        .unwrap();

        let snapshot = snapshot(dir.path(), "stdioMocks:\n  mocksFile: stdio/mocks.yaml\n");
        let mocker = StdioMocker::load(&snapshot, &OccurrenceTable::new()).await;

        assert!(mocker.startup().await.unwrap().is_none());
        let out = mocker.handle_chunk("initialize").await.unwrap().unwrap();
        assert_eq!(out.stdout.unwrap(), br#"{"ok":true}"#);
        assert!(mocker.handle_chunk("shutdown").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_malformed_mock_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = snapshot(
            dir.path(),
            "stdioMocks:\n  mocks:\n    - request: {bodyFragment: ping, nth: -1}\n    - request: {bodyFragment: ping}\n      response: {stdout: pong}\n",
        );
        let mocker = StdioMocker::load(&snapshot, &OccurrenceTable::new()).await;

        let paths: Vec<_> = mocker.diagnostics().iter().map(|d| d.path.as_str()).collect();
        assert_eq!(paths, vec!["stdioMocks.mocks[0]"]);
        let out = mocker.handle_chunk("ping").await.unwrap().unwrap();
        assert_eq!(out.stdout.unwrap(), b"pong");
    }

    #[tokio::test]
    async fn test_missing_mocks_file_keeps_inline_mocks() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = snapshot(
            dir.path(),
            "stdioMocks:\n  mocksFile: missing.json\n  mocks:\n    - response: {stdout: hello}\n",
        );
        let mocker = StdioMocker::load(&snapshot, &OccurrenceTable::new()).await;

        assert_eq!(mocker.diagnostics().len(), 1);
        assert_eq!(mocker.diagnostics()[0].path, "stdioMocks.mocksFile");
        assert!(mocker.diagnostics()[0].message.contains("missing.json"));
        let out = mocker.handle_chunk("anything").await.unwrap().unwrap();
        assert_eq!(out.stdout.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_bad_section_degrades_to_no_mocks() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = snapshot(dir.path(), "stdioMocks:\n  mocks: not-a-list\n");
        let mocker = StdioMocker::load(&snapshot, &OccurrenceTable::new()).await;

        assert!(mocker.is_empty());
        assert_eq!(mocker.diagnostics()[0].path, "stdioMocks");
        assert!(mocker.handle_chunk("x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_body_file_surfaces() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = snapshot(
            dir.path(),
            "stdioMocks:\n  mocks:\n    - request: {bodyFragment: broken}\n      response: {stdout: '@none.txt'}\n    - request: {bodyFragment: ok}\n      response: {stdout: fine}\n",
        );
        let mocker = StdioMocker::load(&snapshot, &OccurrenceTable::new()).await;
        assert!(mocker.diagnostics().is_empty());

        let err = mocker.handle_chunk("broken").await.unwrap_err();
        assert!(matches!(err, RenderError::File { .. }));

        let out = mocker.handle_chunk("ok").await.unwrap().unwrap();
        assert_eq!(out.stdout.unwrap(), b"fine");
    }
}
