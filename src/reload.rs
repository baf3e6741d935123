//! Live configuration reload.
//!
//! A [`LiveProxy`] serves exchanges from an immutable [`ProxyRuntime`]
//! (snapshot + initialized pipeline). A reload builds a complete new
//! runtime and swaps it in; exchanges already running keep the runtime
//! they started with.

use crate::config::ConfigSnapshot;
use crate::error::{Diagnostic, Result};
use crate::matcher::OccurrenceTable;
use crate::pipeline::{ExchangeOutcome, HttpRequest, HttpResponse, Pipeline};
use crate::plugins::{build_pipeline, PluginRegistry};
use arc_swap::ArcSwap;
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Everything one configuration load produces.
#[derive(Debug)]
pub struct ProxyRuntime {
    pub generation: u64,
    pub snapshot: ConfigSnapshot,
    pub pipeline: Pipeline,
    pub diagnostics: Vec<Diagnostic>,
}

impl ProxyRuntime {
    async fn build(
        generation: u64,
        path: &Path,
        registry: &PluginRegistry,
        occurrences: &Arc<OccurrenceTable>,
    ) -> Result<Self> {
        let snapshot = ConfigSnapshot::load(path).await?;
        let build = build_pipeline(&snapshot, registry, Arc::clone(occurrences)).await;

        let mut diagnostics = snapshot.warnings.clone();
        diagnostics.extend(build.diagnostics);

        Ok(Self {
            generation,
            snapshot,
            pipeline: build.pipeline,
            diagnostics,
        })
    }
}

/// A proxy whose configuration can be swapped while it runs.
pub struct LiveProxy {
    path: PathBuf,
    registry: PluginRegistry,
    occurrences: Arc<OccurrenceTable>,
    runtime: ArcSwap<ProxyRuntime>,
    generation: AtomicU64,
}

impl LiveProxy {
    /// Load the configuration and build the first runtime. Fails only when
    /// the configuration cannot be read or parsed.
    pub async fn start(path: impl Into<PathBuf>, registry: PluginRegistry) -> Result<Self> {
        let path = path.into();
        let occurrences = Arc::new(OccurrenceTable::new());
        let runtime = ProxyRuntime::build(1, &path, &registry, &occurrences).await?;

        info!(
            path = %path.display(),
            plugins = runtime.pipeline.len(),
            "Proxy configuration loaded"
        );

        Ok(Self {
            path,
            registry,
            occurrences,
            runtime: ArcSwap::from_pointee(runtime),
            generation: AtomicU64::new(1),
        })
    }

    pub fn config_path(&self) -> &Path {
        &self.path
    }

    /// The runtime new exchanges run against.
    pub fn current(&self) -> Arc<ProxyRuntime> {
        self.runtime.load_full()
    }

    pub fn occurrences(&self) -> &Arc<OccurrenceTable> {
        &self.occurrences
    }

    /// Rebuild the runtime from disk. On failure the current runtime stays.
    pub async fn reload(&self) -> Result<Arc<ProxyRuntime>> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        match ProxyRuntime::build(generation, &self.path, &self.registry, &self.occurrences).await {
            Ok(runtime) => {
                let runtime = Arc::new(runtime);
                self.runtime.store(Arc::clone(&runtime));
                let pruned = self.occurrences.prune();
                info!(
                    generation,
                    plugins = runtime.pipeline.len(),
                    pruned,
                    "Configuration reloaded"
                );
                Ok(runtime)
            }
            Err(e) => {
                error!(error = %e, "Failed to reload config. Keeping current configuration.");
                Err(e)
            }
        }
    }

    /// Run one exchange against the runtime current when it starts.
    pub async fn handle<F, Fut>(&self, request: HttpRequest, upstream: F) -> ExchangeOutcome
    where
        F: FnOnce(HttpRequest) -> Fut,
        Fut: Future<Output = HttpResponse>,
    {
        let runtime = self.current();
        runtime.pipeline.handle(request, upstream).await
    }
}

/// Watches the configuration file and reloads a [`LiveProxy`] on change.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl ConfigWatcher {
    /// Start watching. Change events are coalesced by the channel: one
    /// reload runs per batch of notifications.
    pub fn spawn(proxy: Arc<LiveProxy>) -> std::result::Result<Self, notify::Error> {
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        let path = proxy.config_path().to_path_buf();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if event.kind.is_modify() || event.kind.is_create() {
                        let _ = tx.send(());
                    }
                }
                Err(e) => error!("Watch error: {:?}", e),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;
        watcher.watch(&path, RecursiveMode::NonRecursive)?;

        let task = tokio::spawn(async move {
            while rx.recv().await.is_some() {
                while rx.try_recv().is_ok() {}
                info!("Config file change detected, reloading...");
                let _ = proxy.reload().await;
            }
        });

        info!(path = %path.display(), "Config watcher started");
        Ok(Self {
            _watcher: watcher,
            task,
        })
    }

    /// Stop watching and end the reload task.
    pub fn stop(self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG_V1: &str = r#"{
        "plugins": [{ "name": "MockResponsePlugin", "configSection": "mocks" }],
        "urlsToWatch": ["https://api.example.com/*"],
        "mocks": { "mocks": [{ "response": { "statusCode": 201 } }] }
    }"#;

    const CONFIG_V2: &str = r#"{
        "plugins": [{ "name": "MockResponsePlugin", "configSection": "mocks" }],
        "urlsToWatch": ["https://api.example.com/*"],
        "mocks": { "mocks": [{ "response": { "statusCode": 202 } }] }
    }"#;

    async fn upstream(_: HttpRequest) -> HttpResponse {
        HttpResponse::new(200)
    }

    fn request() -> HttpRequest {
        HttpRequest::new("GET", "https://api.example.com/a")
    }

    #[tokio::test]
    async fn test_reload_swaps_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devproxyrc.json");
        std::fs::write(&path, CONFIG_V1).unwrap();

        let proxy = LiveProxy::start(&path, PluginRegistry::with_builtins())
            .await
            .unwrap();
        let outcome = proxy.handle(request(), upstream).await;
        assert_eq!(outcome.response.unwrap().status, 201);

        std::fs::write(&path, CONFIG_V2).unwrap();
        let runtime = proxy.reload().await.unwrap();
        assert_eq!(runtime.generation, 2);

        let outcome = proxy.handle(request(), upstream).await;
        assert_eq!(outcome.response.unwrap().status, 202);
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_current_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devproxyrc.json");
        std::fs::write(&path, CONFIG_V1).unwrap();

        let proxy = LiveProxy::start(&path, PluginRegistry::with_builtins())
            .await
            .unwrap();

        std::fs::write(&path, "{ broken").unwrap();
        tokio_test::assert_err!(proxy.reload().await);
        assert_eq!(proxy.current().generation, 1);

        let outcome = proxy.handle(request(), upstream).await;
        assert_eq!(outcome.response.unwrap().status, 201);
    }

    #[tokio::test]
    async fn test_in_flight_exchange_keeps_its_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devproxyrc.json");
        std::fs::write(&path, CONFIG_V1).unwrap();

        let proxy = LiveProxy::start(&path, PluginRegistry::with_builtins())
            .await
            .unwrap();

        let before = proxy.current();
        let mut exchange = before.pipeline.begin(request());

        std::fs::write(&path, CONFIG_V2).unwrap();
        tokio_test::assert_ok!(proxy.reload().await);

        before.pipeline.before_request(&mut exchange).await;
        assert_eq!(exchange.response().unwrap().status, 201);
        assert_eq!(before.generation, 1);
        assert_eq!(proxy.current().generation, 2);
    }

    #[tokio::test]
    async fn test_nth_counters_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devproxyrc.json");
        let config = r#"{
            "plugins": [{ "name": "MockResponsePlugin", "configSection": "mocks" }],
            "urlsToWatch": ["https://api.example.com/*"],
            "mocks": { "mocks": [{ "request": { "nth": 2 }, "response": { "statusCode": 299 } }] }
        }"#;
        std::fs::write(&path, config).unwrap();

        let proxy = LiveProxy::start(&path, PluginRegistry::with_builtins())
            .await
            .unwrap();
        let first = proxy.handle(request(), upstream).await;
        assert_eq!(first.response.unwrap().status, 200);

        proxy.reload().await.unwrap();
        let second = proxy.handle(request(), upstream).await;
        assert_eq!(second.response.unwrap().status, 299);
    }

    #[tokio::test]
    async fn test_reload_drops_counters_of_removed_mocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devproxyrc.json");
        let config = |url: &str| {
            format!(
                r#"{{
            "plugins": [{{ "name": "MockResponsePlugin", "configSection": "mocks" }}],
            "urlsToWatch": ["https://api.example.com/*"],
            "mocks": {{ "mocks": [{{ "request": {{ "url": "{url}" }}, "response": {{ "statusCode": 201 }} }}] }}
        }}"#
            )
        };
        std::fs::write(&path, config("https://api.example.com/one")).unwrap();

        let proxy = LiveProxy::start(&path, PluginRegistry::with_builtins())
            .await
            .unwrap();
        assert_eq!(proxy.occurrences().len(), 1);

        for n in 0..5 {
            std::fs::write(&path, config(&format!("https://api.example.com/{n}"))).unwrap();
            proxy.reload().await.unwrap();
            assert_eq!(proxy.occurrences().len(), 1);
        }
    }

    #[tokio::test]
    async fn test_missing_config_fails_start() {
        let dir = tempfile::tempdir().unwrap();
        let result =
            LiveProxy::start(dir.path().join("none.json"), PluginRegistry::with_builtins()).await;
        assert!(result.is_err());
    }
}
