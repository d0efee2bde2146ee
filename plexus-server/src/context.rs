//! Application context
//!
//! The process-wide wiring of the kernel, carried as an explicit value
//! rather than a static. The inner [`Kernel`] (storage, plug-ins,
//! library, security, dispatcher, scheduler) lives behind a read-write
//! lock: requests hold read access for their lifetime, so a `reset()`
//! waits for in-flight requests, tears the old kernel down, and builds a
//! fresh one before the next request proceeds.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::connection::DriverRegistry;
use crate::dict::{Dict, Value};
use crate::error::Result;
use crate::metrics::MetricsRegistry;
use crate::path::StoragePath;
use crate::plugin::PluginManager;
use crate::procedure::{Bindings, CallBindings, CallContext, Library, Procedure};
use crate::scheduler::Scheduler;
use crate::security::SecurityContext;
use crate::storage::root::RootStorage;
use crate::storage::InitContext;
use crate::types::TypeRegistry;
use crate::vault::{LocalVault, VaultRegistry};
use crate::web::WebDispatcher;

/// File recording the listening port under the local directory
const PORT_FILE: &str = "server.port";

/// One built-and-running kernel generation
pub struct Kernel {
    pub root: Arc<RootStorage>,
    pub plugins: Arc<PluginManager>,
    pub library: Arc<Library>,
    pub security: Arc<SecurityContext>,
    pub dispatcher: Arc<WebDispatcher>,
    scheduler: Option<Scheduler>,
}

/// Process-wide application context
pub struct AppContext {
    config: Config,
    base_dir: PathBuf,
    local_dir: PathBuf,
    drivers: Arc<DriverRegistry>,
    vaults: Arc<VaultRegistry>,
    metrics: Arc<MetricsRegistry>,
    kernel: RwLock<Option<Kernel>>,
    reset_pending: Arc<AtomicBool>,
}

impl AppContext {
    /// Build the context and its first kernel
    ///
    /// With `start`, configured plug-ins are loaded, the scheduler boots
    /// and the port file is written; without it only the storage tree
    /// comes up (admin tooling mode).
    pub async fn init(
        config: Config,
        base_dir: impl Into<PathBuf>,
        local_dir: impl Into<PathBuf>,
        start: bool,
    ) -> Result<Arc<Self>> {
        let context = Arc::new(Self {
            config,
            base_dir: base_dir.into(),
            local_dir: local_dir.into(),
            drivers: Arc::new(DriverRegistry::new()),
            vaults: Arc::new(VaultRegistry::new()),
            metrics: Arc::new(MetricsRegistry::new()),
            kernel: RwLock::new(None),
            reset_pending: Arc::new(AtomicBool::new(false)),
        });
        let kernel = context.build_kernel(start).await?;
        *context.kernel.write().await = Some(kernel);
        Ok(context)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Driver registry shared across kernel generations
    ///
    /// Concrete connection drivers register here once at process start
    /// and survive resets.
    pub fn drivers(&self) -> &Arc<DriverRegistry> {
        &self.drivers
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    async fn build_kernel(&self, start: bool) -> Result<Kernel> {
        // transient files do not survive a restart
        let tmp = self.local_dir.join("tmp");
        let _ = tokio::fs::remove_dir_all(&tmp).await;
        tokio::fs::create_dir_all(&tmp).await?;

        let init_cx = InitContext::new(self.config.limits.clone())
            .with_drivers(self.drivers.clone())
            .with_metrics(self.metrics.clone())
            .with_vaults(self.vaults.clone());
        let root = Arc::new(RootStorage::new(
            Arc::new(TypeRegistry::with_builtins()),
            init_cx,
        ));

        let plugin_dir = self.local_dir.join("plugin");
        ensure_local_plugin(&plugin_dir)?;
        let plugins = Arc::new(
            PluginManager::new(root.clone(), &plugin_dir)
                .with_base_dir(self.base_dir.join("plugin")),
        );
        plugins.load("local").await?;
        if self.base_dir.join("plugin/system").is_dir() {
            plugins.load("system").await?;
        }

        self.load_vaults(&root).await;

        let library = Library::new(root.clone());
        library.register_builtin(Arc::new(ResetProcedure::new(self.reset_pending.clone())));
        let library = Arc::new(library);
        let security = Arc::new(SecurityContext::new(
            root.clone(),
            self.config.web.realm.clone(),
            self.config.limits.token_stale_minutes,
        ));
        let dispatcher = Arc::new(WebDispatcher::new(
            root.clone(),
            security.clone(),
            library.clone(),
            self.config.clone(),
        ));

        let mut scheduler = None;
        if start {
            for id in plugins.configured_ids().await? {
                if !plugins.is_loaded(&id) {
                    if let Err(e) = plugins.load(&id).await {
                        warn!(plugin = %id, "configured plug-in failed to load: {}", e);
                    }
                }
            }
            scheduler = Some(Scheduler::start(
                root.clone(),
                self.metrics.clone(),
                &self.config.limits,
            ));
            tokio::fs::write(
                self.local_dir.join(PORT_FILE),
                self.config.service.port.to_string(),
            )
            .await?;
        }
        dispatcher.rebuild_matchers().await?;

        info!(
            plugins = plugins.loaded_ids().len(),
            matchers = dispatcher.matcher_count(),
            "kernel initialized"
        );
        Ok(Kernel {
            root,
            plugins,
            library,
            security,
            dispatcher,
            scheduler,
        })
    }

    /// Register stored `/vault/` records as secret sources
    async fn load_vaults(&self, root: &Arc<RootStorage>) {
        let prefix: StoragePath = "/vault/".parse().expect("valid vault prefix");
        let metas: Vec<_> = root.query(&prefix).collect().await;
        for meta in metas {
            if let Ok(Some(record)) = root.load_dict(&meta.path).await {
                let id = record.str_or("id", meta.path.name()).to_string();
                self.vaults
                    .register(Arc::new(LocalVault::from_dict(id, &record)));
            }
        }
    }

    async fn teardown(&self, kernel: Kernel) {
        if let Some(scheduler) = kernel.scheduler {
            scheduler.shutdown().await;
        }
        // flush modified objects before the storage tree goes away
        kernel.root.cache_clean(true).await;
        let _ = self.metrics.flush(&kernel.root).await;
    }

    /// Tear the kernel down and build it anew
    ///
    /// The write lock serializes against in-flight requests: they finish
    /// on the old kernel, then the swap happens, then new requests see
    /// only the new one.
    pub async fn reset(&self) -> Result<()> {
        let mut guard = self.kernel.write().await;
        if let Some(old) = guard.take() {
            self.teardown(old).await;
        }
        let kernel = self.build_kernel(true).await?;
        *guard = Some(kernel);
        info!("application context reset complete");
        Ok(())
    }

    /// Stop the kernel and release runtime files
    pub async fn stop(&self) {
        let mut guard = self.kernel.write().await;
        if let Some(kernel) = guard.take() {
            self.teardown(kernel).await;
        }
        let _ = tokio::fs::remove_file(self.local_dir.join(PORT_FILE)).await;
        info!("application context stopped");
    }

    /// Serve one HTTP request on the current kernel
    pub async fn handle(&self, request: Request<Body>) -> Response {
        let response = {
            let guard = self.kernel.read().await;
            match guard.as_ref() {
                Some(kernel) => kernel.dispatcher.handle(request).await,
                None => {
                    (StatusCode::SERVICE_UNAVAILABLE, "Server is restarting").into_response()
                }
            }
        };
        // a procedure may have requested a reset; run it now that the
        // read lock is gone
        if self.reset_pending.swap(false, Ordering::AcqRel) {
            if let Err(e) = self.reset().await {
                error!("deferred reset failed: {}", e);
            }
        }
        response
    }

    /// Run a closure against the current kernel
    pub async fn with_kernel<R>(&self, f: impl FnOnce(&Kernel) -> R) -> Option<R> {
        let guard = self.kernel.read().await;
        guard.as_ref().map(f)
    }

    /// Build a call context for a server-side procedure call
    pub async fn call_context(&self) -> Option<CallContext> {
        let guard = self.kernel.read().await;
        guard.as_ref().map(|kernel| {
            CallContext::new(
                kernel.root.clone(),
                kernel.library.clone(),
                kernel.security.clone(),
            )
        })
    }

    /// Install a plug-in bundle file
    pub async fn install_plugin(&self, bundle: &Path) -> Result<String> {
        let guard = self.kernel.write().await;
        let kernel = guard.as_ref().ok_or_else(not_running)?;
        kernel.plugins.install(bundle).await
    }

    /// Load an installed plug-in and refresh the matcher cache
    pub async fn load_plugin(&self, id: &str) -> Result<()> {
        let guard = self.kernel.write().await;
        let kernel = guard.as_ref().ok_or_else(not_running)?;
        kernel.plugins.load(id).await?;
        kernel.dispatcher.rebuild_matchers().await
    }

    /// Unload a plug-in and refresh the matcher cache
    pub async fn unload_plugin(&self, id: &str) -> Result<()> {
        let guard = self.kernel.write().await;
        let kernel = guard.as_ref().ok_or_else(not_running)?;
        kernel.plugins.unload(id).await?;
        kernel.dispatcher.rebuild_matchers().await
    }
}

fn not_running() -> crate::error::Error {
    crate::error::Error::Internal("application context is not running".into())
}

/// Seed the writable local plug-in if it does not exist yet
fn ensure_local_plugin(plugin_dir: &Path) -> Result<()> {
    let manifest = plugin_dir.join("local/plugin/local.json");
    if manifest.exists() {
        return Ok(());
    }
    std::fs::create_dir_all(manifest.parent().expect("manifest has a parent"))?;
    let mut dict = Dict::new();
    dict.set("id", "local")
        .set("type", "plugin")
        .set("priority", 100)
        .set("description", "Local configuration and runtime data");
    std::fs::write(&manifest, dict.to_json())?;
    Ok(())
}

/// Built-in `system/reset`: schedules a context reset
///
/// The reset itself runs after the current request completes, once no
/// request holds the kernel read lock.
struct ResetProcedure {
    flag: Arc<AtomicBool>,
    bindings: Bindings,
}

impl ResetProcedure {
    fn new(flag: Arc<AtomicBool>) -> Self {
        Self {
            flag,
            bindings: Bindings::empty(),
        }
    }
}

#[async_trait]
impl Procedure for ResetProcedure {
    fn id(&self) -> &str {
        "system/reset"
    }

    fn description(&self) -> String {
        "Schedules a full server reset".to_string()
    }

    fn bindings(&self) -> &Bindings {
        &self.bindings
    }

    async fn call(&self, _cx: &mut CallContext, _bindings: &CallBindings) -> Result<Value> {
        self.flag.store(true, Ordering::Release);
        let mut result = Dict::new();
        result.set("success", true);
        Ok(Value::Dict(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::path::PathBuf;

    fn write_bundle(file: &Path, entries: &[(&str, &str)]) {
        let raw = std::fs::File::create(file).unwrap();
        let gz = GzEncoder::new(raw, Compression::default());
        let mut builder = tar::Builder::new(gz);
        for (name, content) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, name, content.as_bytes())
                .unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    fn request(method: &str, path: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(path)
            .body(Body::empty())
            .unwrap()
    }

    async fn test_context(dir: &Path) -> Arc<AppContext> {
        let mut config = Config::default();
        config.limits.cache_clean_secs = 3600;
        config.limits.session_sweep_secs = 3600;
        AppContext::init(config, dir.join("base"), dir.join("local"), true)
            .await
            .unwrap()
    }

    fn sample_bundle(dir: &Path) -> PathBuf {
        let bundle = dir.join("sample.plugin");
        write_bundle(
            &bundle,
            &[
                ("plugin.json", r#"{"id": "sample", "type": "plugin"}"#),
                (
                    "webservice/example.json",
                    r#"{"id": "example", "type": "webservice/status", "match": [{"path": "/ex/", "method": "GET"}]}"#,
                ),
            ],
        );
        bundle
    }

    #[tokio::test]
    async fn test_init_creates_runtime_files() {
        let tmp = tempfile::tempdir().unwrap();
        let context = test_context(tmp.path()).await;

        assert!(tmp.path().join("local/tmp").is_dir());
        assert!(tmp.path().join("local/server.port").is_file());
        assert!(tmp.path().join("local/plugin/local/plugin/local.json").is_file());
        let loaded = context
            .with_kernel(|k| k.plugins.loaded_ids())
            .await
            .unwrap();
        assert!(loaded.contains(&"local".to_string()));

        context.stop().await;
        assert!(!tmp.path().join("local/server.port").exists());
    }

    #[tokio::test]
    async fn test_startup_clears_tmp() {
        let tmp = tempfile::tempdir().unwrap();
        let stale = tmp.path().join("local/tmp/stale.bin");
        std::fs::create_dir_all(stale.parent().unwrap()).unwrap();
        std::fs::write(&stale, b"leftover").unwrap();

        let context = test_context(tmp.path()).await;
        assert!(!stale.exists());
        context.stop().await;
    }

    #[tokio::test]
    async fn test_plugin_hot_load_and_unload() {
        let tmp = tempfile::tempdir().unwrap();
        let context = test_context(tmp.path()).await;
        let bundle = sample_bundle(tmp.path());

        // before the plug-in: 404
        let response = context.handle(request("GET", "/ex/hello")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let id = context.install_plugin(&bundle).await.unwrap();
        context.load_plugin(&id).await.unwrap();
        let response = context.handle(request("GET", "/ex/hello")).await;
        assert_eq!(response.status(), StatusCode::OK);

        context.unload_plugin(&id).await.unwrap();
        let response = context.handle(request("GET", "/ex/hello")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        context.stop().await;
    }

    #[tokio::test]
    async fn test_plugins_survive_reset() {
        let tmp = tempfile::tempdir().unwrap();
        let context = test_context(tmp.path()).await;
        let bundle = sample_bundle(tmp.path());
        let id = context.install_plugin(&bundle).await.unwrap();
        context.load_plugin(&id).await.unwrap();

        context.reset().await.unwrap();

        // the configured plug-in list brought it back
        let response = context.handle(request("GET", "/ex/hello")).await;
        assert_eq!(response.status(), StatusCode::OK);
        context.stop().await;
    }

    #[tokio::test]
    async fn test_handle_after_stop_is_unavailable() {
        let tmp = tempfile::tempdir().unwrap();
        let context = test_context(tmp.path()).await;
        context.stop().await;
        let response = context.handle(request("GET", "/anything")).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
