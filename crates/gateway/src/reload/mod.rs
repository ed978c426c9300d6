//! Reload coordination.
//!
//! Reloads are queued and served by a single task: at fixed ticks the
//! pending callbacks are drained and one full rebuild runs: sync
//! policies, sync definitions, rebuild the API snapshot, install the mux
//! table, then invoke the queued callbacks in order. Serving never blocks
//! on a reload; requests keep the snapshot they started with.
//!
//! Each sync retries with a fixed backoff. When the gateway is slaved to a
//! remote source and every attempt fails, emergency mode kicks in: the
//! sync is retried once against the local disk backup, and the mode clears
//! on the next successful remote pull.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use gantry_common::{GatewayResult, GatewayError};
use gantry_config::{ApiDefinition, GatewayConfig, Policy};

use crate::events::{GatewayEvent, Notifier};
use crate::loader::{ApiProvider, PolicyProvider};
use crate::mux::ProxyMux;
use crate::registry::{ApiRegistry, ApiSnapshot, ApiSpec, PolicyRegistry};
use crate::sync::{load_backup, save_backup};

/// Callback invoked (in queue order) once the reload that served it
/// completes.
pub type ReloadCallback = Box<dyn FnOnce() + Send>;

// ============================================================================
// Graceful drain
// ============================================================================

/// Tracks in-flight requests for graceful reload and shutdown.
pub struct GracefulDrain {
    active_requests: AtomicUsize,
    max_drain_time: Duration,
    shutdown_requested: AtomicBool,
}

impl GracefulDrain {
    pub fn new(max_drain_time: Duration) -> Self {
        Self {
            active_requests: AtomicUsize::new(0),
            max_drain_time,
            shutdown_requested: AtomicBool::new(false),
        }
    }

    pub fn inc_requests(&self) {
        self.active_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_requests(&self) {
        self.active_requests.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn active_count(&self) -> usize {
        self.active_requests.load(Ordering::Relaxed)
    }

    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Wait for in-flight requests to finish. Returns `false` when the
    /// drain deadline expired with requests still active.
    pub async fn wait_for_drain(&self) -> bool {
        let start = Instant::now();
        while self.active_count() > 0 {
            if start.elapsed() > self.max_drain_time {
                warn!(
                    remaining = self.active_count(),
                    "Drain timeout reached with requests still active"
                );
                return false;
            }
            pingora_timeout::sleep(Duration::from_millis(100)).await;
        }
        info!("All requests drained");
        true
    }
}

// ============================================================================
// Reload coordinator
// ============================================================================

/// Handle for queueing reloads from anywhere in the engine.
#[derive(Clone)]
pub struct ReloadQueue {
    tx: mpsc::UnboundedSender<Option<ReloadCallback>>,
}

impl ReloadQueue {
    /// Queue a reload. The callback (when given) runs after the reload
    /// that serves this request completes. If a reload is already queued
    /// the callback still runs when that one finishes.
    pub fn queue(&self, callback: Option<ReloadCallback>) {
        if self.tx.send(callback).is_err() {
            warn!("Reload queued after coordinator stopped");
        }
    }
}

/// Status of the last reload, surfaced by the health endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadStatus {
    Never,
    Succeeded,
    Failed,
}

/// The single-writer reload coordinator.
pub struct ReloadCoordinator {
    api_provider: Arc<dyn ApiProvider>,
    policy_provider: Arc<dyn PolicyProvider>,
    apis: Arc<ApiRegistry>,
    policies: Arc<PolicyRegistry>,
    mux: Arc<ProxyMux>,
    notifier: Arc<Notifier>,
    config: Arc<GatewayConfig>,
    emergency_mode: AtomicBool,
    last_status: Mutex<ReloadStatus>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Option<ReloadCallback>>>>,
    queue: ReloadQueue,
}

impl ReloadCoordinator {
    pub fn new(
        api_provider: Arc<dyn ApiProvider>,
        policy_provider: Arc<dyn PolicyProvider>,
        apis: Arc<ApiRegistry>,
        policies: Arc<PolicyRegistry>,
        mux: Arc<ProxyMux>,
        notifier: Arc<Notifier>,
        config: Arc<GatewayConfig>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            api_provider,
            policy_provider,
            apis,
            policies,
            mux,
            notifier,
            config,
            emergency_mode: AtomicBool::new(false),
            last_status: Mutex::new(ReloadStatus::Never),
            rx: Mutex::new(Some(rx)),
            queue: ReloadQueue { tx },
        }
    }

    pub fn queue_handle(&self) -> ReloadQueue {
        self.queue.clone()
    }

    pub fn last_status(&self) -> ReloadStatus {
        self.last_status.lock().clone()
    }

    pub fn is_emergency_mode(&self) -> bool {
        self.emergency_mode.load(Ordering::Relaxed)
    }

    /// The coordinator loop: drain the queue at each tick and run one
    /// reload cycle for however many requests were pending. Runs until
    /// `shutdown` flips.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let tick = Duration::from_secs(self.config.reload_interval.max(1));
        let mut rx = match self.rx.lock().take() {
            Some(rx) => rx,
            None => {
                error!("Reload coordinator started twice");
                return;
            }
        };
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => {
                    info!("Reload coordinator stopped");
                    return;
                }
            }

            // Drain everything queued since the last tick
            let mut callbacks = Vec::new();
            let mut pending = false;
            while let Ok(cb) = rx.try_recv() {
                pending = true;
                if let Some(cb) = cb {
                    callbacks.push(cb);
                }
            }
            if !pending {
                continue;
            }

            let start = Instant::now();
            info!("reload: initiating");
            match self.do_reload().await {
                Ok(()) => {
                    *self.last_status.lock() = ReloadStatus::Succeeded;
                    info!(duration_ms = start.elapsed().as_millis() as u64, "reload: cycle completed");
                }
                Err(e) => {
                    *self.last_status.lock() = ReloadStatus::Failed;
                    error!(error = %e, "reload: cycle failed, serving continues on the last snapshot");
                }
            }
            for cb in callbacks {
                cb();
            }
        }
    }

    /// One full reload: policies, then definitions, then snapshot + mux.
    pub async fn do_reload(&self) -> GatewayResult<()> {
        let policies = self.sync_policies().await?;
        let apis = self.sync_apis().await?;

        // A sync that reports zero APIs never replaces a non-empty
        // registry; transient empty responses must not blow away a
        // working snapshot.
        if apis.is_empty() {
            if !self.apis.get().is_empty() {
                warn!("Sync returned zero APIs with a non-empty registry, keeping current snapshot");
                return Err(GatewayError::sync("zero-API sync rejected"));
            }
            debug!("No API definitions found, nothing to load");
            self.policies.replace(policies);
            return Ok(());
        }

        let valid = gantry_config::validation::filter_valid(apis);
        let mut specs = Vec::with_capacity(valid.len());
        for def in valid {
            let api_id = def.api_id.clone();
            match ApiSpec::build(def) {
                Ok(spec) => specs.push(Arc::new(spec)),
                Err(e) => {
                    warn!(api_id = %api_id, error = %e, "Skipping definition that failed to compile");
                }
            }
        }

        let snapshot = ApiSnapshot::from_specs(specs);
        let api_count = snapshot.len();
        let policy_count = policies.len();

        self.policies.replace(policies);
        self.mux.install(&snapshot, &self.config).await;
        self.apis.replace(snapshot);

        self.notifier.emit(GatewayEvent::ReloadCompleted {
            apis: api_count,
            policies: policy_count,
        });
        info!(apis = api_count, policies = policy_count, "API reload complete");
        Ok(())
    }

    async fn sync_policies(&self) -> GatewayResult<HashMap<String, Policy>> {
        let source_id = self.policy_provider.source_id();
        let result = self
            .sync_with_retry("policies", || self.policy_provider.fetch_policies())
            .await;
        match result {
            Ok(policies) => {
                self.after_successful_sync(&source_id, &serde_json::to_string(&policies)?);
                Ok(policies)
            }
            Err(e) => self.recover_from_backup(&source_id, e),
        }
    }

    async fn sync_apis(&self) -> GatewayResult<Vec<ApiDefinition>> {
        let source_id = self.api_provider.source_id();
        let result = self
            .sync_with_retry("apis", || self.api_provider.fetch_apis())
            .await;
        match result {
            Ok(apis) => {
                self.after_successful_sync(&source_id, &serde_json::to_string(&apis)?);
                Ok(apis)
            }
            Err(e) => self.recover_from_backup(&source_id, e),
        }
    }

    async fn sync_with_retry<T, F, Fut>(&self, resource: &str, fetch: F) -> GatewayResult<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = GatewayResult<T>>,
    {
        let attempts = self.config.resource_sync.retry_attempts + 1;
        let backoff = Duration::from_secs(self.config.resource_sync.interval.max(1));
        let mut last_err = None;

        for attempt in 1..=attempts {
            match fetch().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    error!(
                        resource = resource,
                        attempt = attempt,
                        attempts = attempts,
                        error = %e,
                        "Sync attempt failed"
                    );
                    last_err = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| GatewayError::sync("sync failed")))
    }

    /// When slaved to a remote source, a fully-failed sync falls back to
    /// the disk backup and enables emergency mode.
    fn recover_from_backup<T: serde::de::DeserializeOwned>(
        &self,
        source_id: &str,
        err: GatewayError,
    ) -> GatewayResult<T> {
        if !self.config.db_app_conf_options.enabled {
            return Err(err);
        }
        warn!(source = %source_id, "All sync attempts failed, entering emergency mode");
        self.emergency_mode.store(true, Ordering::Relaxed);

        match load_backup(&self.config.backup_path, source_id)? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Err(err),
        }
    }

    fn after_successful_sync(&self, source_id: &str, payload: &str) {
        if self.emergency_mode.swap(false, Ordering::Relaxed) {
            info!("Remote sync recovered, emergency mode cleared");
        }
        if self.config.db_app_conf_options.enabled {
            if let Err(e) = save_backup(&self.config.backup_path, source_id, payload) {
                warn!(error = %e, "Failed to write sync backup");
            }
        }
    }
}
