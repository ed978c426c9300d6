//! The gateway service: aggregate state and construction.
//!
//! `GantryGateway` owns every long-lived component (stores, registries,
//! mux, limiters, cache, reload coordinator) and implements Pingora's
//! `ProxyHttp` trait (see [`http_trait`]) to drive the request lifecycle
//! through the per-API pipeline.

pub mod context;
pub mod http;
mod http_trait;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use gantry_common::{GatewayError, GatewayResult, RequestMetrics};
use gantry_config::{GatewayConfig, PolicySource};

use crate::analytics::AnalyticsRecorder;
use crate::cache::ResponseCache;
use crate::control::ControlState;
use crate::events::{self, Notifier};
use crate::limits::{QuotaManager, RateLimiter};
use crate::loader::{ApiProvider, DirectoryApiSource, FilePolicySource, NoPolicySource,
    PolicyProvider};
use crate::mux::ProxyMux;
use crate::pipeline::{DriverRegistry, PipelineDeps};
use crate::registry::{ApiRegistry, PolicyRegistry};
use crate::reload::{GracefulDrain, ReloadCoordinator, ReloadQueue};
use crate::resources::ResourceStack;
use crate::storage::{self, CertificateStore, KeyValueStore, SessionStore};
use crate::sync::DashboardClient;

pub use context::RequestContext;

/// The gateway engine.
pub struct GantryGateway {
    pub config: Arc<GatewayConfig>,
    pub apis: Arc<ApiRegistry>,
    pub policies: Arc<PolicyRegistry>,
    pub mux: Arc<ProxyMux>,
    pub deps: PipelineDeps,
    pub drain: Arc<GracefulDrain>,
    pub coordinator: Arc<ReloadCoordinator>,
    pub analytics: AnalyticsRecorder,
    pub resources: Arc<ResourceStack>,
    pub dashboard: Option<Arc<DashboardClient>>,
    shutdown_tx: watch::Sender<bool>,
}

impl GantryGateway {
    /// Wire up the engine from configuration. Spawns the reload
    /// coordinator, the cluster-notification listener, and (when slaved to
    /// a remote source) node registration and heartbeat.
    pub async fn new(config: GatewayConfig) -> GatewayResult<Self> {
        config.check()?;
        let config = Arc::new(config);

        let store: Arc<dyn KeyValueStore> = storage::connect_store(&config.storage).await?;
        store.ping().await.map_err(|e| {
            GatewayError::storage(format!("store unreachable at startup: {}", e))
        })?;

        let sessions = Arc::new(SessionStore::new(Arc::clone(&store), config.hash_keys));
        let certs = Arc::new(CertificateStore::new());
        if let Some(cert_dir) = &config.certificate_path {
            match certs.load_dir(cert_dir) {
                Ok(count) => info!(count = count, "Loaded certificate store"),
                Err(e) => warn!(error = %e, "Certificate store load failed"),
            }
        }

        let apis = Arc::new(ApiRegistry::new());
        let policies = Arc::new(PolicyRegistry::new());
        let mux = Arc::new(ProxyMux::new(config.listen_port));
        let notifier = Arc::new(Notifier::new());
        let metrics = Arc::new(RequestMetrics::new().map_err(|e| {
            GatewayError::internal(format!("metrics registration failed: {}", e))
        })?);

        let rate_limiter = Arc::new(RateLimiter::new(Arc::clone(&store), &config.rate_limit));
        let quotas = Arc::new(QuotaManager::new(
            Arc::clone(&store),
            config.quota_trigger_thresholds.clone(),
        ));
        let cache = Arc::new(ResponseCache::new());
        let drivers = Arc::new(DriverRegistry::new());

        // Definition / policy providers per configuration
        let dashboard = if config.db_app_conf_options.enabled {
            Some(Arc::new(DashboardClient::new(&config)?))
        } else {
            None
        };
        let api_provider: Arc<dyn ApiProvider> = match (&dashboard, &config.app_path) {
            (Some(client), _) => Arc::clone(client) as Arc<dyn ApiProvider>,
            (None, Some(path)) => Arc::new(DirectoryApiSource::new(path)),
            (None, None) => {
                return Err(GatewayError::config(
                    "no API source configured: set app_path or enable the remote source",
                ))
            }
        };
        let policy_provider: Arc<dyn PolicyProvider> = match config.policies.source {
            PolicySource::Service => match &dashboard {
                Some(client) => Arc::clone(client) as Arc<dyn PolicyProvider>,
                None => {
                    return Err(GatewayError::config(
                        "policy source 'service' requires the remote config source",
                    ))
                }
            },
            PolicySource::File => match &config.policies.path {
                Some(path) => Arc::new(FilePolicySource::new(path)),
                None => Arc::new(NoPolicySource),
            },
        };

        let coordinator = Arc::new(ReloadCoordinator::new(
            api_provider,
            policy_provider,
            Arc::clone(&apis),
            Arc::clone(&policies),
            Arc::clone(&mux),
            Arc::clone(&notifier),
            Arc::clone(&config),
        ));

        let drain = Arc::new(GracefulDrain::new(Duration::from_secs(
            config.graceful_shutdown_timeout,
        )));

        let deps = PipelineDeps {
            store: Arc::clone(&store),
            sessions,
            certs,
            policies: Arc::clone(&policies),
            rate_limiter,
            quotas,
            cache,
            drivers,
            notifier: Arc::clone(&notifier),
            metrics,
            config: Arc::clone(&config),
        };

        let (shutdown_tx, _) = watch::channel(false);
        let resources = Arc::new(ResourceStack::new());

        let analytics_enabled = config.enable_analytics;
        let gateway = Self {
            config,
            apis,
            policies,
            mux,
            deps,
            drain,
            coordinator,
            analytics: AnalyticsRecorder::new(analytics_enabled),
            resources,
            dashboard,
            shutdown_tx,
        };

        // Shutdown releases resources in reverse registration order: the
        // cache empties before the TCP listeners go away
        let mux_for_stop = Arc::clone(&gateway.mux);
        let stop_deadline = Duration::from_secs(gateway.config.graceful_shutdown_timeout);
        gateway.resources.register("tcp-listeners", move || async move {
            mux_for_stop.graceful_stop(stop_deadline).await;
        });
        let cache_for_stop = Arc::clone(&gateway.deps.cache);
        gateway.resources.register("response-cache", move || async move {
            cache_for_stop.clear();
        });

        gateway.start_background_tasks().await;
        Ok(gateway)
    }

    fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    async fn start_background_tasks(&self) {
        // Reload coordinator loop
        tokio::spawn(Arc::clone(&self.coordinator).run(self.shutdown_rx()));

        // Cluster reload notifications through the shared store
        let store = Arc::clone(&self.deps.store);
        let queue = self.coordinator.queue_handle();
        tokio::spawn(async move {
            if let Err(e) = events::run_cluster_listener(store, move || {
                queue.queue(None);
            })
            .await
            {
                warn!(error = %e, "Cluster notification listener ended");
            }
        });

        // Node registration + heartbeat when slaved to a remote source
        if let Some(client) = &self.dashboard {
            let client = Arc::clone(client);
            let mut shutdown = self.shutdown_rx();
            let heartbeat_shutdown = self.shutdown_rx();
            let queue = self.coordinator.queue_handle();
            tokio::spawn(async move {
                client.register_with_retry(&mut shutdown).await;
                // Registration recovers configuration: queue a reload
                queue.queue(None);
                client.run_heartbeat(heartbeat_shutdown).await;
            });
        }

        // Quota trigger forwarding to the config service
        if let Some(client) = &self.dashboard {
            let client = Arc::clone(client);
            let mut events_rx = self.deps.notifier.subscribe();
            tokio::spawn(async move {
                while let Ok(event) = events_rx.recv().await {
                    if let events::GatewayEvent::QuotaThreshold {
                        key_hash,
                        api_id,
                        org_id,
                        remaining,
                        threshold,
                    } = event
                    {
                        let trigger = crate::sync::dashboard::QuotaTriggerEvent {
                            event: "QuotaTrigger".to_string(),
                            key_hash,
                            api_id,
                            org_id,
                            remaining,
                            threshold,
                        };
                        if let Err(e) = client.notify_quota_trigger(&trigger).await {
                            warn!(error = %e, "Quota trigger notification failed");
                        }
                    }
                }
            });
        }
    }

    /// Control-plane state for the builtin endpoints.
    pub fn control_state(&self) -> ControlState {
        let coordinator = Arc::clone(&self.coordinator);
        ControlState {
            config: Arc::clone(&self.config),
            store: Arc::clone(&self.deps.store),
            reload_queue: self.coordinator.queue_handle(),
            last_reload: Arc::new(move || coordinator.last_status()),
        }
    }

    /// Queue a reload (startup, signals, control API).
    pub fn reload_queue(&self) -> ReloadQueue {
        self.coordinator.queue_handle()
    }

    /// Perform the initial blocking load so serving starts with a
    /// populated snapshot.
    pub async fn initial_load(&self) -> GatewayResult<()> {
        self.coordinator.do_reload().await
    }

    /// Graceful shutdown: stop intake, drain in-flight work, release
    /// resources LIFO, de-register from the config service.
    pub async fn shutdown(&self) {
        info!("Stop signal received, shutting down gracefully");
        self.drain.request_shutdown();
        let _ = self.shutdown_tx.send(true);

        let drained = self.drain.wait_for_drain().await;
        if !drained {
            warn!("Forcing shutdown with requests still in flight");
        }

        if let Some(client) = &self.dashboard {
            if let Err(e) = client.deregister().await {
                warn!(error = %e, "De-registration failed");
            }
        }

        self.resources.shutdown().await;
        info!("Shutdown complete");
    }
}
