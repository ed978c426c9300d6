//! In-process pub/sub for gateway events.
//!
//! The notifier fans events out to any interested task (quota trigger
//! forwarding, analytics, tests). Cluster-wide reload notifications
//! additionally travel through the shared store's pub/sub channel so every
//! node picks them up.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use gantry_common::GatewayResult;

use crate::storage::KeyValueStore;

/// Store channel carrying cluster-wide notifications.
pub const CLUSTER_CHANNEL: &str = "gantry.cluster.notifications";

/// Payload of a cluster notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterNotice {
    pub command: String,
}

/// Events emitted by the engine.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GatewayEvent {
    BreakerTripped {
        api_id: String,
        path: String,
    },
    BreakerReset {
        api_id: String,
        path: String,
    },
    QuotaThreshold {
        key_hash: String,
        api_id: String,
        org_id: String,
        remaining: i64,
        threshold: f64,
    },
    ReloadCompleted {
        apis: usize,
        policies: usize,
    },
}

/// Fan-out notifier. Senders never block; lagging receivers drop the
/// oldest events.
pub struct Notifier {
    tx: broadcast::Sender<GatewayEvent>,
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: GatewayEvent) {
        debug!(event = ?event, "Emitting gateway event");
        // A send error just means nobody is subscribed right now
        let _ = self.tx.send(event);
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Ask every node in the cluster to reload.
pub async fn publish_cluster_reload(store: &Arc<dyn KeyValueStore>) -> GatewayResult<()> {
    let notice = ClusterNotice {
        command: "reload".to_string(),
    };
    store
        .publish(CLUSTER_CHANNEL, &serde_json::to_string(&notice)?)
        .await
}

/// Listen for cluster notifications, invoking `on_reload` for each reload
/// command. Runs until the subscription ends.
pub async fn run_cluster_listener<F>(
    store: Arc<dyn KeyValueStore>,
    on_reload: F,
) -> GatewayResult<()>
where
    F: Fn() + Send + Sync + 'static,
{
    let mut rx = store.subscribe(CLUSTER_CHANNEL).await?;
    loop {
        match rx.recv().await {
            Ok(raw) => match serde_json::from_str::<ClusterNotice>(&raw) {
                Ok(notice) if notice.command == "reload" => {
                    debug!("Cluster reload notification received");
                    on_reload();
                }
                Ok(notice) => {
                    debug!(command = %notice.command, "Ignoring cluster notification");
                }
                Err(e) => {
                    warn!(error = %e, "Unparseable cluster notification");
                }
            },
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed = missed, "Cluster listener lagged, continuing");
            }
            Err(broadcast::error::RecvError::Closed) => return Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn notifier_fan_out() {
        let notifier = Notifier::new();
        let mut rx1 = notifier.subscribe();
        let mut rx2 = notifier.subscribe();

        notifier.emit(GatewayEvent::BreakerTripped {
            api_id: "a".into(),
            path: "/x".into(),
        });

        assert!(matches!(
            rx1.recv().await.unwrap(),
            GatewayEvent::BreakerTripped { .. }
        ));
        assert!(matches!(
            rx2.recv().await.unwrap(),
            GatewayEvent::BreakerTripped { .. }
        ));
    }

    #[tokio::test]
    async fn cluster_reload_roundtrip() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let hits = Arc::new(AtomicUsize::new(0));

        let listener_store = Arc::clone(&store);
        let listener_hits = Arc::clone(&hits);
        tokio::spawn(async move {
            let _ = run_cluster_listener(listener_store, move || {
                listener_hits.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        publish_cluster_reload(&store).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
