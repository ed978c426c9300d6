//! TCP passthrough proxy.
//!
//! APIs declaring the `tcp` or `tls` protocol get a per-port forwarder that
//! relays raw bytes between client and target. Each accepted connection runs
//! in its own task; a shutdown cancels the accept loop immediately and gives
//! active connections until the drain deadline before they are aborted.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use gantry_common::{GatewayError, GatewayResult};

use crate::registry::ApiSpec;

/// Extract `host:port` from a target URL, tolerating a scheme prefix.
fn target_address(raw: &str) -> GatewayResult<String> {
    let stripped = raw
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(raw)
        .trim_end_matches('/');
    if stripped.is_empty() {
        return Err(GatewayError::config(format!(
            "target '{}' has no address",
            raw
        )));
    }
    Ok(stripped.to_string())
}

/// Handle to a running per-port TCP forwarder.
pub struct TcpProxyHandle {
    shutdown_tx: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
    active: Arc<AtomicUsize>,
    port: u16,
}

impl TcpProxyHandle {
    /// Bind the port and start the accept loop. Binding is synchronous so
    /// install can report failures immediately.
    pub fn spawn(port: u16, spec: Arc<ApiSpec>) -> GatewayResult<Self> {
        let target = target_address(
            spec.def
                .target_urls
                .first()
                .map(String::as_str)
                .unwrap_or(""),
        )?;

        let bind: SocketAddr = format!("0.0.0.0:{}", port)
            .parse()
            .map_err(|_| GatewayError::config(format!("invalid TCP bind port {}", port)))?;
        let std_listener = std::net::TcpListener::bind(bind)?;
        std_listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(std_listener)?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let active = Arc::new(AtomicUsize::new(0));
        let task_active = Arc::clone(&active);
        let api_id = spec.api_id().to_string();

        info!(port = port, target = %target, api_id = %api_id, "TCP proxy listening");

        let task = tokio::spawn(async move {
            accept_loop(listener, target, api_id, shutdown_rx, task_active).await;
        });

        Ok(Self {
            shutdown_tx,
            task,
            active,
            port,
        })
    }

    /// Signal the accept loop and all connection tasks to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait for active connections to drain, aborting at the deadline.
    pub async fn wait(self, deadline: Duration) {
        let start = Instant::now();
        while self.active.load(Ordering::Relaxed) > 0 {
            if start.elapsed() > deadline {
                warn!(
                    port = self.port,
                    remaining = self.active.load(Ordering::Relaxed),
                    "TCP drain deadline reached, aborting remaining connections"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.task.abort();
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }
}

async fn accept_loop(
    listener: TcpListener,
    target: String,
    api_id: String,
    mut shutdown_rx: watch::Receiver<bool>,
    active: Arc<AtomicUsize>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (client, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(api_id = %api_id, error = %e, "TCP accept failed");
                        continue;
                    }
                };
                debug!(api_id = %api_id, peer = %peer, "Accepted TCP connection");
                let target = target.clone();
                let api_id = api_id.clone();
                let active = Arc::clone(&active);
                let conn_shutdown = shutdown_rx.clone();
                active.fetch_add(1, Ordering::Relaxed);
                tokio::spawn(async move {
                    relay(client, &target, &api_id, conn_shutdown).await;
                    active.fetch_sub(1, Ordering::Relaxed);
                });
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!(api_id = %api_id, "TCP proxy stopping");
                    return;
                }
            }
        }
    }
}

async fn relay(
    mut client: TcpStream,
    target: &str,
    api_id: &str,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut upstream = match TcpStream::connect(target).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(api_id = %api_id, target = %target, error = %e, "TCP upstream connect failed");
            return;
        }
    };

    tokio::select! {
        result = copy_bidirectional(&mut client, &mut upstream) => {
            match result {
                Ok((tx, rx)) => {
                    debug!(api_id = %api_id, bytes_up = tx, bytes_down = rx, "TCP connection closed");
                }
                Err(e) => {
                    debug!(api_id = %api_id, error = %e, "TCP relay ended with error");
                }
            }
        }
        _ = shutdown_rx.changed() => {
            debug!(api_id = %api_id, "TCP connection cancelled by shutdown");
        }
    }
}
