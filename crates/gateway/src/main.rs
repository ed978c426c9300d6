//! Gantry API gateway - main entry point.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pingora::prelude::*;
use std::sync::Arc;
use tracing::{error, info, warn};

use gantry_config::GatewayConfig;
use gantry_gateway::GantryGateway;

/// Gantry - an API gateway built on Pingora
#[derive(Parser, Debug)]
#[command(name = "gantry")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long = "config", env = "GANTRY_CONFIG")]
    config: Option<String>,

    /// Test configuration and exit
    #[arg(short = 't', long = "test")]
    test: bool,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose")]
    verbose: bool,

    /// Run in daemon mode (background)
    #[arg(short = 'd', long = "daemon")]
    daemon: bool,

    /// Upgrade from a running instance
    #[arg(short = 'u', long = "upgrade")]
    upgrade: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate the configuration file and exit
    Test {
        #[arg(short = 'c', long = "config")]
        config: Option<String>,
    },
    /// Run the gateway (default)
    Run {
        #[arg(short = 'c', long = "config")]
        config: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.test {
        return test_config(cli.config.as_deref());
    }

    match cli.command {
        Some(Commands::Test { config }) => {
            test_config(config.as_deref().or(cli.config.as_deref()))
        }
        Some(Commands::Run { config }) => {
            run_server(config.or(cli.config), cli.verbose, cli.daemon, cli.upgrade)
        }
        None => run_server(cli.config, cli.verbose, cli.daemon, cli.upgrade),
    }
}

fn load_config(config_path: Option<&str>) -> Result<GatewayConfig> {
    match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path);
            GatewayConfig::from_file(path).context("Failed to load configuration file")
        }
        None => {
            info!("No configuration specified, using defaults");
            Ok(GatewayConfig::default())
        }
    }
}

/// Validate a configuration file and exit.
fn test_config(config_path: Option<&str>) -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    let config = load_config(config_path)?;
    config.check().context("Configuration validation failed")?;

    info!("Configuration test successful:");
    info!("  - listen port {}", config.listen_port);
    if let Some(control) = config.control_api_port {
        info!("  - control port {}", control);
    }
    info!("  - {} whitelisted extra port(s)", config.port_whitelist.len());

    println!(
        "gantry: configuration file {} test is successful",
        config_path.unwrap_or("(defaults)")
    );
    Ok(())
}

fn run_server(
    config_path: Option<String>,
    verbose: bool,
    daemon: bool,
    upgrade: bool,
) -> Result<()> {
    let log_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();

    let mut pingora_opt = Opt::default();
    pingora_opt.daemon = daemon;
    pingora_opt.upgrade = upgrade;

    let config = load_config(config_path.as_deref())?;

    // Runtime for engine construction and background tasks; Pingora runs
    // its own workers, this one keeps the coordinator and sync tasks alive
    let runtime = tokio::runtime::Runtime::new()?;

    let gateway = runtime
        .block_on(GantryGateway::new(config))
        .context("Failed to initialize gateway")?;

    // Initial load so serving starts with a populated snapshot; a failed
    // initial sync is fatal only when there is nothing to serve at all
    if let Err(e) = runtime.block_on(gateway.initial_load()) {
        if gateway.apis.get().is_empty() {
            warn!(error = %e, "Initial load failed, starting with an empty API set");
        }
    }

    let config = Arc::clone(&gateway.config);
    let reload_queue = gateway.reload_queue();
    let gateway = Arc::new(gateway);

    // Configure the Pingora server
    let worker_threads = if config.worker_threads > 0 {
        config.worker_threads
    } else {
        num_cpus::get()
    };
    let mut pingora_conf = pingora::server::configuration::ServerConf::default();
    pingora_conf.threads = worker_threads;
    pingora_conf.work_stealing = true;
    pingora_conf.upstream_keepalive_pool_size = 256;

    info!(
        worker_threads = worker_threads,
        "Configuring Pingora server"
    );

    let mut server = Server::new_with_opt_and_conf(Some(pingora_opt), pingora_conf);
    server.bootstrap();

    let mut proxy_service =
        http_proxy_service(&server.configuration, ArcGateway(Arc::clone(&gateway)));

    // One listener per whitelisted HTTP port, TLS when configured
    let bind_host = if config.listen_address.is_empty() {
        "0.0.0.0".to_string()
    } else {
        config.listen_address.clone()
    };
    let tls = &config.http_server_options;
    for port in config.allowed_ports() {
        let address = format!("{}:{}", bind_host, port);
        if tls.use_ssl {
            let (Some(cert), Some(key)) = (&tls.ssl_cert_file, &tls.ssl_key_file) else {
                anyhow::bail!("use_ssl requires ssl_cert_file and ssl_key_file");
            };
            let cert = cert.to_string_lossy();
            let key = key.to_string_lossy();
            match proxy_service.add_tls(&address, &cert, &key) {
                Ok(()) => info!("HTTPS listening on: {}", address),
                Err(e) => {
                    error!(address = %address, error = %e, "Failed to configure TLS listener");
                }
            }
        } else {
            proxy_service.add_tcp(&address);
            info!("HTTP listening on: {}", address);
        }
    }

    server.add_service(proxy_service);

    // Signals: SIGHUP queues a reload, SIGTERM/SIGINT drain and exit
    setup_signal_handlers(Arc::clone(&gateway), reload_queue, &runtime);

    info!("Gantry gateway started");
    info!("Hot reload enabled (SIGHUP or POST /tyk/reload)");
    info!("Graceful shutdown enabled (SIGTERM/SIGINT)");

    server.run_forever();
}

/// Wrapper delegating the proxy trait to the shared gateway.
struct ArcGateway(Arc<GantryGateway>);

#[async_trait::async_trait]
impl pingora::proxy::ProxyHttp for ArcGateway {
    type CTX = gantry_gateway::RequestContext;

    fn new_ctx(&self) -> Self::CTX {
        self.0.new_ctx()
    }

    async fn early_request_filter(
        &self,
        session: &mut pingora::proxy::Session,
        ctx: &mut Self::CTX,
    ) -> pingora::Result<()> {
        self.0.early_request_filter(session, ctx).await
    }

    async fn request_filter(
        &self,
        session: &mut pingora::proxy::Session,
        ctx: &mut Self::CTX,
    ) -> pingora::Result<bool> {
        self.0.request_filter(session, ctx).await
    }

    async fn request_body_filter(
        &self,
        session: &mut pingora::proxy::Session,
        body: &mut Option<bytes::Bytes>,
        end_of_stream: bool,
        ctx: &mut Self::CTX,
    ) -> pingora::Result<()> {
        self.0
            .request_body_filter(session, body, end_of_stream, ctx)
            .await
    }

    async fn upstream_peer(
        &self,
        session: &mut pingora::proxy::Session,
        ctx: &mut Self::CTX,
    ) -> pingora::Result<Box<HttpPeer>> {
        self.0.upstream_peer(session, ctx).await
    }

    async fn upstream_request_filter(
        &self,
        session: &mut pingora::proxy::Session,
        upstream_request: &mut pingora::http::RequestHeader,
        ctx: &mut Self::CTX,
    ) -> pingora::Result<()> {
        self.0
            .upstream_request_filter(session, upstream_request, ctx)
            .await
    }

    async fn response_filter(
        &self,
        session: &mut pingora::proxy::Session,
        upstream_response: &mut pingora::http::ResponseHeader,
        ctx: &mut Self::CTX,
    ) -> pingora::Result<()> {
        self.0.response_filter(session, upstream_response, ctx).await
    }

    fn response_body_filter(
        &self,
        session: &mut pingora::proxy::Session,
        body: &mut Option<bytes::Bytes>,
        end_of_stream: bool,
        ctx: &mut Self::CTX,
    ) -> pingora::Result<Option<std::time::Duration>> {
        self.0
            .response_body_filter(session, body, end_of_stream, ctx)
    }

    async fn fail_to_proxy(
        &self,
        session: &mut pingora::proxy::Session,
        e: &pingora::Error,
        ctx: &mut Self::CTX,
    ) -> pingora_proxy::FailToProxy {
        self.0.fail_to_proxy(session, e, ctx).await
    }

    async fn logging(
        &self,
        session: &mut pingora::proxy::Session,
        error: Option<&pingora::Error>,
        ctx: &mut Self::CTX,
    ) {
        self.0.logging(session, error, ctx).await
    }
}

/// Register OS signal handlers on a dedicated thread, forwarding into the
/// async runtime.
fn setup_signal_handlers(
    gateway: Arc<GantryGateway>,
    reload_queue: gantry_gateway::reload::ReloadQueue,
    runtime: &tokio::runtime::Runtime,
) {
    use signal_hook::consts::signal::*;
    use signal_hook::iterator::Signals;

    let handle = runtime.handle().clone();
    std::thread::spawn(move || {
        let mut signals = match Signals::new([SIGTERM, SIGINT, SIGHUP]) {
            Ok(signals) => signals,
            Err(e) => {
                error!(error = %e, "Failed to register signal handlers");
                return;
            }
        };

        for sig in signals.forever() {
            match sig {
                SIGHUP => {
                    info!("Received SIGHUP, queueing reload");
                    reload_queue.queue(None);
                }
                SIGTERM | SIGINT => {
                    info!("Received shutdown signal, draining");
                    let gateway = Arc::clone(&gateway);
                    handle.block_on(async move {
                        gateway.shutdown().await;
                    });
                    std::process::exit(0);
                }
                _ => {}
            }
        }
    });
}
