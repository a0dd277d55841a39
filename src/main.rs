//! Sticky-session reverse proxy
//!
//! Main entry point.
//! Responsibilities:
//! 1. Parse CLI arguments and merge them over the TOML configuration.
//! 2. Open the session cache and build the `Director`.
//! 3. Serve the proxy, plus `/metrics`, `/health`, `/status` and `/assignments`
//!    on the optional admin listener.
//! 4. Drain both listeners on `Ctrl+C` or `SIGTERM`.
//!
//! The `httpserv` subcommand runs a trivial backend for local testing.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Server;
use clap::{Args, Parser, Subcommand};
use reqwest::{redirect, Client};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use sticky_proxy::admin;
use sticky_proxy::cache::{SessionCache, DEFAULT_KEY_LOCK_SHARDS};
use sticky_proxy::config::{try_load_config, Overrides, Settings};
use sticky_proxy::director::Director;
use sticky_proxy::forwarder::{self, ProxyState};
use sticky_proxy::httpserv::{self, Greeting};
use sticky_proxy::region::{HttpRegionSource, RegionResolver};
use sticky_proxy::shutdown::ShutdownManager;
use sticky_proxy::store::LmdbStore;
use sticky_proxy::upstream::{ProxyError, UpstreamPool};
// utils
use sticky_proxy::metrics::TOTAL_UPSTREAMS;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Command-line interface for the application.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// The path to the TOML configuration file.
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Port for the metrics listener. Disabled unless set here or in the config.
    #[arg(short = 'm', long, global = true)]
    metrics_port: Option<u16>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the sticky reverse proxy.
    Proxy(ProxyArgs),
    /// Run a simple HTTP server for testing.
    Httpserv(HttpservArgs),
}

#[derive(Args)]
struct ProxyArgs {
    /// Upstream list in the form 'host1:port1,host2:port2'.
    #[arg(short, long, value_delimiter = ',')]
    upstreams: Vec<String>,

    /// Cache record time-to-live in seconds.
    #[arg(short, long)]
    ttl: Option<u64>,

    /// Session cache database path.
    #[arg(short = 'b', long)]
    cache: Option<String>,

    /// Port to listen on.
    #[arg(short, long)]
    port: Option<u16>,

    /// Region lookup service URL, queried as `<url>?ip=<client>`.
    #[arg(long)]
    region_url: Option<String>,
}

#[derive(Args)]
struct HttpservArgs {
    /// Port to listen on.
    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    /// Name to answer with instead of the hostname.
    #[arg(long)]
    name: Option<String>,
}

fn any_addr(port: u16) -> String {
    format!("0.0.0.0:{}", port)
}

fn parse_addr(addr: &str) -> Result<SocketAddr, ProxyError> {
    addr.parse()
        .map_err(|e: std::net::AddrParseError| ProxyError::ConfigError(format!("{}: {}", addr, e)))
}

fn build_client(settings: &Settings) -> Result<Client, ProxyError> {
    Client::builder()
        .connect_timeout(settings.connect_timeout)
        .timeout(settings.timeout)
        .redirect(redirect::Policy::none())
        .build()
        .map_err(|e| ProxyError::ConfigError(format!("Failed to build HTTP client: {}", e)))
}

fn build_director(settings: &Settings, client: &Client) -> Result<Director, ProxyError> {
    let pool = Arc::new(UpstreamPool::new(&settings.upstreams, &settings.scheme)?);
    TOTAL_UPSTREAMS.set(pool.len() as i64);

    let store = LmdbStore::open(&settings.cache_path, settings.cache_map_size_mb)?;
    let mut cache = SessionCache::new(Arc::new(store), settings.ttl);
    if settings.serialize_per_key {
        cache = cache.with_key_serialization(DEFAULT_KEY_LOCK_SHARDS);
    }

    let resolver = settings.region.as_ref().map(|region| {
        let source = HttpRegionSource::new(client.clone(), region.url.clone());
        RegionResolver::new(Arc::new(source), region.timeout)
    });

    Ok(Director::new(pool, cache, resolver))
}

async fn run_proxy(config_path: &str, overrides: Overrides) -> Result<(), ProxyError> {
    let settings =
        try_load_config(config_path)?.unwrap_or_default().with_overrides(overrides).finalize()?;

    let client = build_client(&settings)?;
    let director = Arc::new(build_director(&settings, &client)?);
    let state = Arc::new(ProxyState { director: director.clone(), client });

    let mut manager = ShutdownManager::new();

    let app = forwarder::router(state, settings.max_body_bytes);
    let addr = parse_addr(&settings.bind_addr)?;
    let server = Server::try_bind(&addr)
        .map_err(|e| ProxyError::BindError(format!("{}: {}", addr, e)))?
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(manager.signal());
    manager.spawn_listener("proxy", server);
    info!(bind_addr = %addr, cache = %settings.cache_path, "Starting sticky proxy");

    if let Some(metrics_addr) = &settings.metrics_addr {
        let addr = parse_addr(metrics_addr)?;
        let server = Server::try_bind(&addr)
            .map_err(|e| ProxyError::BindError(format!("{}: {}", addr, e)))?
            .serve(admin::router(director).into_make_service())
            .with_graceful_shutdown(manager.signal());
        manager.spawn_listener("admin", server);
        info!(metrics_addr = %addr, "Endpoints: /metrics /health /status /assignments");
    }

    run_until_shutdown(manager).await
}

async fn run_httpserv(args: HttpservArgs, metrics_port: Option<u16>) -> Result<(), ProxyError> {
    let name = args.name.unwrap_or_else(httpserv::hostname);
    let mut manager = ShutdownManager::new();

    let addr = parse_addr(&any_addr(args.port))?;
    let server = Server::try_bind(&addr)
        .map_err(|e| ProxyError::BindError(format!("{}: {}", addr, e)))?
        .serve(httpserv::router(Greeting::new(&name, args.port)).into_make_service())
        .with_graceful_shutdown(manager.signal());
    manager.spawn_listener("httpserv", server);
    info!(port = args.port, name = %name, "HTTP server is listening");

    if let Some(port) = metrics_port {
        let addr = parse_addr(&any_addr(port))?;
        let server = Server::try_bind(&addr)
            .map_err(|e| ProxyError::BindError(format!("{}: {}", addr, e)))?
            .serve(admin::metrics_router().into_make_service())
            .with_graceful_shutdown(manager.signal());
        manager.spawn_listener("metrics", server);
        info!(port = port, "Metrics HTTP server is listening");
    }

    run_until_shutdown(manager).await
}

/// Serves until a shutdown signal arrives or a listener dies, then drains.
async fn run_until_shutdown(mut manager: ShutdownManager) -> Result<(), ProxyError> {
    let early_exit = tokio::select! {
        _ = shutdown_signal() => None,
        exited = manager.next_exit() => Some(exited),
    };

    let failure = match early_exit {
        None => None,
        Some(Ok(name)) => {
            error!(listener = name, "Listener exited unexpectedly");
            Some(ProxyError::ServerError(format!("listener '{}' exited", name)))
        }
        Some(Err(e)) => {
            error!(error = %e, "Listener failed");
            Some(e.into())
        }
    };

    if let Err(e) = manager.graceful_shutdown(SHUTDOWN_TIMEOUT).await {
        error!("Graceful shutdown failed: {}", e);
    }

    info!("Shutdown complete.");
    failure.map_or(Ok(()), Err)
}

/// Completes on `Ctrl+C` or `SIGTERM`.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Ctrl+C received. Starting graceful shutdown."),
        _ = terminate => info!("SIGTERM received. Starting graceful shutdown."),
    }
}

#[tokio::main]
async fn main() -> Result<(), ProxyError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    match cli.command {
        Command::Proxy(args) => {
            let overrides = Overrides {
                upstreams: Some(args.upstreams),
                ttl_secs: args.ttl,
                cache_path: args.cache,
                bind_addr: args.port.map(any_addr),
                metrics_addr: cli.metrics_port.map(any_addr),
                region_url: args.region_url,
            };
            run_proxy(&cli.config, overrides).await
        }
        Command::Httpserv(args) => run_httpserv(args, cli.metrics_port).await,
    }
}
