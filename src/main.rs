use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use smooth_proxy::config::{AuthConfig, RoutesConfig, StreamOptions};
use smooth_proxy::proxy::{ProxyService, router as proxy_router};
use smooth_proxy::registry::RouteRegistry;
use smooth_proxy::watcher;

#[derive(Parser, Debug)]
#[command(name = "smooth-proxy")]
#[command(about = "Reverse proxy for streaming upstreams with adaptive pacing", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the proxy server (default command)
    Serve {
        /// Listen address
        #[arg(long, default_value = "0.0.0.0")]
        host: IpAddr,
        /// Listen port
        #[arg(long, default_value_t = 8080)]
        port: u16,
        /// Routes file to load and watch for changes
        #[arg(long, default_value = watcher::DEFAULT_ROUTES_FILE)]
        routes_file: PathBuf,
    },
    /// Validate a routes file and exit
    Check {
        /// Routes file to validate
        #[arg(default_value = watcher::DEFAULT_ROUTES_FILE)]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    if let Err(err) = real_main().await {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}

async fn real_main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve {
        host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        port: 8080,
        routes_file: PathBuf::from(watcher::DEFAULT_ROUTES_FILE),
    }) {
        Command::Serve {
            host,
            port,
            routes_file,
        } => run_server(host, port, &routes_file).await,
        Command::Check { file } => run_check(&file),
    }
}

fn init_tracing() {
    // Default to info logs unless the user sets RUST_LOG.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

async fn run_server(host: IpAddr, port: u16, routes_file: &Path) -> anyhow::Result<()> {
    // Fail fast on bad auth settings before any socket is bound; the auth
    // middleware in front of the relay consumes these.
    let auth = AuthConfig::from_env().context("failed to load auth config")?;
    if !auth.ip_nets.is_empty() {
        info!("ip whitelist active ({} networks)", auth.ip_nets.len());
    }
    if !auth.token_header.is_empty() && !auth.token_key.is_empty() {
        info!("token auth configured (header '{}')", auth.token_header);
    }

    let registry = Arc::new(RouteRegistry::new());
    let _watcher = watcher::init_routes(registry.clone(), routes_file)
        .context("failed to initialize routes")?;

    let stream_opts = StreamOptions::from_env();
    info!(
        "stream smoothing {}, heartbeat {}",
        if stream_opts.smoothing { "enabled" } else { "disabled" },
        if stream_opts.heartbeat { "enabled" } else { "disabled" },
    );

    let proxy = ProxyService::new(registry, stream_opts)?;
    let app = proxy_router(proxy);

    let addr = SocketAddr::from((host, port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("smooth-proxy listening on http://{addr}");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(wait_for_shutdown_signal())
        .await?;

    Ok(())
}

fn run_check(file: &Path) -> anyhow::Result<()> {
    let cfg = RoutesConfig::load(file)?;
    cfg.validate()?;
    println!("{}: OK ({} routes)", file.display(), cfg.routes.len());
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
        ) {
            (Ok(mut sigint), Ok(mut sigterm)) => {
                tokio::select! {
                    _ = sigint.recv() => {},
                    _ = sigterm.recv() => {},
                }
            }
            _ => {
                // Fallback: at least handle Ctrl+C.
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
