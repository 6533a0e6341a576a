use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::{self, RoutesConfig};
use crate::registry::RouteRegistry;

pub const DEFAULT_ROUTES_FILE: &str = "routes.json";

/// Keeps the filesystem watcher alive for the life of the process;
/// dropping it stops hot reload.
pub struct RoutesWatcher {
    _watcher: Option<RecommendedWatcher>,
}

/// Loads the routing table (`ROUTES` env var first, then the routes file,
/// then the built-in default), validates it, publishes it into the
/// registry, and — in file mode — starts watching the file for changes.
///
/// A malformed `ROUTES` payload, an unreadable file, or a table that fails
/// validation is fatal: the listener must not start without a good table.
pub fn init_routes(registry: Arc<RouteRegistry>, file: &Path) -> Result<RoutesWatcher> {
    let mut from_env = false;
    let cfg = match config::load_routes_from_env()? {
        Some(cfg) => {
            from_env = true;
            info!("[ROUTES env] loaded successfully ({} routes)", cfg.routes.len());
            cfg
        }
        None => match std::fs::read_to_string(file) {
            Ok(text) => {
                let cfg = RoutesConfig::from_json(&text)
                    .with_context(|| format!("failed to load routes config from {}", file.display()))?;
                info!("[{}] loaded successfully ({} routes)", file.display(), cfg.routes.len());
                cfg
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                warn!("[{}] not found, loading default config", file.display());
                RoutesConfig::builtin_default()
            }
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", file.display()));
            }
        },
    };

    cfg.validate().context("route validation failed")?;
    registry.publish(cfg);

    if from_env {
        info!("[routes] using ROUTES env var, file watching disabled");
        return Ok(RoutesWatcher { _watcher: None });
    }

    Ok(RoutesWatcher {
        _watcher: watch_routes_file(registry, file)?,
    })
}

fn watch_routes_file(
    registry: Arc<RouteRegistry>,
    file: &Path,
) -> Result<Option<RecommendedWatcher>> {
    let (tx, rx) = mpsc::channel::<Event>(100);

    let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
        match res {
            Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                let _ = tx.blocking_send(event);
            }
            Ok(_) => {}
            Err(err) => warn!("routes watcher error: {err}"),
        }
    })
    .context("failed to create routes file watcher")?;

    if let Err(err) = watcher.watch(file, RecursiveMode::NonRecursive) {
        warn!("watcher: file [{}] not found, skip watching: {err}", file.display());
        return Ok(None);
    }

    tokio::spawn(reload_loop(registry, file.to_path_buf(), rx));
    Ok(Some(watcher))
}

async fn reload_loop(registry: Arc<RouteRegistry>, path: PathBuf, mut rx: mpsc::Receiver<Event>) {
    while rx.recv().await.is_some() {
        // Editors fire bursts of events for a single save; settle, then
        // drain whatever coalesced.
        tokio::time::sleep(Duration::from_millis(100)).await;
        while rx.try_recv().is_ok() {}

        match reload(&registry, &path).await {
            Ok(count) => info!("[{}] reloaded successfully ({count} routes)", path.display()),
            Err(err) => error!(
                "[{}] reload failed, keeping previous routes: {err:#}",
                path.display()
            ),
        }
    }
}

async fn reload(registry: &RouteRegistry, path: &Path) -> Result<usize> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let cfg = RoutesConfig::from_json(&text)?;
    cfg.validate()?;
    let count = cfg.routes.len();
    registry.publish(cfg);
    Ok(count)
}
