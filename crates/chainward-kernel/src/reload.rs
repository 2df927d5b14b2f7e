//! Polling reload of the routes seed file and the definitions directory.
//!
//! Each poller fingerprints its source (path, size, mtime) and acts only when
//! the fingerprint changes. A failed reload is logged and the running
//! configuration stays as it is; the next change is tried again.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use chainward_core::error::{EngineError, Result};

use crate::app_state::AppState;
use crate::config;
use crate::registry::load_registry;

/// Change marker for a file or a directory of descriptors.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Fingerprint(Vec<(PathBuf, u64, Option<SystemTime>)>);

impl Fingerprint {
    pub fn of_file(path: &Path) -> Result<Self> {
        let meta = fs::metadata(path)
            .map_err(|e| EngineError::InvalidConfig(format!("stat {} failed: {e}", path.display())))?;
        Ok(Self(vec![(path.to_path_buf(), meta.len(), meta.modified().ok())]))
    }

    /// Every `*.yaml` / `*.yml` entry of `dir`, sorted by path.
    pub fn of_dir(dir: &Path) -> Result<Self> {
        let entries = fs::read_dir(dir)
            .map_err(|e| EngineError::InvalidConfig(format!("read {} failed: {e}", dir.display())))?;
        let mut out = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !matches!(path.extension().and_then(|x| x.to_str()), Some("yaml" | "yml")) {
                continue;
            }
            if let Ok(meta) = entry.metadata() {
                out.push((path, meta.len(), meta.modified().ok()));
            }
        }
        out.sort();
        Ok(Self(out))
    }
}

fn spawn_poller<F, A>(
    every: Duration,
    cancel: CancellationToken,
    what: &'static str,
    fingerprint: F,
    mut apply: A,
) -> JoinHandle<()>
where
    F: Fn() -> Result<Fingerprint> + Send + 'static,
    A: FnMut() -> Result<()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut last = fingerprint().ok();
        let mut tick = tokio::time::interval(every);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    let current = match fingerprint() {
                        Ok(f) => f,
                        Err(e) => {
                            tracing::warn!(what, error = %e, "reload source unavailable");
                            continue;
                        }
                    };
                    if last.as_ref() == Some(&current) {
                        continue;
                    }
                    last = Some(current);
                    match apply() {
                        Ok(()) => tracing::info!(what, "reloaded"),
                        Err(e) => tracing::warn!(
                            what,
                            code = e.code().as_str(),
                            error = %e,
                            "reload rejected; keeping current configuration"
                        ),
                    }
                }
            }
        }
    })
}

/// Republish the routes seed file whenever it changes.
pub fn spawn_routes_reload(
    app: AppState,
    path: PathBuf,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let probe = path.clone();
    spawn_poller(
        every,
        cancel,
        "routes",
        move || Fingerprint::of_file(&probe),
        move || reload_routes(&app, &path).map(|_| ()),
    )
}

/// Rebuild the registry whenever the definitions directory changes.
pub fn spawn_definitions_reload(
    app: AppState,
    dir: PathBuf,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let probe = dir.clone();
    spawn_poller(
        every,
        cancel,
        "definitions",
        move || Fingerprint::of_dir(&probe),
        move || reload_definitions(&app, &dir),
    )
}

/// Load and publish the routes file once. Returns the snapshot version.
pub fn reload_routes(app: &AppState, path: &Path) -> Result<u64> {
    let routes = config::load_routes_file(path)?;
    app.publish_routes(routes.routes)
}

/// Rebuild the registry from built-ins plus `dir` and swap it into the kernel.
pub fn reload_definitions(app: &AppState, dir: &Path) -> Result<()> {
    let registry = load_registry(Some(dir))?;
    app.kernel().reload_registry(registry)
}
