use anyhow::Context;
use mcp_fleet::config::{CatalogDiff, Config, ServerSpec, SpecKey, validate_config};
use mcp_fleet::scheduler::{Scheduler, SchedulerOptions};
use mcp_fleet::server::{ProcessLifecycle, RpcProbe};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Upper bound on stopping the pools a reload removes.
const RELOAD_TIMEOUT: Duration = Duration::from_secs(30);

fn init_tracing() -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = fmt::layer().with_target(true).with_writer(std::io::stderr);

    match std::env::var_os("MCPD_LOG_DIR") {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "mcpd.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .init();
            None
        }
    }
}

fn config_path() -> PathBuf {
    std::env::args_os()
        .nth(1)
        .or_else(|| std::env::var_os("MCPD_CONFIG"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("mcpd.yaml"))
}

fn load_registry(path: &Path) -> anyhow::Result<(Config, HashMap<SpecKey, ServerSpec>)> {
    let config = Config::from_file(path)
        .with_context(|| format!("loading catalog {}", path.display()))?;
    validate_config(&config.mcp_servers)
        .with_context(|| format!("validating catalog {}", path.display()))?;
    let registry = config.registry();
    Ok((config, registry))
}

async fn warm_up(scheduler: &Scheduler, registry: &HashMap<SpecKey, ServerSpec>) {
    for (key, spec) in registry {
        if spec.min_ready == 0 {
            continue;
        }
        if let Err(e) = scheduler.set_desired_min_ready(key, spec.min_ready).await {
            warn!(server = %spec.name, error = %e, "Warm-up incomplete");
        }
    }
}

async fn reload(
    scheduler: &Scheduler,
    path: &Path,
    current: &mut HashMap<SpecKey, ServerSpec>,
) -> anyhow::Result<()> {
    let (_, registry) = load_registry(path)?;
    let diff = CatalogDiff::between(current, &registry);
    if diff.is_empty() {
        info!("Catalog unchanged");
        return Ok(());
    }
    info!(
        added = diff.added_spec_keys.len(),
        removed = diff.removed_spec_keys.len(),
        updated = diff.updated_spec_keys.len(),
        replaced = diff.replaced_spec_keys.len(),
        "Applying catalog change"
    );

    let cancel = CancellationToken::new();
    let timer = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(RELOAD_TIMEOUT).await;
            cancel.cancel();
        })
    };
    let applied = scheduler
        .apply_catalog_diff(&cancel, &diff, registry.clone())
        .await;
    timer.abort();

    let added: HashMap<SpecKey, ServerSpec> = diff
        .added_spec_keys
        .iter()
        .filter_map(|key| Some((key.clone(), registry.get(key)?.clone())))
        .collect();
    *current = registry;
    warm_up(scheduler, &added).await;
    applied.context("applying catalog change")
}

#[cfg(unix)]
async fn hangup(signal: &mut Option<tokio::signal::unix::Signal>) {
    match signal {
        Some(signal) => {
            signal.recv().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing();

    let path = config_path();
    let (config, mut registry) = load_registry(&path)?;
    info!(
        path = %path.display(),
        servers = config.mcp_servers.len(),
        specs = registry.len(),
        "Catalog loaded"
    );

    let runtime = &config.runtime;
    let lifecycle = Arc::new(ProcessLifecycle::new(
        runtime.start_timeout(),
        runtime.stop_timeout(),
    ));
    let options = SchedulerOptions::from_runtime(runtime).with_probe(Arc::new(RpcProbe));
    let scheduler = Scheduler::new(lifecycle, registry.clone(), options);

    scheduler.start_idle_manager(runtime.idle_check_interval());
    scheduler.start_ping_manager(runtime.ping_interval());
    warm_up(&scheduler, &registry).await;
    info!("mcpd running, send SIGHUP to reload, Ctrl+C to exit");

    #[cfg(unix)]
    let mut hup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        .map_err(|e| warn!(error = %e, "SIGHUP reload unavailable"))
        .ok();

    loop {
        #[cfg(unix)]
        let reload_requested = hangup(&mut hup);
        #[cfg(not(unix))]
        let reload_requested = std::future::pending::<()>();

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("waiting for Ctrl+C")?;
                break;
            }
            _ = reload_requested => {
                info!(path = %path.display(), "Reloading catalog");
                if let Err(e) = reload(&scheduler, &path, &mut registry).await {
                    error!("Reload failed: {:#}", e);
                }
            }
        }
    }

    info!("Shutting down");
    scheduler.stop_all().await;
    Ok(())
}
