//! `hangar serve`: builds the Registry, spawns the Background Supervisors,
//! and runs the control-socket accept loop until a shutdown signal arrives
//! (spec §6, SPEC_FULL.md §4.H).

use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use hangar_config::HangarConfig;
use hangar_core::batch::BatchExecutor;
use hangar_core::events::EventBus;
use hangar_core::registry::Registry;
use hangar_core::rpc::{self, RpcContext};
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// How long a graceful shutdown waits for in-flight control-socket
/// connections (and therefore in-flight batch calls) to drain before the
/// process exits anyway (spec §6).
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

pub struct ServeOptions {
    pub config_path: PathBuf,
    pub socket_path: PathBuf,
}

/// Run the daemon in the foreground; returns once a graceful shutdown
/// completes (SIGTERM/SIGINT) or an unrecoverable startup error occurs.
pub async fn run_foreground(opts: ServeOptions) -> Result<()> {
    let config = hangar_config::load_path(&opts.config_path)
        .with_context(|| format!("failed to load config from {}", opts.config_path.display()))?;
    let errors = hangar_config::validate::validate_config(&config);
    if !errors.is_empty() {
        anyhow::bail!(
            "config at {} failed validation: {}",
            opts.config_path.display(),
            errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
        );
    }

    let events = EventBus::new();
    let registry = Arc::new(Registry::new(&config, events.clone()));
    let batch = Arc::new(BatchExecutor::new(registry.clone(), config.batch, config.truncation));
    let ctx = Arc::new(RpcContext {
        registry: registry.clone(),
        batch,
        events: events.clone(),
        config_path: opts.config_path.clone(),
    });

    let shutdown = CancellationToken::new();
    let inflight = Arc::new(AtomicUsize::new(0));

    let gc_task = tokio::spawn(hangar_core::background::run_idle_gc(registry.clone(), Duration::from_secs(30)));
    let health_task = tokio::spawn(hangar_core::background::run_health_prober(registry.clone()));
    let reload_task = if config.config_reload.enabled {
        let reload_config = config.config_reload.clone();
        Some(tokio::spawn(hangar_core::background::run_hot_reload_worker(
            registry.clone(),
            events.clone(),
            opts.config_path.clone(),
            Duration::from_secs(reload_config.interval_s),
        )))
    } else {
        None
    };

    let serve_shutdown = shutdown.clone();
    let serve_ctx = ctx.clone();
    let serve_inflight = inflight.clone();
    let socket_path = opts.socket_path.clone();
    let serve_task = tokio::spawn(async move {
        rpc::serve(serve_ctx, &socket_path, serve_shutdown, serve_inflight).await
    });

    info!(socket = %opts.socket_path.display(), config = %opts.config_path.display(), "hangar daemon listening");

    wait_for_signals(ctx.clone(), shutdown.clone()).await;

    info!("shutdown signal received, draining in-flight control-socket connections");
    wait_for_drain(&inflight, SHUTDOWN_GRACE).await;

    gc_task.abort();
    health_task.abort();
    if let Some(task) = reload_task {
        task.abort();
    }

    match serve_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "control socket accept loop exited with an error"),
        Err(e) => warn!(error = %e, "control socket task panicked"),
    }

    Ok(())
}

/// Listens for SIGHUP (hot reload), SIGTERM, and SIGINT (graceful
/// shutdown) and returns once a shutdown signal triggers `shutdown`.
async fn wait_for_signals(ctx: Arc<RpcContext>, shutdown: CancellationToken) {
    let mut sighup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to install SIGHUP handler");
            return;
        }
    };
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to install SIGTERM handler");
            return;
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to install SIGINT handler");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = sighup.recv() => {
                info!("SIGHUP received, triggering hot reload");
                match rpc::dispatch(&ctx, "reload_config", serde_json::json!({})).await {
                    Ok(outcome) => info!(?outcome, "hot reload completed"),
                    Err(e) => error!(error = %e, "hot reload failed"),
                }
            }
            _ = sigterm.recv() => {
                shutdown.cancel();
                return;
            }
            _ = sigint.recv() => {
                shutdown.cancel();
                return;
            }
        }
    }
}

async fn wait_for_drain(inflight: &AtomicUsize, grace: Duration) {
    let deadline = tokio::time::Instant::now() + grace;
    while inflight.load(Ordering::SeqCst) > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let remaining = inflight.load(Ordering::SeqCst);
    if remaining > 0 {
        warn!(remaining, "grace period elapsed with connections still in flight, shutting down anyway");
    }
}

/// Fork into the background (self re-exec with `--foreground`, teacher's
/// `spawn_background` pattern), detach from the controlling terminal via
/// `setsid`, and write a pid file next to the socket.
pub fn spawn_background(socket_path: &Path, config_path: &Path) -> Result<u32> {
    let exe = std::env::current_exe().context("failed to resolve current executable path")?;
    let mut command = std::process::Command::new(exe);
    command
        .arg("serve")
        .arg("--foreground")
        .arg("--socket")
        .arg(socket_path)
        .arg("--config")
        .arg(config_path)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());

    // SAFETY: `setsid` is called in the child after fork (pre_exec runs in
    // the forked child before exec), detaching it from the parent's
    // session so it survives the parent's exit.
    unsafe {
        command.pre_exec(|| {
            if unsafe { libc::setsid() } == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = command.spawn().context("failed to spawn background daemon")?;
    let pid = child.id();

    let pid_path = hangar_config::pid_path_for_socket(socket_path);
    if let Some(parent) = pid_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&pid_path, pid.to_string())
        .with_context(|| format!("failed to write pid file at {}", pid_path.display()))?;

    // Detach: the std::process::Child would otherwise kill its child on
    // drop if `kill_on_drop` were set (it isn't by default for std), but
    // we still must not block on it.
    std::mem::forget(child);

    Ok(pid)
}
