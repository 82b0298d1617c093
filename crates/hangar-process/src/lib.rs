//! Process launch and sandboxing for provider child processes (spec §4.B).
//!
//! A provider in `subprocess` or `container` mode is launched here and
//! handed off, with piped stdin/stdout, to the Transport Client that owns
//! the newline-delimited JSON-RPC framing for its lifetime. This crate only
//! covers getting the child running under the right isolation; it knows
//! nothing about the wire protocol spoken over its pipes.

pub mod command;
pub mod container;
pub mod stderr_ring;

use anyhow::{Context, Result};
use std::collections::HashMap;
use tokio::process::Command;
use tracing::debug;

use hangar_resource::cgroup::SandboxConfig;
use hangar_resource::rlimit::RssWatcher;
use hangar_resource::sandbox::{SandboxCapability, detect_sandbox_capability};

pub use command::{CommandValidationError, validate_command};
pub use container::{ContainerValidationError, build_container_command};
pub use stderr_ring::StderrRing;

/// Holds sandbox resources that must live as long as the child process.
///
/// # Signal semantics
///
/// - **`Cgroup`**: The child runs inside a systemd transient scope. On drop,
///   [`CgroupScopeGuard`] calls `systemctl --user stop <scope>`, sending
///   `SIGTERM` to every process in the scope.
/// - **`Rlimit`**: `setrlimit` was applied in the child's `pre_exec`. The
///   optional [`RssWatcher`] monitors RSS from the parent and sends
///   `SIGTERM` to the child's process group if RSS exceeds the threshold.
/// - **`None`**: No sandbox active (e.g. container mode, where the
///   container runtime itself is the isolation boundary).
///
/// [`CgroupScopeGuard`]: hangar_resource::cgroup::CgroupScopeGuard
/// [`RssWatcher`]: hangar_resource::rlimit::RssWatcher
pub enum SandboxHandle {
    Cgroup(hangar_resource::cgroup::CgroupScopeGuard),
    Rlimit { watcher: Option<RssWatcher> },
    None,
}

#[derive(Debug, Clone, Copy)]
enum PreExecPolicy {
    SetsidOnly,
    SetsidAndRlimits {
        memory_max_mb: u64,
        pids_max: Option<u64>,
    },
}

/// Spawn a provider subprocess with piped stdin/stdout/stderr, no sandbox.
///
/// - Sets stdin/stdout/stderr to piped so the Transport Client can own them.
/// - Isolates the child in its own process group (`setsid`) so a later kill
///   takes any grandchildren with it.
/// - Enables `kill_on_drop` as a safety net against orphaned children if the
///   supervisor task is aborted.
pub async fn spawn_provider(cmd: Command) -> Result<tokio::process::Child> {
    spawn_provider_with_pre_exec(cmd, PreExecPolicy::SetsidOnly).await
}

async fn spawn_provider_with_pre_exec(
    mut cmd: Command,
    pre_exec_policy: PreExecPolicy,
) -> Result<tokio::process::Child> {
    cmd.stdin(std::process::Stdio::piped());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.kill_on_drop(true);

    // SAFETY: setsid() and setrlimit are async-signal-safe and run before exec.
    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(move || {
            libc::setsid();
            match pre_exec_policy {
                PreExecPolicy::SetsidOnly => Ok(()),
                PreExecPolicy::SetsidAndRlimits {
                    memory_max_mb,
                    pids_max,
                } => hangar_resource::rlimit::apply_rlimits(memory_max_mb, pids_max)
                    .map_err(std::io::Error::other),
            }
        });
    }
    #[cfg(not(unix))]
    let _ = pre_exec_policy;

    cmd.spawn().context("failed to spawn provider process")
}

/// Spawn a provider subprocess under the host's detected sandbox capability.
///
/// - **CgroupV2**: the command is rebuilt as a child of `systemd-run --user
///   --scope` with `MemoryMax`/`MemorySwapMax`/`TasksMax` applied.
/// - **Setrlimit**: `RLIMIT_AS`/`RLIMIT_NPROC` are applied in `pre_exec`; an
///   [`RssWatcher`] polls RSS from the parent afterwards.
/// - **None**: falls through to [`spawn_provider`] with no isolation.
pub async fn spawn_provider_sandboxed(
    cmd: Command,
    sandbox: Option<&SandboxConfig>,
    provider_id: &str,
    generation: &str,
) -> Result<(tokio::process::Child, SandboxHandle)> {
    let Some(config) = sandbox else {
        let child = spawn_provider(cmd).await?;
        return Ok((child, SandboxHandle::None));
    };

    match detect_sandbox_capability() {
        SandboxCapability::CgroupV2 => {
            spawn_with_cgroup(cmd, config, provider_id, generation).await
        }
        SandboxCapability::Setrlimit => spawn_with_rlimit(cmd, config).await,
        SandboxCapability::None => {
            debug!("no sandbox capability detected; spawning provider without isolation");
            let child = spawn_provider(cmd).await?;
            Ok((child, SandboxHandle::None))
        }
    }
}

async fn spawn_with_cgroup(
    original_cmd: Command,
    config: &SandboxConfig,
    provider_id: &str,
    generation: &str,
) -> Result<(tokio::process::Child, SandboxHandle)> {
    let scope_cmd = hangar_resource::cgroup::create_scope_command(provider_id, generation, config);

    let mut tokio_cmd = Command::from(scope_cmd);
    tokio_cmd.arg(original_cmd.as_std().get_program());
    tokio_cmd.args(original_cmd.as_std().get_args());

    let envs: Vec<_> = original_cmd
        .as_std()
        .get_envs()
        .filter_map(|(k, v)| v.map(|val| (k.to_owned(), val.to_owned())))
        .collect();
    for (key, val) in &envs {
        tokio_cmd.env(key, val);
    }
    if let Some(dir) = original_cmd.as_std().get_current_dir() {
        tokio_cmd.current_dir(dir);
    }

    let child = spawn_provider_with_pre_exec(tokio_cmd, PreExecPolicy::SetsidOnly).await?;
    let guard = hangar_resource::cgroup::CgroupScopeGuard::new(provider_id, generation);

    debug!(
        scope = %guard.scope_name(),
        pid = child.id(),
        "spawned provider inside cgroup scope"
    );

    Ok((child, SandboxHandle::Cgroup(guard)))
}

async fn spawn_with_rlimit(
    cmd: Command,
    config: &SandboxConfig,
) -> Result<(tokio::process::Child, SandboxHandle)> {
    let memory_max_mb = config.memory_max_mb;
    let pids_max = config.pids_max.map(u64::from);

    let child = spawn_provider_with_pre_exec(
        cmd,
        PreExecPolicy::SetsidAndRlimits {
            memory_max_mb,
            pids_max,
        },
    )
    .await?;

    let watcher = child.id().and_then(|pid| {
        debug!(pid, memory_max_mb, "starting RSS watcher for sandboxed provider");
        match RssWatcher::start(pid, memory_max_mb, std::time::Duration::from_secs(5)) {
            Ok(w) => Some(w),
            Err(e) => {
                tracing::warn!("failed to start RSS watcher: {e:#}");
                None
            }
        }
    });

    Ok((child, SandboxHandle::Rlimit { watcher }))
}

/// Build a ready-to-spawn [`Command`] for a validated subprocess provider.
///
/// `env` should already be the result of [`hangar_config::env::filter_child_env`]
/// so secrets from the ambient environment never leak into the child beyond
/// what the operator explicitly configured.
pub fn build_subprocess_command(
    program: &str,
    args: &[String],
    env: &HashMap<String, String>,
) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd.env_clear();
    cmd.envs(env);
    cmd
}
