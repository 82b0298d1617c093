//! Provider Supervisor (spec §4.B): one per configured provider. Owns the
//! state machine, launch/shutdown of the transport, health counters,
//! circuit breaker, and idle timestamp. Lifecycle transitions are
//! serialised by `inner`'s lock (the "uncontended fast path" of spec §5);
//! the slow launch itself is deduplicated by a dedicated [`SingleFlight`]
//! so concurrent `ensure_ready()` callers rendezvous on one attempt without
//! holding the lifecycle lock across I/O.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hangar_config::provider::{ProviderMode, ProviderSpec};
use hangar_lock::SingleFlight;
use hangar_process::StderrRing;
use hangar_resource::cgroup::SandboxConfig;
use hangar_transport::{CallOutcome, HttpTransport, StdioTransport, TransportClient};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::diagnostics::{LaunchDiagnostics, diagnose};
use crate::error::{ErrorKind, HangarError};
use crate::events::{DomainEvent, EventBus};

/// Fixed resource envelope applied to every subprocess-mode provider.
/// Container-mode providers are hardened by `hangar_process::container`
/// instead; remote providers have no local process to bound.
const SUBPROCESS_SANDBOX_MEMORY_MAX_MB: u64 = 2048;
const SUBPROCESS_SANDBOX_MEMORY_SWAP_MAX_MB: Option<u64> = Some(0);
const SUBPROCESS_SANDBOX_PIDS_MAX: Option<u32> = None;

const INITIAL_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);
const STDERR_RING_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProviderState {
    Cold,
    Initializing,
    Ready,
    Degraded,
    Dead,
}

impl ProviderState {
    fn label(self) -> &'static str {
        match self {
            ProviderState::Cold => "COLD",
            ProviderState::Initializing => "INITIALIZING",
            ProviderState::Ready => "READY",
            ProviderState::Degraded => "DEGRADED",
            ProviderState::Dead => "DEAD",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolSchema {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
}

/// Read-only snapshot for `details()` queries (spec §4.B).
#[derive(Debug, Clone, Serialize)]
pub struct ProviderDetails {
    pub provider_id: String,
    pub state: ProviderState,
    pub is_alive: bool,
    pub tools_count: usize,
    pub tools: Vec<ToolSchema>,
}

/// Read-only snapshot for `health()` queries (spec §4.B).
#[derive(Debug, Clone, Serialize)]
pub struct HealthInfo {
    pub provider_id: String,
    pub state: ProviderState,
    pub consecutive_failures: u32,
    pub total_invocations: u64,
    pub total_failures: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success_at_unix_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_at_unix_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff_remaining_secs: Option<u64>,
}

struct Inner {
    state: ProviderState,
    transport: Option<Arc<dyn TransportClient>>,
    child: Option<tokio::process::Child>,
    stderr_ring: Option<Arc<StderrRing>>,
    tools: HashMap<String, ToolSchema>,
    consecutive_failures: u32,
    total_invocations: u64,
    total_failures: u64,
    last_success_at: Option<Instant>,
    last_failure_at: Option<Instant>,
    last_used: Instant,
    last_health_check: Instant,
    backoff_until: Option<Instant>,
}

impl Inner {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            state: ProviderState::Cold,
            transport: None,
            child: None,
            stderr_ring: None,
            tools: HashMap::new(),
            consecutive_failures: 0,
            total_invocations: 0,
            total_failures: 0,
            last_success_at: None,
            last_failure_at: None,
            last_used: now,
            last_health_check: now,
            backoff_until: None,
        }
    }

    fn transition(&mut self, to: ProviderState, provider_id: &str, events: &EventBus) {
        if self.state == to {
            return;
        }
        events.emit(DomainEvent::ProviderStateChanged {
            provider_id: provider_id.to_string(),
            from: self.state.label(),
            to: to.label(),
        });
        self.state = to;
    }

    /// Drop the transport and child handle, moving to COLD. Invariant:
    /// state is COLD iff no transport handle exists.
    async fn close_transport(&mut self) {
        if let Some(transport) = self.transport.take() {
            transport.close().await;
        }
        self.child = None;
        self.stderr_ring = None;
    }
}

pub struct ProviderSupervisor {
    provider_id: String,
    spec: ProviderSpec,
    events: EventBus,
    inner: tokio::sync::Mutex<Inner>,
    launch_single_flight: SingleFlight<(), (), HangarError>,
    generation: std::sync::atomic::AtomicU64,
}

impl ProviderSupervisor {
    pub fn new(spec: ProviderSpec, events: EventBus) -> Self {
        Self {
            provider_id: spec.id.clone(),
            spec,
            events,
            inner: tokio::sync::Mutex::new(Inner::new()),
            launch_single_flight: SingleFlight::new(),
            generation: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.provider_id
    }

    pub fn spec(&self) -> &ProviderSpec {
        &self.spec
    }

    pub async fn state(&self) -> ProviderState {
        self.inner.lock().await.state
    }

    /// Advance to READY if possible, blocking the caller. Safe to call
    /// concurrently: only one actual launch occurs (spec §4.B).
    pub async fn ensure_ready(&self) -> Result<(), HangarError> {
        {
            let inner = self.inner.lock().await;
            if inner.state == ProviderState::Ready {
                return Ok(());
            }
        }
        self.launch_single_flight
            .run((), || self.ensure_ready_once())
            .await
    }

    async fn ensure_ready_once(&self) -> Result<(), HangarError> {
        {
            let mut inner = self.inner.lock().await;
            match inner.state {
                ProviderState::Ready => return Ok(()),
                ProviderState::Degraded => {
                    let eligible = inner
                        .backoff_until
                        .is_none_or(|until| Instant::now() >= until);
                    if !eligible {
                        let remaining = inner
                            .backoff_until
                            .map(|u| u.saturating_duration_since(Instant::now()))
                            .unwrap_or_default();
                        return Err(HangarError::new(
                            ErrorKind::CircuitOpen,
                            format!("provider in backoff for {:.1}s more", remaining.as_secs_f64()),
                        )
                        .with_provider(self.provider_id.clone()));
                    }
                    inner.close_transport().await;
                    inner.transition(ProviderState::Cold, &self.provider_id, &self.events);
                }
                ProviderState::Dead => {
                    inner.close_transport().await;
                    inner.transition(ProviderState::Cold, &self.provider_id, &self.events);
                }
                ProviderState::Cold => {}
                ProviderState::Initializing => {
                    // Single-flight already excludes concurrent bodies; an
                    // INITIALIZING sighting here means a previous attempt
                    // crashed without resetting state. Treat as COLD.
                }
            }
            inner.transition(ProviderState::Initializing, &self.provider_id, &self.events);
        }

        self.events.emit(DomainEvent::ColdStart {
            provider_id: self.provider_id.clone(),
        });

        match self.launch_and_handshake().await {
            Ok((transport, child, stderr_ring, tools)) => {
                let mut inner = self.inner.lock().await;
                inner.transport = Some(transport);
                inner.child = child;
                inner.stderr_ring = stderr_ring;
                for tool in tools {
                    inner.tools.insert(tool.name.clone(), tool);
                }
                inner.consecutive_failures = 0;
                inner.last_health_check = Instant::now();
                inner.transition(ProviderState::Ready, &self.provider_id, &self.events);
                info!(provider_id = %self.provider_id, "provider READY");
                Ok(())
            }
            Err(e) => {
                let mut inner = self.inner.lock().await;
                inner.close_transport().await;
                inner.transition(ProviderState::Dead, &self.provider_id, &self.events);
                warn!(provider_id = %self.provider_id, error = %e, "provider launch failed");
                Err(e)
            }
        }
    }

    async fn launch_and_handshake(
        &self,
    ) -> Result<
        (
            Arc<dyn TransportClient>,
            Option<tokio::process::Child>,
            Option<Arc<StderrRing>>,
            Vec<ToolSchema>,
        ),
        HangarError,
    > {
        let (transport, child, stderr_ring) = self.launch().await?;

        transport
            .call("initialize", json!({}), INITIAL_HANDSHAKE_TIMEOUT)
            .await
            .map_err(HangarError::from)?;

        let discovered = match transport
            .call("tools/list", json!({}), INITIAL_HANDSHAKE_TIMEOUT)
            .await
            .map_err(HangarError::from)?
        {
            CallOutcome::Result(value) => parse_tools_list(&value),
            CallOutcome::Error(e) => {
                return Err(HangarError::new(
                    ErrorKind::LaunchFailed,
                    format!("initial tools/list failed: {}", e.message),
                )
                .with_provider(self.provider_id.clone()));
            }
        };

        // Predefined tools are authoritative; discovery only adds entries
        // it doesn't already know about (Open Question #3 in SPEC_FULL.md).
        let mut tools: HashMap<String, ToolSchema> = self
            .spec
            .predefined_tools
            .iter()
            .map(|name| {
                (
                    name.clone(),
                    ToolSchema {
                        name: name.clone(),
                        input_schema: None,
                    },
                )
            })
            .collect();
        for tool in discovered {
            tools.entry(tool.name.clone()).or_insert(tool);
        }

        Ok((transport, child, stderr_ring, tools.into_values().collect()))
    }

    async fn launch(
        &self,
    ) -> Result<
        (
            Arc<dyn TransportClient>,
            Option<tokio::process::Child>,
            Option<Arc<StderrRing>>,
        ),
        HangarError,
    > {
        match &self.spec.mode {
            ProviderMode::Subprocess(spec) => {
                hangar_process::validate_command(
                    &spec.command,
                    &spec.args,
                    &spec.allow_commands,
                    &spec.deny_commands,
                )
                .map_err(|e| {
                    HangarError::new(ErrorKind::Configuration, e.to_string())
                        .with_provider(self.provider_id.clone())
                })?;

                let env = hangar_config::env::filter_child_env(&spec.env);
                let cmd = hangar_process::build_subprocess_command(&spec.command, &spec.args, &env);
                let generation = self
                    .generation
                    .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
                    .to_string();
                let sandbox = SandboxConfig {
                    memory_max_mb: SUBPROCESS_SANDBOX_MEMORY_MAX_MB,
                    memory_swap_max_mb: SUBPROCESS_SANDBOX_MEMORY_SWAP_MAX_MB,
                    pids_max: SUBPROCESS_SANDBOX_PIDS_MAX,
                };
                let (mut child, _sandbox_handle) = hangar_process::spawn_provider_sandboxed(
                    cmd,
                    Some(&sandbox),
                    &self.provider_id,
                    &generation,
                )
                .await
                .map_err(|e| {
                    HangarError::new(ErrorKind::LaunchFailed, format!("spawn failed: {e:#}"))
                        .with_provider(self.provider_id.clone())
                })?;

                let stdin = child.stdin.take().ok_or_else(|| {
                    HangarError::new(ErrorKind::LaunchFailed, "child has no stdin pipe")
                })?;
                let stdout = child.stdout.take().ok_or_else(|| {
                    HangarError::new(ErrorKind::LaunchFailed, "child has no stdout pipe")
                })?;
                let stderr = child.stderr.take();

                let ring = Arc::new(StderrRing::new(STDERR_RING_CAPACITY));
                if let Some(stderr) = stderr {
                    hangar_process::stderr_ring::spawn_capture(stderr, ring.clone(), None);
                }

                let transport: Arc<dyn TransportClient> = Arc::new(StdioTransport::new(stdin, stdout));
                Ok((transport, Some(child), Some(ring)))
            }
            ProviderMode::Container(spec) => {
                let mut cmd = hangar_process::build_container_command(
                    container_runtime(),
                    spec,
                )
                .map_err(|e| {
                    HangarError::new(ErrorKind::Configuration, e.to_string())
                        .with_provider(self.provider_id.clone())
                })?;
                cmd.stdin(std::process::Stdio::piped());
                cmd.stdout(std::process::Stdio::piped());
                cmd.stderr(std::process::Stdio::piped());
                cmd.kill_on_drop(true);

                let mut child = cmd.spawn().map_err(|e| {
                    HangarError::new(ErrorKind::LaunchFailed, format!("container spawn failed: {e}"))
                        .with_provider(self.provider_id.clone())
                })?;

                let stdin = child.stdin.take().ok_or_else(|| {
                    HangarError::new(ErrorKind::LaunchFailed, "container has no stdin pipe")
                })?;
                let stdout = child.stdout.take().ok_or_else(|| {
                    HangarError::new(ErrorKind::LaunchFailed, "container has no stdout pipe")
                })?;
                let stderr = child.stderr.take();

                let ring = Arc::new(StderrRing::new(STDERR_RING_CAPACITY));
                if let Some(stderr) = stderr {
                    hangar_process::stderr_ring::spawn_capture(stderr, ring.clone(), None);
                }

                let transport: Arc<dyn TransportClient> = Arc::new(StdioTransport::new(stdin, stdout));
                Ok((transport, Some(child), Some(ring)))
            }
            ProviderMode::Remote(spec) => {
                let transport = HttpTransport::new(spec).map_err(|e| {
                    HangarError::new(ErrorKind::LaunchFailed, e.to_string())
                        .with_provider(self.provider_id.clone())
                })?;
                Ok((Arc::new(transport), None, None))
            }
            ProviderMode::Group { group } => Err(HangarError::new(
                ErrorKind::Configuration,
                format!("provider id resolves to group `{group}`; route through the Group Router instead"),
            )
            .with_provider(self.provider_id.clone())),
        }
    }

    /// Invoke a tool. Must be preceded by `ensure_ready()`.
    pub async fn invoke(
        &self,
        tool: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<Value, HangarError> {
        if !self.spec.predefined_tools.is_empty() {
            let known = {
                let inner = self.inner.lock().await;
                inner.tools.contains_key(tool)
            };
            if !known {
                return Err(HangarError::new(
                    ErrorKind::NotFound,
                    format!("tool `{tool}` is not in this provider's schema"),
                )
                .with_provider(self.provider_id.clone()));
            }
        }

        let transport = {
            let mut inner = self.inner.lock().await;
            inner.last_used = Instant::now();
            inner.transport.clone().ok_or_else(|| {
                HangarError::new(ErrorKind::Transport, "provider has no active transport")
                    .with_provider(self.provider_id.clone())
            })?
        };

        let params = json!({"name": tool, "arguments": arguments});
        let outcome = transport.call("tools/call", params, timeout).await;

        match outcome {
            Ok(CallOutcome::Result(value)) => {
                self.record_success().await;
                Ok(value)
            }
            Ok(CallOutcome::Error(err)) => {
                // Provider-domain failure: does not count against health.
                self.record_tool_error().await;
                Err(HangarError::new(ErrorKind::ToolError, err.message)
                    .with_provider(self.provider_id.clone()))
            }
            Err(transport_err) => {
                let hangar_err =
                    HangarError::from(transport_err).with_provider(self.provider_id.clone());
                self.record_failure(hangar_err.kind).await;
                Err(hangar_err)
            }
        }
    }

    async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        inner.consecutive_failures = 0;
        inner.total_invocations += 1;
        inner.last_success_at = Some(Instant::now());
    }

    async fn record_tool_error(&self) {
        let mut inner = self.inner.lock().await;
        inner.total_invocations += 1;
    }

    async fn record_failure(&self, kind: ErrorKind) {
        let mut inner = self.inner.lock().await;
        inner.total_invocations += 1;
        inner.total_failures += 1;
        inner.last_failure_at = Some(Instant::now());
        if kind.counts_against_health() {
            inner.consecutive_failures += 1;
            if inner.consecutive_failures >= self.spec.max_consecutive_failures
                && inner.state == ProviderState::Ready
            {
                let backoff = backoff_for(inner.consecutive_failures, self.spec.max_consecutive_failures, self.spec.backoff_max());
                inner.backoff_until = Some(Instant::now() + backoff);
                inner.transition(ProviderState::Degraded, &self.provider_id, &self.events);
                warn!(
                    provider_id = %self.provider_id,
                    consecutive_failures = inner.consecutive_failures,
                    backoff_secs = backoff.as_secs(),
                    "provider entered DEGRADED"
                );
            }
        }
    }

    /// Active health probe (spec §4.E): `tools/list` with a short timeout.
    pub async fn health_check(&self) -> bool {
        let transport = {
            let inner = self.inner.lock().await;
            if inner.state != ProviderState::Ready {
                return false;
            }
            inner.transport.clone()
        };
        let Some(transport) = transport else { return false };

        match transport
            .call("tools/list", json!({}), HEALTH_CHECK_TIMEOUT)
            .await
        {
            Ok(CallOutcome::Result(value)) => {
                let discovered = parse_tools_list(&value);
                let mut inner = self.inner.lock().await;
                inner.last_health_check = Instant::now();
                for tool in discovered {
                    inner.tools.entry(tool.name.clone()).or_insert(tool);
                }
                self.record_success().await;
                true
            }
            Ok(CallOutcome::Error(_)) => true,
            Err(e) => {
                let hangar_err = HangarError::from(e);
                self.record_failure(hangar_err.kind).await;
                false
            }
        }
    }

    /// Move to COLD, closing the transport and cancelling in-flight calls
    /// (they observe `transport` errors as the reader/writer tear down).
    pub async fn shutdown(&self, reason: &str) {
        let mut inner = self.inner.lock().await;
        if inner.state == ProviderState::Cold {
            return;
        }
        debug!(provider_id = %self.provider_id, reason, "shutting down provider");
        inner.close_transport().await;
        if let Some(mut child) = inner.child.take() {
            let _ = child.start_kill();
        }
        inner.transition(ProviderState::Cold, &self.provider_id, &self.events);
    }

    /// Idle GC: shut down if READY and idle past `idle_ttl`. No-op if the
    /// provider transitioned away concurrently (checked under the same
    /// lock the transition itself uses).
    pub async fn gc_if_idle(&self, now: Instant) {
        let should_shutdown = {
            let inner = self.inner.lock().await;
            inner.state == ProviderState::Ready
                && now.saturating_duration_since(inner.last_used) > self.spec.idle_ttl()
        };
        if should_shutdown {
            self.shutdown("idle").await;
        }
    }

    pub async fn due_for_health_check(&self, now: Instant) -> bool {
        let inner = self.inner.lock().await;
        inner.state == ProviderState::Ready
            && now.saturating_duration_since(inner.last_health_check)
                >= self.spec.health_check_interval()
    }

    pub async fn details(&self) -> ProviderDetails {
        let inner = self.inner.lock().await;
        ProviderDetails {
            provider_id: self.provider_id.clone(),
            state: inner.state,
            is_alive: inner.transport.is_some(),
            tools_count: inner.tools.len(),
            tools: inner.tools.values().cloned().collect(),
        }
    }

    pub async fn health_info(&self) -> HealthInfo {
        let inner = self.inner.lock().await;
        let now = Instant::now();
        HealthInfo {
            provider_id: self.provider_id.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            total_invocations: inner.total_invocations,
            total_failures: inner.total_failures,
            last_success_at_unix_ms: inner.last_success_at.map(|t| instant_age_ms(t, now)),
            last_failure_at_unix_ms: inner.last_failure_at.map(|t| instant_age_ms(t, now)),
            backoff_remaining_secs: inner.backoff_until.map(|until| {
                until.saturating_duration_since(now).as_secs()
            }),
        }
    }

    pub async fn diagnose_launch_failure(&self, exit_code: Option<i32>) -> LaunchDiagnostics {
        let tail = {
            let inner = self.inner.lock().await;
            match &inner.stderr_ring {
                Some(ring) => ring.tail_text().await,
                None => String::new(),
            }
        };
        diagnose(&tail, exit_code)
    }
}

fn container_runtime() -> &'static str {
    match hangar_config::env::recognised_env().container_runtime.as_deref() {
        Some("docker") => "docker",
        _ => "podman",
    }
}

/// Exponential backoff, base 2, starting at 1s, capped at `max` (Open
/// Question #1 in SPEC_FULL.md §9).
fn backoff_for(consecutive_failures: u32, threshold: u32, max: Duration) -> Duration {
    let overshoot = consecutive_failures.saturating_sub(threshold);
    let secs = 1u64.saturating_shl(overshoot.min(20));
    Duration::from_secs(secs).min(max)
}

fn parse_tools_list(value: &Value) -> Vec<ToolSchema> {
    let tools = value
        .get("tools")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_else(|| value.as_array().cloned().unwrap_or_default());

    tools
        .into_iter()
        .filter_map(|t| {
            let name = t.get("name")?.as_str()?.to_string();
            let input_schema = t.get("inputSchema").cloned();
            Some(ToolSchema { name, input_schema })
        })
        .collect()
}

fn instant_age_ms(t: Instant, now: Instant) -> u64 {
    now.saturating_duration_since(t).as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_caps_at_configured_max() {
        let max = Duration::from_secs(60);
        assert_eq!(backoff_for(3, 3, max), Duration::from_secs(1));
        assert_eq!(backoff_for(4, 3, max), Duration::from_secs(2));
        assert_eq!(backoff_for(10, 3, max), max);
    }

    #[test]
    fn parse_tools_list_reads_wrapped_array() {
        let value = json!({"tools": [{"name": "math/add", "inputSchema": {"type": "object"}}]});
        let tools = parse_tools_list(&value);
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "math/add");
    }

    #[test]
    fn parse_tools_list_reads_bare_array() {
        let value = json!([{"name": "math/sub"}]);
        let tools = parse_tools_list(&value);
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "math/sub");
    }

    #[tokio::test]
    async fn new_supervisor_starts_cold_with_no_transport() {
        use hangar_config::provider::{ProviderMode, SubprocessSpec};
        let spec = ProviderSpec {
            id: "p1".to_string(),
            mode: ProviderMode::Subprocess(SubprocessSpec {
                command: "true".to_string(),
                args: vec![],
                env: Default::default(),
                allow_commands: vec![],
                deny_commands: vec![],
            }),
            idle_ttl_secs: 600,
            health_check_interval_secs: 30,
            max_consecutive_failures: 3,
            predefined_tools: vec![],
            backoff_max_secs: 60,
        };
        let supervisor = ProviderSupervisor::new(spec, EventBus::new());
        assert_eq!(supervisor.state().await, ProviderState::Cold);
        let details = supervisor.details().await;
        assert!(!details.is_alive);
    }
}
