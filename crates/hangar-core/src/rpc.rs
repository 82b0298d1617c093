//! Control surface (spec §6): every client-facing RPC exposed as an MCP
//! tool over the same JSON-RPC transport as upstream providers, served here
//! over a Unix domain control socket. The discovery-subsystem RPCs
//! (`discover`/`discovered`/`approve`/`quarantine`/`sources`) are explicitly
//! out of scope — the spec marks them as an external subsystem.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

use crate::background::{apply_reload, load_and_validate};
use crate::batch::{BatchCallRequest, BatchExecutor, BatchRequest, BatchTarget};
use crate::error::{ErrorEnvelope, ErrorKind, HangarError};
use crate::events::{DomainEvent, EventBus};
use crate::registry::Registry;

const DEFAULT_WARM_TIMEOUT: Duration = Duration::from_secs(30);

pub struct RpcContext {
    pub registry: Arc<Registry>,
    pub batch: Arc<BatchExecutor>,
    pub events: EventBus,
    pub config_path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct WireBatchCall {
    call_id: Option<String>,
    provider: Option<String>,
    group: Option<String>,
    tool: String,
    #[serde(default)]
    arguments: Value,
    timeout: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct WireBatchRequest {
    calls: Vec<WireBatchCall>,
    max_concurrency: Option<u32>,
    timeout: Option<u64>,
    #[serde(default)]
    fail_fast: bool,
    max_retries: Option<u32>,
}

fn provider_mode_label(spec: &hangar_config::provider::ProviderSpec) -> &'static str {
    use hangar_config::provider::ProviderMode;
    match &spec.mode {
        ProviderMode::Subprocess(_) => "subprocess",
        ProviderMode::Container(_) => "container",
        ProviderMode::Remote(_) => "remote",
        ProviderMode::Group { .. } => "group",
    }
}

/// Dispatch one client-facing RPC by name. Returns the JSON result value on
/// success; errors are already [`HangarError`] and the caller converts them
/// to the wire [`ErrorEnvelope`].
pub async fn dispatch(ctx: &RpcContext, method: &str, params: Value) -> Result<Value, HangarError> {
    match method {
        "list" => list(ctx, params).await,
        "start" => start(ctx, params).await,
        "stop" => stop(ctx, params).await,
        "call" => call(ctx, params).await,
        "tools" => tools(ctx, params).await,
        "details" => details(ctx, params).await,
        "health" => health(ctx, params).await,
        "status" => status(ctx, params).await,
        "warm" => warm(ctx, params).await,
        "reload_config" => reload_config(ctx, params).await,
        "discover" | "discovered" | "approve" | "quarantine" | "sources" => {
            Err(HangarError::new(
                ErrorKind::NotFound,
                format!("`{method}` is served by the discovery subsystem, not the control plane core"),
            ))
        }
        other => Err(HangarError::new(ErrorKind::NotFound, format!("unknown RPC method `{other}`"))),
    }
}

fn require_str(params: &Value, field: &str) -> Result<String, HangarError> {
    params
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| HangarError::new(ErrorKind::Validation, format!("missing required field `{field}`")))
}

async fn list(ctx: &RpcContext, _params: Value) -> Result<Value, HangarError> {
    let mut entries = Vec::new();
    for id in ctx.registry.list_provider_ids() {
        let Some(supervisor) = ctx.registry.provider(&id) else { continue };
        let details = supervisor.details().await;
        let health = supervisor.health_info().await;
        entries.push(json!({
            "provider_id": id,
            "state": details.state,
            "mode": provider_mode_label(supervisor.spec()),
            "is_alive": details.is_alive,
            "tools_count": details.tools_count,
            "health_status": health,
        }));
    }
    Ok(Value::Array(entries))
}

async fn start(ctx: &RpcContext, params: Value) -> Result<Value, HangarError> {
    let provider_id = require_str(&params, "provider")?;
    let supervisor = ctx
        .registry
        .provider(&provider_id)
        .ok_or_else(|| HangarError::new(ErrorKind::NotFound, format!("provider `{provider_id}` does not exist")))?;
    supervisor.ensure_ready().await?;
    let details = supervisor.details().await;
    Ok(json!({
        "provider": provider_id,
        "state": details.state,
        "tools": details.tools,
    }))
}

async fn stop(ctx: &RpcContext, params: Value) -> Result<Value, HangarError> {
    let provider_id = require_str(&params, "provider")?;
    let supervisor = ctx
        .registry
        .provider(&provider_id)
        .ok_or_else(|| HangarError::new(ErrorKind::NotFound, format!("provider `{provider_id}` does not exist")))?;
    let reason = params
        .get("reason")
        .and_then(Value::as_str)
        .unwrap_or("requested")
        .to_string();
    supervisor.shutdown(&reason).await;
    Ok(json!({"stopped": true, "reason": reason}))
}

async fn call(ctx: &RpcContext, params: Value) -> Result<Value, HangarError> {
    let wire: WireBatchRequest = serde_json::from_value(params)
        .map_err(|e| HangarError::new(ErrorKind::Validation, format!("invalid `call` request: {e}")))?;

    let calls = wire
        .calls
        .into_iter()
        .map(|c| {
            let target = match (c.provider, c.group) {
                (Some(provider_id), _) => BatchTarget::Provider { provider_id },
                (None, Some(group_id)) => BatchTarget::Group { group_id },
                (None, None) => BatchTarget::Provider { provider_id: String::new() },
            };
            BatchCallRequest {
                call_id: c.call_id,
                target,
                tool: c.tool,
                arguments: c.arguments,
                timeout_secs: c.timeout,
            }
        })
        .collect();

    let request = BatchRequest {
        calls,
        max_concurrency: wire.max_concurrency,
        global_timeout_secs: wire.timeout,
        max_retries: wire.max_retries,
        fail_fast: wire.fail_fast,
    };

    match ctx.batch.execute(request).await {
        Ok(response) => Ok(serde_json::to_value(response).expect("BatchResponse always serialises")),
        Err(failures) => Err(HangarError::new(
            ErrorKind::Validation,
            format!(
                "batch failed eager validation: {}",
                failures
                    .iter()
                    .map(|f| format!("[{}] {}", f.index, f.message))
                    .collect::<Vec<_>>()
                    .join("; ")
            ),
        )),
    }
}

async fn tools(ctx: &RpcContext, params: Value) -> Result<Value, HangarError> {
    let provider_id = require_str(&params, "provider")?;
    let supervisor = ctx
        .registry
        .provider(&provider_id)
        .ok_or_else(|| HangarError::new(ErrorKind::NotFound, format!("provider `{provider_id}` does not exist")))?;
    let details = supervisor.details().await;
    Ok(serde_json::to_value(details.tools).expect("tool schemas always serialise"))
}

async fn details(ctx: &RpcContext, params: Value) -> Result<Value, HangarError> {
    if let Some(provider_id) = params.get("provider").and_then(Value::as_str) {
        let supervisor = ctx
            .registry
            .provider(provider_id)
            .ok_or_else(|| HangarError::new(ErrorKind::NotFound, format!("provider `{provider_id}` does not exist")))?;
        return Ok(serde_json::to_value(supervisor.details().await).expect("details always serialise"));
    }
    let mut all = Vec::new();
    for id in ctx.registry.list_provider_ids() {
        if let Some(supervisor) = ctx.registry.provider(&id) {
            all.push(supervisor.details().await);
        }
    }
    Ok(serde_json::to_value(all).expect("details always serialise"))
}

async fn health(ctx: &RpcContext, params: Value) -> Result<Value, HangarError> {
    if let Some(provider_id) = params.get("provider").and_then(Value::as_str) {
        let supervisor = ctx
            .registry
            .provider(provider_id)
            .ok_or_else(|| HangarError::new(ErrorKind::NotFound, format!("provider `{provider_id}` does not exist")))?;
        return Ok(serde_json::to_value(supervisor.health_info().await).expect("health info always serialises"));
    }
    let mut all = Vec::new();
    for id in ctx.registry.list_provider_ids() {
        if let Some(supervisor) = ctx.registry.provider(&id) {
            all.push(supervisor.health_info().await);
        }
    }
    Ok(serde_json::to_value(all).expect("health info always serialises"))
}

async fn status(ctx: &RpcContext, _params: Value) -> Result<Value, HangarError> {
    let mut providers = Vec::new();
    for id in ctx.registry.list_provider_ids() {
        if let Some(supervisor) = ctx.registry.provider(&id) {
            providers.push(json!({"provider_id": id, "state": supervisor.state().await}));
        }
    }
    let mut groups = Vec::new();
    for id in ctx.registry.list_group_ids() {
        if let Some(router) = ctx.registry.group(&id) {
            groups.push(json!({"group_id": id, "status": router.status()}));
        }
    }
    Ok(json!({"providers": providers, "groups": groups}))
}

async fn warm(ctx: &RpcContext, params: Value) -> Result<Value, HangarError> {
    let ids_field = require_str(&params, "ids")?;
    let ids: Vec<&str> = ids_field.split(',').map(str::trim).filter(|s| !s.is_empty()).collect();

    let mut results = serde_json::Map::new();
    for id in ids {
        let outcome = match ctx.registry.provider(id) {
            None => json!({"error": true, "kind": "not_found"}),
            Some(supervisor) => match tokio::time::timeout(DEFAULT_WARM_TIMEOUT, supervisor.ensure_ready()).await {
                Ok(Ok(())) => json!({"error": false}),
                Ok(Err(e)) => serde_json::to_value(ErrorEnvelope::from(e)).expect("envelope always serialises"),
                Err(_) => json!({"error": true, "kind": "timeout"}),
            },
        };
        results.insert(id.to_string(), outcome);
    }
    Ok(Value::Object(results))
}

async fn reload_config(ctx: &RpcContext, _params: Value) -> Result<Value, HangarError> {
    let new_config = load_and_validate(&ctx.config_path)
        .map_err(|reason| HangarError::new(ErrorKind::Configuration, reason))?;
    let outcome = apply_reload(&ctx.registry, &new_config).await;
    ctx.events.emit(DomainEvent::ReloadCompleted {
        added: outcome.added.clone(),
        removed: outcome.removed.clone(),
        updated: outcome.updated.clone(),
        unchanged: outcome.unchanged.clone(),
    });
    Ok(json!({
        "added": outcome.added,
        "removed": outcome.removed,
        "updated": outcome.updated,
        "unchanged": outcome.unchanged,
    }))
}

#[derive(Debug, Deserialize)]
struct RpcRequest {
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Serialize)]
struct RpcResponse {
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorEnvelope>,
}

/// Accept loop for the control socket: each connection serves
/// newline-delimited JSON-RPC requests until the peer disconnects. Stops
/// accepting as soon as `shutdown` is cancelled; the caller is responsible
/// for waiting out the in-flight grace period afterwards (spec §6 signal
/// handling) using [`inflight`]'s returned counter.
pub async fn serve(
    ctx: Arc<RpcContext>,
    socket_path: &Path,
    shutdown: tokio_util::sync::CancellationToken,
    inflight: Arc<std::sync::atomic::AtomicUsize>,
) -> anyhow::Result<()> {
    let listener = crate::socket::bind_listener(socket_path).await?;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, _) = accepted?;
                let ctx = ctx.clone();
                let inflight = inflight.clone();
                inflight.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(ctx, stream).await {
                        warn!(error = %e, "control socket connection ended with an error");
                    }
                    inflight.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
                });
            }
        }
    }
}

async fn handle_connection(ctx: Arc<RpcContext>, stream: tokio::net::UnixStream) -> anyhow::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Ok(());
        }
        let request: RpcRequest = match serde_json::from_str(line.trim()) {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, "malformed control-socket request line");
                continue;
            }
        };

        let response = match dispatch(&ctx, &request.method, request.params).await {
            Ok(result) => RpcResponse {
                id: request.id,
                result: Some(result),
                error: None,
            },
            Err(e) => RpcResponse {
                id: request.id,
                result: None,
                error: Some(ErrorEnvelope::from(e)),
            },
        };

        let mut payload = serde_json::to_vec(&response)?;
        payload.push(b'\n');
        write_half.write_all(&payload).await?;
    }
}
