//! Batch Executor (spec §4.D): eager validation, bounded concurrency,
//! per-batch single-flight cold starts, fail-fast cancellation, and
//! response truncation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use hangar_config::provider::BatchLimits;
use hangar_lock::SingleFlight;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::warn;

use crate::error::{ErrorKind, HangarError};
use crate::registry::Registry;

const MAX_ARGUMENT_BYTES: usize = 1024 * 1024;
const MAX_ARGUMENT_NESTING: usize = 10;
const MIN_PER_CALL_TIMEOUT_SECS: f64 = 0.1;
const MAX_PER_CALL_TIMEOUT_SECS: f64 = 3600.0;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Deserialize)]
pub struct BatchCallRequest {
    pub call_id: Option<String>,
    pub target: BatchTarget,
    pub tool: String,
    #[serde(default)]
    pub arguments: Value,
    #[serde(default)]
    pub timeout_secs: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BatchTarget {
    Provider { provider_id: String },
    Group { group_id: String },
}

impl BatchTarget {
    fn id(&self) -> &str {
        match self {
            BatchTarget::Provider { provider_id } => provider_id,
            BatchTarget::Group { group_id } => group_id,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchRequest {
    pub calls: Vec<BatchCallRequest>,
    #[serde(default)]
    pub max_concurrency: Option<u32>,
    #[serde(default)]
    pub global_timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub fail_fast: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchCallResult {
    pub index: usize,
    pub call_id: Option<String>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub truncated: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_size_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchResponse {
    pub batch_id: String,
    pub success: bool,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub elapsed_ms: u64,
    pub results: Vec<BatchCallResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationFailure {
    pub index: usize,
    pub message: String,
}

pub struct BatchExecutor {
    registry: Arc<Registry>,
    limits: BatchLimits,
    truncation: hangar_config::provider::TruncationConfig,
    batch_counter: AtomicU64,
}

impl BatchExecutor {
    pub fn new(
        registry: Arc<Registry>,
        limits: BatchLimits,
        truncation: hangar_config::provider::TruncationConfig,
    ) -> Self {
        Self {
            registry,
            limits,
            truncation,
            batch_counter: AtomicU64::new(0),
        }
    }

    fn next_batch_id(&self) -> String {
        let n = self.batch_counter.fetch_add(1, Ordering::Relaxed);
        format!("batch-{n}")
    }

    /// Eager validation (spec §4.D): checks every call before executing
    /// any of them. Returns per-index failures; an empty vec means the
    /// batch may proceed.
    fn validate(&self, request: &BatchRequest) -> Vec<ValidationFailure> {
        let mut failures = Vec::new();

        if request.calls.len() > self.limits.max_batch_size {
            failures.push(ValidationFailure {
                index: 0,
                message: format!(
                    "batch of {} calls exceeds max_batch_size {}",
                    request.calls.len(),
                    self.limits.max_batch_size
                ),
            });
            return failures;
        }

        for (index, call) in request.calls.iter().enumerate() {
            if let Err(message) = self.validate_call(call) {
                failures.push(ValidationFailure { index, message });
            }
        }
        failures
    }

    fn validate_call(&self, call: &BatchCallRequest) -> Result<(), String> {
        match &call.target {
            BatchTarget::Provider { provider_id } => {
                let Some(supervisor) = self.registry.provider(provider_id) else {
                    return Err(format!("provider `{provider_id}` does not exist"));
                };
                let predefined = &supervisor.spec().predefined_tools;
                if !predefined.is_empty() && !predefined.contains(&call.tool) {
                    return Err(format!(
                        "tool `{}` is not in provider `{provider_id}`'s predefined set",
                        call.tool
                    ));
                }
            }
            BatchTarget::Group { group_id } => {
                if self.registry.group(group_id).is_none() {
                    return Err(format!("group `{group_id}` does not exist"));
                }
            }
        }

        let serialized = serde_json::to_vec(&call.arguments)
            .map_err(|e| format!("arguments not serialisable: {e}"))?;
        if serialized.len() > MAX_ARGUMENT_BYTES {
            return Err(format!(
                "arguments of {} bytes exceed the {} byte cap",
                serialized.len(),
                MAX_ARGUMENT_BYTES
            ));
        }
        if json_depth(&call.arguments) > MAX_ARGUMENT_NESTING {
            return Err(format!(
                "arguments nesting exceeds the {MAX_ARGUMENT_NESTING}-level cap"
            ));
        }

        if let Some(timeout) = call.timeout_secs
            && !(MIN_PER_CALL_TIMEOUT_SECS..=MAX_PER_CALL_TIMEOUT_SECS).contains(&timeout)
        {
            return Err(format!(
                "timeout_secs {timeout} outside the allowed [{MIN_PER_CALL_TIMEOUT_SECS}, \
                 {MAX_PER_CALL_TIMEOUT_SECS}] range"
            ));
        }

        Ok(())
    }

    /// Run a batch to completion. On eager-validation failure, returns
    /// `Err` with the per-index failures and executes nothing.
    pub async fn execute(&self, request: BatchRequest) -> Result<BatchResponse, Vec<ValidationFailure>> {
        let failures = self.validate(&request);
        if !failures.is_empty() {
            return Err(failures);
        }

        let batch_id = self.next_batch_id();
        let started = Instant::now();

        let max_concurrency = self
            .limits
            .clamp_concurrency(request.max_concurrency.unwrap_or(self.limits.default_max_concurrency));
        let global_timeout = Duration::from_secs(
            self.limits
                .clamp_timeout_secs(request.global_timeout_secs.unwrap_or(self.limits.default_timeout_secs)),
        );
        let max_retries = self
            .limits
            .clamp_max_retries(request.max_retries.unwrap_or(self.limits.default_max_retries));
        let global_deadline = started + global_timeout;

        let semaphore = Arc::new(Semaphore::new(max_concurrency as usize));
        let cancelled = Arc::new(AtomicBool::new(false));
        let cumulative_bytes = Arc::new(AtomicU64::new(0));
        let cold_start_dedup: Arc<SingleFlight<String, (), HangarError>> = Arc::new(SingleFlight::new());

        let mut join_set = tokio::task::JoinSet::new();
        for (index, call) in request.calls.into_iter().enumerate() {
            let registry = self.registry.clone();
            let semaphore = semaphore.clone();
            let cancelled = cancelled.clone();
            let cumulative_bytes = cumulative_bytes.clone();
            let cold_start_dedup = cold_start_dedup.clone();
            let truncation = self.truncation;
            let fail_fast = request.fail_fast;

            join_set.spawn(async move {
                if fail_fast && cancelled.load(Ordering::SeqCst) {
                    return BatchCallResult {
                        index,
                        call_id: call.call_id,
                        success: false,
                        value: None,
                        error: Some("batch cancelled by an earlier failure".to_string()),
                        error_kind: Some(ErrorKind::Cancelled),
                        elapsed_ms: 0,
                        retries: None,
                        truncated: None,
                        original_size_bytes: None,
                    };
                }

                let _permit = match semaphore.acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => {
                        return BatchCallResult {
                            index,
                            call_id: call.call_id,
                            success: false,
                            value: None,
                            error: Some("concurrency semaphore closed".to_string()),
                            error_kind: Some(ErrorKind::Internal),
                            elapsed_ms: 0,
                            retries: None,
                            truncated: None,
                            original_size_bytes: None,
                        };
                    }
                };

                let call_started = Instant::now();
                let result = run_single_call(
                    &registry,
                    &call,
                    global_deadline,
                    max_retries,
                    &cold_start_dedup,
                )
                .await;
                let elapsed_ms = call_started.elapsed().as_millis() as u64;

                match result {
                    Ok((value, retries)) => {
                        let serialized = serde_json::to_vec(&value).unwrap_or_default();
                        let size = serialized.len() as u64;
                        let cumulative = cumulative_bytes.fetch_add(size, Ordering::SeqCst) + size;
                        let truncated = size > truncation.per_call_max_bytes
                            || cumulative > truncation.cumulative_max_bytes;

                        BatchCallResult {
                            index,
                            call_id: call.call_id,
                            success: true,
                            value: if truncated { None } else { Some(value) },
                            error: None,
                            error_kind: None,
                            elapsed_ms,
                            retries: if retries > 0 { Some(retries) } else { None },
                            truncated: if truncated { Some(true) } else { None },
                            original_size_bytes: if truncated { Some(size) } else { None },
                        }
                    }
                    Err(e) => {
                        if fail_fast {
                            cancelled.store(true, Ordering::SeqCst);
                        }
                        BatchCallResult {
                            index,
                            call_id: call.call_id,
                            success: false,
                            value: None,
                            error: Some(e.message.clone()),
                            error_kind: Some(e.kind),
                            elapsed_ms,
                            retries: None,
                            truncated: None,
                            original_size_bytes: None,
                        }
                    }
                }
            });
        }

        let mut results = Vec::with_capacity(join_set.len());
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(r) => results.push(r),
                Err(e) => warn!(error = %e, "batch call task panicked"),
            }
        }
        results.sort_by_key(|r| r.index);

        let succeeded = results.iter().filter(|r| r.success).count();
        let failed = results.len() - succeeded;

        Ok(BatchResponse {
            batch_id,
            success: failed == 0,
            total: results.len(),
            succeeded,
            failed,
            elapsed_ms: started.elapsed().as_millis() as u64,
            results,
        })
    }
}

async fn run_single_call(
    registry: &Registry,
    call: &BatchCallRequest,
    global_deadline: Instant,
    max_retries: u32,
    cold_start_dedup: &SingleFlight<String, (), HangarError>,
) -> Result<(Value, u32), HangarError> {
    let provider_id = call.target.id().to_string();

    let mut attempt = 0u32;
    loop {
        let remaining = global_deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(HangarError::new(ErrorKind::Timeout, "global batch deadline exceeded"));
        }
        let requested = call
            .timeout_secs
            .map(Duration::from_secs_f64)
            .unwrap_or(remaining);
        let effective_timeout = requested.min(remaining);

        let outcome = dispatch_call(registry, call, &provider_id, effective_timeout, cold_start_dedup).await;

        match outcome {
            Ok(value) => return Ok((value, attempt)),
            Err(e) if attempt + 1 < max_retries && e.kind.retriable_in_batch() => {
                attempt += 1;
                let delay = RETRY_BASE_DELAY * 2u32.saturating_pow(attempt - 1);
                tokio::time::sleep(delay.min(remaining)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn dispatch_call(
    registry: &Registry,
    call: &BatchCallRequest,
    provider_id: &str,
    timeout: Duration,
    cold_start_dedup: &SingleFlight<String, (), HangarError>,
) -> Result<Value, HangarError> {
    match &call.target {
        BatchTarget::Provider { .. } => {
            let supervisor = registry
                .provider(provider_id)
                .ok_or_else(|| HangarError::new(ErrorKind::NotFound, format!("provider `{provider_id}` does not exist")))?;

            cold_start_dedup
                .run(provider_id.to_string(), || async { supervisor.ensure_ready().await })
                .await?;

            supervisor.invoke(&call.tool, call.arguments.clone(), timeout).await
        }
        BatchTarget::Group { group_id } => {
            let router = registry
                .group(group_id)
                .ok_or_else(|| HangarError::new(ErrorKind::NotFound, format!("group `{group_id}` does not exist")))?;

            let selection = router.select()?;
            let supervisor = registry.provider(&selection.provider_id).ok_or_else(|| {
                HangarError::new(
                    ErrorKind::Internal,
                    format!("group member `{}` has no registered supervisor", selection.provider_id),
                )
            })?;

            cold_start_dedup
                .run(selection.provider_id.clone(), || async { supervisor.ensure_ready().await })
                .await?;

            let result = supervisor.invoke(&call.tool, call.arguments.clone(), timeout).await;
            let infra_failure = matches!(
                &result,
                Err(e) if e.kind.retriable_in_batch()
            );
            router.record_outcome(&selection, infra_failure);
            result
        }
    }
}

fn json_depth(value: &Value) -> usize {
    match value {
        Value::Object(map) => 1 + map.values().map(json_depth).max().unwrap_or(0),
        Value::Array(items) => 1 + items.iter().map(json_depth).max().unwrap_or(0),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_depth_counts_nested_objects() {
        let value = serde_json::json!({"a": {"b": {"c": 1}}});
        assert_eq!(json_depth(&value), 3);
    }

    #[test]
    fn json_depth_flat_value_is_zero() {
        assert_eq!(json_depth(&serde_json::json!(42)), 0);
    }
}
