//! Background Supervisors (spec §4.E): idle GC, the active health prober,
//! and the hot-reload worker. Each runs as its own periodic task against
//! the shared [`Registry`]; none of them ever panics the process on a
//! per-provider failure.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hangar_config::HangarConfig;
use hangar_config::validate::validate_config;
use tokio::time::interval;
use tracing::{error, info, warn};

use crate::events::{DomainEvent, EventBus};
use crate::registry::Registry;

const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_HEALTH_PROBE_INTERVAL: Duration = Duration::from_secs(5);

/// Walk all providers and shut down any READY provider idle past its
/// `idle_ttl`. Safe to call repeatedly; each Supervisor's own lock makes
/// the check-then-shutdown atomic with respect to concurrent invocations.
pub async fn run_idle_gc(registry: Arc<Registry>, gc_interval: Duration) {
    let mut ticker = interval(if gc_interval.is_zero() {
        DEFAULT_GC_INTERVAL
    } else {
        gc_interval
    });
    loop {
        ticker.tick().await;
        let now = Instant::now();
        for id in registry.list_provider_ids() {
            if let Some(supervisor) = registry.provider(&id) {
                supervisor.gc_if_idle(now).await;
            }
        }
    }
}

/// For each READY provider due for a health check, issue `tools/list` with
/// a short timeout. Failures feed the same counters an invocation failure
/// would (spec §4.E).
pub async fn run_health_prober(registry: Arc<Registry>) {
    let mut ticker = interval(DEFAULT_HEALTH_PROBE_INTERVAL);
    loop {
        ticker.tick().await;
        let now = Instant::now();
        for id in registry.list_provider_ids() {
            let Some(supervisor) = registry.provider(&id) else { continue };
            if supervisor.due_for_health_check(now).await {
                let healthy = supervisor.health_check().await;
                if !healthy {
                    warn!(provider_id = %id, "active health probe failed");
                }
            }
        }
    }
}

pub struct ReloadOutcome {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub updated: Vec<String>,
    pub unchanged: Vec<String>,
}

/// Apply a freshly parsed config against the running registry (spec §4.E
/// steps 2-4): diff by provider id using `launch_fingerprint()`, shut down
/// and replace anything that changed, register anything new, deregister
/// anything removed. Unchanged providers are left entirely alone so their
/// in-flight connections survive the reload.
pub async fn apply_reload(registry: &Registry, new_config: &HangarConfig) -> ReloadOutcome {
    let mut added = Vec::new();
    let mut removed = Vec::new();
    let mut updated = Vec::new();
    let mut unchanged = Vec::new();

    let existing_ids = registry.list_provider_ids();

    for id in &existing_ids {
        if !new_config.providers.contains_key(id) {
            if let Some(supervisor) = registry.remove_provider(id) {
                supervisor.shutdown("reload: removed").await;
            }
            removed.push(id.clone());
        }
    }

    for (id, new_spec) in &new_config.providers {
        match registry.provider(id) {
            None => {
                registry.insert_provider(new_spec.clone());
                added.push(id.clone());
            }
            Some(existing) => {
                if existing.spec().launch_fingerprint() == new_spec.launch_fingerprint() {
                    unchanged.push(id.clone());
                } else {
                    existing.shutdown("reload: replaced").await;
                    registry.remove_provider(id);
                    registry.insert_provider(new_spec.clone());
                    updated.push(id.clone());
                }
            }
        }
    }

    let existing_group_ids = registry.list_group_ids();
    for id in &existing_group_ids {
        if !new_config.groups.contains_key(id) {
            registry.remove_group(id);
        }
    }
    for (id, group) in &new_config.groups {
        if registry.group(id).is_none() {
            registry.insert_group(group.clone());
        }
    }

    ReloadOutcome {
        added,
        removed,
        updated,
        unchanged,
    }
}

/// Watches `config_path` for changes (polling; a filesystem-notification
/// backend can replace the poll loop without changing this function's
/// contract) and applies validated reloads to `registry`.
pub async fn run_hot_reload_worker(
    registry: Arc<Registry>,
    events: EventBus,
    config_path: PathBuf,
    poll_interval: Duration,
) {
    let mut last_modified = std::fs::metadata(&config_path).and_then(|m| m.modified()).ok();
    let mut ticker = interval(poll_interval);
    loop {
        ticker.tick().await;

        let modified = match std::fs::metadata(&config_path).and_then(|m| m.modified()) {
            Ok(m) => m,
            Err(e) => {
                warn!(path = %config_path.display(), error = %e, "failed to stat config file");
                continue;
            }
        };
        if last_modified == Some(modified) {
            continue;
        }
        last_modified = Some(modified);

        info!(path = %config_path.display(), "config change detected, reloading");
        match load_and_validate(&config_path) {
            Ok(new_config) => {
                let outcome = apply_reload(&registry, &new_config).await;
                events.emit(DomainEvent::ReloadCompleted {
                    added: outcome.added,
                    removed: outcome.removed,
                    updated: outcome.updated,
                    unchanged: outcome.unchanged,
                });
            }
            Err(reason) => {
                error!(reason = %reason, "config reload failed validation; leaving running state untouched");
                events.emit(DomainEvent::ReloadFailed { reason });
            }
        }
    }
}

pub(crate) fn load_and_validate(config_path: &std::path::Path) -> Result<HangarConfig, String> {
    let config = hangar_config::load_path(config_path).map_err(|e| e.to_string())?;
    let errors = validate_config(&config);
    if !errors.is_empty() {
        return Err(errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; "));
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hangar_config::provider::{ProviderMode, ProviderSpec, SubprocessSpec};

    fn provider_spec(id: &str, command: &str) -> ProviderSpec {
        ProviderSpec {
            id: id.to_string(),
            mode: ProviderMode::Subprocess(SubprocessSpec {
                command: command.to_string(),
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
        }
    }

    #[tokio::test]
    async fn reload_classifies_added_removed_updated_unchanged() {
        let mut initial = HangarConfig::default();
        initial.providers.insert("keep".to_string(), provider_spec("keep", "true"));
        initial.providers.insert("change".to_string(), provider_spec("change", "true"));
        initial.providers.insert("drop".to_string(), provider_spec("drop", "true"));

        let registry = Registry::new(&initial, EventBus::new());

        let mut next = HangarConfig::default();
        next.providers.insert("keep".to_string(), provider_spec("keep", "true"));
        next.providers.insert("change".to_string(), provider_spec("change", "false"));
        next.providers.insert("new".to_string(), provider_spec("new", "true"));

        let outcome = apply_reload(&registry, &next).await;

        assert_eq!(outcome.added, vec!["new".to_string()]);
        assert_eq!(outcome.removed, vec!["drop".to_string()]);
        assert_eq!(outcome.updated, vec!["change".to_string()]);
        assert_eq!(outcome.unchanged, vec!["keep".to_string()]);
        assert!(registry.provider("drop").is_none());
        assert!(registry.provider("new").is_some());
    }
}
