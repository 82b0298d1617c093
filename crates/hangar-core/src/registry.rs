//! Registry (spec §2.F): the process-wide map from provider id to
//! [`ProviderSupervisor`] and group id to [`GroupRouter`], and the entry
//! point every tool-facing operation (direct call, batch, hot-reload) goes
//! through to resolve a target.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;

use hangar_config::HangarConfig;
use hangar_config::provider::{GroupConfig, ProviderId, ProviderMode, ProviderSpec};

use crate::events::EventBus;
use crate::router::GroupRouter;
use crate::supervisor::ProviderSupervisor;

/// Owns every configured provider's Supervisor and every configured group's
/// Router. Cheap to construct in isolation for tests (spec §9): just build
/// a [`HangarConfig`] in memory and pass it to [`Registry::new`].
pub struct Registry {
    providers: RwLock<HashMap<ProviderId, Arc<ProviderSupervisor>>>,
    groups: RwLock<HashMap<ProviderId, Arc<GroupRouter>>>,
    events: EventBus,
}

impl Registry {
    pub fn new(config: &HangarConfig, events: EventBus) -> Self {
        let providers = config
            .providers
            .values()
            .map(|spec| {
                (
                    spec.id.clone(),
                    Arc::new(ProviderSupervisor::new(spec.clone(), events.clone())),
                )
            })
            .collect();
        let groups = config
            .groups
            .values()
            .map(|group| (group.id.clone(), Arc::new(GroupRouter::new(group.clone(), events.clone()))))
            .collect();
        Self {
            providers: RwLock::new(providers),
            groups: RwLock::new(groups),
            events,
        }
    }

    pub fn provider(&self, id: &str) -> Option<Arc<ProviderSupervisor>> {
        self.providers.read().expect("registry poisoned").get(id).cloned()
    }

    pub fn group(&self, id: &str) -> Option<Arc<GroupRouter>> {
        self.groups.read().expect("registry poisoned").get(id).cloned()
    }

    /// Resolve a client-facing `provider` argument that may actually point
    /// at a group (`ProviderMode::Group`), per spec §4.B's note that such an
    /// entry routes through the Group Router instead of a Supervisor.
    pub fn resolve_group_alias(&self, provider_id: &str) -> Option<String> {
        let supervisor = self.provider(provider_id)?;
        match &supervisor.spec().mode {
            ProviderMode::Group { group } => Some(group.clone()),
            _ => None,
        }
    }

    pub fn list_provider_ids(&self) -> Vec<ProviderId> {
        self.providers.read().expect("registry poisoned").keys().cloned().collect()
    }

    pub fn list_group_ids(&self) -> Vec<ProviderId> {
        self.groups.read().expect("registry poisoned").keys().cloned().collect()
    }

    pub fn insert_provider(&self, spec: ProviderSpec) {
        let supervisor = Arc::new(ProviderSupervisor::new(spec.clone(), self.events.clone()));
        self.providers
            .write()
            .expect("registry poisoned")
            .insert(spec.id.clone(), supervisor);
    }

    pub fn insert_group(&self, group: GroupConfig) {
        let router = Arc::new(GroupRouter::new(group.clone(), self.events.clone()));
        self.groups.write().expect("registry poisoned").insert(group.id.clone(), router);
    }

    /// Remove and return a provider's Supervisor so the caller can shut it
    /// down before dropping it (used by the hot-reload worker).
    pub fn remove_provider(&self, id: &str) -> Option<Arc<ProviderSupervisor>> {
        self.providers.write().expect("registry poisoned").remove(id)
    }

    pub fn remove_group(&self, id: &str) -> Option<Arc<GroupRouter>> {
        self.groups.write().expect("registry poisoned").remove(id)
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hangar_config::provider::SubprocessSpec;

    fn sample_config() -> HangarConfig {
        let mut config = HangarConfig::default();
        config.providers.insert(
            "math".to_string(),
            ProviderSpec {
                id: "math".to_string(),
                mode: ProviderMode::Subprocess(SubprocessSpec {
                    command: "math-server".to_string(),
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
            },
        );
        config
    }

    #[test]
    fn new_registry_builds_a_supervisor_per_configured_provider() {
        let registry = Registry::new(&sample_config(), EventBus::new());
        assert!(registry.provider("math").is_some());
        assert!(registry.provider("missing").is_none());
        assert_eq!(registry.list_provider_ids(), vec!["math".to_string()]);
    }

    #[test]
    fn remove_provider_drops_it_from_future_lookups() {
        let registry = Registry::new(&sample_config(), EventBus::new());
        assert!(registry.remove_provider("math").is_some());
        assert!(registry.provider("math").is_none());
    }
}
