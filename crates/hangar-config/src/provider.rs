//! Provider and group configuration types (spec ยง3, ยง4).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Identifier for a provider or group. Validated by [`crate::validate`].
pub type ProviderId = String;

/// TLS options for a remote provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TlsConfig {
    #[serde(default = "default_true")]
    pub verify: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_bundle: Option<PathBuf>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            verify: true,
            ca_bundle: None,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Authentication for a remote provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuthConfig {
    None,
    ApiKeyHeader { header: String, value: String },
    Bearer { token: String },
    Basic { username: String, password: String },
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self::None
    }
}

/// `subprocess` launch parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubprocessSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Explicit allow-list of commands; empty means "no restriction beyond
    /// the built-in deny list".
    #[serde(default)]
    pub allow_commands: Vec<String>,
    #[serde(default)]
    pub deny_commands: Vec<String>,
}

/// `container` launch parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContainerSpec {
    pub image: String,
    #[serde(default)]
    pub volumes: Vec<VolumeMount>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default = "default_network_mode")]
    pub network: String,
    #[serde(default)]
    pub memory_max_mb: Option<u64>,
    #[serde(default)]
    pub cpus: Option<f64>,
    #[serde(default = "default_true")]
    pub read_only_root: bool,
}

fn default_network_mode() -> String {
    "none".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeMount {
    pub host_path: PathBuf,
    pub container_path: PathBuf,
    #[serde(default)]
    pub read_only: bool,
}

/// `remote` launch parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteSpec {
    pub endpoint: String,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sse: Option<bool>,
}

/// Launch mode for a provider, tagged by `mode` in the config document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ProviderMode {
    Subprocess(SubprocessSpec),
    Container(ContainerSpec),
    Remote(RemoteSpec),
    /// A provider entry that is itself a pointer to a group id; used when a
    /// client addresses a group through the same provider-shaped surface.
    Group { group: String },
}

/// Immutable-per-generation spec for one provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderSpec {
    pub id: ProviderId,
    #[serde(flatten)]
    pub mode: ProviderMode,
    #[serde(default = "default_idle_ttl_secs")]
    pub idle_ttl_secs: u64,
    #[serde(default = "default_health_interval_secs")]
    pub health_check_interval_secs: u64,
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    #[serde(default)]
    pub predefined_tools: Vec<String>,
    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,
}

fn default_idle_ttl_secs() -> u64 {
    600
}
fn default_health_interval_secs() -> u64 {
    30
}
fn default_max_consecutive_failures() -> u32 {
    3
}
fn default_backoff_max_secs() -> u64 {
    60
}

impl ProviderSpec {
    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.backoff_max_secs)
    }

    /// Launch-affecting fields used by the hot-reload differ. Two specs are
    /// "unchanged" iff this value compares equal between old and new,
    /// with empty-collection / null normalisation already applied.
    pub fn launch_fingerprint(&self) -> LaunchFingerprint {
        LaunchFingerprint {
            mode: self.mode.clone(),
            idle_ttl_secs: self.idle_ttl_secs,
            health_check_interval_secs: self.health_check_interval_secs,
            max_consecutive_failures: self.max_consecutive_failures,
        }
    }
}

/// Comparable snapshot of the fields that force a provider replacement on
/// reload (spec ยง4.E step 2). Built so callers never forget a field: add it
/// here and every comparison picks it up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchFingerprint {
    mode: ProviderMode,
    idle_ttl_secs: u64,
    health_check_interval_secs: u64,
    max_consecutive_failures: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    RoundRobin,
    WeightedRoundRobin,
    LeastConnections,
    Random,
    Priority,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupMember {
    pub provider: ProviderId,
    #[serde(default)]
    pub weight: Option<u32>,
    #[serde(default)]
    pub priority: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_reset_timeout_secs")]
    pub reset_timeout_secs: u64,
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_reset_timeout_secs() -> u64 {
    30
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_secs: default_reset_timeout_secs(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_secs(self.reset_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupConfig {
    pub id: ProviderId,
    pub members: Vec<GroupMember>,
    #[serde(default = "default_strategy")]
    pub strategy: RoutingStrategy,
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,
    #[serde(default = "default_healthy_threshold")]
    pub healthy_threshold: u32,
    #[serde(default = "default_min_healthy")]
    pub min_healthy: usize,
    #[serde(default)]
    pub circuit: CircuitBreakerConfig,
}

fn default_strategy() -> RoutingStrategy {
    RoutingStrategy::RoundRobin
}
fn default_unhealthy_threshold() -> u32 {
    3
}
fn default_healthy_threshold() -> u32 {
    2
}
fn default_min_healthy() -> usize {
    1
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchLimits {
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_max_concurrency")]
    pub default_max_concurrency: u32,
    #[serde(default = "default_global_timeout_secs")]
    pub default_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
}

fn default_max_batch_size() -> usize {
    100
}
fn default_max_concurrency() -> u32 {
    8
}
fn default_global_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    1
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            default_max_concurrency: default_max_concurrency(),
            default_timeout_secs: default_global_timeout_secs(),
            default_max_retries: default_max_retries(),
        }
    }
}

impl BatchLimits {
    /// Clamp an incoming `max_concurrency` to \[1, 20\] per spec ยง3.
    pub fn clamp_concurrency(&self, requested: u32) -> u32 {
        requested.clamp(1, 20)
    }

    /// Clamp an incoming global timeout (seconds) to \[1, 300\] per spec ยง3.
    pub fn clamp_timeout_secs(&self, requested: u64) -> u64 {
        requested.clamp(1, 300)
    }

    /// Clamp `max_retries` to \[1, 10\]; 1 means "no retry".
    pub fn clamp_max_retries(&self, requested: u32) -> u32 {
        requested.clamp(1, 10)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TruncationConfig {
    #[serde(default = "default_per_call_bytes")]
    pub per_call_max_bytes: u64,
    #[serde(default = "default_cumulative_bytes")]
    pub cumulative_max_bytes: u64,
}

fn default_per_call_bytes() -> u64 {
    10 * 1024 * 1024
}
fn default_cumulative_bytes() -> u64 {
    50 * 1024 * 1024
}

impl Default for TruncationConfig {
    fn default() -> Self {
        Self {
            per_call_max_bytes: default_per_call_bytes(),
            cumulative_max_bytes: default_cumulative_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfigReloadConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub use_watchdog: bool,
    #[serde(default = "default_reload_interval_secs")]
    pub interval_s: u64,
}

fn default_reload_interval_secs() -> u64 {
    5
}

impl Default for ConfigReloadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            use_watchdog: true,
            interval_s: default_reload_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HttpBindConfig {
    #[serde(default = "default_http_host")]
    pub host: String,
    #[serde(default)]
    pub port: u16,
}

fn default_http_host() -> String {
    "127.0.0.1".to_string()
}

impl Default for HttpBindConfig {
    fn default() -> Self {
        Self {
            host: default_http_host(),
            port: 0,
        }
    }
}
