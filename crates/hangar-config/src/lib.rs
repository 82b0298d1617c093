//! Configuration schema and loader for the hangar control plane.
//!
//! A hangar config document declares `providers`, optional `groups`, and a
//! handful of ambient sections (`config_reload`, `batch`, `truncation`,
//! `http`). It may be written as TOML, YAML, or JSON; [`load_path`] sniffs
//! the format from the file extension.

pub mod env;
pub mod paths;
pub mod provider;
pub mod validate;

mod loader;

pub use env::{RecognisedEnv, filter_child_env, recognised_env};
pub use loader::{ConfigFormat, HangarConfig, load_path, load_str};
pub use paths::{APP_NAME, default_config_path, default_socket_path, pid_path_for_socket};
pub use provider::{
    AuthConfig, BatchLimits, CircuitBreakerConfig, ConfigReloadConfig, ContainerSpec, GroupConfig,
    GroupMember, HttpBindConfig, ProviderId, ProviderMode, ProviderSpec, RemoteSpec,
    RoutingStrategy, SubprocessSpec, TlsConfig, TruncationConfig,
};
pub use validate::{ValidationError, validate_config};
