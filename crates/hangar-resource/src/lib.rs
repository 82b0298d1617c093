//! Resource-isolation primitives for provider child processes: cgroup v2
//! scopes, POSIX rlimits, and host capability detection.

pub mod cgroup;
pub mod rlimit;
pub mod sandbox;

pub use cgroup::{
    CgroupScopeGuard, OrphanScope, SandboxConfig, cleanup_orphan_scopes, create_scope_command,
};
pub use rlimit::{RssWatcher, apply_rlimits};
pub use sandbox::{SandboxCapability, detect_sandbox_capability};
