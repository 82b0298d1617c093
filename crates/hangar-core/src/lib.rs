//! The MCP Hangar control plane core: provider lifecycle, health
//! supervision, request routing, and batch fan-out over many MCP
//! providers, behind one client-facing control socket.

pub mod background;
pub mod batch;
pub mod diagnostics;
pub mod error;
pub mod events;
pub mod registry;
pub mod router;
pub mod rpc;
mod socket;
pub mod supervisor;

pub use background::{apply_reload, run_health_prober, run_hot_reload_worker, run_idle_gc, ReloadOutcome};
pub use batch::{
    BatchCallRequest, BatchCallResult, BatchExecutor, BatchRequest, BatchResponse, BatchTarget,
    ValidationFailure,
};
pub use error::{ErrorEnvelope, ErrorKind, HangarError};
pub use events::{DomainEvent, EventBus};
pub use registry::Registry;
pub use router::{GroupRouter, GroupStatus};
pub use rpc::{dispatch, serve, RpcContext};
pub use supervisor::{HealthInfo, ProviderDetails, ProviderState, ProviderSupervisor, ToolSchema};
