//! Reusable concurrency primitives shared by the hangar control plane.
//!
//! The one primitive specified by the control-plane design (spec ยง5,
//! "Single-flight") lives here so it is implemented exactly once and reused
//! by both the Provider Supervisor's `ensure_ready()` and the Batch
//! Executor's batch-scoped cold-start deduplication.

pub mod single_flight;

pub use single_flight::SingleFlight;
