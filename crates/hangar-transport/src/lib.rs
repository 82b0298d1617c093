//! The Transport Client (spec §4.A): one per running provider, multiplexing
//! concurrent JSON-RPC 2.0 calls over a single underlying channel — a
//! provider subprocess's stdio, or a pooled HTTP(S) connection.

mod protocol;

pub mod http;
pub mod stdio;

pub use http::HttpTransport;
pub use protocol::{CallOutcome, JsonRpcErrorObject, TransportError};
pub use stdio::StdioTransport;

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

/// Contract shared by every underlying channel a provider can be reached
/// over. `call` multiplexes; concurrent calls on the same client are
/// expected and must not interfere with each other's correlation.
#[async_trait]
pub trait TransportClient: Send + Sync {
    async fn call(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<CallOutcome, TransportError>;

    /// Release the underlying channel, terminate the reader, and drain any
    /// pending callers with a `transport` error. Idempotent.
    async fn close(&self);

    /// True once `close()` has run or the channel observed a terminal
    /// failure (EOF, I/O error, unparseable line).
    fn is_closed(&self) -> bool;
}
