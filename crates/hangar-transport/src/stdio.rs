//! Stdio transport: newline-delimited JSON-RPC over a provider subprocess's
//! stdin/stdout (spec §4.A). A single reader task consumes responses and
//! dispatches each by id to a per-request rendezvous slot; a write mutex
//! serialises outbound frames; id allocation is monotonic and never reused.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, warn};

use crate::protocol::{JsonRpcRequest, JsonRpcResponse};
use crate::{CallOutcome, TransportClient, TransportError};

type PendingSlot = oneshot::Sender<Result<CallOutcome, TransportError>>;

struct Shared {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingSlot>>,
    write_half: Mutex<ChildStdin>,
    closed: AtomicBool,
}

impl Shared {
    async fn fail_all(&self, make_err: impl Fn() -> TransportError) {
        self.closed.store(true, Ordering::SeqCst);
        let mut pending = self.pending.lock().await;
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(make_err()));
        }
    }
}

/// A provider's stdio-backed Transport Client.
pub struct StdioTransport {
    shared: Arc<Shared>,
    reader_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl StdioTransport {
    /// Spawn the reader task over `stdout` and take ownership of `stdin`
    /// for outbound writes. The caller keeps the `tokio::process::Child`
    /// itself (for pid/exit-code observation); this type only needs the
    /// two pipe halves.
    pub fn new(stdin: ChildStdin, stdout: ChildStdout) -> Self {
        let shared = Arc::new(Shared {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            write_half: Mutex::new(stdin),
            closed: AtomicBool::new(false),
        });

        let reader_shared = shared.clone();
        let reader_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        Self::dispatch(&reader_shared, &line).await;
                    }
                    Ok(None) => {
                        debug!("provider stdout closed (EOF)");
                        reader_shared
                            .fail_all(|| TransportError::Transport("stdout closed (EOF)".into()))
                            .await;
                        break;
                    }
                    Err(e) => {
                        warn!("provider stdout read error: {e}");
                        reader_shared
                            .fail_all(|| TransportError::Transport(format!("stdout read error: {e}")))
                            .await;
                        break;
                    }
                }
            }
        });

        Self {
            shared,
            reader_task: Mutex::new(Some(reader_task)),
        }
    }

    async fn dispatch(shared: &Shared, line: &str) {
        let parsed: Result<JsonRpcResponse, _> = serde_json::from_str(line);
        let response = match parsed {
            Ok(r) => r,
            Err(e) => {
                // A single unparseable line is a channel-level fault: we
                // cannot know which in-flight caller it was meant for.
                warn!("unparseable response line, closing channel: {e}");
                shared
                    .fail_all(|| TransportError::Transport(format!("unparseable response line: {e}")))
                    .await;
                return;
            }
        };

        let Some(id) = response.numeric_id() else {
            debug!("ignoring response/notification with no numeric id");
            return;
        };

        let slot = {
            let mut pending = shared.pending.lock().await;
            pending.remove(&id)
        };
        let Some(slot) = slot else {
            // Orphan: the caller already timed out and released this id.
            debug!(id, "discarding orphan response for released id");
            return;
        };

        let _ = slot.send(response.into_outcome());
    }
}

#[async_trait]
impl TransportClient for StdioTransport {
    async fn call(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<CallOutcome, TransportError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Transport("channel already closed".into()));
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.shared.pending.lock().await;
            pending.insert(id, tx);
        }

        let request = JsonRpcRequest::new(id, method, params);
        let mut line = serde_json::to_string(&request)
            .map_err(|e| TransportError::Protocol(format!("failed to encode request: {e}")))?;
        line.push('\n');

        {
            let mut writer = self.shared.write_half.lock().await;
            if let Err(e) = writer.write_all(line.as_bytes()).await {
                self.shared.pending.lock().await.remove(&id);
                self.shared
                    .fail_all(|| TransportError::Transport(format!("stdin write error: {e}")))
                    .await;
                return Err(TransportError::Transport(format!("stdin write error: {e}")));
            }
            if let Err(e) = writer.flush().await {
                self.shared.pending.lock().await.remove(&id);
                return Err(TransportError::Transport(format!("stdin flush error: {e}")));
            }
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::Transport(
                "response channel dropped without a reply".to_string(),
            )),
            Err(_) => {
                self.shared.pending.lock().await.remove(&id);
                Err(TransportError::Timeout(timeout))
            }
        }
    }

    async fn close(&self) {
        self.shared
            .fail_all(|| TransportError::Transport("transport closed".into()))
            .await;
        if let Some(task) = self.reader_task.lock().await.take() {
            task.abort();
        }
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::process::Command;

    /// `cat` echoes each stdin line back on stdout unmodified, which is
    /// enough to drive the id-correlation and timeout paths without a real
    /// MCP provider.
    async fn spawn_cat() -> (tokio::process::Child, ChildStdin, ChildStdout) {
        let mut cmd = Command::new("cat");
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::null());
        cmd.kill_on_drop(true);
        let mut child = cmd.spawn().expect("spawn cat");
        let stdin = child.stdin.take().unwrap();
        let stdout = child.stdout.take().unwrap();
        (child, stdin, stdout)
    }

    #[tokio::test]
    async fn eof_fails_all_pending_callers_with_transport() {
        let mut cmd = Command::new("true");
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        let mut child = cmd.spawn().expect("spawn true");
        let stdin = child.stdin.take().unwrap();
        let stdout = child.stdout.take().unwrap();
        let transport = StdioTransport::new(stdin, stdout);

        let result = transport
            .call("tools/list", serde_json::json!({}), Duration::from_secs(2))
            .await;
        assert!(matches!(result, Err(TransportError::Transport(_))));
        assert!(transport.is_closed());
        let _ = child.wait().await;
    }

    #[tokio::test]
    async fn timeout_releases_the_slot_for_reuse() {
        let mut cmd = Command::new("sleep");
        cmd.arg("5");
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        let mut child = cmd.spawn().expect("spawn sleep");
        let stdin = child.stdin.take().unwrap();
        let stdout = child.stdout.take().unwrap();
        let transport = StdioTransport::new(stdin, stdout);

        let result = transport
            .call("tools/list", serde_json::json!({}), Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(TransportError::Timeout(_))));
        assert_eq!(transport.shared.pending.lock().await.len(), 0);
        let _ = child.kill().await;
    }

    #[tokio::test]
    async fn correlates_response_by_id() {
        let (mut child, stdin, stdout) = spawn_cat().await;
        let transport = StdioTransport::new(stdin, stdout);

        // `cat` doesn't speak JSON-RPC, so emulate a provider reply by
        // writing a well-formed response at the id we expect (1, since
        // this is the first call on a fresh client).
        let reply = serde_json::json!({"jsonrpc":"2.0","id":1,"result":{"ok":true}});
        let _ = reply;

        // Drive a real call against `cat`: it will echo our request line
        // back, which is itself a valid-looking but semantically-id-1
        // JSON-RPC *request*, not a response with a "result"/"error" key.
        // `into_outcome` rejects that as a protocol error, scoped to the
        // one waiter rather than closing the channel.
        let result = transport
            .call("tools/list", serde_json::json!({}), Duration::from_secs(2))
            .await;
        assert!(matches!(result, Err(TransportError::Protocol(_))));
        assert!(!transport.is_closed());

        transport.close().await;
        let _ = child.kill().await;
    }
}
