//! Bounded stderr capture for provider children (spec §4.A): "Stderr is
//! captured into a bounded ring buffer so that a failed start can surface
//! diagnostic text."

use std::collections::VecDeque;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::ChildStderr;
use tokio::sync::{Mutex, mpsc};

/// A fixed-capacity FIFO of the most recent stderr lines a provider child
/// has written. Oldest lines are dropped once `capacity` is exceeded so a
/// runaway provider can't grow this unbounded.
#[derive(Debug)]
pub struct StderrRing {
    lines: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl StderrRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Mutex::new(VecDeque::with_capacity(capacity.min(256))),
            capacity,
        }
    }

    async fn push(&self, line: String) {
        let mut lines = self.lines.lock().await;
        if lines.len() >= self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Snapshot the buffered lines, oldest first.
    pub async fn snapshot(&self) -> Vec<String> {
        self.lines.lock().await.iter().cloned().collect()
    }

    /// Join the buffered lines into a single diagnostic string, newest-last.
    pub async fn tail_text(&self) -> String {
        self.snapshot().await.join("\n")
    }
}

/// Spawn a background task that reads `stderr` line-by-line into `ring`
/// until EOF, forwarding each line on `forward` as well so a caller can
/// react to stderr in real time (e.g. for structured logging) without
/// re-reading the ring buffer.
///
/// Returns the task handle; callers that don't need to await completion may
/// drop it, since `kill_on_drop` on the child already bounds its lifetime.
pub fn spawn_capture(
    stderr: ChildStderr,
    ring: std::sync::Arc<StderrRing>,
    forward: Option<mpsc::UnboundedSender<String>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            ring.push(line.clone()).await;
            if let Some(tx) = &forward {
                let _ = tx.send(line);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drops_oldest_once_over_capacity() {
        let ring = StderrRing::new(3);
        for i in 0..5 {
            ring.push(format!("line {i}")).await;
        }
        assert_eq!(
            ring.snapshot().await,
            vec!["line 2".to_string(), "line 3".to_string(), "line 4".to_string()]
        );
    }

    #[tokio::test]
    async fn tail_text_joins_with_newlines() {
        let ring = StderrRing::new(10);
        ring.push("a".to_string()).await;
        ring.push("b".to_string()).await;
        assert_eq!(ring.tail_text().await, "a\nb");
    }
}
