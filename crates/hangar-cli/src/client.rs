//! Thin client over the control socket: every non-`serve` subcommand opens
//! a connection, sends one newline-delimited JSON-RPC request, reads one
//! response line, and prints the result (spec §6 / SPEC_FULL.md §4.H).

use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

#[derive(Serialize)]
struct RpcRequest<'a> {
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

/// Send one RPC and return its `result` value, or an error built from the
/// wire `ErrorEnvelope` on failure.
pub async fn call_rpc(socket_path: &Path, method: &str, params: Value) -> Result<Value> {
    let stream = UnixStream::connect(socket_path)
        .await
        .with_context(|| format!("failed to connect to control socket at {}", socket_path.display()))?;
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let request = RpcRequest { id: 1, method, params };
    let mut payload = serde_json::to_vec(&request)?;
    payload.push(b'\n');
    write_half.write_all(&payload).await?;

    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        bail!("control socket closed the connection without a response");
    }

    let response: RpcResponse = serde_json::from_str(line.trim())?;
    match (response.result, response.error) {
        (Some(result), _) => Ok(result),
        (None, Some(error)) => bail!("{}", serde_json::to_string_pretty(&error)?),
        (None, None) => bail!("malformed control-socket response: neither `result` nor `error`"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    #[tokio::test]
    async fn call_rpc_round_trips_a_result() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("hangar.sock");

        let listener = UnixListener::bind(&socket_path).unwrap();
        let server_socket = socket_path.clone();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            let request: Value = serde_json::from_str(line.trim()).unwrap();
            assert_eq!(request["method"], "status");
            write_half
                .write_all(br#"{"id":1,"result":{"providers":[]}}"#)
                .await
                .unwrap();
            write_half.write_all(b"\n").await.unwrap();
            let _ = server_socket;
        });

        let result = call_rpc(&socket_path, "status", serde_json::json!({})).await.unwrap();
        assert_eq!(result, serde_json::json!({"providers": []}));
    }

    #[tokio::test]
    async fn call_rpc_surfaces_error_envelope() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("hangar.sock");

        let listener = UnixListener::bind(&socket_path).unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (_, mut write_half) = stream.into_split();
            write_half
                .write_all(br#"{"id":1,"error":{"error":true,"kind":"not_found"}}"#)
                .await
                .unwrap();
            write_half.write_all(b"\n").await.unwrap();
        });

        let err = call_rpc(&socket_path, "start", serde_json::json!({"provider": "missing"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not_found"));
    }
}
