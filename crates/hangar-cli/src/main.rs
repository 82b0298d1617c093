use anyhow::{Context, Result, bail};
use clap::Parser;
use serde_json::{Value, json};

mod cli;
mod client;
mod serve;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_writer(std::io::stderr)
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init()
            .ok();
    } else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init()
            .ok();
    }

    match cli.command {
        Commands::Serve {
            background,
            foreground: _,
            socket,
            config,
            http_bind: _,
            http_port: _,
        } => {
            let socket_path = socket.unwrap_or_else(hangar_config::default_socket_path);
            let config_path = config.unwrap_or_else(hangar_config::default_config_path);

            if background {
                let pid = serve::spawn_background(&socket_path, &config_path)?;
                println!("{}", json!({"started": true, "pid": pid, "socket": socket_path}));
                return Ok(());
            }

            serve::run_foreground(serve::ServeOptions { config_path, socket_path }).await
        }
        Commands::Status { socket } => {
            let socket_path = socket.unwrap_or_else(hangar_config::default_socket_path);
            print_rpc_result(client::call_rpc(&socket_path, "status", json!({})).await?);
            Ok(())
        }
        Commands::Stop { socket, timeout_secs } => {
            let socket_path = socket.unwrap_or_else(hangar_config::default_socket_path);
            stop_daemon(&socket_path, timeout_secs).await
        }
        Commands::List { socket } => {
            let socket_path = socket.unwrap_or_else(hangar_config::default_socket_path);
            print_rpc_result(client::call_rpc(&socket_path, "list", json!({})).await?);
            Ok(())
        }
        Commands::Start { provider, socket } => {
            let socket_path = socket.unwrap_or_else(hangar_config::default_socket_path);
            print_rpc_result(client::call_rpc(&socket_path, "start", json!({"provider": provider})).await?);
            Ok(())
        }
        Commands::StopProvider { provider, reason, socket } => {
            let socket_path = socket.unwrap_or_else(hangar_config::default_socket_path);
            let params = json!({"provider": provider, "reason": reason});
            print_rpc_result(client::call_rpc(&socket_path, "stop", params).await?);
            Ok(())
        }
        Commands::Call { provider, group, tool, arguments, timeout, socket } => {
            let socket_path = socket.unwrap_or_else(hangar_config::default_socket_path);
            let arguments: Value = serde_json::from_str(&arguments).context("--arguments must be valid JSON")?;
            let call = json!({
                "provider": provider,
                "group": group,
                "tool": tool,
                "arguments": arguments,
                "timeout": timeout,
            });
            let request = json!({"calls": [call]});
            print_rpc_result(client::call_rpc(&socket_path, "call", request).await?);
            Ok(())
        }
        Commands::Tools { provider, socket } => {
            let socket_path = socket.unwrap_or_else(hangar_config::default_socket_path);
            print_rpc_result(client::call_rpc(&socket_path, "tools", json!({"provider": provider})).await?);
            Ok(())
        }
        Commands::Details { provider, socket } => {
            let socket_path = socket.unwrap_or_else(hangar_config::default_socket_path);
            let params = provider.map(|p| json!({"provider": p})).unwrap_or_else(|| json!({}));
            print_rpc_result(client::call_rpc(&socket_path, "details", params).await?);
            Ok(())
        }
        Commands::Health { provider, socket } => {
            let socket_path = socket.unwrap_or_else(hangar_config::default_socket_path);
            let params = provider.map(|p| json!({"provider": p})).unwrap_or_else(|| json!({}));
            print_rpc_result(client::call_rpc(&socket_path, "health", params).await?);
            Ok(())
        }
        Commands::Warm { ids, socket } => {
            let socket_path = socket.unwrap_or_else(hangar_config::default_socket_path);
            print_rpc_result(client::call_rpc(&socket_path, "warm", json!({"ids": ids})).await?);
            Ok(())
        }
        Commands::ReloadConfig { socket } => {
            let socket_path = socket.unwrap_or_else(hangar_config::default_socket_path);
            print_rpc_result(client::call_rpc(&socket_path, "reload_config", json!({})).await?);
            Ok(())
        }
    }
}

fn print_rpc_result(value: Value) {
    println!("{}", serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string()));
}

/// Read the daemon's pid file, send SIGTERM, and poll until it exits or
/// `timeout_secs` elapses (spec §6: SIGTERM triggers graceful shutdown).
async fn stop_daemon(socket_path: &std::path::Path, timeout_secs: u64) -> Result<()> {
    let pid_path = hangar_config::pid_path_for_socket(socket_path);
    let pid_text = std::fs::read_to_string(&pid_path)
        .with_context(|| format!("no pid file at {} — is the daemon running?", pid_path.display()))?;
    let pid: i32 = pid_text.trim().parse().context("pid file does not contain a valid pid")?;

    // SAFETY: sending a plain termination signal to a pid we read from our
    // own pid file; `kill` with signal 0 below only probes liveness.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc != 0 {
        bail!("failed to signal pid {pid}: {}", std::io::Error::last_os_error());
    }

    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(timeout_secs);
    while std::time::Instant::now() < deadline {
        // SAFETY: signal 0 performs no action beyond an existence check.
        let alive = unsafe { libc::kill(pid, 0) } == 0;
        if !alive {
            println!("{}", json!({"stopped": true, "pid": pid}));
            return Ok(());
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }

    bail!("daemon (pid {pid}) did not exit within {timeout_secs}s");
}
