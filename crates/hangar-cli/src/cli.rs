use std::path::PathBuf;

use clap::{Parser, Subcommand};

fn build_version() -> &'static str {
    static VERSION: std::sync::OnceLock<String> = std::sync::OnceLock::new();
    VERSION.get_or_init(|| {
        let cargo_ver = env!("CARGO_PKG_VERSION");
        let git_desc = env!("HANGAR_GIT_DESCRIBE");
        if git_desc.is_empty() {
            cargo_ver.to_string()
        } else {
            format!("{cargo_ver} ({git_desc})")
        }
    })
}

#[derive(Parser)]
#[command(name = "hangar", version = build_version())]
#[command(about = "MCP Hangar: a supervisor multiplexing one client-facing interface over many MCP providers")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Emit logs as JSON instead of the default human-readable format
    #[arg(long, global = true)]
    pub log_json: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the hangar daemon: builds the Registry, spawns background
    /// supervisors, and listens on the control socket.
    Serve {
        /// Fork into the background and write a pid file; mutually
        /// exclusive with --foreground (the default).
        #[arg(long, conflicts_with = "foreground")]
        background: bool,

        /// Stay attached to the terminal (default behaviour).
        #[arg(long)]
        foreground: bool,

        /// Control socket path (default: XDG runtime dir).
        #[arg(long)]
        socket: Option<PathBuf>,

        /// Config file path (default: XDG config dir).
        #[arg(long)]
        config: Option<PathBuf>,

        /// HTTP bind address for the optional HTTP front door.
        #[arg(long)]
        http_bind: Option<String>,

        /// HTTP bind port.
        #[arg(long)]
        http_port: Option<u16>,
    },

    /// Print the daemon's provider/group status as JSON.
    Status {
        #[arg(long)]
        socket: Option<PathBuf>,
    },

    /// Gracefully stop a running daemon (SIGTERM, then wait).
    Stop {
        #[arg(long)]
        socket: Option<PathBuf>,

        /// Seconds to wait for the daemon to exit before giving up.
        #[arg(long, default_value_t = 10)]
        timeout_secs: u64,
    },

    /// List every configured provider and its current state.
    List {
        #[arg(long)]
        socket: Option<PathBuf>,
    },

    /// Ensure a provider is READY (lazily launching it if necessary).
    Start {
        provider: String,
        #[arg(long)]
        socket: Option<PathBuf>,
    },

    /// Shut down a running provider.
    StopProvider {
        provider: String,
        #[arg(long)]
        reason: Option<String>,
        #[arg(long)]
        socket: Option<PathBuf>,
    },

    /// Invoke one tool on a provider or group and print the result.
    Call {
        /// Target provider id (mutually exclusive with --group).
        #[arg(long)]
        provider: Option<String>,

        /// Target group id (mutually exclusive with --provider).
        #[arg(long)]
        group: Option<String>,

        tool: String,

        /// Tool arguments as a JSON object (default: `{}`).
        #[arg(long, default_value = "{}")]
        arguments: String,

        #[arg(long)]
        timeout: Option<f64>,

        #[arg(long)]
        socket: Option<PathBuf>,
    },

    /// List a provider's advertised tool schemas.
    Tools {
        provider: String,
        #[arg(long)]
        socket: Option<PathBuf>,
    },

    /// Print full provider details, or every provider's if none is named.
    Details {
        provider: Option<String>,
        #[arg(long)]
        socket: Option<PathBuf>,
    },

    /// Print provider health info, or every provider's if none is named.
    Health {
        provider: Option<String>,
        #[arg(long)]
        socket: Option<PathBuf>,
    },

    /// Eagerly launch one or more providers by id (comma-separated).
    Warm {
        ids: String,
        #[arg(long)]
        socket: Option<PathBuf>,
    },

    /// Ask a running daemon to reload its config file immediately.
    ReloadConfig {
        #[arg(long)]
        socket: Option<PathBuf>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn call_requires_a_tool_name() {
        let cli = Cli::try_parse_from(["hangar", "call", "--provider", "math", "add"]).unwrap();
        match cli.command {
            Commands::Call { provider, tool, .. } => {
                assert_eq!(provider.as_deref(), Some("math"));
                assert_eq!(tool, "add");
            }
            _ => panic!("expected Call"),
        }
    }

    #[test]
    fn serve_background_and_foreground_are_mutually_exclusive() {
        let result = Cli::try_parse_from(["hangar", "serve", "--background", "--foreground"]);
        assert!(result.is_err());
    }
}
