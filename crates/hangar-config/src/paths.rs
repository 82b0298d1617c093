//! XDG-aware path resolution for the control socket, pid file, and default
//! config location.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

pub const APP_NAME: &str = "mcp-hangar";

fn effective_uid() -> u32 {
    #[cfg(unix)]
    {
        // SAFETY: `geteuid` has no preconditions and returns the caller's
        // effective UID.
        unsafe { libc::geteuid() }
    }
    #[cfg(not(unix))]
    {
        0
    }
}

fn runtime_dir(runtime_root: Option<&str>, uid: u32) -> PathBuf {
    if let Some(root) = runtime_root {
        return PathBuf::from(root).join(APP_NAME);
    }
    PathBuf::from("/tmp").join(format!("{APP_NAME}-{uid}"))
}

/// Default control-socket path: `$XDG_RUNTIME_DIR/mcp-hangar/hangar.sock`,
/// falling back to `/tmp/mcp-hangar-$UID/hangar.sock`.
pub fn default_socket_path() -> PathBuf {
    runtime_dir(std::env::var("XDG_RUNTIME_DIR").ok().as_deref(), effective_uid())
        .join("hangar.sock")
}

/// Path to the pid file sitting alongside a given socket path.
pub fn pid_path_for_socket(socket_path: &Path) -> PathBuf {
    let mut buf: OsString = socket_path.as_os_str().to_owned();
    buf.push(".pid");
    PathBuf::from(buf)
}

/// Default config file location: `$XDG_CONFIG_HOME/mcp-hangar/config.toml`.
pub fn default_config_path() -> PathBuf {
    directories::ProjectDirs::from("", "", APP_NAME)
        .map(|dirs| dirs.config_dir().join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("./hangar.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_socket_path_prefers_xdg_runtime_dir() {
        let path = runtime_dir(Some("/tmp/xdg-test"), 1000).join("hangar.sock");
        assert_eq!(
            path,
            PathBuf::from("/tmp/xdg-test/mcp-hangar/hangar.sock")
        );
    }

    #[test]
    fn default_socket_path_falls_back_to_tmp_with_uid() {
        let path = runtime_dir(None, 1001).join("hangar.sock");
        let s = path.to_string_lossy();
        assert!(s.contains("/tmp/mcp-hangar-1001/"));
    }

    #[test]
    fn pid_path_appends_suffix() {
        let socket = Path::new("/tmp/mcp-hangar-1000/hangar.sock");
        assert_eq!(
            pid_path_for_socket(socket),
            Path::new("/tmp/mcp-hangar-1000/hangar.sock.pid")
        );
    }
}
