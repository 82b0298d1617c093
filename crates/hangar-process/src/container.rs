//! Container-mode provider launch (spec §4.B): builds a hardened command
//! line for the configured container runtime. Hardening is always applied,
//! never opt-in: dropped capabilities, no new privileges, a read-only root
//! unless explicitly disabled, resource limits, and the configured network
//! mode (default `none`).

use std::path::Path;
use tokio::process::Command;

use hangar_config::provider::ContainerSpec;

/// Host path prefixes a volume mount is never allowed to expose, regardless
/// of `read_only`. Kept conservative and host-path-based since provider
/// configuration is operator-authored, not attacker-authored, but a typo'd
/// mount of `/` or `/etc` should still fail closed.
const BLOCKED_SENSITIVE_PATHS: &[&str] = &[
    "/",
    "/etc",
    "/root",
    "/var/run/docker.sock",
    "/proc",
    "/sys",
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContainerValidationError {
    #[error("volume host_path `{0}` must be absolute")]
    HostPathNotAbsolute(String),
    #[error("volume host_path `{0}` matches a blocked sensitive path")]
    BlockedSensitivePath(String),
    #[error("image reference `{0}` must not be empty")]
    EmptyImage,
}

fn validate_volumes(spec: &ContainerSpec) -> Result<(), ContainerValidationError> {
    if spec.image.trim().is_empty() {
        return Err(ContainerValidationError::EmptyImage);
    }
    for volume in &spec.volumes {
        if !volume.host_path.is_absolute() {
            return Err(ContainerValidationError::HostPathNotAbsolute(
                volume.host_path.display().to_string(),
            ));
        }
        let host_path_str = volume.host_path.to_string_lossy();
        if BLOCKED_SENSITIVE_PATHS
            .iter()
            .any(|blocked| host_path_str == *blocked || is_strict_subpath(&volume.host_path, Path::new(blocked)))
        {
            return Err(ContainerValidationError::BlockedSensitivePath(
                host_path_str.to_string(),
            ));
        }
    }
    Ok(())
}

fn is_strict_subpath(candidate: &Path, ancestor: &Path) -> bool {
    // `/etc/foo` is blocked by `/etc`; `/etcetera` is not.
    candidate.starts_with(ancestor) && candidate != ancestor
}

/// Build the container-runtime invocation for a `container`-mode provider.
///
/// `runtime` is the configured binary name, e.g. `"podman"` or `"docker"`
/// (spec §6, `HANGAR_CONTAINER_RUNTIME`). The provider's own `command`/`args`
/// (if any) are appended after `--`, matching the runtime's own convention
/// for overriding the image's entrypoint arguments.
pub fn build_container_command(
    runtime: &str,
    spec: &ContainerSpec,
) -> Result<Command, ContainerValidationError> {
    validate_volumes(spec)?;

    let mut cmd = Command::new(runtime);
    cmd.args([
        "run",
        "--rm",
        "-i",
        "--cap-drop=ALL",
        "--security-opt=no-new-privileges",
    ]);

    if spec.read_only_root {
        cmd.arg("--read-only");
    }

    cmd.arg(format!("--network={}", spec.network));

    if let Some(memory_max_mb) = spec.memory_max_mb {
        cmd.arg(format!("--memory={memory_max_mb}m"));
    }
    if let Some(cpus) = spec.cpus {
        cmd.arg(format!("--cpus={cpus}"));
    }

    for volume in &spec.volumes {
        let mode = if volume.read_only { "ro" } else { "rw" };
        cmd.arg("-v").arg(format!(
            "{}:{}:{mode}",
            volume.host_path.display(),
            volume.container_path.display()
        ));
    }

    for (key, value) in &spec.env {
        cmd.arg("-e").arg(format!("{key}={value}"));
    }

    cmd.arg(&spec.image);

    Ok(cmd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hangar_config::provider::VolumeMount;
    use std::path::PathBuf;

    fn base_spec() -> ContainerSpec {
        ContainerSpec {
            image: "ghcr.io/example/mcp-fs:latest".to_string(),
            volumes: vec![],
            env: Default::default(),
            network: "none".to_string(),
            memory_max_mb: Some(512),
            cpus: Some(1.0),
            read_only_root: true,
        }
    }

    #[test]
    fn rejects_relative_host_path() {
        let mut spec = base_spec();
        spec.volumes.push(VolumeMount {
            host_path: PathBuf::from("relative/path"),
            container_path: PathBuf::from("/data"),
            read_only: true,
        });
        let err = build_container_command("podman", &spec).unwrap_err();
        assert!(matches!(err, ContainerValidationError::HostPathNotAbsolute(_)));
    }

    #[test]
    fn rejects_blocked_sensitive_path() {
        let mut spec = base_spec();
        spec.volumes.push(VolumeMount {
            host_path: PathBuf::from("/etc/passwd"),
            container_path: PathBuf::from("/data"),
            read_only: true,
        });
        let err = build_container_command("podman", &spec).unwrap_err();
        assert!(matches!(
            err,
            ContainerValidationError::BlockedSensitivePath(_)
        ));
    }

    #[test]
    fn allows_unrelated_absolute_path() {
        let mut spec = base_spec();
        spec.volumes.push(VolumeMount {
            host_path: PathBuf::from("/home/ops/workspace"),
            container_path: PathBuf::from("/workspace"),
            read_only: false,
        });
        assert!(build_container_command("podman", &spec).is_ok());
    }

    #[test]
    fn rejects_empty_image() {
        let mut spec = base_spec();
        spec.image = String::new();
        let err = build_container_command("docker", &spec).unwrap_err();
        assert_eq!(err, ContainerValidationError::EmptyImage);
    }

    #[test]
    fn applies_hardening_flags() {
        let spec = base_spec();
        let cmd = build_container_command("podman", &spec).unwrap();
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect();
        assert!(args.contains(&"--cap-drop=ALL".to_string()));
        assert!(args.contains(&"--security-opt=no-new-privileges".to_string()));
        assert!(args.contains(&"--read-only".to_string()));
        assert!(args.contains(&"--network=none".to_string()));
    }
}
