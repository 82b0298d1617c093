//! Recognised environment variables (spec ยง6) and child-process env
//! sandboxing.

use std::collections::HashMap;

/// Environment variables the hangar binary itself recognises.
#[derive(Debug, Clone, Default)]
pub struct RecognisedEnv {
    /// Container runtime selection: "podman" or "docker".
    pub container_runtime: Option<String>,
    pub rate_limit_per_sec: Option<u32>,
    pub rate_limit_burst: Option<u32>,
    pub http_host: Option<String>,
    pub http_port: Option<u16>,
    pub config_path: Option<String>,
}

/// Read the recognised environment variables from the process environment.
pub fn recognised_env() -> RecognisedEnv {
    RecognisedEnv {
        container_runtime: std::env::var("HANGAR_CONTAINER_RUNTIME").ok(),
        rate_limit_per_sec: std::env::var("HANGAR_RATE_LIMIT_PER_SEC")
            .ok()
            .and_then(|v| v.parse().ok()),
        rate_limit_burst: std::env::var("HANGAR_RATE_LIMIT_BURST")
            .ok()
            .and_then(|v| v.parse().ok()),
        http_host: std::env::var("HANGAR_HTTP_HOST").ok(),
        http_port: std::env::var("HANGAR_HTTP_PORT")
            .ok()
            .and_then(|v| v.parse().ok()),
        config_path: std::env::var("HANGAR_CONFIG").ok(),
    }
}

/// Patterns of environment variable keys considered sensitive. Matched
/// case-insensitively as a substring, mirroring the masking the process
/// sandbox applies before handing an environment to a subprocess child.
const SENSITIVE_KEY_PATTERNS: &[&str] = &["password", "token", "secret", "key", "credential"];

fn is_sensitive_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    SENSITIVE_KEY_PATTERNS
        .iter()
        .any(|pattern| lower.contains(pattern))
}

/// Build the environment a provider child process should inherit: the
/// ambient process environment filtered of sensitive keys, overlaid with the
/// provider's own explicit `env` map (which is never filtered โ€” it was
/// supplied deliberately by the operator).
pub fn filter_child_env(explicit: &HashMap<String, String>) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = std::env::vars()
        .filter(|(key, _)| !is_sensitive_key(key))
        .collect();
    for (key, value) in explicit {
        env.insert(key.clone(), value.clone());
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_sensitive_keys() {
        assert!(is_sensitive_key("AWS_SECRET_ACCESS_KEY"));
        assert!(is_sensitive_key("DB_PASSWORD"));
        assert!(is_sensitive_key("API_TOKEN"));
        assert!(!is_sensitive_key("PATH"));
        assert!(!is_sensitive_key("HOME"));
    }

    #[test]
    fn explicit_env_always_passes_through() {
        let mut explicit = HashMap::new();
        explicit.insert("MY_SECRET_TOKEN".to_string(), "value".to_string());
        let env = filter_child_env(&explicit);
        assert_eq!(env.get("MY_SECRET_TOKEN").map(String::as_str), Some("value"));
    }
}
