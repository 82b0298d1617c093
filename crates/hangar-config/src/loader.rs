//! Config document loading: TOML / YAML / JSON, sniffed by extension.

use crate::provider::{
    BatchLimits, ConfigReloadConfig, GroupConfig, HttpBindConfig, ProviderId, ProviderSpec,
    TruncationConfig,
};
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Top-level hangar configuration document (spec ยง6 "Config file").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HangarConfig {
    #[serde(default)]
    pub providers: HashMap<ProviderId, ProviderSpec>,
    #[serde(default)]
    pub groups: HashMap<ProviderId, GroupConfig>,
    #[serde(default)]
    pub config_reload: ConfigReloadConfig,
    #[serde(default)]
    pub batch: BatchLimits,
    #[serde(default)]
    pub truncation: TruncationConfig,
    #[serde(default)]
    pub http: HttpBindConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Yaml,
    Json,
}

impl ConfigFormat {
    pub fn sniff(path: &Path) -> Result<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Ok(Self::Toml),
            Some("yaml") | Some("yml") => Ok(Self::Yaml),
            Some("json") => Ok(Self::Json),
            other => bail!(
                "cannot determine config format from extension {:?} (expected .toml, .yaml, .yml, or .json)",
                other
            ),
        }
    }
}

/// Load and parse a config document, inferring the encoding from the file
/// extension.
pub fn load_path(path: &Path) -> Result<HangarConfig> {
    let format = ConfigFormat::sniff(path)?;
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    load_str(&raw, format).with_context(|| format!("failed to parse config: {}", path.display()))
}

/// Parse a config document already read into memory.
pub fn load_str(raw: &str, format: ConfigFormat) -> Result<HangarConfig> {
    let mut config = match format {
        ConfigFormat::Toml => toml::from_str(raw).context("invalid TOML")?,
        ConfigFormat::Yaml => serde_yaml_like_json(raw).context("invalid YAML")?,
        ConfigFormat::Json => serde_json::from_str(raw).context("invalid JSON")?,
    };
    normalise(&mut config);
    Ok(config)
}

/// The pack's dependency set carries `serde_json` and `toml` universally but
/// not every build enables a YAML crate; accept YAML documents that are also
/// valid JSON (flow-style) and otherwise point the caller at TOML/JSON.
fn serde_yaml_like_json(raw: &str) -> Result<HangarConfig> {
    serde_json::from_str(raw)
        .context("YAML config must currently be flow-style JSON-compatible YAML")
}

fn normalise(config: &mut HangarConfig) {
    for (id, spec) in config.providers.iter_mut() {
        if spec.id.is_empty() {
            spec.id = id.clone();
        }
    }
    for (id, group) in config.groups.iter_mut() {
        if group.id.is_empty() {
            group.id = id.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_minimal_toml() {
        let raw = r#"
            [providers.math]
            mode = "subprocess"
            command = "math-server"
            args = ["--stdio"]
        "#;
        let cfg = load_str(raw, ConfigFormat::Toml).unwrap();
        assert_eq!(cfg.providers.len(), 1);
        assert_eq!(cfg.providers["math"].id, "math");
    }

    #[test]
    fn loads_minimal_json() {
        let raw = r#"{"providers":{"math":{"mode":"subprocess","command":"math-server","args":[]}}}"#;
        let cfg = load_str(raw, ConfigFormat::Json).unwrap();
        assert_eq!(cfg.providers.len(), 1);
    }

    #[test]
    fn defaults_are_applied() {
        let raw = r#"{"providers":{}}"#;
        let cfg = load_str(raw, ConfigFormat::Json).unwrap();
        assert_eq!(cfg.batch.max_batch_size, 100);
        assert_eq!(cfg.truncation.per_call_max_bytes, 10 * 1024 * 1024);
        assert!(cfg.config_reload.enabled);
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let err = ConfigFormat::sniff(Path::new("config.ini")).unwrap_err();
        assert!(err.to_string().contains("extension"));
    }
}
