//! Config validation: charset rules, ranges, and cross-reference checks.

use crate::loader::HangarConfig;
use crate::provider::ProviderMode;
use std::fmt;

const MAX_ID_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    InvalidId { id: String, reason: &'static str },
    DuplicateId(String),
    UnknownGroupMember { group: String, provider: String },
    GroupReferencesMissingMode { provider: String },
    EmptyGroup(String),
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidId { id, reason } => write!(f, "invalid id '{id}': {reason}"),
            Self::DuplicateId(id) => write!(f, "id '{id}' used by both a provider and a group"),
            Self::UnknownGroupMember { group, provider } => write!(
                f,
                "group '{group}' references unknown provider '{provider}'"
            ),
            Self::GroupReferencesMissingMode { provider } => write!(
                f,
                "provider '{provider}' has mode = \"group\" but no matching group entry"
            ),
            Self::EmptyGroup(group) => write!(f, "group '{group}' has no members"),
        }
    }
}

impl std::error::Error for ValidationError {}

/// Validate an id against the shared charset rule from spec ยง3: non-empty,
/// โ‰ค64 chars, `[A-Za-z0-9_-]`.
pub fn validate_id(id: &str) -> Result<(), ValidationError> {
    if id.is_empty() {
        return Err(ValidationError::InvalidId {
            id: id.to_string(),
            reason: "must not be empty",
        });
    }
    if id.len() > MAX_ID_LEN {
        return Err(ValidationError::InvalidId {
            id: id.to_string(),
            reason: "must be at most 64 characters",
        });
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(ValidationError::InvalidId {
            id: id.to_string(),
            reason: "must match [A-Za-z0-9_-]",
        });
    }
    Ok(())
}

/// Validate a whole config document: ids, cross-references, non-empty
/// groups. Returns every violation found rather than stopping at the first.
pub fn validate_config(config: &HangarConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    for id in config.providers.keys() {
        if let Err(e) = validate_id(id) {
            errors.push(e);
        }
        if config.groups.contains_key(id) {
            errors.push(ValidationError::DuplicateId(id.clone()));
        }
    }

    for (group_id, group) in &config.groups {
        if let Err(e) = validate_id(group_id) {
            errors.push(e);
        }
        if group.members.is_empty() {
            errors.push(ValidationError::EmptyGroup(group_id.clone()));
        }
        for member in &group.members {
            if !config.providers.contains_key(&member.provider) {
                errors.push(ValidationError::UnknownGroupMember {
                    group: group_id.clone(),
                    provider: member.provider.clone(),
                });
            }
        }
    }

    for (provider_id, spec) in &config.providers {
        if let ProviderMode::Group { group } = &spec.mode
            && !config.groups.contains_key(group)
        {
            errors.push(ValidationError::GroupReferencesMissingMode {
                provider: provider_id.clone(),
            });
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_valid_ids() {
        assert!(validate_id("math_add-v2").is_ok());
    }

    #[test]
    fn rejects_empty_and_long_and_bad_chars() {
        assert!(validate_id("").is_err());
        assert!(validate_id(&"a".repeat(65)).is_err());
        assert!(validate_id("has space").is_err());
        assert!(validate_id("has/slash").is_err());
    }

    #[test]
    fn flags_unknown_group_member() {
        let raw = r#"{
            "providers": {},
            "groups": { "g": { "id": "g", "members": [{"provider": "missing"}] } }
        }"#;
        let config: HangarConfig = serde_json::from_str(raw).unwrap();
        let errors = validate_config(&config);
        assert!(
            errors
                .iter()
                .any(|e| matches!(e, ValidationError::UnknownGroupMember { .. }))
        );
    }
}
