//! Subprocess command validation (spec §4.B): allow/deny lists and
//! shell-injection pattern rejection. Providers are never launched through a
//! shell, so this exists to reject configuration that *looks* like it is
//! trying to smuggle shell behaviour through an argument vector anyway.

use std::path::Path;

/// Characters that have no legitimate place in a bare argv entry for a
/// provider command or argument; their presence suggests the config author
/// expected shell expansion, which never happens here.
const SHELL_METACHARACTERS: &[char] = &[
    '|', '&', ';', '$', '>', '<', '`', '\n', '\r', '(', ')', '{', '}',
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandValidationError {
    #[error("command `{0}` is not in the configured allow-list")]
    NotAllowed(String),
    #[error("command `{0}` is in the configured deny-list")]
    Denied(String),
    #[error("command `{0}` contains a shell metacharacter; shell invocation is not supported")]
    ShellMetacharacter(String),
    #[error("argument `{0}` contains a shell metacharacter; shell invocation is not supported")]
    ArgShellMetacharacter(String),
    #[error("command must not be empty")]
    Empty,
}

/// Validate a subprocess launch command against the provider's allow/deny
/// lists and the built-in shell-injection check.
///
/// An empty `allow_commands` list means "no allow-list restriction beyond
/// the deny list and metacharacter check" (spec §4.B); a non-empty list is
/// matched against the command's final path component so both bare names
/// (`"node"`) and absolute paths (`"/usr/bin/node"`) can be allow-listed
/// uniformly.
pub fn validate_command(
    command: &str,
    args: &[String],
    allow_commands: &[String],
    deny_commands: &[String],
) -> Result<(), CommandValidationError> {
    if command.is_empty() {
        return Err(CommandValidationError::Empty);
    }
    if let Some(bad) = find_shell_metacharacter(command) {
        return Err(CommandValidationError::ShellMetacharacter(bad.to_string()));
    }
    for arg in args {
        if let Some(bad) = find_shell_metacharacter(arg) {
            return Err(CommandValidationError::ArgShellMetacharacter(bad.to_string()));
        }
    }

    let basename = Path::new(command)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(command);

    if deny_commands
        .iter()
        .any(|denied| denied == command || denied == basename)
    {
        return Err(CommandValidationError::Denied(command.to_string()));
    }

    if !allow_commands.is_empty()
        && !allow_commands
            .iter()
            .any(|allowed| allowed == command || allowed == basename)
    {
        return Err(CommandValidationError::NotAllowed(command.to_string()));
    }

    Ok(())
}

fn find_shell_metacharacter(s: &str) -> Option<String> {
    s.chars()
        .find(|c| SHELL_METACHARACTERS.contains(c))
        .map(|c| c.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_allow_list_permits_anything_not_denied() {
        assert!(validate_command("node", &[], &[], &[]).is_ok());
    }

    #[test]
    fn allow_list_rejects_unlisted_command() {
        let err = validate_command("node", &[], &["python3".to_string()], &[]).unwrap_err();
        assert_eq!(err, CommandValidationError::NotAllowed("node".to_string()));
    }

    #[test]
    fn allow_list_matches_basename_of_absolute_path() {
        assert!(validate_command(
            "/usr/bin/node",
            &[],
            &["node".to_string()],
            &[]
        )
        .is_ok());
    }

    #[test]
    fn deny_list_wins_even_if_allowed() {
        let err = validate_command(
            "node",
            &[],
            &["node".to_string()],
            &["node".to_string()],
        )
        .unwrap_err();
        assert_eq!(err, CommandValidationError::Denied("node".to_string()));
    }

    #[test]
    fn rejects_shell_metacharacters_in_command() {
        let err = validate_command("node; rm -rf /", &[], &[], &[]).unwrap_err();
        assert!(matches!(err, CommandValidationError::ShellMetacharacter(_)));
    }

    #[test]
    fn rejects_shell_metacharacters_in_args() {
        let err = validate_command(
            "node",
            &["$(whoami)".to_string()],
            &[],
            &[],
        )
        .unwrap_err();
        assert!(matches!(
            err,
            CommandValidationError::ArgShellMetacharacter(_)
        ));
    }

    #[test]
    fn rejects_empty_command() {
        assert_eq!(
            validate_command("", &[], &[], &[]).unwrap_err(),
            CommandValidationError::Empty
        );
    }
}
