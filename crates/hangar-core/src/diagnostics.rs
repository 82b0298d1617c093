//! Launch-failure diagnostics (spec §4.B): "a contract, not an algorithm —
//! any matcher set is acceptable provided these fields are populated when
//! available." Plain substring checks against a handful of known markers
//! are enough here; the patterns are fixed literals, not user-supplied, so
//! no regex engine is warranted.

#[derive(Debug, Clone, serde::Serialize)]
pub struct LaunchDiagnostics {
    pub stderr_tail: String,
    pub exit_code: Option<i32>,
    pub suggestion: Option<String>,
}

pub fn diagnose(stderr_tail: &str, exit_code: Option<i32>) -> LaunchDiagnostics {
    LaunchDiagnostics {
        stderr_tail: stderr_tail.to_string(),
        exit_code,
        suggestion: suggest(stderr_tail, exit_code),
    }
}

fn suggest(stderr_tail: &str, exit_code: Option<i32>) -> Option<String> {
    if stderr_tail.contains("ModuleNotFoundError") || stderr_tail.contains("No module named") {
        return Some(
            "the provider's Python dependencies appear missing; check its venv/requirements"
                .to_string(),
        );
    }
    if stderr_tail.contains("command not found") || stderr_tail.contains("No such file or directory")
    {
        return Some(
            "the configured command was not found on PATH; check the provider's `command` field"
                .to_string(),
        );
    }
    if stderr_tail.contains("EADDRINUSE") || stderr_tail.contains("address already in use") {
        return Some("the provider's bind address is already in use".to_string());
    }
    match exit_code {
        Some(127) => Some("exit 127: command not found or not executable".to_string()),
        Some(137) => Some(
            "exit 137: process was killed (likely OOM or an external SIGKILL); consider raising \
             memory_max_mb"
                .to_string(),
        ),
        Some(126) => Some("exit 126: command found but not executable (check permissions)".to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suggests_missing_module_from_stderr() {
        let d = diagnose("Traceback...\nModuleNotFoundError: No module named 'foo'", Some(1));
        assert!(d.suggestion.unwrap().contains("Python dependencies"));
    }

    #[test]
    fn suggests_from_exit_code_when_stderr_unhelpful() {
        let d = diagnose("", Some(137));
        assert!(d.suggestion.unwrap().contains("killed"));
    }

    #[test]
    fn no_suggestion_when_nothing_matches() {
        let d = diagnose("some unrelated output", Some(1));
        assert!(d.suggestion.is_none());
    }
}
