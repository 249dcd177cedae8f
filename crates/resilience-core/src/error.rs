use serde::{Deserialize, Serialize};
use thiserror::Error;

const RETRYABLE_SIGNALS: &[&str] = &[
    "failed to fetch",
    "network",
    "timeout",
    "temporar",
    "rate limit",
    "429",
];

/// Failure reported by a unit of work.
///
/// This is the raw signal handed to [`classify`] and to the retry callbacks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct OperationError {
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message, usually as reported by the remote side.
    pub message: String,
}

impl OperationError {
    /// Construct a new operation error.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl From<&str> for OperationError {
    fn from(message: &str) -> Self {
        Self::new("operation_failed", message)
    }
}

impl From<String> for OperationError {
    fn from(message: String) -> Self {
        Self::new("operation_failed", message)
    }
}

/// Broad outcome category used for user-facing handling and retry behavior.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OutcomeKind {
    /// Account is timed out, muted or banned. Never retried.
    Blocked,
    /// Authorization failure. Never retried.
    Denied,
    /// Network, timeout or rate-limit failure. Retried per backoff policy.
    Transient,
    /// Nothing matched; surfaced as-is.
    Unknown,
}

/// User-facing interpretation of a failed operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OperationOutcome {
    pub kind: OutcomeKind,
    pub title: String,
    pub description: String,
    pub retryable: bool,
}

impl OperationOutcome {
    fn terminal(kind: OutcomeKind, title: String, description: impl Into<String>) -> Self {
        Self {
            kind,
            title,
            description: description.into(),
            retryable: false,
        }
    }
}

/// Map an operation failure to a title, description and retry decision.
///
/// Patterns are matched case-insensitively against the message, first match
/// wins. The order matters: a "timed out" moderation message must never be
/// mistaken for a retryable "timeout".
pub fn classify(operation: &str, error: &OperationError) -> OperationOutcome {
    let message = error.message.to_lowercase();

    if message.contains("timed out") {
        return OperationOutcome::terminal(
            OutcomeKind::Blocked,
            format!("{operation} blocked"),
            "Your account is currently timed out in this server.",
        );
    }
    if message.contains("muted") {
        return OperationOutcome::terminal(
            OutcomeKind::Blocked,
            format!("{operation} blocked"),
            "Your account is currently muted in this server.",
        );
    }
    if message.contains("banned") {
        return OperationOutcome::terminal(
            OutcomeKind::Blocked,
            format!("{operation} blocked"),
            "Your account is banned in this server.",
        );
    }
    if message.contains("row-level security") || message.contains("permission denied") {
        return OperationOutcome::terminal(
            OutcomeKind::Denied,
            format!("{operation} denied"),
            "You do not have permission to do that here.",
        );
    }
    if RETRYABLE_SIGNALS
        .iter()
        .any(|signal| message.contains(signal))
    {
        return OperationOutcome {
            kind: OutcomeKind::Transient,
            title: format!("{operation} delayed"),
            description: format!(
                "{operation} could not reach the server and is queued to retry automatically."
            ),
            retryable: true,
        };
    }

    let description = match error.message.trim() {
        "" => "Unexpected error.".to_owned(),
        raw => raw.to_owned(),
    };
    OperationOutcome::terminal(OutcomeKind::Unknown, format!("{operation} failed"), description)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(message: &str) -> OperationOutcome {
        classify("Send message", &OperationError::from(message))
    }

    #[test]
    fn fetch_failures_are_retryable_and_delayed() {
        let out = outcome("Failed to fetch");
        assert!(out.retryable);
        assert_eq!(out.kind, OutcomeKind::Transient);
        assert!(out.title.contains("delayed"));
    }

    #[test]
    fn row_level_security_is_denied() {
        let out = outcome("new row violates row-level security policy violation");
        assert!(!out.retryable);
        assert_eq!(out.kind, OutcomeKind::Denied);
        assert!(out.title.contains("denied"));
    }

    #[test]
    fn permission_denied_matches_case_insensitively() {
        let out = outcome("PERMISSION DENIED for table messages");
        assert_eq!(out.kind, OutcomeKind::Denied);
    }

    #[test]
    fn timed_out_wins_over_timeout_signal() {
        let out = outcome("User is timed out; request timeout");
        assert_eq!(out.kind, OutcomeKind::Blocked);
        assert!(!out.retryable);
        assert_eq!(
            out.description,
            "Your account is currently timed out in this server."
        );
    }

    #[test]
    fn moderation_checks_run_in_fixed_order() {
        assert_eq!(
            outcome("muted and banned").description,
            "Your account is currently muted in this server."
        );
        assert_eq!(
            outcome("you are banned").description,
            "Your account is banned in this server."
        );
        // Blocked outranks denied.
        assert_eq!(outcome("banned: permission denied").kind, OutcomeKind::Blocked);
    }

    #[test]
    fn every_retryable_signal_is_recognized() {
        for message in [
            "NetworkError when attempting to fetch resource",
            "upstream timeout",
            "Service temporarily unavailable",
            "temporary failure in name resolution",
            "Rate limit exceeded",
            "HTTP 429",
        ] {
            let out = outcome(message);
            assert!(out.retryable, "{message} should be retryable");
            assert_eq!(out.kind, OutcomeKind::Transient);
        }
    }

    #[test]
    fn unknown_errors_echo_the_raw_message() {
        let out = outcome("duplicate key value violates unique constraint");
        assert_eq!(out.kind, OutcomeKind::Unknown);
        assert!(!out.retryable);
        assert_eq!(out.title, "Send message failed");
        assert_eq!(out.description, "duplicate key value violates unique constraint");
    }

    #[test]
    fn empty_message_falls_back_to_generic_description() {
        let out = classify("Upload", &OperationError::new("unknown", "   "));
        assert_eq!(out.kind, OutcomeKind::Unknown);
        assert_eq!(out.description, "Unexpected error.");
    }

    #[test]
    fn display_includes_code_and_message() {
        let err = OperationError::new("send_failed", "boom");
        assert_eq!(err.to_string(), "send_failed: boom");
    }
}
