// ── Completion status ──
//
// Every asynchronous callback from a transport carries one of these.
// Warnings count as success; errors and fatal statuses do not.

use std::fmt;

use serde::Serialize;

/// Severity of a [`Status`].
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize,
    strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "UPPERCASE")]
pub enum StatusType {
    #[default]
    Ok,
    Warning,
    Error,
    Fatal,
}

/// Outcome of one transport exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Status {
    kind: StatusType,
    message: String,
}

impl Status {
    /// A successful status with no message.
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            kind: StatusType::Warning,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: StatusType::Error,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: StatusType::Fatal,
            message: message.into(),
        }
    }

    /// Status reported when a wait gave up before the callback fired.
    pub fn timeout(what: &str, secs: f64) -> Self {
        Self::error(format!("{what} timed out after {secs}s"))
    }

    pub fn kind(&self) -> StatusType {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// `true` for `Ok` and `Warning`.
    pub fn is_ok(&self) -> bool {
        matches!(self.kind, StatusType::Ok | StatusType::Warning)
    }

    /// `true` only for a plain `Ok` with nothing to report.
    pub fn is_success(&self) -> bool {
        self.kind == StatusType::Ok
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}: {}", self.kind, self.message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warning_counts_as_ok() {
        assert!(Status::warning("clipped").is_ok());
        assert!(!Status::warning("clipped").is_success());
        assert!(!Status::error("boom").is_ok());
        assert!(!Status::fatal("boom").is_ok());
    }

    #[test]
    fn display_includes_message() {
        assert_eq!(Status::ok().to_string(), "OK");
        assert_eq!(Status::error("no such record").to_string(), "ERROR: no such record");
    }
}
