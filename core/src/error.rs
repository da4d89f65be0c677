//! All error-related Basecode types. Compilation and execution problems are
//! reported as coded [Diagnostic] messages collected in a [SessionResult];
//! the session marks overall failure on the first error but keeps collecting
//! so the user receives a batch.

use crate::source::SourceLocation;
use serde::Serialize;
use std::fmt::{self, Display, Formatter};
use thiserror::Error;

/// How serious a diagnostic is. Only [Severity::Error] affects the overall
/// success of a session.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Display for Severity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// A single coded message with a source span. The code is one of the stable
/// `P###`/`C###`/`B###` identifiers, so tooling can match on it without
/// parsing the message text.
#[derive(Clone, Debug, Error, Serialize)]
pub struct Diagnostic {
    code: &'static str,
    message: String,
    severity: Severity,
    location: SourceLocation,
}

impl Diagnostic {
    pub fn new(
        code: &'static str,
        message: impl Into<String>,
        severity: Severity,
        location: SourceLocation,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            severity,
            location,
        }
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn location(&self) -> SourceLocation {
        self.location
    }
}

impl Display for Diagnostic {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] at {}: {}",
            self.severity, self.code, self.location, self.message,
        )
    }
}

/// Accumulates diagnostics for one compile session. Phases short-circuit on
/// [SessionResult::is_failed] between steps but generally finish the current
/// element so related errors arrive together.
#[derive(Clone, Debug, Default, Serialize)]
pub struct SessionResult {
    messages: Vec<Diagnostic>,
    failed: bool,
}

impl SessionResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an already-built diagnostic.
    pub fn add(&mut self, diagnostic: Diagnostic) {
        if diagnostic.severity == Severity::Error {
            self.failed = true;
        }
        self.messages.push(diagnostic);
    }

    pub fn info(
        &mut self,
        code: &'static str,
        message: impl Into<String>,
        location: SourceLocation,
    ) {
        self.messages.push(Diagnostic::new(
            code,
            message,
            Severity::Info,
            location,
        ));
    }

    pub fn warning(
        &mut self,
        code: &'static str,
        message: impl Into<String>,
        location: SourceLocation,
    ) {
        self.messages.push(Diagnostic::new(
            code,
            message,
            Severity::Warning,
            location,
        ));
    }

    pub fn error(
        &mut self,
        code: &'static str,
        message: impl Into<String>,
        location: SourceLocation,
    ) {
        self.messages.push(Diagnostic::new(
            code,
            message,
            Severity::Error,
            location,
        ));
        self.failed = true;
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub fn messages(&self) -> &[Diagnostic] {
        &self.messages
    }

    pub fn has_code(&self, code: &str) -> bool {
        self.messages.iter().any(|message| message.code == code)
    }

    pub fn find_code(&self, code: &str) -> Option<&Diagnostic> {
        self.messages.iter().find(|message| message.code == code)
    }
}

impl Display for SessionResult {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for (i, message) in self.messages.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", message)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errors_mark_failure() {
        let mut result = SessionResult::new();
        assert!(!result.is_failed());

        result.warning("P041", "suspicious literal", SourceLocation::default());
        assert!(!result.is_failed());

        result.error("P004", "unresolved identifier", SourceLocation::default());
        assert!(result.is_failed());
        assert!(result.has_code("P004"));
        assert!(result.find_code("P041").is_some());
        assert_eq!(result.messages().len(), 2);
    }
}
