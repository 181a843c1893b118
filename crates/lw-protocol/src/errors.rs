//! Error taxonomy shared by every pipeline component.
//!
//! Errors are classified by *kind*, not by origin: a storage failure and a
//! transport failure are both `Operational`, a missing route and an empty
//! downlink queue are both `NotFound`. The kind decides how the caller
//! reacts (retry, broadcast, nack, ignore).

use std::fmt;

use lw_core::CodecError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed or invalid input; not retryable as-is.
    Structural,
    /// Internal, storage or transport failure; possibly transient.
    Operational,
    /// Absence is an expected outcome (no route, empty queue, no MIC match).
    NotFound,
    /// Protocol-level refusal.
    Behavioural,
    /// Deliberately unimplemented feature.
    Implementation,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Structural => "structural",
            ErrorKind::Operational => "operational",
            ErrorKind::NotFound => "not found",
            ErrorKind::Behavioural => "behavioural",
            ErrorKind::Implementation => "implementation",
        };
        f.write_str(s)
    }
}

/// A classified failure. Cloneable so one failure can be fanned out to
/// several waiting callers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[error("{kind} error: {message}")]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn structural(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Structural, message)
    }

    pub fn operational(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Operational, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn behavioural(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Behavioural, message)
    }

    pub fn implementation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Implementation, message)
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ErrorKind::NotFound
    }
}

impl From<CodecError> for Error {
    fn from(e: CodecError) -> Self {
        Error::structural(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_message() {
        let e = Error::not_found("no route");
        assert_eq!(e.to_string(), "not found error: no route");
        assert!(e.is_not_found());
    }

    #[test]
    fn codec_failures_are_structural() {
        let e: Error = CodecError::FOptsTooLong.into();
        assert_eq!(e.kind, ErrorKind::Structural);
    }
}
