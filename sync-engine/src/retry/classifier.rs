//! Error classification for retry decisions.
//!
//! Remote backends report failures as free-form text, so classification is by
//! keyword over the full message (wrapped context included).

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Network,
    Validation,
    Permission,
    Other,
}

const NETWORK_KEYWORDS: &[&str] = &[
    "offline",
    "unavailable",
    "timeout",
    "timed out",
    "deadline-exceeded",
    "aborted",
    "failed to connect",
    "failed-to-connect",
    "network",
    "connection reset",
    "connection refused",
];

const PERMISSION_KEYWORDS: &[&str] = &["permission", "unauthenticated", "unauthorized"];

pub fn classify(error: &Error) -> ErrorClass {
    if error.is_validation() {
        return ErrorClass::Validation;
    }

    let text = error.to_string().to_lowercase();
    if NETWORK_KEYWORDS.iter().any(|k| text.contains(k)) {
        ErrorClass::Network
    } else if PERMISSION_KEYWORDS.iter().any(|k| text.contains(k)) {
        ErrorClass::Permission
    } else {
        ErrorClass::Other
    }
}

pub fn is_network_error(error: &Error) -> bool {
    classify(error) == ErrorClass::Network
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Result, ResultExt};

    #[test]
    fn test_network_keywords() {
        for msg in ["Service Unavailable", "request timed out", "DEADLINE-EXCEEDED", "connection refused"] {
            assert_eq!(classify(&Error::Storage(msg.into())), ErrorClass::Network, "{msg}");
        }
        // the variant name itself appears in the rendered message
        assert_eq!(classify(&Error::Network("boom".into())), ErrorClass::Network);
    }

    #[test]
    fn test_validation_wins_over_text() {
        let err = Error::validation("round", "r1", "network timeout in notes");
        assert_eq!(classify(&err), ErrorClass::Validation);
    }

    #[test]
    fn test_permission_and_other() {
        assert_eq!(classify(&Error::PermissionDenied("nope".into())), ErrorClass::Permission);
        assert_eq!(classify(&Error::Storage("Unauthenticated".into())), ErrorClass::Permission);
        assert_eq!(classify(&Error::NotFound("project p1".into())), ErrorClass::Other);
    }

    #[test]
    fn test_wrapped_context_is_scanned() {
        let err: Result<()> = Err(Error::Storage("disk full".into()));
        let err = err.context("failed to connect to backend").unwrap_err();
        assert!(is_network_error(&err));
    }
}
