//! Failure classification for agent output.
//!
//! Pattern-matches the tail of a failed agent run to decide whether the
//! backend rejected the credential or was temporarily unavailable.

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Kind of backend failure recognised in agent output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureClass {
    /// The credential was rejected.
    Authentication,
    /// Rate limiting, server errors or connectivity problems.
    Unavailable,
}

impl FailureClass {
    /// Converts to the matching crate error.
    pub fn into_error(self, message: impl Into<String>) -> Error {
        match self {
            FailureClass::Authentication => Error::Authentication(message.into()),
            FailureClass::Unavailable => Error::BackendUnavailable(message.into()),
        }
    }
}

/// Detects and classifies backend failures from output.
pub struct FailureDetector {
    /// Known patterns for credential rejections (lowercase).
    auth_patterns: Vec<&'static str>,
    /// Known patterns for transient outages (lowercase).
    unavailable_patterns: Vec<&'static str>,
}

impl Default for FailureDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl FailureDetector {
    /// Creates a detector with default patterns.
    pub fn new() -> Self {
        Self {
            auth_patterns: vec![
                "invalid api key",
                "invalid x-api-key",
                "incorrect api key",
                "api key not valid",
                "authentication_error",
                "authentication failed",
                "401 unauthorized",
                "status 401",
                "status code 401",
                "http 401",
                "error code: 401",
                "403 forbidden",
                "permission denied for api key",
            ],
            unavailable_patterns: vec![
                "rate limit",
                "rate_limit",
                "too many requests",
                "status 429",
                "http 429",
                "error code: 429",
                "overloaded",
                "service unavailable",
                "status 503",
                "error code: 503",
                "502 bad gateway",
                "status 502",
                "504 gateway",
                "gateway timeout",
                "internal server error",
                "connection refused",
                "connection reset",
                "econnrefused",
                "econnreset",
                "etimedout",
                "network unreachable",
                "request timed out",
            ],
        }
    }

    /// Analyzes output text for a known failure.
    ///
    /// Authentication patterns win over availability patterns.
    pub fn analyze(&self, text: &str) -> Option<FailureClass> {
        let lower = text.to_lowercase();
        if self.auth_patterns.iter().any(|p| lower.contains(p)) {
            return Some(FailureClass::Authentication);
        }
        if self.unavailable_patterns.iter().any(|p| lower.contains(p)) {
            return Some(FailureClass::Unavailable);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_invalid_api_key() {
        let detector = FailureDetector::new();
        assert_eq!(
            detector.analyze("Error: Invalid API key provided"),
            Some(FailureClass::Authentication)
        );
        assert_eq!(
            detector.analyze("HTTP 401 Unauthorized"),
            Some(FailureClass::Authentication)
        );
    }

    #[test]
    fn detects_transient_outages() {
        let detector = FailureDetector::new();
        assert_eq!(
            detector.analyze("429 Too Many Requests"),
            Some(FailureClass::Unavailable)
        );
        assert_eq!(
            detector.analyze("connect ECONNREFUSED 127.0.0.1:443"),
            Some(FailureClass::Unavailable)
        );
        assert_eq!(
            detector.analyze("API Error: Overloaded"),
            Some(FailureClass::Unavailable)
        );
    }

    #[test]
    fn ignores_ordinary_errors() {
        let detector = FailureDetector::new();
        assert_eq!(detector.analyze("SyntaxError: unexpected token"), None);
    }

    #[test]
    fn bare_status_digits_are_not_failures() {
        let detector = FailureDetector::new();
        assert_eq!(detector.analyze("compiled 4012 files"), None);
        assert_eq!(detector.analyze("listening on port 5030"), None);
        assert_eq!(detector.analyze("processed 1429 rows in 5043ms"), None);
        assert_eq!(detector.analyze("test integration::slow timed out"), None);
    }

    #[test]
    fn status_codes_with_context_are_classified() {
        let detector = FailureDetector::new();
        assert_eq!(
            detector.analyze("request failed with status 401"),
            Some(FailureClass::Authentication)
        );
        assert_eq!(
            detector.analyze("API error code: 503"),
            Some(FailureClass::Unavailable)
        );
        assert_eq!(
            detector.analyze("upstream: 504 Gateway Timeout"),
            Some(FailureClass::Unavailable)
        );
    }

    #[test]
    fn failure_class_maps_to_errors() {
        assert!(matches!(
            FailureClass::Authentication.into_error("bad key"),
            Error::Authentication(_)
        ));
        assert!(matches!(
            FailureClass::Unavailable.into_error("503"),
            Error::BackendUnavailable(_)
        ));
    }
}
