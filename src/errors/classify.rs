//! Heuristic error classification.
//!
//! [`classify`] is total: every [`GatewayError`] maps to exactly one
//! [`ErrorKind`], falling back to [`ErrorKind::Unknown`] rather than failing.
//! Signals are intentionally heuristic — HTTP status codes where available,
//! message substrings otherwise — and the policy layers decide what to do
//! with each kind.

use std::sync::OnceLock;
use std::time::Duration;

use http::StatusCode;
use regex::Regex;

use crate::errors::GatewayError;

/// Policy-facing failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Momentary upstream hiccup, safe to retry soon
    Transient,
    /// Request or quota limits were hit
    RateLimited,
    /// Connection-level failure
    Network,
    /// A deadline elapsed
    Timeout,
    /// The remote service failed (5xx family)
    ServerError,
    /// The request itself is at fault (4xx family); retrying cannot help
    ClientError,
    /// Structurally unrecoverable: configuration, cleared queues, shutdown
    Permanent,
    /// No recognizable signal
    Unknown,
}

impl ErrorKind {
    /// Label form used to tag metrics and log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ServerError => "server_error",
            ErrorKind::ClientError => "client_error",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Unknown => "unknown",
        }
    }

    /// Default retry posture for this kind.
    ///
    /// `Unknown` is treated optimistically; callers handling
    /// security-sensitive operations should exclude it from their retryable
    /// set (see `RetryConfig::retryable_kinds`).
    pub fn is_retryable_by_default(&self) -> bool {
        matches!(
            self,
            ErrorKind::Transient
                | ErrorKind::RateLimited
                | ErrorKind::Network
                | ErrorKind::Timeout
                | ErrorKind::ServerError
                | ErrorKind::Unknown
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps a failure into the taxonomy. Pure and deterministic.
pub fn classify(error: &GatewayError) -> ErrorKind {
    match error {
        GatewayError::Configuration { .. }
        | GatewayError::QueueCleared { .. }
        | GatewayError::Shutdown { .. }
        | GatewayError::Internal { .. } => ErrorKind::Permanent,
        GatewayError::RateLimited { .. } => ErrorKind::RateLimited,
        GatewayError::Network { .. } => ErrorKind::Network,
        GatewayError::Timeout { .. } => ErrorKind::Timeout,
        GatewayError::Upstream {
            status: Some(code),
            message,
        } => classify_status(*code, message),
        GatewayError::Upstream {
            status: None,
            message,
        }
        | GatewayError::Unknown { message } => classify_message(message),
    }
}

fn classify_status(code: u16, message: &str) -> ErrorKind {
    let status = match StatusCode::from_u16(code) {
        Ok(status) => status,
        Err(_) => return classify_message(message),
    };
    if status == StatusCode::TOO_MANY_REQUESTS {
        ErrorKind::RateLimited
    } else if status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::GATEWAY_TIMEOUT {
        ErrorKind::Timeout
    } else if status == StatusCode::SERVICE_UNAVAILABLE {
        ErrorKind::Transient
    } else if status.is_server_error() {
        ErrorKind::ServerError
    } else if status.is_client_error() {
        ErrorKind::ClientError
    } else {
        classify_message(message)
    }
}

fn classify_message(message: &str) -> ErrorKind {
    let m = message.to_ascii_lowercase();
    if m.contains("rate limit") || m.contains("too many requests") || m.contains("quota") {
        ErrorKind::RateLimited
    } else if m.contains("timed out") || m.contains("timeout") || m.contains("deadline") {
        ErrorKind::Timeout
    } else if m.contains("connection refused")
        || m.contains("connection reset")
        || m.contains("broken pipe")
        || m.contains("host unreachable")
        || m.contains("network unreachable")
        || m.contains("dns")
        || m.contains("failed to lookup")
    {
        ErrorKind::Network
    } else if m.contains("temporarily unavailable")
        || m.contains("service unavailable")
        || m.contains("overloaded")
        || m.contains("try again")
    {
        ErrorKind::Transient
    } else if m.contains("internal server error") || m.contains("bad gateway") {
        ErrorKind::ServerError
    } else if m.contains("bad request")
        || m.contains("unauthorized")
        || m.contains("forbidden")
        || m.contains("not found")
        || m.contains("unprocessable")
    {
        ErrorKind::ClientError
    } else {
        ErrorKind::Unknown
    }
}

/// Extracts a "retry after N seconds" hint from an error message.
pub fn parse_retry_after(message: &str) -> Option<Duration> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let re = PATTERN.get_or_init(|| {
        Regex::new(r"(?i)retry[\s_-]?after[:\s]+(\d+)").expect("retry-after pattern is valid")
    });
    re.captures(message)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(429, "", ErrorKind::RateLimited; "too many requests")]
    #[test_case(408, "", ErrorKind::Timeout; "request timeout")]
    #[test_case(504, "", ErrorKind::Timeout; "gateway timeout")]
    #[test_case(503, "", ErrorKind::Transient; "service unavailable")]
    #[test_case(500, "", ErrorKind::ServerError; "internal server error")]
    #[test_case(502, "", ErrorKind::ServerError; "bad gateway")]
    #[test_case(400, "", ErrorKind::ClientError; "bad request")]
    #[test_case(404, "", ErrorKind::ClientError; "not found")]
    #[test_case(422, "", ErrorKind::ClientError; "unprocessable entity")]
    fn classify_by_status(code: u16, message: &str, expected: ErrorKind) {
        let err = GatewayError::Upstream {
            message: message.to_string(),
            status: Some(code),
        };
        assert_eq!(classify(&err), expected);
    }

    #[test_case("rate limit exceeded", ErrorKind::RateLimited)]
    #[test_case("request quota exhausted for today", ErrorKind::RateLimited)]
    #[test_case("operation timed out after 30s", ErrorKind::Timeout)]
    #[test_case("Connection refused (os error 111)", ErrorKind::Network)]
    #[test_case("connection reset by peer", ErrorKind::Network)]
    #[test_case("failed to lookup address information", ErrorKind::Network)]
    #[test_case("resource temporarily unavailable, try again", ErrorKind::Transient)]
    #[test_case("upstream returned internal server error", ErrorKind::ServerError)]
    #[test_case("forbidden: token lacks scope", ErrorKind::ClientError)]
    #[test_case("something inexplicable happened", ErrorKind::Unknown)]
    fn classify_by_message(message: &str, expected: ErrorKind) {
        let err = GatewayError::Unknown {
            message: message.to_string(),
        };
        assert_eq!(classify(&err), expected);
    }

    #[test]
    fn classification_is_total() {
        // A status outside the valid range falls back to message heuristics,
        // and an empty message lands on Unknown rather than panicking.
        let err = GatewayError::Upstream {
            message: String::new(),
            status: Some(99),
        };
        assert_eq!(classify(&err), ErrorKind::Unknown);
    }

    #[test]
    fn parse_retry_after_variants() {
        assert_eq!(
            parse_retry_after("please retry after 12 seconds"),
            Some(Duration::from_secs(12))
        );
        assert_eq!(
            parse_retry_after("Retry-After: 3"),
            Some(Duration::from_secs(3))
        );
        assert_eq!(parse_retry_after("no hint here"), None);
    }

    #[test]
    fn unknown_is_retryable_by_default() {
        assert!(ErrorKind::Unknown.is_retryable_by_default());
        assert!(!ErrorKind::ClientError.is_retryable_by_default());
        assert!(!ErrorKind::Permanent.is_retryable_by_default());
    }
}
