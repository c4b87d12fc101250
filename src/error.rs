//! Error taxonomy for the upstream and storage boundaries.
//!
//! Both enums are absorbed at the scheduler boundary: they are logged and
//! recorded in job status, never surfaced to readers of derived views.

use thiserror::Error;

/// Failures talking to the upstream telemetry integrator.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The call exceeded its per-call deadline and was aborted.
    #[error("upstream call '{endpoint}' timed out after {timeout_ms} ms")]
    Timeout { endpoint: &'static str, timeout_ms: u64 },

    /// Non-2xx response other than an authentication rejection.
    #[error("upstream returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// Credentials rejected, after the single re-authentication retry where applicable.
    #[error("upstream authentication failed: {0}")]
    Auth(String),

    #[error("upstream transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// A 2xx response whose body does not match the expected envelope.
    #[error("malformed upstream payload: {0}")]
    Malformed(String),

    /// The envelope reported `success: false`.
    #[error("upstream rejected the request: {0}")]
    Rejected(String),

    #[error("upstream client misconfigured: {0}")]
    Config(String),
}

/// Failures writing to or introspecting the durable store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Table metadata could not be read or lists no columns. Degraded, not fatal.
    #[error("schema unavailable for table '{table}': {reason}")]
    SchemaUnavailable { table: String, reason: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid SQL identifier '{0}'")]
    InvalidIdentifier(String),
}

/// Maximum number of body bytes kept in an error message.
const MAX_BODY_CHARS: usize = 512;

/// Truncate a response body for inclusion in an error or log line.
pub fn truncate_body(body: &str) -> String {
    // ---
    if body.chars().count() <= MAX_BODY_CHARS {
        return body.to_string();
    }
    let mut cut: String = body.chars().take(MAX_BODY_CHARS).collect();
    cut.push('…');
    cut
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_body() {
        assert_eq!(truncate_body("short"), "short");
        let long = "x".repeat(2_000);
        assert_eq!(truncate_body(&long).chars().count(), MAX_BODY_CHARS + 1);
    }

    #[test]
    fn test_error_messages() {
        let e = UpstreamError::Http {
            status: 502,
            body: "bad gateway".to_string(),
        };
        assert_eq!(e.to_string(), "upstream returned HTTP 502: bad gateway");

        let e = StoreError::SchemaUnavailable {
            table: "fatigue_event_history".to_string(),
            reason: "no columns".to_string(),
        };
        assert!(e.to_string().contains("fatigue_event_history"));
    }
}
