use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Terminal classification of one relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayOutcome {
    /// Response fully delivered, or tunnel closed by an endpoint
    Completed,
    /// Failed before any response bytes reached the client
    Failed,
    /// Stream error after the response had started; the client side resolved
    /// silently but the failure is still recorded here
    Interrupted,
}

impl RelayOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayOutcome::Completed => "completed",
            RelayOutcome::Failed => "failed",
            RelayOutcome::Interrupted => "interrupted",
        }
    }

    pub fn is_failure(&self) -> bool {
        !matches!(self, RelayOutcome::Completed)
    }
}

impl std::fmt::Display for RelayOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Completion record for one relay, broadcast to subscribers when the relay
/// reaches its terminal outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayRecord {
    pub method: String,
    /// Request target: absolute URL for plain requests, `host:port` for CONNECT
    pub target: String,
    /// Upstream proxy the relay was routed through, credentials redacted
    pub upstream: Option<String>,
    pub outcome: RelayOutcome,
    /// Status sent to the client, or the status that classified the failure
    pub status_code: u16,
    pub error_message: Option<String>,
    /// Bytes written to the upstream side
    pub bytes_sent: u64,
    /// Bytes read from the upstream side
    pub bytes_received: u64,
    pub duration_ms: i64,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_classification() {
        assert!(!RelayOutcome::Completed.is_failure());
        assert!(RelayOutcome::Failed.is_failure());
        assert!(RelayOutcome::Interrupted.is_failure());
        assert_eq!(RelayOutcome::Interrupted.to_string(), "interrupted");
    }

    #[test]
    fn test_record_serializes_outcome_lowercase() {
        let record = RelayRecord {
            method: "GET".to_string(),
            target: "http://example.test/page".to_string(),
            upstream: None,
            outcome: RelayOutcome::Completed,
            status_code: 200,
            error_message: None,
            bytes_sent: 10,
            bytes_received: 20,
            duration_ms: 5,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["outcome"], "completed");
        assert_eq!(json["status_code"], 200);
    }
}
