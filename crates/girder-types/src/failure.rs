use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Failure taxonomy for classified step failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    /// Network, timeout, temporary issues.
    Transient,
    /// Infrastructure, deployment, environment issues.
    Infra,
    /// Test failures, assertions.
    TestAssert,
    /// Code style, formatting issues.
    Lint,
    /// Type checking errors.
    Typecheck,
    /// Security violations, vulnerabilities.
    Security,
    /// Policy violations, permissions.
    Policy,
    /// Runtime errors, exceptions.
    Runtime,
    /// Database schema issues.
    SchemaMigration,
    /// Rate limiting, throttling.
    RateLimit,
    Unknown,
}

impl FailureType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureType::Transient => "transient",
            FailureType::Infra => "infra",
            FailureType::TestAssert => "test_assert",
            FailureType::Lint => "lint",
            FailureType::Typecheck => "typecheck",
            FailureType::Security => "security",
            FailureType::Policy => "policy",
            FailureType::Runtime => "runtime",
            FailureType::SchemaMigration => "schema_migration",
            FailureType::RateLimit => "rate_limit",
            FailureType::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// A classified step failure. Produced deterministically by the classifier;
/// consumed by the auto-fix strategy selector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureSignal {
    #[serde(rename = "type")]
    pub failure_type: FailureType,
    /// Agent or step name the failure came from.
    pub source: String,
    pub message: String,
    pub severity: Severity,
    pub can_retry: bool,
    pub requires_replan: bool,
    #[serde(default)]
    pub evidence: HashMap<String, Value>,
    /// Classifier confidence in `[0, 1]`.
    pub confidence: f64,
}

impl FailureSignal {
    pub fn unknown(source: &str, logs: &str) -> Self {
        let mut evidence = HashMap::new();
        evidence.insert(
            "logs".to_string(),
            Value::String(truncate(logs, 1000).to_string()),
        );
        Self {
            failure_type: FailureType::Unknown,
            source: source.to_string(),
            message: "Unclassified failure".to_string(),
            severity: Severity::Medium,
            can_retry: true,
            requires_replan: false,
            evidence,
            confidence: 0.0,
        }
    }
}

/// A retry delay extracted from failure output, honored up to the
/// orchestrator's backoff clamp.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffHint {
    pub seconds: f64,
    pub source: BackoffHintSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffHintSource {
    RetryAfterHeader,
    RateLimitReset,
}

pub fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_orders_low_to_critical() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::High < Severity::Critical);
    }

    #[test]
    fn unknown_signal_keeps_log_evidence() {
        let signal = FailureSignal::unknown("codegen", "boom");
        assert_eq!(signal.failure_type, FailureType::Unknown);
        assert_eq!(
            signal.evidence.get("logs").and_then(|v| v.as_str()),
            Some("boom")
        );
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("hi", 10), "hi");
    }
}
