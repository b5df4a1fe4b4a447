// Failure classifier: converts raw step output into a typed FailureSignal.
// Classification is a pure function of (step_name, logs, artifacts,
// prior_signals); the same inputs always yield the same signal.

use crate::patterns::{pattern_confidence, PATTERNS};
use girder_types::{truncate, Artifact, FailureSignal, FailureType, Severity};
use serde_json::Value;
use std::collections::HashSet;

/// Minimum final confidence for a pattern match to win; below this the
/// signal is `unknown`.
pub const CONFIDENCE_THRESHOLD: f64 = 0.3;

/// How many distinct failure types in history collapse the signal to
/// `runtime` with a replan request.
const MIXED_TYPES_LIMIT: usize = 3;

#[derive(Default)]
pub struct FailureClassifier;

impl FailureClassifier {
    pub fn new() -> Self {
        Self
    }

    pub fn classify(
        &self,
        step_name: &str,
        logs: &str,
        artifacts: &[Artifact],
        prior_signals: &[FailureSignal],
    ) -> FailureSignal {
        let candidate = self
            .best_pattern_match(step_name, logs, artifacts)
            .unwrap_or_else(|| FailureSignal::unknown(step_name, logs));

        self.apply_rules(candidate, prior_signals)
    }

    fn best_pattern_match(
        &self,
        step_name: &str,
        logs: &str,
        artifacts: &[Artifact],
    ) -> Option<FailureSignal> {
        let mut best: Option<(&'static str, f64, &crate::patterns::PatternTemplate)> = None;
        for template in PATTERNS.iter() {
            let confidence = pattern_confidence(template, logs);
            if confidence > best.map(|(_, c, _)| c).unwrap_or(0.0) {
                best = Some((template.regex.as_str(), confidence, template));
            }
        }

        let (pattern, confidence, template) = best?;
        if confidence < CONFIDENCE_THRESHOLD {
            return None;
        }

        let mut evidence = std::collections::HashMap::new();
        evidence.insert(
            "logs".to_string(),
            Value::String(truncate(logs, 1000).to_string()),
        );
        evidence.insert("pattern".to_string(), Value::String(pattern.to_string()));
        evidence.insert(
            "artifact_count".to_string(),
            Value::from(artifacts.len() as u64),
        );

        Some(FailureSignal {
            failure_type: template.failure_type,
            source: step_name.to_string(),
            message: format!("matched {} pattern", template.failure_type.as_str()),
            severity: template.severity,
            can_retry: template.can_retry,
            requires_replan: template.requires_replan,
            evidence,
            confidence,
        })
    }

    /// Meta-rules applied over the candidate plus history, in order.
    fn apply_rules(&self, candidate: FailureSignal, prior: &[FailureSignal]) -> FailureSignal {
        // Two consecutive unknowns: keep the unknown type but force a replan.
        if candidate.failure_type == FailureType::Unknown
            && prior
                .last()
                .map(|s| s.failure_type == FailureType::Unknown)
                .unwrap_or(false)
        {
            let mut promoted = candidate;
            promoted.requires_replan = true;
            promoted.message = "consecutive unclassified failures".to_string();
            return promoted;
        }

        // Too many distinct failure types: the step is churning, collapse to
        // runtime and replan.
        let mut types: HashSet<FailureType> =
            prior.iter().map(|s| s.failure_type).collect();
        types.insert(candidate.failure_type);
        if types.len() > MIXED_TYPES_LIMIT {
            let mut collapsed = candidate;
            collapsed.failure_type = FailureType::Runtime;
            collapsed.severity = Severity::Medium;
            collapsed.requires_replan = true;
            collapsed.can_retry = true;
            collapsed.message = "mixed failure types across attempts".to_string();
            return collapsed;
        }

        candidate
    }
}
