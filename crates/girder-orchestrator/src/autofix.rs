// Auto-fix strategy selector. Pure: consumes a signal plus retry state and
// returns a decision; all commits are the orchestrator's job.

use girder_classify::{BackoffPolicy, MAX_BACKOFF_SECONDS};
use girder_plan::ReplanRequest;
use girder_types::{AutoFixOutcome, BackoffHint, FailureSignal, FailureType, RetryState, Severity};

/// Types mended by a category-specific fix generator.
const PATCH_TYPES: &[FailureType] = &[FailureType::Lint, FailureType::Typecheck];

/// Types always deferred to a human.
const ESCALATE_TYPES: &[FailureType] = &[
    FailureType::Security,
    FailureType::Policy,
    FailureType::SchemaMigration,
];

/// Types retried with backoff.
const RETRY_TYPES: &[FailureType] = &[FailureType::Transient, FailureType::RateLimit];

#[derive(Debug, Clone)]
pub struct FixDecision {
    pub outcome: AutoFixOutcome,
    pub strategy_name: String,
    /// Sleep before the next execution, for `retried` outcomes.
    pub backoff_seconds: f64,
    /// Set for `replanned` outcomes.
    pub re_plan_request: Option<ReplanRequest>,
}

/// First match wins, in rule order:
/// give up, replan, total budget, step budget, retry, patch, escalate,
/// generic patch.
pub fn select_strategy(
    signal: &FailureSignal,
    history: &[FailureSignal],
    retry_state: &RetryState,
    step_id: &str,
    hint: Option<BackoffHint>,
    policy: &BackoffPolicy,
) -> FixDecision {
    // Rule 1: unrecoverable. Critical severity always gives up; so does a
    // signal that cannot be retried, replanned, patched, or escalated.
    let has_dedicated_strategy = PATCH_TYPES.contains(&signal.failure_type)
        || ESCALATE_TYPES.contains(&signal.failure_type)
        || RETRY_TYPES.contains(&signal.failure_type);
    if signal.severity == Severity::Critical
        || (!signal.can_retry && !signal.requires_replan && !has_dedicated_strategy)
    {
        return FixDecision {
            outcome: AutoFixOutcome::GaveUp,
            strategy_name: "unrecoverable".to_string(),
            backoff_seconds: 0.0,
            re_plan_request: None,
        };
    }

    // Rule 2: the classifier asked for a new plan.
    if signal.requires_replan {
        return FixDecision {
            outcome: AutoFixOutcome::Replanned,
            strategy_name: "replan".to_string(),
            backoff_seconds: 0.0,
            re_plan_request: Some(replan_request_from(signal, history, step_id)),
        };
    }

    // Rules 3 and 4: attempt budgets defer to a human.
    if retry_state.total_attempts >= retry_state.max_total_attempts {
        return FixDecision {
            outcome: AutoFixOutcome::Escalated,
            strategy_name: "total_attempt_budget".to_string(),
            backoff_seconds: 0.0,
            re_plan_request: None,
        };
    }
    if retry_state.step_attempts(step_id) >= retry_state.max_per_step_attempts {
        return FixDecision {
            outcome: AutoFixOutcome::Escalated,
            strategy_name: "step_attempt_budget".to_string(),
            backoff_seconds: 0.0,
            re_plan_request: None,
        };
    }

    // Rule 5: transient and rate-limited failures sleep and retry.
    if RETRY_TYPES.contains(&signal.failure_type) {
        let attempt = retry_state.step_attempts(step_id).max(1);
        let backoff = policy
            .delay_seconds(attempt, hint)
            .clamp(0.0, MAX_BACKOFF_SECONDS);
        return FixDecision {
            outcome: AutoFixOutcome::Retried,
            strategy_name: "backoff_retry".to_string(),
            backoff_seconds: backoff,
            re_plan_request: None,
        };
    }

    // Rule 6: category fix generators.
    if PATCH_TYPES.contains(&signal.failure_type) {
        return FixDecision {
            outcome: AutoFixOutcome::PatchApplied,
            strategy_name: format!("patch_{}", signal.failure_type.as_str()),
            backoff_seconds: 0.0,
            re_plan_request: None,
        };
    }

    // Rule 7: sensitive categories always get a human.
    if ESCALATE_TYPES.contains(&signal.failure_type) {
        return FixDecision {
            outcome: AutoFixOutcome::Escalated,
            strategy_name: format!("escalate_{}", signal.failure_type.as_str()),
            backoff_seconds: 0.0,
            re_plan_request: None,
        };
    }

    // Rule 8: everything else gets the generic patch generator.
    FixDecision {
        outcome: AutoFixOutcome::PatchApplied,
        strategy_name: "patch_generic".to_string(),
        backoff_seconds: 0.0,
        re_plan_request: None,
    }
}

fn replan_request_from(
    signal: &FailureSignal,
    history: &[FailureSignal],
    step_id: &str,
) -> ReplanRequest {
    let mut recommendations: Vec<String> = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for s in history.iter().chain(std::iter::once(signal)) {
        let rec = match s.failure_type {
            FailureType::Unknown => "simplify the failing task".to_string(),
            other => format!("address repeated {} failures", other.as_str()),
        };
        if seen.insert(rec.clone()) {
            recommendations.push(rec);
        }
    }

    ReplanRequest {
        delta_goal: format!("revise plan after failure in step {}", step_id),
        recommendations,
        failed_task_ids: vec![step_id.to_string()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn signal(failure_type: FailureType, severity: Severity, can_retry: bool) -> FailureSignal {
        FailureSignal {
            failure_type,
            source: "step".into(),
            message: "test".into(),
            severity,
            can_retry,
            requires_replan: false,
            evidence: HashMap::new(),
            confidence: 0.8,
        }
    }

    fn state() -> RetryState {
        RetryState::default()
    }

    fn decide(sig: &FailureSignal, rs: &RetryState) -> FixDecision {
        select_strategy(sig, &[], rs, "step_1", None, &BackoffPolicy::default())
    }

    #[test]
    fn critical_severity_gives_up() {
        let sig = signal(FailureType::Security, Severity::Critical, false);
        assert_eq!(decide(&sig, &state()).outcome, AutoFixOutcome::GaveUp);
    }

    #[test]
    fn unpatchable_non_retryable_gives_up() {
        let sig = signal(FailureType::TestAssert, Severity::Medium, false);
        assert_eq!(decide(&sig, &state()).outcome, AutoFixOutcome::GaveUp);
    }

    #[test]
    fn replan_flag_wins_over_budgets() {
        let mut sig = signal(FailureType::Unknown, Severity::Medium, true);
        sig.requires_replan = true;
        let mut rs = state();
        rs.total_attempts = 10;
        let decision = decide(&sig, &rs);
        assert_eq!(decision.outcome, AutoFixOutcome::Replanned);
        let request = decision.re_plan_request.unwrap();
        assert_eq!(request.failed_task_ids, vec!["step_1".to_string()]);
        assert!(!request.recommendations.is_empty());
    }

    #[test]
    fn total_budget_escalates() {
        let sig = signal(FailureType::Transient, Severity::Low, true);
        let mut rs = state();
        rs.total_attempts = rs.max_total_attempts;
        let decision = decide(&sig, &rs);
        assert_eq!(decision.outcome, AutoFixOutcome::Escalated);
        assert_eq!(decision.strategy_name, "total_attempt_budget");
    }

    #[test]
    fn step_budget_escalates_at_cap() {
        let sig = signal(FailureType::Unknown, Severity::Medium, true);
        let mut rs = state();
        rs.per_step_attempts.insert("step_1".into(), 3);
        rs.total_attempts = 3;
        let decision = decide(&sig, &rs);
        assert_eq!(decision.outcome, AutoFixOutcome::Escalated);
        assert_eq!(decision.strategy_name, "step_attempt_budget");
    }

    #[test]
    fn transient_retries_with_bounded_backoff() {
        let sig = signal(FailureType::Transient, Severity::Low, true);
        let mut rs = state();
        rs.per_step_attempts.insert("step_1".into(), 1);
        rs.total_attempts = 1;
        let decision = decide(&sig, &rs);
        assert_eq!(decision.outcome, AutoFixOutcome::Retried);
        assert!(decision.backoff_seconds <= 4.0);
    }

    #[test]
    fn rate_limit_honors_hint_up_to_clamp() {
        let sig = signal(FailureType::RateLimit, Severity::Low, true);
        let decision = select_strategy(
            &sig,
            &[],
            &state(),
            "step_1",
            Some(BackoffHint {
                seconds: 7.0,
                source: girder_types::BackoffHintSource::RetryAfterHeader,
            }),
            &BackoffPolicy::default(),
        );
        assert_eq!(decision.outcome, AutoFixOutcome::Retried);
        assert!(decision.backoff_seconds >= 7.0 * 0.8);
        assert!(decision.backoff_seconds <= 7.0 * 1.2);
    }

    #[test]
    fn lint_and_typecheck_get_category_patches() {
        let lint = signal(FailureType::Lint, Severity::Low, false);
        let decision = decide(&lint, &state());
        assert_eq!(decision.outcome, AutoFixOutcome::PatchApplied);
        assert_eq!(decision.strategy_name, "patch_lint");

        let ty = signal(FailureType::Typecheck, Severity::Medium, false);
        assert_eq!(decide(&ty, &state()).outcome, AutoFixOutcome::PatchApplied);
    }

    #[test]
    fn sensitive_types_escalate() {
        for ft in [
            FailureType::Security,
            FailureType::Policy,
            FailureType::SchemaMigration,
        ] {
            let sig = signal(ft, Severity::High, false);
            assert_eq!(decide(&sig, &state()).outcome, AutoFixOutcome::Escalated);
        }
    }

    #[test]
    fn unknown_falls_through_to_generic_patch() {
        let sig = signal(FailureType::Unknown, Severity::Medium, true);
        let decision = decide(&sig, &state());
        assert_eq!(decision.outcome, AutoFixOutcome::PatchApplied);
        assert_eq!(decision.strategy_name, "patch_generic");
    }
}
