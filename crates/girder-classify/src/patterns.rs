// Classification pattern tables. Consulted in order; each pattern carries
// the signal template applied when it wins.

use girder_types::{FailureType, Severity};
use once_cell::sync::Lazy;
use regex::Regex;

pub struct PatternTemplate {
    pub failure_type: FailureType,
    pub regex: Regex,
    /// Number of `|` alternatives; more alternatives means a less specific
    /// pattern and a lower confidence ceiling.
    pub alternatives: usize,
    pub severity: Severity,
    pub can_retry: bool,
    pub requires_replan: bool,
}

fn template(
    failure_type: FailureType,
    pattern: &str,
    severity: Severity,
    can_retry: bool,
) -> PatternTemplate {
    let alternatives = pattern.split('|').count();
    // Static table entries; an invalid pattern is a programming error caught
    // by the table test below.
    let regex = Regex::new(&format!("(?i){}", pattern))
        .unwrap_or_else(|e| panic!("bad classifier pattern {:?}: {}", pattern, e));
    PatternTemplate {
        failure_type,
        regex,
        alternatives,
        severity,
        can_retry,
        requires_replan: false,
    }
}

/// Ordered pattern table. Earlier rows win ties on confidence.
pub static PATTERNS: Lazy<Vec<PatternTemplate>> = Lazy::new(|| {
    use FailureType::*;
    use Severity::*;
    vec![
        // Transient: network, timeout, temporary issues.
        template(
            Transient,
            r"Connection.*timeout|timeout.*error|Connection.*refused|timeout.*after",
            Low,
            true,
        ),
        template(Transient, r"Network.*unreachable|DNS.*resolution.*failed", Low, true),
        template(
            Transient,
            r"Temporary.*failure|Service.*unavailable.*temporarily",
            Low,
            true,
        ),
        // Infra: deployment and environment.
        template(Infra, r"docker.*error|container.*failed|deployment.*failed", Medium, true),
        template(Infra, r"kubernetes.*error|pod.*failed|service.*unavailable", Medium, true),
        template(
            Infra,
            r"disk.*full|memory.*exhausted|resource.*quota.*exceeded",
            High,
            true,
        ),
        // Test assertions.
        template(
            TestAssert,
            r"AssertionError|assertion.*failed|test.*failed|FAILED",
            Medium,
            false,
        ),
        template(
            TestAssert,
            r"expected.*but.*got|actual.*does.*not.*equal.*expected",
            Medium,
            false,
        ),
        // Lint and formatting.
        template(Lint, r"E\d{3}|W\d{3}|F\d{3}", Low, false),
        template(Lint, r"clippy.*warning|rustfmt.*error|formatting.*error", Low, false),
        // Type checking.
        template(Typecheck, r"type.*mismatch|type.*error|TypeError", Medium, false),
        template(Typecheck, r"incompatible.*type|type.*annotation.*error", Medium, false),
        // Security.
        template(Security, r"security.*vulnerability|CVE-\d{4}-\d+", High, false),
        template(Security, r"injection.*attack|XSS|CSRF|SQL.*injection", Critical, false),
        // Policy.
        template(Policy, r"permission.*denied|access.*denied|forbidden", High, false),
        template(Policy, r"policy.*violation|compliance.*error", Medium, false),
        // Runtime.
        template(Runtime, r"RuntimeError|Exception.*occurred|Error.*occurred", Medium, false),
        template(Runtime, r"ImportError|ModuleNotFoundError|NameError", Medium, false),
        template(Runtime, r"SyntaxError|IndentationError|unexpected token", Medium, false),
        // Schema migrations.
        template(
            SchemaMigration,
            r"migration.*failed|schema.*error|alembic.*error",
            High,
            false,
        ),
        template(
            SchemaMigration,
            r"table.*does.*not.*exist|column.*does.*not.*exist",
            High,
            false,
        ),
        template(
            SchemaMigration,
            r"foreign.*key.*constraint|integrity.*error",
            High,
            false,
        ),
        // Rate limiting.
        template(RateLimit, r"429|HTTPError.*429|Too.*Many.*Requests", Low, true),
        template(RateLimit, r"quota.*exceeded|throttling.*error", Low, true),
        template(RateLimit, r"Retry-After|X-RateLimit-Remaining.*0", Low, true),
    ]
});

/// Confidence for one pattern against a log body.
///
/// Base confidence grows with match count and is discounted by alternation
/// complexity: `min(0.9, 0.5 + matches * 0.1) * max(0.5, 1 - alts * 0.1)`.
pub fn pattern_confidence(template: &PatternTemplate, logs: &str) -> f64 {
    let matches = template.regex.find_iter(logs).count();
    if matches == 0 {
        return 0.0;
    }
    let base = (0.5 + matches as f64 * 0.1).min(0.9);
    let complexity_factor = (1.0 - template.alternatives as f64 * 0.1).max(0.5);
    base * complexity_factor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_compiles_and_covers_every_type_except_unknown() {
        let covered: std::collections::HashSet<_> =
            PATTERNS.iter().map(|p| p.failure_type).collect();
        for ty in [
            FailureType::Transient,
            FailureType::Infra,
            FailureType::TestAssert,
            FailureType::Lint,
            FailureType::Typecheck,
            FailureType::Security,
            FailureType::Policy,
            FailureType::Runtime,
            FailureType::SchemaMigration,
            FailureType::RateLimit,
        ] {
            assert!(covered.contains(&ty), "no pattern covers {:?}", ty);
        }
        assert!(!covered.contains(&FailureType::Unknown));
    }

    #[test]
    fn confidence_grows_with_matches_and_shrinks_with_alternatives() {
        let narrow = template(FailureType::Runtime, "RuntimeError", Severity::Medium, false);
        let wide = template(
            FailureType::Runtime,
            "RuntimeError|a|b|c|d|e|f|g|h",
            Severity::Medium,
            false,
        );
        let single = pattern_confidence(&narrow, "RuntimeError");
        let double = pattern_confidence(&narrow, "RuntimeError ... RuntimeError");
        assert!(double > single);
        assert!(pattern_confidence(&wide, "RuntimeError") < single);
    }

    #[test]
    fn no_match_is_zero_confidence() {
        let t = template(FailureType::Runtime, "RuntimeError", Severity::Medium, false);
        assert_eq!(pattern_confidence(&t, "all good"), 0.0);
    }
}
