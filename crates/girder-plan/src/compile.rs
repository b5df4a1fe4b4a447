// Plan compiler: spec input to versioned, immutable plans.

use crate::parser::PlanParser;
use girder_types::{new_plan_id, Plan, Result, Spec, TaskGraph, TaskType};
use serde_json::Value;
use std::collections::BTreeMap;
use std::collections::HashSet;

/// Carried from the auto-fixer into a replan: what went wrong and what the
/// next plan version should address.
#[derive(Debug, Clone, Default)]
pub struct ReplanRequest {
    pub delta_goal: String,
    pub recommendations: Vec<String>,
    pub failed_task_ids: Vec<String>,
}

#[derive(Default)]
pub struct PlanCompiler {
    parser: PlanParser,
}

impl PlanCompiler {
    pub fn new() -> Self {
        Self {
            parser: PlanParser::new(),
        }
    }

    /// Compile version 1 of a plan from a spec.
    pub fn compile(&self, spec: &Spec) -> Result<Plan> {
        let graph = self.parser.parse(&spec.plan_input())?;
        let risk_score = risk_score(&graph);
        let summary = summarize(&graph);
        let diff_preview = graph
            .nodes
            .iter()
            .map(|n| format!("+ {} ({})", n.task_id, n.task_type.as_str()))
            .collect::<Vec<_>>()
            .join("\n");

        Ok(Plan {
            id: new_plan_id(),
            spec_id: spec.id.clone(),
            version: 1,
            graph,
            risk_score,
            summary,
            diff_preview,
            original_plan_id: None,
            created_at: chrono::Utc::now(),
        })
    }

    /// Produce the next plan version for a replan. The graph is recompiled
    /// from the spec with the delta goal folded into its metadata; the new
    /// plan links to its predecessor and never mutates it.
    pub fn replan(&self, spec: &Spec, prior: &Plan, request: &ReplanRequest) -> Result<Plan> {
        let mut graph = self.parser.parse(&spec.plan_input())?;
        graph
            .metadata
            .insert("delta_goal".into(), Value::String(request.delta_goal.clone()));
        if !request.recommendations.is_empty() {
            graph.metadata.insert(
                "recommendations".into(),
                Value::Array(
                    request
                        .recommendations
                        .iter()
                        .map(|r| Value::String(r.clone()))
                        .collect(),
                ),
            );
        }

        // Replans address instability: rate the new version at least as
        // risky as its predecessor.
        let risk_score = risk_score(&graph).max(prior.risk_score).min(1.0);
        let summary = format!(
            "v{} replan of {}: {}",
            prior.version + 1,
            prior.id,
            request.delta_goal
        );
        let diff_preview = diff_preview(&prior.graph, &graph);

        Ok(Plan {
            id: new_plan_id(),
            spec_id: spec.id.clone(),
            version: prior.version + 1,
            graph,
            risk_score,
            summary,
            diff_preview,
            original_plan_id: Some(prior.id.clone()),
            created_at: chrono::Utc::now(),
        })
    }
}

/// Estimated execution risk in [0, 1]: graph size, schema work, and the
/// absence of tests all push the score up.
fn risk_score(graph: &TaskGraph) -> f64 {
    let size_term = (graph.len() as f64 * 0.03).min(0.5);
    let has_schema = graph
        .nodes
        .iter()
        .any(|n| n.task_type == TaskType::CreateSchema);
    let has_tests = graph.nodes.iter().any(|n| {
        matches!(
            n.task_type,
            TaskType::CreateTest | TaskType::RunAcceptance
        )
    });
    let mut score = 0.1 + size_term;
    if has_schema {
        score += 0.15;
    }
    if !has_tests {
        score += 0.2;
    }
    score.clamp(0.0, 1.0)
}

fn summarize(graph: &TaskGraph) -> String {
    let mut counts: BTreeMap<&'static str, usize> = BTreeMap::new();
    for node in &graph.nodes {
        *counts.entry(node.task_type.as_str()).or_insert(0) += 1;
    }
    let breakdown = counts
        .iter()
        .map(|(ty, count)| format!("{} {}", count, ty))
        .collect::<Vec<_>>()
        .join(", ");
    format!("{} tasks: {}", graph.len(), breakdown)
}

fn diff_preview(prior: &TaskGraph, next: &TaskGraph) -> String {
    let prior_ids: HashSet<&str> = prior.nodes.iter().map(|n| n.task_id.as_str()).collect();
    let next_ids: HashSet<&str> = next.nodes.iter().map(|n| n.task_id.as_str()).collect();

    let mut lines = Vec::new();
    for node in &next.nodes {
        if !prior_ids.contains(node.task_id.as_str()) {
            lines.push(format!("+ {} ({})", node.task_id, node.task_type.as_str()));
        }
    }
    for node in &prior.nodes {
        if !next_ids.contains(node.task_id.as_str()) {
            lines.push(format!("- {} ({})", node.task_id, node.task_type.as_str()));
        }
    }
    if lines.is_empty() {
        "unchanged graph; retrying with revised guidance".to_string()
    } else {
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use girder_types::{SpecMode, TenantId};

    fn spec(description: &str) -> Spec {
        Spec::new(
            TenantId::new("acme"),
            "test".into(),
            SpecMode::Freeform,
            description.into(),
        )
    }

    #[test]
    fn compile_produces_version_one() {
        let plan = PlanCompiler::new().compile(&spec("hello world")).unwrap();
        assert_eq!(plan.version, 1);
        assert!(plan.original_plan_id.is_none());
        assert_eq!(plan.graph.len(), 2);
        assert!(plan.risk_score > 0.0 && plan.risk_score <= 1.0);
        assert!(plan.summary.contains("2 tasks"));
        assert!(plan.diff_preview.contains("+ create_dir_hello"));
    }

    #[test]
    fn replan_links_to_prior_and_bumps_version() {
        let compiler = PlanCompiler::new();
        let spec = spec("hello world");
        let v1 = compiler.compile(&spec).unwrap();
        let v2 = compiler
            .replan(
                &spec,
                &v1,
                &ReplanRequest {
                    delta_goal: "address repeated unknown failures".into(),
                    recommendations: vec!["retry with simpler content".into()],
                    failed_task_ids: vec!["create_file_hello_main".into()],
                },
            )
            .unwrap();

        assert_eq!(v2.version, 2);
        assert_eq!(v2.original_plan_id.as_deref(), Some(v1.id.as_str()));
        assert!(v2.risk_score >= v1.risk_score);
        assert!(v2
            .graph
            .metadata
            .get("delta_goal")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .contains("unknown failures"));
    }

    #[test]
    fn missing_tests_raise_risk() {
        let compiler = PlanCompiler::new();
        let with_tests = compiler
            .compile(&spec(
                "# Generators\nmodule renderer\n# Acceptance Criteria\n- renderer emits files\n",
            ))
            .unwrap();
        let without_tests = compiler
            .compile(&spec("# Generators\nmodule renderer\n"))
            .unwrap();
        assert!(without_tests.risk_score > with_tests.risk_score);
    }
}
