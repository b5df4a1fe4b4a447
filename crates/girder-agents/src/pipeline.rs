// Stage selection: which roles run for which task type, in order.
// The auto-fixer is not part of any static path; it is invoked from the
// orchestrator's failure-handling subroutine.

use crate::contract::AgentRole;
use girder_types::TaskType;

/// Stage path for a single task node.
pub fn stages_for(task_type: TaskType) -> &'static [AgentRole] {
    match task_type {
        TaskType::CreateFile
        | TaskType::CreateDirectory
        | TaskType::GenerateModule
        | TaskType::CreateSchema
        | TaskType::SetupRepo => &[AgentRole::Codegen, AgentRole::Evaluator, AgentRole::Devops],
        TaskType::CreateTest => &[AgentRole::Codegen, AgentRole::Evaluator],
        TaskType::RunAcceptance => &[AgentRole::Evaluator],
    }
}

/// Stage path for a full-plan build, wrapped around the per-node paths:
/// the leading stages run once before the first step, the codegen and
/// evaluator core runs per node via [`stages_for`], and the trailing
/// stages close the build out.
pub const FULL_BUILD_STAGES: &[AgentRole] = &[
    AgentRole::Architect,
    AgentRole::Designer,
    AgentRole::Security,
    AgentRole::Codegen,
    AgentRole::Evaluator,
    AgentRole::Devops,
    AgentRole::Reviewer,
];

/// Full-build stages that run once before any step executes.
pub fn full_build_prelude() -> &'static [AgentRole] {
    &FULL_BUILD_STAGES[..3]
}

/// Full-build stages that run once after every step has succeeded.
pub fn full_build_postlude() -> &'static [AgentRole] {
    &FULL_BUILD_STAGES[5..]
}

/// The action name a role answers to in this pipeline.
pub fn action_for(role: AgentRole) -> &'static str {
    match role {
        AgentRole::Architect => "draft_requirements",
        AgentRole::Designer => "outline_design",
        AgentRole::Security => "review",
        AgentRole::Codegen => "generate",
        AgentRole::Evaluator => "evaluate",
        AgentRole::AutoFixer => "generate_fix",
        AgentRole::Devops => "package",
        AgentRole::Reviewer => "finalize",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nodes_skip_devops() {
        assert_eq!(
            stages_for(TaskType::CreateTest),
            &[AgentRole::Codegen, AgentRole::Evaluator]
        );
    }

    #[test]
    fn acceptance_runs_evaluator_only() {
        assert_eq!(stages_for(TaskType::RunAcceptance), &[AgentRole::Evaluator]);
    }

    #[test]
    fn file_nodes_end_at_devops() {
        let stages = stages_for(TaskType::CreateFile);
        assert_eq!(stages.last(), Some(&AgentRole::Devops));
    }

    #[test]
    fn full_build_path_starts_with_architect_and_ends_with_reviewer() {
        assert_eq!(FULL_BUILD_STAGES.first(), Some(&AgentRole::Architect));
        assert_eq!(FULL_BUILD_STAGES.last(), Some(&AgentRole::Reviewer));
    }

    #[test]
    fn prelude_core_and_postlude_partition_the_full_build_path() {
        let mut reassembled = full_build_prelude().to_vec();
        reassembled.extend_from_slice(stages_for(TaskType::CreateFile));
        reassembled.extend_from_slice(full_build_postlude());
        // Devops runs both per step and at close-out; dedup the seam.
        reassembled.dedup();
        assert_eq!(reassembled, FULL_BUILD_STAGES);

        assert!(!full_build_prelude().contains(&AgentRole::Codegen));
        assert_eq!(full_build_postlude().first(), Some(&AgentRole::Devops));
    }
}
