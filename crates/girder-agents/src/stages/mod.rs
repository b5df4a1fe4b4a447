mod architect;
mod auto_fixer;
mod codegen;
mod designer;
mod devops;
mod evaluator;
mod reviewer;
mod security;

pub use architect::ArchitectAgent;
pub use auto_fixer::AutoFixerAgent;
pub use codegen::CodegenAgent;
pub use designer::DesignerAgent;
pub use devops::DevopsAgent;
pub use evaluator::EvaluatorAgent;
pub use reviewer::ReviewerAgent;
pub use security::SecurityAgent;

use crate::context::AgentContext;
use girder_types::{new_artifact_id, Artifact, ArtifactType};
use sha2::{Digest, Sha256};
use std::io;
use std::path::Path;

/// Write a file artifact under the build workspace and return its record.
/// Paths are workspace-relative; parents are created as needed.
pub fn write_file_artifact(
    ctx: &AgentContext,
    step_id: &str,
    artifact_type: ArtifactType,
    rel_path: &str,
    content: &str,
) -> io::Result<Artifact> {
    let rel_path = rel_path.trim_start_matches('/');
    let full = ctx.workspace.join(rel_path);
    if let Some(parent) = full.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&full, content)?;

    Ok(Artifact {
        id: new_artifact_id(),
        build_id: ctx.build_id.clone(),
        step_id: step_id.to_string(),
        artifact_type,
        path: rel_path.to_string(),
        content_hash: hex_digest(content.as_bytes()),
        bytes_written: content.len() as u64,
        created: chrono::Utc::now(),
    })
}

/// Record a directory artifact. The hash covers the path, since there are
/// no bytes to address.
pub(crate) fn write_dir_artifact(
    ctx: &AgentContext,
    step_id: &str,
    rel_path: &str,
) -> io::Result<Artifact> {
    let rel_path = rel_path.trim_start_matches('/');
    let full = ctx.workspace.join(rel_path);
    std::fs::create_dir_all(&full)?;

    Ok(Artifact {
        id: new_artifact_id(),
        build_id: ctx.build_id.clone(),
        step_id: step_id.to_string(),
        artifact_type: ArtifactType::Code,
        path: rel_path.to_string(),
        content_hash: hex_digest(rel_path.as_bytes()),
        bytes_written: 0,
        created: chrono::Utc::now(),
    })
}

/// Check the artifact against its declared shape: the path exists, and
/// files are non-empty.
pub fn verify_artifact(workspace: &Path, artifact: &Artifact) -> bool {
    let full = workspace.join(&artifact.path);
    match std::fs::metadata(&full) {
        Ok(meta) if meta.is_dir() => true,
        Ok(meta) => meta.len() > 0,
        Err(_) => false,
    }
}

pub(crate) fn hex_digest(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}
