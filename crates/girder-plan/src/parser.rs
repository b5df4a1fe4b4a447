// Plan parser: heterogeneous build input to task graph.
//
// Three input shapes are accepted: a structured plan document with named
// sections, a domain spec recognized by keyword patterns, and free text.
// Section parsing wins; the domain library is the fallback; an
// unrecognized message becomes a single create_file node.

use crate::graph::validate_graph;
use girder_types::{Result, TaskGraph, TaskNode, TaskType};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Section {
    RepoSkeleton,
    Spec,
    Generators,
    AcceptanceCriteria,
    Roadmap,
}

impl Section {
    fn from_header(line: &str) -> Option<Self> {
        let name = line
            .trim()
            .trim_start_matches('#')
            .trim()
            .trim_end_matches(':')
            .to_lowercase();
        match name.as_str() {
            "repo skeleton" | "directory structure" | "folder structure" => {
                Some(Section::RepoSkeleton)
            }
            "spec" | "schemas" | "schema" => Some(Section::Spec),
            "generators" | "modules" => Some(Section::Generators),
            "acceptance criteria" | "acceptance" => Some(Section::AcceptanceCriteria),
            "roadmap" | "timeline" => Some(Section::Roadmap),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Section::RepoSkeleton => "repo_skeleton",
            Section::Spec => "spec",
            Section::Generators => "generators",
            Section::AcceptanceCriteria => "acceptance_criteria",
            Section::Roadmap => "roadmap",
        }
    }
}

static FILE_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[A-Za-z0-9_][A-Za-z0-9_./-]*\.[A-Za-z0-9]+")
        .unwrap_or_else(|e| panic!("bad regex: {}", e))
});
static DIR_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[A-Za-z0-9_-]+(?:/[A-Za-z0-9_-]+)+/?").unwrap_or_else(|e| panic!("bad regex: {}", e))
});
static EXPLICIT_DIR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:directory|folder|package)\s+([A-Za-z0-9_./-]+)")
        .unwrap_or_else(|e| panic!("bad regex: {}", e))
});
static SCHEMA_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:schema|spec)\s+([A-Za-z_][A-Za-z0-9_]*)")
        .unwrap_or_else(|e| panic!("bad regex: {}", e))
});
static SCHEMA_NAME_REVERSED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:define|create)\s+([A-Za-z_][A-Za-z0-9_]*)\s+(?:schema|spec)")
        .unwrap_or_else(|e| panic!("bad regex: {}", e))
});
static MODULE_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:generator|module|component)\s+([A-Za-z_][A-Za-z0-9_]*)")
        .unwrap_or_else(|e| panic!("bad regex: {}", e))
});
static MODULE_NAME_REVERSED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:create|add)\s+([A-Za-z_][A-Za-z0-9_]*)\s+(?:generator|module)")
        .unwrap_or_else(|e| panic!("bad regex: {}", e))
});

/// Stable id for an acceptance criterion: first 8 hex chars of its SHA-256.
pub fn criterion_id(criterion: &str) -> String {
    let digest = Sha256::digest(criterion.trim().as_bytes());
    format!("test_{:02x}{:02x}{:02x}{:02x}", digest[0], digest[1], digest[2], digest[3])
}

fn slug(path: &str) -> String {
    path.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect::<String>()
        .trim_matches('_')
        .to_string()
}

#[derive(Default)]
pub struct PlanParser;

impl PlanParser {
    pub fn new() -> Self {
        Self
    }

    /// Parse input into a validated task graph.
    pub fn parse(&self, content: &str) -> Result<TaskGraph> {
        let sections = extract_sections(content);

        let mut graph = TaskGraph::default();
        if !sections.is_empty() {
            for (section, body) in &sections {
                match section {
                    Section::RepoSkeleton => graph.nodes.extend(parse_repo_skeleton(body)),
                    Section::Spec => graph.nodes.extend(parse_spec_section(body)),
                    Section::Generators => graph.nodes.extend(parse_generators_section(body)),
                    Section::AcceptanceCriteria => {
                        graph.nodes.extend(parse_acceptance_section(body))
                    }
                    Section::Roadmap => {
                        graph
                            .metadata
                            .insert("roadmap".into(), Value::String(body.trim().to_string()));
                    }
                }
            }
            graph.metadata.insert("source".into(), Value::String("sections".into()));
            graph.metadata.insert(
                "sections".into(),
                Value::Array(
                    sections
                        .iter()
                        .map(|(s, _)| Value::String(s.name().to_string()))
                        .collect(),
                ),
            );
        }

        if graph.nodes.is_empty() {
            if let Some((domain, nodes)) = match_domain(content) {
                graph.nodes = nodes;
                graph
                    .metadata
                    .insert("source".into(), Value::String(format!("domain:{}", domain)));
            } else if !content.trim().is_empty() {
                graph.nodes = parse_simple_message(content);
                graph.metadata.insert("source".into(), Value::String("freeform".into()));
            }
        }

        validate_graph(&graph)?;
        Ok(graph)
    }
}

/// Split content into (section, body) runs. A header is a line whose text,
/// stripped of markdown decoration, names a known section.
fn extract_sections(content: &str) -> Vec<(Section, String)> {
    let mut sections: Vec<(Section, String)> = Vec::new();
    let mut current: Option<(Section, Vec<&str>)> = None;

    for line in content.lines() {
        if let Some(section) = Section::from_header(line) {
            if let Some((prev, body)) = current.take() {
                sections.push((prev, body.join("\n")));
            }
            current = Some((section, Vec::new()));
        } else if let Some((_, body)) = current.as_mut() {
            body.push(line);
        }
    }
    if let Some((prev, body)) = current.take() {
        sections.push((prev, body.join("\n")));
    }
    sections
}

fn parse_repo_skeleton(body: &str) -> Vec<TaskNode> {
    let mut nodes: Vec<TaskNode> = Vec::new();
    let mut seen_dirs: HashSet<String> = HashSet::new();
    let mut seen_files: HashSet<String> = HashSet::new();

    for caps in EXPLICIT_DIR.captures_iter(body) {
        let dir = caps[1].trim_matches('/').to_string();
        if !dir.is_empty() {
            seen_dirs.insert(dir);
        }
    }
    for m in DIR_PATH.find_iter(body) {
        let token = m.as_str().trim_matches('/');
        // A match immediately followed by '.' is a file stem, not a
        // directory ("src/core/lib" inside "src/core/lib.rs").
        if body[m.end()..].starts_with('.') {
            continue;
        }
        let last = token.rsplit('/').next().unwrap_or(token);
        if !last.contains('.') {
            seen_dirs.insert(token.to_string());
        }
    }
    for m in FILE_PATH.find_iter(body) {
        seen_files.insert(m.as_str().to_string());
    }

    let mut dirs: Vec<String> = seen_dirs.into_iter().collect();
    dirs.sort();
    for dir in &dirs {
        let mut node = TaskNode::new(format!("create_dir_{}", slug(dir)), TaskType::CreateDirectory);
        node.directory = Some(dir.clone());
        node.metadata.insert("source".into(), Value::String("repo_skeleton".into()));
        nodes.push(node);
    }

    let mut files: Vec<String> = seen_files.into_iter().collect();
    files.sort();
    for file in &files {
        let mut node = TaskNode::new(format!("create_file_{}", slug(file)), TaskType::CreateFile);
        node.file = Some(file.clone());
        node.metadata.insert("source".into(), Value::String("repo_skeleton".into()));
        // A file under a declared directory waits for that directory.
        node.dependencies = dirs
            .iter()
            .filter(|dir| file.starts_with(&format!("{}/", dir)))
            .map(|dir| format!("create_dir_{}", slug(dir)))
            .collect();
        nodes.push(node);
    }

    nodes
}

fn parse_spec_section(body: &str) -> Vec<TaskNode> {
    let mut names: Vec<String> = Vec::new();
    let mut seen = HashSet::new();
    for caps in SCHEMA_NAME.captures_iter(body).chain(SCHEMA_NAME_REVERSED.captures_iter(body)) {
        let name = caps[1].to_lowercase();
        if seen.insert(name.clone()) {
            names.push(name);
        }
    }

    names
        .into_iter()
        .map(|name| {
            let mut node =
                TaskNode::new(format!("create_schema_{}", name), TaskType::CreateSchema);
            node.file = Some(format!("schemas/{}.schema.json", name));
            node.content = Some(format!("{{\n  \"title\": \"{}\"\n}}\n", name));
            node.metadata.insert("schema_name".into(), Value::String(name));
            node
        })
        .collect()
}

fn parse_generators_section(body: &str) -> Vec<TaskNode> {
    let mut names: Vec<String> = Vec::new();
    let mut seen = HashSet::new();
    for caps in MODULE_NAME.captures_iter(body).chain(MODULE_NAME_REVERSED.captures_iter(body)) {
        let name = caps[1].to_lowercase();
        if seen.insert(name.clone()) {
            names.push(name);
        }
    }

    names
        .into_iter()
        .map(|name| {
            let mut node =
                TaskNode::new(format!("generate_module_{}", name), TaskType::GenerateModule);
            node.file = Some(format!("modules/{}.md", name));
            node.metadata.insert("module_name".into(), Value::String(name));
            node
        })
        .collect()
}

fn parse_acceptance_section(body: &str) -> Vec<TaskNode> {
    let mut nodes: Vec<TaskNode> = Vec::new();
    let mut test_ids = Vec::new();

    for line in body.lines() {
        let criterion = line
            .trim()
            .trim_start_matches(['-', '*'])
            .trim_start_matches(|c: char| c.is_ascii_digit() || c == '.' || c == ')')
            .trim();
        if criterion.len() < 8 {
            continue;
        }
        let id = criterion_id(criterion);
        if test_ids.contains(&id) {
            continue;
        }
        let mut node = TaskNode::new(id.clone(), TaskType::CreateTest);
        node.file = Some(format!("tests/{}.txt", id));
        node.acceptance_criteria = Some(criterion.to_string());
        node.content = Some(criterion.to_string());
        nodes.push(node);
        test_ids.push(id);
    }

    if !nodes.is_empty() {
        let mut runner = TaskNode::new("run_acceptance", TaskType::RunAcceptance);
        runner.dependencies = test_ids;
        nodes.push(runner);
    }

    nodes
}

// ============================================================================
// Domain pattern library
// ============================================================================

struct DomainPattern {
    name: &'static str,
    keywords: &'static [&'static str],
    build: fn(&str) -> Vec<TaskNode>,
}

static DOMAINS: &[DomainPattern] = &[
    DomainPattern {
        name: "hello_world",
        keywords: &["hello world"],
        build: build_hello_world,
    },
    DomainPattern {
        name: "site_builder",
        keywords: &["website builder", "landing page", "site builder"],
        build: build_site_sequence,
    },
    DomainPattern {
        name: "api_service",
        keywords: &["rest api", "api service", "crud service"],
        build: build_api_sequence,
    },
];

fn match_domain(content: &str) -> Option<(&'static str, Vec<TaskNode>)> {
    let lowered = content.to_lowercase();
    DOMAINS
        .iter()
        .find(|d| d.keywords.iter().any(|k| lowered.contains(k)))
        .map(|d| (d.name, (d.build)(content)))
}

fn build_hello_world(_content: &str) -> Vec<TaskNode> {
    let mut dir = TaskNode::new("create_dir_hello", TaskType::CreateDirectory);
    dir.directory = Some("hello".into());

    let mut file = TaskNode::new("create_file_hello_main", TaskType::CreateFile);
    file.file = Some("hello/main.txt".into());
    file.content = Some("hello world\n".into());
    file.dependencies = vec!["create_dir_hello".into()];

    vec![dir, file]
}

fn build_site_sequence(content: &str) -> Vec<TaskNode> {
    let mut repo = TaskNode::new("setup_repo", TaskType::SetupRepo);
    repo.directory = Some("site".into());
    repo.requires_exclusive = true;

    let mut schema = TaskNode::new("create_schema_site", TaskType::CreateSchema);
    schema.file = Some("site/schemas/site.schema.json".into());
    schema.content = Some("{\n  \"title\": \"site\"\n}\n".into());
    schema.dependencies = vec!["setup_repo".into()];

    let mut sections = TaskNode::new("generate_module_sections", TaskType::GenerateModule);
    sections.file = Some("site/modules/sections.md".into());
    sections.dependencies = vec!["create_schema_site".into()];

    let criterion = "site renders every section declared by the spec";
    let test_id = criterion_id(criterion);
    let mut smoke = TaskNode::new(test_id.clone(), TaskType::CreateTest);
    smoke.file = Some(format!("site/tests/{}.txt", test_id));
    smoke.acceptance_criteria = Some(criterion.to_string());
    smoke.content = Some(criterion.to_string());
    smoke.dependencies = vec!["generate_module_sections".into()];

    let mut acceptance = TaskNode::new("run_acceptance", TaskType::RunAcceptance);
    acceptance.dependencies = vec![test_id];
    acceptance
        .metadata
        .insert("goal".into(), Value::String(girder_types::truncate(content, 200).to_string()));

    vec![repo, schema, sections, smoke, acceptance]
}

fn build_api_sequence(_content: &str) -> Vec<TaskNode> {
    let mut repo = TaskNode::new("setup_repo", TaskType::SetupRepo);
    repo.directory = Some("service".into());
    repo.requires_exclusive = true;

    let mut schema = TaskNode::new("create_schema_models", TaskType::CreateSchema);
    schema.file = Some("service/schemas/models.schema.json".into());
    schema.content = Some("{\n  \"title\": \"models\"\n}\n".into());
    schema.dependencies = vec!["setup_repo".into()];

    let mut endpoints = TaskNode::new("generate_module_endpoints", TaskType::GenerateModule);
    endpoints.file = Some("service/modules/endpoints.md".into());
    endpoints.dependencies = vec!["create_schema_models".into()];

    let criterion = "every resource exposes create, read, update, delete";
    let test_id = criterion_id(criterion);
    let mut test = TaskNode::new(test_id, TaskType::CreateTest);
    test.file = Some(format!("service/tests/{}.txt", criterion_id(criterion)));
    test.acceptance_criteria = Some(criterion.to_string());
    test.content = Some(criterion.to_string());
    test.dependencies = vec!["generate_module_endpoints".into()];

    vec![repo, schema, endpoints, test]
}

fn parse_simple_message(content: &str) -> Vec<TaskNode> {
    let mut node = TaskNode::new("create_file_request", TaskType::CreateFile);
    node.file = Some("request.txt".into());
    node.content = Some(content.to_string());
    vec![node]
}
