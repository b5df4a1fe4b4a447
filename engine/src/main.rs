use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use girder_orchestrator::{GirderService, ServiceConfig};
use girder_plan::PlanParser;
use girder_types::{SpecMode, StepStatus, TenantId};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "girder-engine")]
#[command(about = "Headless Girder build orchestrator")]
struct Cli {
    /// Base directory for journals and build workspaces.
    #[arg(long, env = "GIRDER_STATE_DIR", default_value = ".girder")]
    state_dir: String,

    /// Tenant every operation is scoped to.
    #[arg(long, default_value = "default")]
    tenant: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Parse a spec file and print the task graph without executing it.
    Plan { spec_file: PathBuf },
    /// Compile a spec file into a plan and drive the build to completion.
    Run {
        spec_file: PathBuf,
        #[arg(long, default_value = "cli")]
        idempotency_key: String,
        #[arg(long)]
        max_iterations: Option<u32>,
    },
    /// Classify a failure log and print the resulting signal.
    Classify { log_file: PathBuf },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let tenant = TenantId::new(&cli.tenant);

    match cli.command {
        Command::Plan { spec_file } => {
            let input = std::fs::read_to_string(&spec_file)
                .with_context(|| format!("reading {}", spec_file.display()))?;
            let graph = PlanParser::new().parse(&input)?;
            println!("{}", serde_json::to_string_pretty(&graph)?);
        }
        Command::Run {
            spec_file,
            idempotency_key,
            max_iterations,
        } => {
            let input = std::fs::read_to_string(&spec_file)
                .with_context(|| format!("reading {}", spec_file.display()))?;
            let service = GirderService::open(ServiceConfig::at(&cli.state_dir))?;

            let title = spec_file
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| "spec".to_string());
            let spec_id =
                service.create_spec(&tenant, &title, SpecMode::Freeform, &input, None)?;
            let (plan_id, version, risk) = service.generate_plan(&tenant, &spec_id)?;
            info!(plan = %plan_id, version, risk, "plan compiled");

            let build_id = service
                .start_build(&tenant, &spec_id, Some(&plan_id), &idempotency_key, max_iterations)
                .await?;
            let build = service
                .wait_build_settled(&tenant, &build_id, Duration::from_secs(600))
                .await?;

            println!("build {}: {:?}", build_id, build.status);
            for step in &build.steps {
                let marker = match step.status {
                    StepStatus::Succeeded => "ok",
                    StepStatus::Failed => "FAILED",
                    StepStatus::Skipped => "skipped",
                    StepStatus::Running => "running",
                    StepStatus::Pending => "pending",
                };
                println!("  [{}] {} ({} ms)", marker, step.name, step.elapsed_ms);
            }
            if let Some(gate) = service.gate_for_build(&tenant, &build_id) {
                println!("pending approval gate: {} ({})", gate.id, gate.gate_type);
            }
            if let Some(error) = &build.error {
                println!("error: {}", error);
            }
        }
        Command::Classify { log_file } => {
            let logs = std::fs::read_to_string(&log_file)
                .with_context(|| format!("reading {}", log_file.display()))?;
            let service = GirderService::open(ServiceConfig::at(&cli.state_dir))?;
            let signal = service.classify_failure("cli", &logs, &[], &[]);
            println!("{}", serde_json::to_string_pretty(&signal)?);
        }
    }

    Ok(())
}
