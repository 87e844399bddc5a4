//! CLI interface for data-integrator

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{self, Config};
use crate::orchestrator::allocation::{AllocationPolicy, DatasetProfile};
use crate::orchestrator::escalation::Resolution;
use crate::orchestrator::pipeline::{PipelineStage, PipelineState};
use crate::orchestrator::MasterOrchestrator;
use crate::registry::Capability;
use crate::services::{Collaborators, Fixture, FixtureServices};
use crate::types::{Complexity, DatasetRef, JoinType, PipelineRequest};

#[derive(Parser)]
#[command(name = "data-integrator")]
#[command(about = "Agent orchestration core for merging two uploaded datasets", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a merge pipeline against in-memory collaborators
    Run {
        /// Fixture describing datasets, mappings and quality verdict (JSON or YAML).
        /// A built-in demo is used when omitted.
        #[arg(short, long)]
        fixture: Option<PathBuf>,
        /// First dataset (defaults to the fixture's first dataset)
        #[arg(long)]
        dataset_a: Option<String>,
        /// Second dataset (defaults to the fixture's second dataset)
        #[arg(long)]
        dataset_b: Option<String>,
        /// inner, left, right or full_outer
        #[arg(short, long)]
        join_type: Option<JoinType>,
        /// Approve any escalation with the proposed mappings
        #[arg(short, long)]
        approve: bool,
        /// Upload session id
        #[arg(long, env = "DATA_INTEGRATOR_SESSION")]
        session: Option<String>,
        /// Print the final pipeline state as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the resource allocation for a workload
    Allocate {
        /// Combined row count of both datasets
        #[arg(short, long)]
        rows: u64,
        /// low, medium or high
        #[arg(short, long, default_value = "low")]
        complexity: Complexity,
        /// Column count of the narrowest dataset
        #[arg(long, default_value = "8")]
        columns: u32,
    },
    /// List capability tags
    Capabilities,
    /// Print the registered tools with their parameter schemas as JSON
    Tools,
    /// Configure the orchestrator
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
        /// Reset configuration to defaults
        #[arg(long)]
        reset: bool,
        /// Print the configuration file path
        #[arg(long)]
        path: bool,
    },
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            fixture,
            dataset_a,
            dataset_b,
            join_type,
            approve,
            session,
            json,
        } => {
            let fixture = match fixture {
                Some(path) => Fixture::load(&path)?,
                None => Fixture::demo(),
            };
            let options = RunOptions {
                dataset_a,
                dataset_b,
                join_type,
                approve,
                session,
                json,
            };
            run_pipeline(fixture, options).await?;
        }
        Commands::Allocate {
            rows,
            complexity,
            columns,
        } => {
            let config = Config::load().unwrap_or_default();
            let policy = AllocationPolicy::new(
                config.orchestrator.max_schema_agents,
                config.orchestrator.max_merge_agents,
            );
            let decision = policy.decide(DatasetProfile {
                row_count: rows,
                column_count: columns,
                complexity,
            })?;
            println!("Rows:           {}", rows);
            println!("Complexity:     {}", complexity);
            println!("Schema agents:  {}", decision.schema_agents);
            println!("Merge agents:   {}", decision.merge_agents);
            println!("Warehouse tier: {}", decision.warehouse_tier);
        }
        Commands::Capabilities => {
            for capability in Capability::ALL {
                println!("{:<20} {}", capability.as_str(), capability.description());
            }
        }
        Commands::Tools => {
            let config = Config::load().unwrap_or_default();
            let services = Arc::new(FixtureServices::new(Fixture::demo()));
            let orchestrator =
                MasterOrchestrator::new(config, Collaborators::from_fixture(services))?;
            let catalog = orchestrator.registry().tool_catalog();
            println!("{}", serde_json::to_string_pretty(&catalog)?);
        }
        Commands::Config { show, reset, path } => {
            if reset {
                config::reset_config()?;
            } else if path {
                println!("{}", config::config_path()?.display());
            } else if show {
                config::show_config()?;
            } else {
                println!("Use --show to view configuration, --reset to restore defaults");
            }
        }
    }

    Ok(())
}

struct RunOptions {
    dataset_a: Option<String>,
    dataset_b: Option<String>,
    join_type: Option<JoinType>,
    approve: bool,
    session: Option<String>,
    json: bool,
}

async fn run_pipeline(fixture: Fixture, options: RunOptions) -> Result<()> {
    let config = Config::load().unwrap_or_default();

    let mut known = fixture.datasets.keys().cloned();
    let dataset_a = options
        .dataset_a
        .or_else(|| known.next())
        .context("Fixture defines no datasets")?;
    let dataset_b = options
        .dataset_b
        .or_else(|| known.next())
        .context("Fixture needs a second dataset")?;
    let session = options
        .session
        .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
    let join_type = options
        .join_type
        .unwrap_or(config.orchestrator.default_join_type);

    let services = Arc::new(FixtureServices::new(fixture));
    let orchestrator = MasterOrchestrator::new(config, Collaborators::from_fixture(services))?;

    let request = PipelineRequest::new(session, DatasetRef::new(dataset_a), DatasetRef::new(dataset_b))
        .with_join_type(join_type);
    let pipeline_id = orchestrator.start_pipeline(request)?;
    let mut state = orchestrator.wait_until_settled(&pipeline_id).await?;

    if state.stage == PipelineStage::AwaitingApproval {
        print_escalation(&state);
        if let Some(sql) = &state.artifacts.proposed_sql {
            println!("\nProposed merge:\n{}", sql);
        }
        if options.approve {
            println!("\nApproving proposed mappings...");
            orchestrator.approve_escalation(&pipeline_id, Vec::new())?;
            state = orchestrator.wait_until_settled(&pipeline_id).await?;
        } else {
            println!("\nPipeline paused. Re-run with --approve to accept the proposed mappings.");
        }
    }

    orchestrator.shutdown();
    if state.stage.is_terminal() {
        orchestrator.forget_pipeline(&pipeline_id)?;
    }

    if options.json {
        println!("{}", serde_json::to_string_pretty(&state)?);
    } else {
        print_summary(&state);
    }

    if let Some(failure) = &state.failure {
        anyhow::bail!(
            "pipeline failed during {} ({}): {}",
            failure.stage,
            failure.kind,
            failure.message
        );
    }
    Ok(())
}

fn print_escalation(state: &PipelineState) {
    println!(
        "Escalation {} raised for pipeline {}",
        state.artifacts.escalation_ticket.as_deref().unwrap_or("-"),
        state.pipeline_id
    );
    for conflict in state.artifacts.conflicts.iter().filter(|c| !c.is_resolved()) {
        println!(
            "  [{}] {} -> {} ({}, confidence {:.2}): {}",
            conflict.severity,
            conflict.source_field,
            conflict.target_field,
            conflict.kind,
            conflict.confidence,
            conflict.description
        );
    }
}

fn print_summary(state: &PipelineState) {
    println!("\nPipeline {} ({})", state.pipeline_id, state.stage);
    if let Some(allocation) = &state.allocation {
        println!(
            "  allocation: {} schema agents, {} merge agents, {} warehouse",
            allocation.schema_agents, allocation.merge_agents, allocation.warehouse_tier
        );
    }
    for step in &state.steps {
        println!(
            "  {:>3}. [{}] {}{}",
            step.seq,
            step.stage,
            step.detail,
            step.agent_id
                .as_deref()
                .map(|id| format!(" ({})", id))
                .unwrap_or_default()
        );
    }

    let approved = state
        .artifacts
        .conflicts
        .iter()
        .filter(|c| matches!(c.resolution, Some(Resolution::Approved { .. })))
        .count();
    if approved > 0 {
        println!("  {} conflicts approved", approved);
    }
    if let Some(merge) = &state.artifacts.merge {
        println!("  output: {} ({} rows)", merge.output_table_ref, merge.row_count);
    }
    for warning in &state.warnings {
        println!("  warning: {}", warning);
    }
}
