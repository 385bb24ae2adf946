use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use idwatch_core::EntityType;
use idwatch_sync::{Pipeline, PipelineConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "idwatch")]
#[command(about = "Tracks records appearing in and disappearing from the DDB search index")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every stage for every enabled entity type once and write a report.
    Run,
    /// Snapshot today's identifiers.
    Dump {
        #[arg(long)]
        entity: Option<EntityType>,
    },
    /// Diff consecutive snapshots into MISSING/NEW files.
    Compare {
        #[arg(long)]
        entity: Option<EntityType>,
    },
    /// Rebuild the delta table from the compare files.
    Import {
        #[arg(long)]
        entity: Option<EntityType>,
    },
    /// Re-check MISSING records against the live index.
    Correct {
        #[arg(long)]
        entity: Option<EntityType>,
    },
    /// Remove invalid artifacts, and expired ones with --older-than-days.
    Purge {
        #[arg(long)]
        older_than_days: Option<u32>,
    },
    /// Run each entity type on its cron schedule until interrupted.
    Schedule,
}

fn selected(pipeline: &Pipeline, entity: Option<EntityType>) -> Result<Vec<EntityType>> {
    let enabled = pipeline.entity_types();
    match entity {
        Some(entity) if !enabled.contains(&entity) => bail!("{entity} is disabled by config"),
        Some(entity) => Ok(vec![entity]),
        None => Ok(enabled),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = PipelineConfig::from_env();
    if matches!(cli.command, Some(Commands::Schedule)) {
        config.scheduler_enabled = true;
    }
    let pipeline = Pipeline::connect(config)?;
    let run_id = Uuid::new_v4();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let summary = pipeline.run_once().await?;
            let failed = summary.failed_entities();
            println!(
                "run complete: run_id={} entities={} failed={} reports={}",
                summary.run_id,
                summary.entities.len(),
                failed.len(),
                summary.reports_dir
            );
            if !failed.is_empty() {
                let names: Vec<String> = failed.iter().map(ToString::to_string).collect();
                bail!("run failed for {}", names.join(", "));
            }
        }
        Commands::Dump { entity } => {
            for entity in selected(&pipeline, entity)? {
                let outcome = pipeline.dump(entity, run_id).await?;
                println!(
                    "dump {entity}: {} of {} records -> {}",
                    outcome.processed,
                    outcome.total,
                    outcome.path.display()
                );
            }
        }
        Commands::Compare { entity } => {
            for entity in selected(&pipeline, entity)? {
                let s = pipeline.compare(entity).await?;
                println!(
                    "compare {entity}: pairs={} created={} skipped={} failed={}",
                    s.pairs, s.created, s.skipped, s.failed
                );
            }
        }
        Commands::Import { entity } => {
            for entity in selected(&pipeline, entity)? {
                let s = pipeline.import(entity).await?;
                println!(
                    "import {entity}: rows={} files={} failed_files={}",
                    s.rows, s.files, s.failed_files
                );
            }
        }
        Commands::Correct { entity } => {
            for entity in selected(&pipeline, entity)? {
                let s = pipeline.correct(entity, run_id).await?;
                println!(
                    "correct {entity}: checked={} found={} failed={}",
                    s.checked, s.found, s.failed
                );
            }
        }
        Commands::Purge { older_than_days } => {
            for (entity, removed) in pipeline.purge(older_than_days) {
                println!("purge {entity}: removed={removed}");
            }
        }
        Commands::Schedule => {
            let pipeline = Arc::new(pipeline);
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                bail!("scheduler is disabled");
            };
            sched.start().await?;
            info!("scheduler started, waiting for ctrl-c");
            tokio::signal::ctrl_c().await?;
            sched.shutdown().await?;
            info!("scheduler stopped");
        }
    }

    Ok(())
}
