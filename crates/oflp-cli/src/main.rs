use std::collections::BTreeMap;

use anyhow::Result;
use clap::{Parser, Subcommand};
use oflp_core::{ClientRecord, Criterion, Tier};
use oflp_score::ScoringEngine;
use oflp_storage::PipelineStore;
use oflp_sync::pipeline_path_from_env;
use serde_json::Value as JsonValue;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "oflp")]
#[command(about = "OpenFEMA lead pipeline command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Harvest all enabled dataset domains into the artifact cache.
    Harvest,
    /// Score an opportunity against the tier-weighted rubric.
    Score {
        #[arg(long)]
        tier: Tier,
        #[arg(long)]
        scope_alignment: u8,
        #[arg(long)]
        contract_value: u8,
        #[arg(long)]
        staffing_match: u8,
        #[arg(long)]
        qualifications_match: u8,
        #[arg(long)]
        deal_overview: u8,
    },
    /// Inspect or upsert the pipeline client document.
    Pipeline {
        #[command(subcommand)]
        command: PipelineCommands,
    },
}

#[derive(Debug, Subcommand)]
enum PipelineCommands {
    /// Insert a client record, or merge fields into an existing ID.
    Upsert {
        #[arg(long)]
        id: String,
        /// Field assignment, repeatable: --set "RFP Status=closed"
        #[arg(long = "set", value_parser = parse_field)]
        fields: Vec<(String, String)>,
    },
    /// Print the whole pipeline document.
    Show,
}

fn parse_field(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(name, value)| (name.trim().to_string(), value.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Harvest => {
            let summary = oflp_sync::run_harvest_once_from_env().await?;
            let incomplete = summary.domains.iter().filter(|d| !d.complete).count();
            println!(
                "harvest complete: run_id={} domains={} cache_hits={} records={} incomplete={} manifest={}",
                summary.run_id,
                summary.domains.len(),
                summary.cache_hits(),
                summary.records_written(),
                incomplete,
                summary.manifest_path
            );
        }
        Commands::Score {
            tier,
            scope_alignment,
            contract_value,
            staffing_match,
            qualifications_match,
            deal_overview,
        } => {
            let scores = BTreeMap::from([
                (Criterion::ScopeAlignment, scope_alignment),
                (Criterion::ContractValue, contract_value),
                (Criterion::InternalStaffingMatch, staffing_match),
                (Criterion::QualificationsMatch, qualifications_match),
                (Criterion::DealOverview, deal_overview),
            ]);
            let score = ScoringEngine.score(tier, &scores)?;
            println!(
                "{} tier: weighted total {:.2} / 5.00 -> {}",
                score.tier, score.weighted_total, score.band
            );
        }
        Commands::Pipeline { command } => {
            let store = PipelineStore::new(pipeline_path_from_env());
            match command {
                PipelineCommands::Upsert { id, fields } => {
                    let mut record = ClientRecord::new(id.clone());
                    for (name, value) in fields {
                        record.fields.insert(name, JsonValue::String(value));
                    }
                    let outcome = store.upsert(record).await?;
                    println!("{outcome} client {id} in {}", store.path().display());
                }
                PipelineCommands::Show => {
                    let document = store.load().await?;
                    println!("{}", serde_json::to_string_pretty(&document)?);
                }
            }
        }
    }

    Ok(())
}
