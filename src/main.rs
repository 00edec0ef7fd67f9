//! Storyledger CLI
//!
//! Drives the continuity core from the shell: one subcommand per pipeline step.

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use storyledger::{
    ChatClient, ContinuityConfig, ContinuityStore, Engine, JsonFileStore, LedgerError, Roster,
    WorkInfo,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Storyledger - per-character continuity for chapter-by-chapter generation
#[derive(Parser, Debug)]
#[command(name = "storyledger")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Store directory (overrides the config)
    #[arg(long)]
    store: Option<PathBuf>,

    /// Verbose output: debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register a work and its place in a series
    RegisterWork {
        work_id: String,

        #[arg(long)]
        title: Option<String>,

        /// Series this work belongs to
        #[arg(long, requires = "order")]
        series: Option<String>,

        /// Position within the series, starting at 1
        #[arg(long)]
        order: Option<u32>,

        /// The work this one is a sequel to
        #[arg(long)]
        parent: Option<String>,
    },

    /// Store a unit's text and extract its ledger entry
    Extract {
        work_id: String,
        unit: u32,

        /// File holding the unit text
        #[arg(long)]
        text: PathBuf,

        /// Character roster (TOML or JSON)
        #[arg(long)]
        roster: PathBuf,
    },

    /// Print the context block for generating a unit
    Context {
        work_id: String,
        unit: u32,
    },

    /// Review a unit's character voices
    Review {
        work_id: String,
        unit: u32,

        /// Unit text; defaults to the stored text
        #[arg(long)]
        text: Option<PathBuf>,

        #[arg(long)]
        roster: PathBuf,

        /// Revise immediately if the review calls for it
        #[arg(long)]
        revise: bool,
    },

    /// Revise a stored unit against its stored review
    Revise {
        work_id: String,
        unit: u32,

        #[arg(long)]
        roster: Option<PathBuf>,
    },

    /// Print stored records as JSON
    Show {
        work_id: String,

        /// Only this unit
        #[arg(long)]
        unit: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let mut config = ContinuityConfig::load_or_default(cli.config.as_deref()).await?;
    if let Some(store_dir) = cli.store {
        config = config.with_store_dir(store_dir);
    }

    let store: Arc<dyn ContinuityStore> = Arc::new(JsonFileStore::open(&config.store_dir).await?);
    let model = Arc::new(ChatClient::new(config.model.clone())?);
    let engine = Engine::new(model, store.clone(), &config)?;

    if let Err(e) = run(cli.command, &engine, store.as_ref()).await {
        if e
            .downcast_ref::<LedgerError>()
            .is_some_and(LedgerError::corrupts_record)
        {
            error!("Continuity record for this work may be incomplete: {}", e);
        }
        return Err(e);
    }

    for (purpose, calls, usage) in engine.usage().snapshot() {
        info!(
            "{}: {} call(s), {} input / {} output tokens",
            purpose.as_str(),
            calls,
            usage.input_tokens,
            usage.output_tokens
        );
    }
    Ok(())
}

async fn run(command: Command, engine: &Engine, store: &dyn ContinuityStore) -> anyhow::Result<()> {
    match command {
        Command::RegisterWork {
            work_id,
            title,
            series,
            order,
            parent,
        } => {
            let mut work = WorkInfo::new(work_id);
            if let Some(title) = title {
                work = work.with_title(title);
            }
            if let (Some(series), Some(order)) = (series, order) {
                work = work.in_series(series, order);
            }
            if let Some(parent) = parent {
                work = work.sequel_to(parent);
            }
            engine.register_work(&work).await?;
        }

        Command::Extract {
            work_id,
            unit,
            text,
            roster,
        } => {
            let roster = load_roster(&roster).await?;
            let text = read_text(&text).await?;
            match engine.record_unit(&work_id, unit, &text, Some(&roster)).await? {
                Some(entry) => println!("{}", serde_json::to_string_pretty(&entry)?),
                None => warn!("No ledger entry recorded for unit {}", unit),
            }
        }

        Command::Context { work_id, unit } => {
            let context = engine.context_for(&work_id, unit).await?;
            info!(
                "~{} tokens, window {:?}, {} section(s) dropped",
                context.estimated_tokens, context.window_used, context.dropped_sections
            );
            println!("{}", context.text);
        }

        Command::Review {
            work_id,
            unit,
            text,
            roster,
            revise,
        } => {
            let roster = load_roster(&roster).await?;
            let text = match text {
                Some(path) => read_text(&path).await?,
                None => store
                    .unit(&work_id, unit)
                    .await?
                    .map(|u| u.text)
                    .with_context(|| format!("no stored text for '{}' unit {}", work_id, unit))?,
            };

            if revise {
                let outcome = engine
                    .review_and_revise(&work_id, unit, &text, Some(&roster))
                    .await?;
                if let Some(review) = outcome.review {
                    println!("{}", serde_json::to_string_pretty(&review)?);
                }
                if let Some(revised) = outcome.revised_text {
                    println!("\n{}", revised);
                }
            } else if let Some(review) = engine.review_unit(&work_id, unit, &text, Some(&roster)).await? {
                println!("{}", serde_json::to_string_pretty(&review)?);
            }
        }

        Command::Revise {
            work_id,
            unit,
            roster,
        } => {
            let roster = match roster {
                Some(path) => Some(load_roster(&path).await?),
                None => None,
            };
            match engine.revise_unit(&work_id, unit, roster.as_ref()).await? {
                Some(revised) => println!("{}", revised),
                None => info!("No revision applied to unit {}", unit),
            }
        }

        Command::Show { work_id, unit } => {
            let work = store.work(&work_id).await?;
            let entries: Vec<_> = store
                .entries(&work_id)
                .await?
                .into_iter()
                .filter(|e| unit.map_or(true, |u| e.unit_index == u))
                .collect();
            let mut reviews = Vec::new();
            for entry in &entries {
                if let Some(review) = store.review(&work_id, entry.unit_index).await? {
                    reviews.push(review);
                }
            }
            let report = serde_json::json!({
                "work": work,
                "entries": entries,
                "reviews": reviews,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}

async fn load_roster(path: &Path) -> anyhow::Result<Roster> {
    let content = read_text(path).await?;
    let roster = Roster::parse(&content)
        .with_context(|| format!("failed to parse roster {:?}", path))?;
    info!("Loaded {} character(s) from {:?}", roster.characters.len(), path);
    Ok(roster)
}

async fn read_text(path: &Path) -> anyhow::Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {:?}", path))
}
