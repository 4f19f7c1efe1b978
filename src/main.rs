//! # gearflow CLI
//!
//! Operator interface to the discovery pipeline stores. Every command reads
//! the same TOML configuration and opens the same SQLite database the flow
//! coordinator uses, so an operator can inspect or nudge a running pipeline.
//!
//! ## Usage
//!
//! ```bash
//! gearflow --config ./config/gearflow.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `gearflow init` | Create the database and run schema migrations |
//! | `gearflow registry …` | Check, record, and list scanned sources |
//! | `gearflow queue …` | Enqueue, claim, and move discoveries through their lifecycle |
//! | `gearflow research …` | Log research steps, complete and validate sessions |
//! | `gearflow flow …` | Inspect flow snapshots, health, and reclaim stale claims |
//! | `gearflow stats` | Summary of every store |
//!
//! ## Examples
//!
//! ```bash
//! gearflow queue enqueue --kind product --name "Duplex" --brand Zpacks \
//!     --source-url https://zpacks.com/duplex --priority 8
//! gearflow queue next --worker operator
//! gearflow research log --research-id r1 --discovery-id product-… \
//!     --url https://zpacks.com/duplex --authority manufacturer \
//!     --fields name,brand,weight --confidence verified
//! gearflow research complete r1
//! gearflow flow health main
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use gearflow::commands::{self, EnqueueArgs, LogStepArgs};
use gearflow::config::{self, Config};
use gearflow::db::Stores;
use gearflow::models::{
    AuthorityCategory, ConfidenceLevel, DiscoveryStatus, KindLabel, SourceCategory,
};
use gearflow::stats;

/// gearflow: durable discovery pipeline core.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/gearflow.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "gearflow",
    about = "gearflow: source registry, discovery queue, research ledger, and resumable flow",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/gearflow.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all pipeline tables. Running it
    /// again is safe.
    Init,

    /// Source registry operations.
    Registry {
        #[command(subcommand)]
        action: RegistryAction,
    },

    /// Discovery queue operations.
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },

    /// Research ledger operations.
    Research {
        #[command(subcommand)]
        action: ResearchAction,
    },

    /// Flow snapshot operations.
    Flow {
        #[command(subcommand)]
        action: FlowAction,
    },

    /// Show a summary of every store.
    Stats,
}

#[derive(Subcommand)]
enum RegistryAction {
    /// Report whether a location has been scanned before.
    Check { location: String },
    /// Record a scan of a location.
    Record {
        location: String,
        #[arg(long)]
        category: Option<SourceCategory>,
        /// Items found during this scan.
        #[arg(long, default_value_t = 0)]
        items: u32,
        /// Record the scan as failed.
        #[arg(long)]
        failed: bool,
    },
    /// Most recently scanned locations.
    Recent {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Totals per source category.
    Stats,
}

#[derive(Subcommand)]
enum QueueAction {
    /// Admit a discovery. The id is derived from kind, name, and source URL.
    Enqueue {
        #[arg(long)]
        kind: KindLabel,
        #[arg(long)]
        name: String,
        #[arg(long)]
        source_url: String,
        #[arg(long, default_value = "website")]
        source_category: SourceCategory,
        /// Brand name (product discoveries).
        #[arg(long)]
        brand: Option<String>,
        /// Summary (insight discoveries).
        #[arg(long)]
        summary: Option<String>,
        /// Parent category (category discoveries).
        #[arg(long)]
        parent: Option<String>,
        /// Website (brand discoveries).
        #[arg(long)]
        website: Option<String>,
        #[arg(long)]
        context: Option<String>,
        #[arg(long, default_value_t = 5)]
        priority: u8,
        #[arg(long, default_value_t = 0.5)]
        confidence: f64,
        #[arg(long, default_value = "operator")]
        discovered_by: String,
    },
    /// Claim the highest-priority pending discovery.
    Next {
        #[arg(long, default_value = "operator")]
        worker: String,
    },
    /// Show the next pending discoveries without claiming them.
    Peek {
        #[arg(default_value_t = 10)]
        n: i64,
    },
    /// List discoveries, optionally filtered by status.
    List {
        #[arg(long)]
        status: Option<DiscoveryStatus>,
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    /// Show one discovery in full.
    Show { id: String },
    /// Overwrite a discovery's status without checking the lifecycle.
    SetStatus { id: String, status: DiscoveryStatus },
    /// Move a discovery to a new status if the lifecycle allows it.
    Transition { id: String, status: DiscoveryStatus },
    /// Return an errored discovery to pending.
    Reset { id: String },
    /// Return claims older than the given age to pending.
    Reclaim {
        #[arg(long, default_value_t = 1800)]
        older_than_secs: u64,
    },
    /// Counts by status and kind.
    Status,
}

#[derive(Subcommand)]
enum ResearchAction {
    /// Append one consulted source to a research session.
    Log {
        #[arg(long)]
        research_id: String,
        #[arg(long)]
        discovery_id: String,
        #[arg(long)]
        url: String,
        #[arg(long)]
        authority: AuthorityCategory,
        /// Comma-separated field names found at this source.
        #[arg(long, value_delimiter = ',')]
        fields: Vec<String>,
        #[arg(long)]
        confidence: ConfidenceLevel,
        #[arg(long)]
        note: Option<String>,
        /// Kind of the discovery; selects the required fields.
        #[arg(long)]
        kind: Option<KindLabel>,
        #[arg(long)]
        researcher: Option<String>,
    },
    /// All sessions and steps for a discovery.
    Retrieve { discovery_id: String },
    /// Close a session and compute its scores.
    Complete { research_id: String },
    /// Check a completed session against the quality gate.
    Validate { research_id: String },
    /// Recompute step hashes and report mismatches.
    Verify { research_id: String },
}

#[derive(Subcommand)]
enum FlowAction {
    /// List flows, or show one flow's snapshot.
    Show { flow_id: Option<String> },
    /// Pipeline health summary for a flow.
    Health { flow_id: String },
    /// Return stale claims to pending and update the flow snapshot.
    Reclaim { flow_id: String },
}

fn init_tracing(cfg: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.logging.level.as_str()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    init_tracing(&cfg);

    let stores = Stores::open(&cfg).await?;

    match cli.command {
        Commands::Init => {
            println!("Database initialized successfully.");
        }
        Commands::Registry { action } => match action {
            RegistryAction::Check { location } => {
                commands::registry_check(&stores, &location).await?;
            }
            RegistryAction::Record {
                location,
                category,
                items,
                failed,
            } => {
                commands::registry_record(&stores, &location, category, items, failed).await?;
            }
            RegistryAction::Recent { limit } => {
                commands::registry_recent(&stores, limit).await?;
            }
            RegistryAction::Stats => {
                commands::registry_stats(&stores).await?;
            }
        },
        Commands::Queue { action } => match action {
            QueueAction::Enqueue {
                kind,
                name,
                source_url,
                source_category,
                brand,
                summary,
                parent,
                website,
                context,
                priority,
                confidence,
                discovered_by,
            } => {
                let args = EnqueueArgs {
                    kind,
                    name,
                    source_url,
                    source_category,
                    brand,
                    summary,
                    parent,
                    website,
                    context,
                    priority,
                    confidence,
                    discovered_by,
                };
                commands::queue_enqueue(&stores, args).await?;
            }
            QueueAction::Next { worker } => commands::queue_next(&stores, &worker).await?,
            QueueAction::Peek { n } => commands::queue_peek(&stores, n).await?,
            QueueAction::List { status, limit } => {
                commands::queue_list(&stores, status, limit).await?;
            }
            QueueAction::Show { id } => commands::queue_show(&stores, &id).await?,
            QueueAction::SetStatus { id, status } => {
                commands::queue_set_status(&stores, &id, status, false).await?;
            }
            QueueAction::Transition { id, status } => {
                commands::queue_set_status(&stores, &id, status, true).await?;
            }
            QueueAction::Reset { id } => commands::queue_reset(&stores, &id).await?,
            QueueAction::Reclaim { older_than_secs } => {
                commands::queue_reclaim(&stores, older_than_secs).await?;
            }
            QueueAction::Status => commands::queue_status(&stores).await?,
        },
        Commands::Research { action } => match action {
            ResearchAction::Log {
                research_id,
                discovery_id,
                url,
                authority,
                fields,
                confidence,
                note,
                kind,
                researcher,
            } => {
                let args = LogStepArgs {
                    research_id,
                    discovery_id,
                    url,
                    authority,
                    fields,
                    confidence,
                    note,
                    kind,
                    researcher,
                };
                commands::research_log(&stores, args).await?;
            }
            ResearchAction::Retrieve { discovery_id } => {
                commands::research_retrieve(&stores, &discovery_id).await?;
            }
            ResearchAction::Complete { research_id } => {
                commands::research_complete(&stores, &research_id).await?;
            }
            ResearchAction::Validate { research_id } => {
                commands::research_validate(&stores, &research_id).await?;
            }
            ResearchAction::Verify { research_id } => {
                commands::research_verify(&stores, &research_id).await?;
            }
        },
        Commands::Flow { action } => match action {
            FlowAction::Show { flow_id } => {
                commands::flow_show(&stores, flow_id.as_deref()).await?;
            }
            FlowAction::Health { flow_id } => commands::flow_health(&stores, &flow_id).await?,
            FlowAction::Reclaim { flow_id } => {
                commands::flow_reclaim(&stores, &cfg, &flow_id).await?;
            }
        },
        Commands::Stats => stats::run_stats(&cfg, &stores).await?,
    }

    Ok(())
}
