//! # Open Locator CLI (`olo`)
//!
//! The `olo` binary registers works and harvest endpoints, loads rule
//! tables, and runs the queue-driven workers that harvest, scrape, and
//! recalculate.
//!
//! ## Usage
//!
//! ```bash
//! olo --config ./config/olo.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `olo init` | Create the SQLite database and run schema migrations |
//! | `olo add <id>...` | Upsert works and put them on the works queue |
//! | `olo endpoint add <url>` | Register a harvest endpoint |
//! | `olo rules load <file>` | Import journal, license, and override tables |
//! | `olo queue <name>` | Run, inspect, or kick one of the work queues |
//! | `olo update <op>` | One-shot run of an operation over every id (or one) |
//! | `olo show <id>` | Print a work's consolidated result |
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the database
//! olo init --config ./config/olo.toml
//!
//! # Register an endpoint and harvest until the queue is empty
//! olo endpoint add https://export.arxiv.org/oai2
//! olo queue endpoints --run --drain
//!
//! # Four worker processes scraping pages
//! olo queue pages --dynos 4
//!
//! # Backlog and ETA
//! olo queue works --status
//! ```

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use open_locator::config::{self, Config};
use open_locator::dynos::{self, DynoSpec};
use open_locator::lease::{worker_tag, ClaimFilter};
use open_locator::normalize::clean_doi;
use open_locator::queue::{QueueKind, WorkQueue};
use open_locator::runner::{self, IdSource, JobContext, Operation, RunOptions};
use open_locator::{db, endpoints, logging, migrate, rules, status, works};

/// Open Locator: finds and ranks freely readable copies of published works.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/olo.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "olo",
    about = "Open Locator: finds and ranks freely readable copies of published works",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/olo.toml`.
    #[arg(long, global = true, default_value = "./config/olo.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Upsert works and put them on the works queue.
    ///
    /// Ids that look like DOIs are canonicalized to lowercase bare DOIs.
    Add {
        /// Work identifiers (usually DOIs).
        #[arg(required = true)]
        ids: Vec<String>,

        /// JSON metadata file. With one id the whole file is that work's
        /// metadata; with several it must be an object keyed by id.
        #[arg(long)]
        metadata: Option<PathBuf>,
    },

    /// Harvest endpoint management.
    Endpoint {
        #[command(subcommand)]
        action: EndpointAction,
    },

    /// Rule table management.
    Rules {
        #[command(subcommand)]
        action: RulesAction,
    },

    /// Queue-driven worker surface.
    ///
    /// Without an action flag, prints the queue status.
    Queue {
        queue: QueueKind,

        /// Loop forever, leasing and processing chunks.
        #[arg(long)]
        run: bool,

        /// Process one item synchronously, bypassing the queue.
        #[arg(long)]
        id: Option<String>,

        /// Stop after this many items.
        #[arg(long)]
        limit: Option<usize>,

        /// Items per chunk (defaults to `[queue].chunk_size`).
        #[arg(long)]
        chunk: Option<usize>,

        /// Print backlog size and ETA.
        #[arg(long)]
        status: bool,

        /// Release every in-flight lease, live or expired.
        #[arg(long)]
        kick: bool,

        /// Start N worker processes running this queue.
        #[arg(long)]
        dynos: Option<usize>,

        /// Operation to run (defaults to the queue's own operation).
        #[arg(long, value_enum)]
        op: Option<Operation>,

        /// Re-claim items finished more than `rescrape_after_days` ago.
        #[arg(long)]
        rescrape: bool,

        /// Exit on the first empty claim instead of waiting for work.
        #[arg(long)]
        drain: bool,
    },

    /// One-shot run of an operation over a fixed id list.
    Update {
        #[arg(value_enum)]
        op: Operation,

        /// Run on this id only.
        #[arg(long)]
        id: Option<String>,

        #[arg(long)]
        limit: Option<usize>,

        #[arg(long)]
        chunk: Option<usize>,
    },

    /// Print a work's consolidated result JSON.
    Show { id: String },
}

#[derive(Subcommand)]
enum EndpointAction {
    /// Register an endpoint (or update the URL and set of an existing id).
    Add {
        base_url: String,

        /// Harvest set spec.
        #[arg(long)]
        set: Option<String>,

        /// Endpoint id (defaults to the URL without scheme, plus `#set`).
        #[arg(long)]
        id: Option<String>,
    },
}

#[derive(Subcommand)]
enum RulesAction {
    /// Import a rules TOML file. Each table present replaces that table's rows.
    Load { file: PathBuf },
}

/// Works are keyed by canonical DOI; endpoint and page ids pass through.
fn target_id(op: Operation, id: String) -> String {
    if op.queue() == QueueKind::Works {
        clean_doi(&id).unwrap_or(id)
    } else {
        id
    }
}

/// Pair each id with its metadata JSON.
fn read_metadata(ids: &[String], path: Option<&Path>) -> anyhow::Result<Vec<(String, String)>> {
    let ids: Vec<String> = ids
        .iter()
        .map(|id| clean_doi(id).unwrap_or_else(|| id.trim().to_string()))
        .collect();

    let Some(path) = path else {
        return Ok(ids.into_iter().map(|id| (id, "{}".to_string())).collect());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read metadata file: {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse metadata file: {}", path.display()))?;

    if ids.len() == 1 {
        return Ok(vec![(ids[0].clone(), value.to_string())]);
    }
    let serde_json::Value::Object(by_id) = value else {
        bail!("metadata for several ids must be a JSON object keyed by id");
    };
    let by_id: HashMap<String, serde_json::Value> = by_id
        .into_iter()
        .map(|(k, v)| (clean_doi(&k).unwrap_or(k), v))
        .collect();
    Ok(ids
        .into_iter()
        .map(|id| {
            let metadata = by_id
                .get(&id)
                .map(|v| v.to_string())
                .unwrap_or_else(|| "{}".to_string());
            (id, metadata)
        })
        .collect())
}

fn run_options(cfg: &Config, limit: Option<usize>, chunk: Option<usize>, drain: bool) -> RunOptions {
    let mut opts = RunOptions::from_config(cfg);
    if let Some(chunk) = chunk {
        opts.chunk_size = chunk;
    }
    opts.limit = limit;
    opts.drain = drain;
    opts
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    logging::init(&cfg.logging.filter);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Add { ids, metadata } => {
            let works_in = read_metadata(&ids, metadata.as_deref())?;
            let pool = db::connect(&cfg).await?;
            let n = works::add_works(&pool, &works_in).await?;
            println!("Added {} work(s) to the works queue.", n);
        }
        Commands::Endpoint { action } => match action {
            EndpointAction::Add { base_url, set, id } => {
                let pool = db::connect(&cfg).await?;
                let id =
                    endpoints::register_endpoint(&pool, &base_url, set.as_deref(), id.as_deref())
                        .await?;
                println!("Registered endpoint {}", id);
            }
        },
        Commands::Rules { action } => match action {
            RulesAction::Load { file } => {
                let pool = db::connect(&cfg).await?;
                let summary = rules::import_rules(&pool, &file).await?;
                println!("Rules loaded from {}", file.display());
                println!("  journal rules:     {}", summary.journal_rules);
                println!("  license patterns:  {}", summary.license_patterns);
                println!("  overrides:         {}", summary.overrides);
                println!("  noncompliant:      {}", summary.noncompliant);
                println!("  repository links:  {}", summary.repository_links);
                println!("  pmc manuscripts:   {}", summary.pmc_manuscripts);
            }
        },
        Commands::Queue {
            queue,
            run,
            id,
            limit,
            chunk,
            status: show_status,
            kick,
            dynos: dyno_count,
            op,
            rescrape,
            drain,
        } => {
            let op = op.unwrap_or_else(|| Operation::default_for(queue));
            if op.queue() != queue {
                bail!("operation {} does not run on the {} queue", op, queue);
            }
            if rescrape && queue != QueueKind::Pages {
                bail!("--rescrape only applies to the pages queue");
            }

            if let Some(n) = dyno_count {
                let spec = DynoSpec {
                    config_path: cli.config.clone(),
                    queue,
                    op: Some(op),
                    chunk,
                    rescrape,
                };
                dynos::run_dynos(&spec, n).await?;
                return Ok(());
            }

            let pool = db::connect(&cfg).await?;

            if kick {
                let queue = WorkQueue::new(pool.clone(), queue, &cfg, worker_tag());
                let released = queue.kick().await?;
                println!("Released {} in-flight lease(s) on {}.", released, queue.kind());
            }

            if let Some(id) = id {
                let id = target_id(op, id);
                let ctx = JobContext::from_config(pool.clone(), &cfg)?;
                let opts = run_options(&cfg, None, chunk, false);
                let summary =
                    runner::run_operation(&ctx, op, IdSource::Fixed(vec![id.clone()]), &opts)
                        .await?;
                if summary.failed > 0 {
                    bail!("{} failed on {}", op, id);
                }
                println!("{} finished for {}", op, id);
            } else if run {
                let ctx = JobContext::from_config(pool.clone(), &cfg)?;
                let opts = run_options(&cfg, limit, chunk, drain);
                let filter = if rescrape {
                    ClaimFilter::FinishedBefore(Duration::from_secs(
                        cfg.queue.rescrape_after_days * 24 * 3600,
                    ))
                } else {
                    ClaimFilter::Available
                };
                let source = IdSource::Queue {
                    queue: WorkQueue::new(pool.clone(), queue, &cfg, worker_tag()),
                    filter,
                };
                let summary = runner::run_operation(&ctx, op, source, &opts).await?;
                println!(
                    "{}: {} item(s) in {} chunk(s), {} failed",
                    op, summary.processed, summary.chunks, summary.failed
                );
            } else if show_status || !kick {
                status::run_status(&pool, &cfg, queue).await?;
            }
        }
        Commands::Update {
            op,
            id,
            limit,
            chunk,
        } => {
            let pool = db::connect(&cfg).await?;
            let ctx = JobContext::from_config(pool.clone(), &cfg)?;
            let ids = match id {
                Some(id) => vec![target_id(op, id)],
                None => runner::all_ids(&pool, op).await?,
            };
            let opts = run_options(&cfg, limit, chunk, false);
            let summary = runner::run_operation(&ctx, op, IdSource::Fixed(ids), &opts).await?;
            println!(
                "{}: {} item(s) in {} chunk(s), {} failed",
                op, summary.processed, summary.chunks, summary.failed
            );
        }
        Commands::Show { id } => {
            let pool = db::connect(&cfg).await?;
            let id = clean_doi(&id).unwrap_or(id);
            let Some(work) = works::load_work(&pool, &id).await? else {
                bail!("no work with id {}", id);
            };
            match work.response_json.as_deref() {
                Some(json) => {
                    let value: serde_json::Value = serde_json::from_str(json)?;
                    println!("{}", serde_json::to_string_pretty(&value)?);
                }
                None => println!("{} has not been calculated yet", id),
            }
        }
    }

    Ok(())
}
