//! # OAI Harvest CLI (`harvest`)
//!
//! The `harvest` binary initializes the database, runs incremental
//! `ListRecords` harvests against configured OAI-PMH endpoints, and
//! inspects what has been stored.
//!
//! ## Usage
//!
//! ```bash
//! harvest --config ./config/harvest.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `harvest init` | Create the SQLite database and run schema migrations |
//! | `harvest targets` | List configured targets and their stored progress |
//! | `harvest run <target>` | Harvest one target, or `all` of them concurrently |
//! | `harvest get <id>` | Print a stored identifier as JSON |
//! | `harvest stats` | Show per-service counts and checkpoints |
//!
//! ## Examples
//!
//! ```bash
//! # Resume from the latest stored datestamp
//! harvest run doidb --config ./config/harvest.toml
//!
//! # Re-harvest a fixed window, ignoring stored progress
//! harvest run doidb --full --from 2021-01-01 --until 2021-06-30
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use oai_harvest::config::{self, parse_date_arg};
use oai_harvest::session::{self, HarvestOptions};
use oai_harvest::{get, logging, migrate, services, stats};

/// OAI Harvest CLI: incremental OAI-PMH harvesting into SQLite.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/harvest.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "harvest",
    about = "Incremental OAI-PMH harvester with a durable SQLite store",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/harvest.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables. Running it
    /// again is safe.
    Init,

    /// List configured targets with their latest stored datestamp.
    Targets,

    /// Harvest a target.
    ///
    /// Without `--from` the harvest resumes from the newest datestamp
    /// already stored for the target's service and set.
    Run {
        /// Target name from `[targets.<name>]`, or `all`.
        target: String,

        /// Ignore stored progress and harvest the whole window.
        #[arg(long)]
        full: bool,

        /// Lower bound of the window (YYYY-MM-DD or YYYY-MM-DDThh:mm:ssZ).
        #[arg(long)]
        from: Option<String>,

        /// Upper bound of the window (YYYY-MM-DD or YYYY-MM-DDThh:mm:ssZ).
        #[arg(long)]
        until: Option<String>,
    },

    /// Print a stored identifier as JSON.
    Get {
        /// External identifier, e.g. `10273/IEABC0001`.
        id: String,
    },

    /// Show database statistics.
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    logging::init(&cfg.logging.level);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Targets => {
            services::list_targets(&cfg).await?;
        }
        Commands::Run {
            target,
            full,
            from,
            until,
        } => {
            let options = HarvestOptions {
                full,
                from: from.as_deref().map(parse_date_arg).transpose()?,
                until: until.as_deref().map(parse_date_arg).transpose()?,
            };

            let shutdown = CancellationToken::new();
            let on_interrupt = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; finishing current page");
                    on_interrupt.cancel();
                }
            });

            session::run_harvest(&cfg, &target, options, shutdown).await?;
        }
        Commands::Get { id } => {
            get::run_get(&cfg, &id).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
    }

    Ok(())
}
