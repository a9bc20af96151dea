//! Stash CLI - resumable download queue on the command line
//!
//! Transfers run inside this process: `add` and `resume` stay in the
//! foreground until the task settles, and Ctrl-C pauses instead of losing
//! progress.

mod commands;
mod output;
mod progress;

use anyhow::Result;
use clap::{Parser, Subcommand};
use stash_core::Storage;
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Stash - resumable download queue
#[derive(Parser)]
#[command(name = "stash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Data directory for Stash
    #[arg(long, env = "STASH_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "human")]
    output: OutputFormat,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum OutputFormat {
    Human,
    Json,
    Table,
}

#[derive(Subcommand)]
enum Commands {
    /// Download an asset (or resume the task that already owns the id)
    Add {
        /// Task id of the source content
        id: String,

        /// URL to download
        url: String,

        /// Preview image URL kept with the task
        #[arg(long)]
        thumbnail: Option<String>,

        /// Extra metadata as a JSON object
        #[arg(long)]
        metadata: Option<String>,
    },

    /// List tasks, most recent first
    List {
        /// Filter by status
        #[arg(short, long)]
        status: Option<String>,

        /// Show all details
        #[arg(short, long)]
        all: bool,
    },

    /// Show task info
    Info {
        /// Task id
        id: String,
    },

    /// Pause a task
    Pause {
        /// Task id
        id: String,
    },

    /// Resume a paused or failed task
    Resume {
        /// Task id
        id: String,
    },

    /// Cancel a task and discard its partial file
    Cancel {
        /// Task id
        id: String,
    },

    /// Delete a task together with its file
    Delete {
        /// Task id
        id: String,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Show/update settings
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a config value
    Get {
        /// Config key
        key: String,
    },

    /// Set a config value
    Set {
        /// Config key
        key: String,

        /// Config value
        value: String,
    },

    /// Show all config
    Show,

    /// Reset to defaults
    Reset,
}

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_env("STASH_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if verbose {
            "stash_core=debug,stash=debug"
        } else {
            "warn"
        })
    });

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    // Determine data directory
    let data_dir = cli.data_dir.unwrap_or_else(Storage::default_data_dir);
    debug!("Using data directory {}", data_dir.display());

    // Settings and completions do not need a running core
    match cli.command {
        Commands::Config { action } => {
            return commands::config_action(data_dir, action, cli.output).await;
        }
        Commands::Completions { shell } => {
            use clap::CommandFactory;
            clap_complete::generate(shell, &mut Cli::command(), "stash", &mut std::io::stdout());
            return Ok(());
        }
        _ => {}
    }

    // Initialize core
    let (core, progress) = commands::open_core(data_dir, cli.output).await?;

    // Execute command
    match cli.command {
        Commands::Add {
            id,
            url,
            thumbnail,
            metadata,
        } => {
            commands::add_download(&core, &progress, id, url, thumbnail, metadata, cli.output)
                .await?
        }

        Commands::List { status, all } => commands::list_tasks(&core, status, all, cli.output).await?,

        Commands::Info { id } => commands::show_info(&core, &id, cli.output).await?,

        Commands::Pause { id } => commands::pause_download(&core, &id, cli.output).await?,

        Commands::Resume { id } => {
            commands::resume_download(&core, &progress, &id, cli.output).await?
        }

        Commands::Cancel { id } => commands::cancel_download(&core, &id, cli.output).await?,

        Commands::Delete { id, yes } => commands::delete_task(&core, &id, yes, cli.output).await?,

        Commands::Config { .. } | Commands::Completions { .. } => {}
    }

    Ok(())
}
