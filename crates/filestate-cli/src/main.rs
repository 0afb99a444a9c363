mod cmd_clear;
mod cmd_files;
mod cmd_modules;
mod cmd_set;
mod cmd_show;
mod paths;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use filestate::{FileStateManager, ManagerConfig};
use filestate_sqlite::SqliteStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use crate::paths::DataDirResolver;

#[derive(Parser, Debug)]
#[command(name = "filestate")]
#[command(about = "Inspect and edit per-file state databases")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// State database (default: $FILESTATE_HOME/filestate.db)
    #[arg(long, global = true, env = "FILESTATE_DB")]
    db: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List every file with stored state
    Files {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Load and print the combined state of a file
    Show {
        /// File path the state belongs to
        path: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Replace one module's state for a file
    Set {
        /// File path the state belongs to
        path: String,

        /// Module id (see `filestate modules`)
        module: String,

        /// New state as JSON
        state: String,
    },
    /// Clear one module's state, or everything stored for a file
    Clear {
        /// File path the state belongs to
        path: String,

        /// Only clear this module
        #[arg(long)]
        module: Option<String>,
    },
    /// List registered state modules
    Modules {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn open_manager(db: &Path) -> Result<FileStateManager> {
    let store = SqliteStore::open(db).with_context(|| format!("Failed to open {:?}", db))?;
    tracing::debug!(db = %db.display(), "opened state database");
    Ok(FileStateManager::with_default_modules(
        Arc::new(store),
        ManagerConfig::default(),
    ))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let db = match cli.db {
        Some(db) => db,
        None => DataDirResolver::from_env().database_path()?,
    };
    let manager = open_manager(&db)?;

    let result = match cli.command {
        Commands::Files { json } => cmd_files::run(&manager, json).await,
        Commands::Show { path, json } => cmd_show::run(&manager, &path, json).await,
        Commands::Set {
            path,
            module,
            state,
        } => cmd_set::run(&manager, &path, &module, &state).await,
        Commands::Clear { path, module } => cmd_clear::run(&manager, &path, module.as_deref()).await,
        Commands::Modules { json } => cmd_modules::run(&manager, json),
    };
    manager.shutdown().await?;
    result
}
