use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use runtrack::{ExternalCacheVerifier, Project, SnapshotCache};

#[derive(Parser, Debug)]
#[command(name = "runtrack", version, about = "Run tracking and result lookup for experiments")]
struct Cli {
    /// Project directory (defaults to the current directory)
    #[arg(long, global = true)]
    path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the run ledger
    Log,
    /// Verify pinned external data against its recorded commits
    Verify,
    /// Manage read-only data caches
    Cache(CacheArgs),
}

#[derive(Parser, Debug)]
struct CacheArgs {
    #[command(subcommand)]
    command: CacheCommands,
}

#[derive(Subcommand, Debug)]
enum CacheCommands {
    /// Re-materialize pinned external data (missing entries only unless forced)
    Reload {
        /// Discard and re-clone every pinned entry
        #[arg(long)]
        force: bool,
    },
    /// Remove branch snapshots and pinned external data
    Clear,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let path = cli.path.unwrap_or_else(|| PathBuf::from("."));
    let project = Project::open(&path)?;

    match cli.command {
        Commands::Log => {
            let ledger = SnapshotCache::new(&project).ledger()?;
            print!("{}", ledger.render_table());
            Ok(())
        }
        Commands::Verify => {
            ExternalCacheVerifier::new(&project).verify_all()?;
            println!("all pinned data matches its recorded commits");
            Ok(())
        }
        Commands::Cache(args) => match args.command {
            CacheCommands::Reload { force } => ExternalCacheVerifier::new(&project).reload(force),
            CacheCommands::Clear => {
                SnapshotCache::new(&project).clear()?;
                ExternalCacheVerifier::new(&project).clear()
            }
        },
    }
}
