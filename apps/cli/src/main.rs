//! StarFS CLI - fetch files from StarFS nodes
//!
//! Every chunk is paid for with proof-of-work mined locally.

mod commands;
mod output;
mod progress;

use anyhow::Result;
use clap::{Parser, Subcommand};
use starfs_types::DEFAULT_STEP;
use std::path::PathBuf;
use url::Url;

/// StarFS - proof-of-work gated file retrieval
#[derive(Parser)]
#[command(name = "starfs")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Node to talk to
    #[arg(long, env = "STARFS_SERVER", default_value = "ws://localhost:3000")]
    server: Url,

    /// Output format
    #[arg(long, default_value = "human")]
    format: OutputFormat,

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
    /// Download a file by hash
    Get {
        /// File hash
        hash: String,

        /// Output file path (defaults to the hash)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Bytes requested per chunk, minus one
        #[arg(long, default_value_t = DEFAULT_STEP)]
        step: u64,

        /// Write the content to stdout instead of a file
        #[arg(long, conflicts_with = "output")]
        stdout: bool,
    },

    /// Show node status
    Status,

    /// Show the node's ledger balances
    Ledger,

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(tracing_subscriber::EnvFilter::new("debug"))
            .init();
    }

    match cli.command {
        Commands::Get {
            hash,
            output,
            step,
            stdout,
        } => {
            let target = if stdout {
                commands::Target::Stdout
            } else {
                commands::Target::File(output.unwrap_or_else(|| PathBuf::from(&hash)))
            };
            commands::get_file(&cli.server, &hash, target, step, cli.format).await?
        }

        Commands::Status => commands::show_status(&cli.server, cli.format).await?,

        Commands::Ledger => commands::show_ledger(&cli.server, cli.format).await?,

        Commands::Completions { shell } => {
            use clap::CommandFactory;
            clap_complete::generate(shell, &mut Cli::command(), "starfs", &mut std::io::stdout());
        }
    }

    Ok(())
}
