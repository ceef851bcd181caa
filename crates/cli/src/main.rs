//! Treewatch CLI - treewatch command

use anyhow::Result;
use clap::{Parser, Subcommand};

mod cmd;

/// Treewatch - recursive file system watcher
#[derive(Parser)]
#[command(name = "treewatch")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine over stdin/stdout (newline-delimited JSON)
    Serve,
    /// Watch a directory and print changes until Ctrl-C
    Watch(cmd::watch::WatchArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (_guard, log) = cli_lib::logging::init()?;

    match cli.command {
        Commands::Serve => cmd::serve::run(log).await,
        Commands::Watch(args) => cmd::watch::run(args, log).await,
    }
}
