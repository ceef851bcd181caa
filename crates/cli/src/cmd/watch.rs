//! Watch a directory through a `treewatch serve` child and print changes

use anyhow::{Context, Result};
use clap::Args;
use cli_lib::logging::LogHandle;
use cli_lib::Client;
use owo_colors::OwoColorize;
use std::path::PathBuf;
use treewatch_core::{BackendKind, FilterSet, Op, WatchConfig, WatchEvent};

#[derive(Args, Debug)]
pub struct WatchArgs {
    /// Directory to watch
    pub path: PathBuf,

    /// Watch subdirectories too
    #[arg(short, long)]
    pub recursive: bool,

    /// Only report these operations (create, write, rename, move, remove)
    #[arg(short, long = "filter", value_name = "OP")]
    pub filters: Vec<Op>,

    /// Paths to leave unwatched
    #[arg(short, long = "ignore", value_name = "PATH")]
    pub ignore: Vec<PathBuf>,

    /// Skip dot-files and dot-directories
    #[arg(long)]
    pub ignore_hidden: bool,

    /// Coalescing window in milliseconds
    #[arg(long, default_value = "500")]
    pub interval: u64,

    /// Scan periodically instead of using kernel notifications
    #[arg(long)]
    pub poll: bool,

    /// Verbose engine diagnostics
    #[arg(long)]
    pub debug: bool,

    /// Print events as JSON lines
    #[arg(long)]
    pub json: bool,
}

impl WatchArgs {
    fn config(&self) -> Result<WatchConfig> {
        let path = std::fs::canonicalize(&self.path)
            .with_context(|| format!("Failed to resolve {}", self.path.display()))?;

        let mut config = WatchConfig::new(path)
            .recursive(self.recursive)
            .filters(FilterSet::new(self.filters.iter().copied()))
            .interval_ms(self.interval);
        config.ignore_paths = self.ignore.clone();
        config.ignore_hidden_files = self.ignore_hidden;
        config.debug = self.debug;
        if self.poll {
            config.backend = BackendKind::Poll;
        }

        config.validate()?;
        Ok(config)
    }
}

pub async fn run(args: WatchArgs, log: LogHandle) -> Result<()> {
    let config = args.config()?;
    log.set_debug(args.debug);

    let exe = std::env::current_exe().context("Failed to get current executable path")?;
    let client = Client::spawn(&exe).context("Failed to launch engine")?;

    let json = args.json;
    client.on_all(move |event| print_event(event, json));
    client.on_error(|err| eprintln!("{} {}", "error".red().bold(), err));

    let files = client
        .start(config.clone())
        .await
        .with_context(|| format!("Failed to watch {}", config.path.display()))?;

    if !json {
        println!(
            "{} {} ({} entries, Ctrl-C to stop)",
            "Watching".green().bold(),
            config.path.display(),
            files.len()
        );
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    client.stop().await.context("Failed to stop engine")?;
    client.close().await.context("Engine did not exit cleanly")?;

    if !json {
        println!("{}", "Stopped".dimmed());
    }
    Ok(())
}

fn print_event(event: &WatchEvent, json: bool) {
    if json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{}", line),
            Err(e) => eprintln!("failed to encode event: {}", e),
        }
        return;
    }

    let time = event
        .timestamp
        .with_timezone(&chrono::Local)
        .format("%H:%M:%S")
        .to_string();
    let op = format!("{:<6}", event.op.as_str());
    let op = match event.op {
        Op::Create => op.green().to_string(),
        Op::Write => op.yellow().to_string(),
        Op::Remove => op.red().to_string(),
        Op::Rename | Op::Move => op.cyan().to_string(),
    };

    match &event.old_path {
        Some(old_path) => println!(
            "{} {} {} {} {}",
            time.dimmed(),
            op,
            old_path.display(),
            "->".dimmed(),
            event.path.display()
        ),
        None => println!("{} {} {}", time.dimmed(), op, event.path.display()),
    }
}
