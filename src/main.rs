mod app;
mod cache;
mod commands;
mod config;
mod db;
mod event;
mod fetch;
mod logging;
mod network;
mod queue;
mod store;
mod sync;
#[cfg(test)]
mod test_support;
mod update;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::path::PathBuf;

use commands::{FetchArgs, ReportArgs};

#[derive(Parser, Debug)]
#[command(name = "fieldsync")]
#[command(about = "Offline-first submission queue and fetch cache for field reports")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./fieldsync.yaml, then $XDG_CONFIG_HOME/fieldsync/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Mirror log output to stderr
  #[arg(short, long, global = true)]
  verbose: bool,

  /// Keep the queue and caches in memory for this invocation only
  #[arg(long, global = true)]
  ephemeral: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Queue a report for the next flush
  Enqueue(ReportArgs),
  /// Deliver a report now, queueing it if the backend cannot be reached
  Submit {
    #[command(flatten)]
    report: ReportArgs,
    /// Skip the delivery attempt, as when the client knows it is offline
    #[arg(long)]
    offline: bool,
  },
  /// List pending submissions
  Status,
  /// Send pending submissions to the backend
  Flush,
  /// Drop every pending submission
  Clear,
  /// Rewrite the queue log to its live records
  Compact,
  /// Run the sync agent until interrupted
  Run,
  /// Inspect and manage the response caches
  Cache {
    #[command(subcommand)]
    command: CacheCommand,
  },
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
  /// Precache the configured version and evict older generations
  Install,
  /// Issue one request through the cache manager
  Fetch(FetchArgs),
  /// List cache generations and their entries
  List,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = config::Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.data_dir()?.join("logs"), args.verbose)?;

  let ephemeral = args.ephemeral;
  match args.command {
    Command::Enqueue(report) => commands::enqueue(&config, ephemeral, &report),
    Command::Submit { report, offline } => commands::submit(&config, ephemeral, &report, offline).await,
    Command::Status => commands::status(&config, ephemeral),
    Command::Flush => commands::flush(&config, ephemeral).await,
    Command::Clear => commands::clear(&config, ephemeral),
    Command::Compact => commands::compact(&config, ephemeral),
    Command::Run => app::App::new(config, ephemeral)?.run().await,
    Command::Cache { command } => match command {
      CacheCommand::Install => commands::cache_install(&config, ephemeral).await,
      CacheCommand::Fetch(fetch) => commands::cache_fetch(&config, ephemeral, &fetch).await,
      CacheCommand::List => commands::cache_list(&config, ephemeral),
    },
  }
}
