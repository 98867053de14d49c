use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;

use pagesync::config::Config;
use pagesync::replay::{self, Scenario};

#[derive(Parser, Debug)]
#[command(name = "pagesync")]
#[command(about = "Replay list-view synchronization scenarios against a reference backend")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/pagesync/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Replay a scenario and print the final state of every view
  Replay {
    scenario: PathBuf,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,
  },
  /// Replay a scenario and fail if any view drifted from the backend
  Check { scenario: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = pagesync::logging::init(&config.logging)?;

  match args.command {
    Command::Replay { scenario, json } => {
      let scenario = Scenario::load(&scenario)?;
      let report = replay::run(&scenario, &config).await?;
      if json {
        println!("{}", report.to_json()?);
      } else {
        print!("{}", report.render_text());
      }
    }
    Command::Check { scenario } => {
      let scenario = Scenario::load(&scenario)?;
      let report = replay::run(&scenario, &config).await?;
      let drifted: Vec<&str> = report.drifted().map(|v| v.label.as_str()).collect();
      if !drifted.is_empty() {
        print!("{}", report.render_text());
        return Err(eyre!("{} view(s) drifted: {}", drifted.len(), drifted.join(", ")));
      }
      println!("{} view(s) consistent", report.views.len());
    }
  }

  Ok(())
}
