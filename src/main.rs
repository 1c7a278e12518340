use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use fleetpatch::config::log_dir;
use fleetpatch::logging::{LogFormat, init_logging};

mod cmd;

#[derive(Parser)]
#[command(name = "fleetpatch")]
#[command(version, about = "Fork, patch and open pull requests across many GitHub repositories")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Console log format
    #[arg(long, value_enum, default_value = "text", global = true)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Migrate every repository in the task list
    Run {
        /// Task list file (one `owner/name[/path]` per line)
        #[arg(short, long)]
        tasks: Option<PathBuf>,

        /// Maximum concurrent pipelines (0 for unbounded)
        #[arg(long)]
        max_parallel: Option<usize>,

        /// Rewrite and diff locally, but do not touch the remote
        #[arg(long)]
        dry_run: bool,

        /// Write the JSON run report to this path
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Show which task lines a run would claim, without touching anything
    Plan {
        #[arg(short, long)]
        tasks: Option<PathBuf>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default fleetpatch.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Run {
            tasks,
            max_parallel,
            dry_run,
            report,
        } => {
            let _guard = init_logging(cli.log_format, cli.verbose, Some(&log_dir(&project_dir)));
            let args = cmd::RunArgs {
                tasks: tasks.clone(),
                max_parallel: *max_parallel,
                dry_run: *dry_run,
                report: report.clone(),
            };
            cmd::cmd_run(&cli, project_dir, args).await?;
        }
        Commands::Plan { tasks } => {
            let _guard = init_logging(cli.log_format, cli.verbose, None);
            cmd::cmd_plan(&project_dir, tasks.clone())?;
        }
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
    }

    Ok(())
}
