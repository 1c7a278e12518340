//! Bulk migration run (`fleetpatch run`).

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fleetpatch::config::{FleetConfig, is_valid_github_token, load_dotenv};
use fleetpatch::dispatch::{Dispatcher, InMemoryRegistry};
use fleetpatch::errors::ConfigError;
use fleetpatch::logging::LogFormat;
use fleetpatch::pacing::{Pacer, RetryPolicy, TokioClock};
use fleetpatch::pipeline::{CommitTemplate, Pipeline, PullRequestTemplate};
use fleetpatch::platform::{GitHubClient, Identity, Platform};
use fleetpatch::rewrite::RegexRewriter;
use fleetpatch::task::parse_task_list;
use fleetpatch::ui::RunProgress;
use fleetpatch::workspace::WorkspaceManager;

use super::super::Cli;

pub struct RunArgs {
    pub tasks: Option<PathBuf>,
    pub max_parallel: Option<usize>,
    pub dry_run: bool,
    pub report: Option<PathBuf>,
}

pub async fn cmd_run(cli: &Cli, project_dir: PathBuf, args: RunArgs) -> Result<()> {
    load_dotenv(&project_dir);
    let config = FleetConfig::with_cli_args(
        project_dir,
        cli.verbose,
        args.tasks,
        args.max_parallel,
        args.dry_run,
    )?;
    for warning in config.validate() {
        tracing::warn!("{}", warning);
    }

    let token = config.token()?;
    if !is_valid_github_token(&token) {
        tracing::warn!(
            var = %config.toml.github.token_env,
            "token does not have a known GitHub prefix"
        );
    }

    let tasks_path = config.tasks_file();
    let content = read_tasks(&tasks_path)?;
    let lines = parse_task_list(&content);
    if lines.is_empty() {
        println!("No tasks in {}", tasks_path.display());
        return Ok(());
    }

    let client = GitHubClient::new(&config.toml.github.api_url, &config.toml.github.graphql_url, token)?
        .with_actor(config.toml.github.actor.clone());
    let actor = client
        .current_actor()
        .await
        .context("Failed to resolve the authenticated account")?;
    tracing::info!(actor = %actor, tasks = lines.len(), dry_run = config.dry_run, "starting run");

    let pipeline = build_pipeline(&config, Arc::new(client), actor)?;
    let total = lines.iter().filter(|l| l.parsed.is_ok()).count() as u64;
    let progress = if cli.log_format == LogFormat::Json {
        RunProgress::hidden()
    } else {
        RunProgress::new(total, cli.verbose)
    };
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let progress_task = tokio::spawn(progress.drive(rx));

    let dispatcher = Dispatcher::new(Arc::new(pipeline), Arc::new(InMemoryRegistry::new()))
        .with_max_parallel(config.max_parallel())
        .with_event_channel(tx);
    let report = dispatcher.run(lines).await;
    drop(dispatcher);
    progress_task.await.ok();

    println!();
    print!("{}", report.render_summary());

    if let Some(path) = args.report {
        let path = if path.is_absolute() {
            path
        } else {
            config.project_dir.join(path)
        };
        report.write_json(&path)?;
        println!("Report written to {}", path.display());
    }

    Ok(())
}

fn read_tasks(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::TaskListUnreadable {
        path: path.to_path_buf(),
        source,
    })
}

fn build_pipeline(config: &FleetConfig, platform: Arc<dyn Platform>, actor: String) -> Result<Pipeline> {
    let toml = &config.toml;
    let rewriter = RegexRewriter::from_config(&toml.rewrite)?;
    let identity = Identity {
        name: toml.commit.author_name.clone(),
        email: toml.commit.author_email.clone(),
    };
    let workspaces = WorkspaceManager::new(
        config.workspace_root(),
        toml.run.ci_dir.clone(),
        toml.run.patch_file.clone(),
        identity,
    );
    let pacer = Pacer::new(
        Arc::new(TokioClock),
        config.settle_after_fork(),
        config.settle_after_commit(),
        config.min_mutation_interval(),
    );

    Ok(Pipeline::new(platform, workspaces, Arc::new(rewriter), actor)
        .with_pacer(Arc::new(pacer))
        .with_retry(RetryPolicy::from_config(&toml.retry))
        .with_commit(CommitTemplate::from_config(&toml.commit))
        .with_pull_request(PullRequestTemplate::from_config(config))
        .with_dry_run(config.dry_run))
}
