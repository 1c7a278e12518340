//! Offline view of what a run would claim (`fleetpatch plan`).

use anyhow::Result;
use console::style;
use std::path::{Path, PathBuf};

use fleetpatch::config::FleetConfig;
use fleetpatch::dispatch::{Dispatch, InMemoryRegistry, plan};
use fleetpatch::errors::ConfigError;
use fleetpatch::task::parse_task_list;
use fleetpatch::ui::icons::{CHECK, CROSS, SKIP};

pub fn cmd_plan(project_dir: &Path, tasks: Option<PathBuf>) -> Result<()> {
    let config = FleetConfig::with_cli_args(project_dir.to_path_buf(), false, tasks, None, true)?;
    let path = config.tasks_file();
    let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::TaskListUnreadable {
        path: path.clone(),
        source,
    })?;

    let lines = parse_task_list(&content);
    let decisions = plan(&lines, &InMemoryRegistry::new());

    let (mut claimed, mut duplicates, mut malformed) = (0, 0, 0);
    println!();
    println!("Tasks from {}", path.display());
    println!();
    for (line, decision) in &decisions {
        match decision {
            Dispatch::Claimed(task) => {
                claimed += 1;
                let target = if task.has_target_file() {
                    task.relative_path.as_str()
                } else {
                    "(whole repository)"
                };
                println!("{}{:>4}  {} {}", CHECK, line.line, style(task.key()).bold(), style(target).dim());
            }
            Dispatch::Duplicate { task, first_line } => {
                duplicates += 1;
                println!(
                    "{}{:>4}  {} duplicate of line {}",
                    SKIP,
                    line.line,
                    style(task.key()).dim(),
                    first_line
                );
            }
            Dispatch::Malformed(err) => {
                malformed += 1;
                println!("{}{:>4}  {}", CROSS, line.line, style(&err.cause).red());
            }
        }
    }
    println!();
    println!(
        "{} claimed, {} duplicates, {} malformed",
        style(claimed).green().bold(),
        duplicates,
        malformed
    );

    Ok(())
}
