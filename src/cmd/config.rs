//! Configuration view and validation commands (`fleetpatch config`).

use anyhow::Result;

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &std::path::Path, command: Option<ConfigCommands>) -> Result<()> {
    use fleetpatch::config::{CONFIG_DIR, CONFIG_FILE, FleetConfig, FleetToml};

    let config_dir = project_dir.join(CONFIG_DIR);
    let config_path = config_dir.join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Fleetpatch Configuration");
            println!("========================");
            println!();

            let toml = if config_path.exists() {
                println!("Config file: {}", config_path.display());
                FleetToml::load(&config_path)?
            } else {
                println!("No {} found at {}", CONFIG_FILE, config_path.display());
                println!("Using default configuration.");
                FleetToml::default()
            };
            println!();

            println!("[github]");
            println!("  api_url = \"{}\"", toml.github.api_url);
            println!("  graphql_url = \"{}\"", toml.github.graphql_url);
            if let Some(actor) = &toml.github.actor {
                println!("  actor = \"{}\"", actor);
            }
            println!("  token_env = \"{}\"", toml.github.token_env);
            println!();

            println!("[run]");
            println!("  tasks_file = \"{}\"", toml.run.tasks_file.display());
            println!("  workspace_root = \"{}\"", toml.run.workspace_root.display());
            println!("  max_parallel = {}", toml.run.max_parallel);
            println!();

            println!("[pacing]");
            println!("  settle_after_fork_ms = {}", toml.pacing.settle_after_fork_ms);
            println!("  settle_after_commit_ms = {}", toml.pacing.settle_after_commit_ms);
            println!("  min_mutation_interval_ms = {}", toml.pacing.min_mutation_interval_ms);
            println!();

            println!("[retry]");
            println!("  max_attempts = {}", toml.retry.max_attempts);
            println!();

            println!("[rewrite]");
            println!("  marker = \"{}\"", toml.rewrite.marker);
            println!("  extensions = {:?}", toml.rewrite.extensions);
            println!("  scope = \"{}\"", toml.rewrite.scope);
            println!();

            // Only resolvable when the project dir exists.
            if let Ok(config) = FleetConfig::new(project_dir.to_path_buf()) {
                println!("Effective values (with env/CLI overrides):");
                println!("  tasks_file = \"{}\"", config.tasks_file().display());
                println!("  workspace_root = \"{}\"", config.workspace_root().display());
                let token_set = config.token().is_ok();
                println!(
                    "  {} = {}",
                    toml.github.token_env,
                    if token_set { "(set)" } else { "(not set)" }
                );
                println!();
            }

            if !config_path.exists() {
                println!("Run 'fleetpatch config init' to create a {} file.", CONFIG_FILE);
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No {} found. Using defaults (valid).", CONFIG_FILE);
                return Ok(());
            }

            let toml = FleetToml::load(&config_path)?;
            let warnings = toml.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("{} already exists at {}", CONFIG_FILE, config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            if !config_dir.exists() {
                std::fs::create_dir_all(&config_dir)?;
            }

            FleetToml::default().save(&config_path)?;

            println!("Created {} at {}", CONFIG_FILE, config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [github] actor, token_env");
            println!("  - [run] tasks_file, workspace_root, max_parallel");
            println!("  - [commit] and [pull_request] titles and bodies");
            println!();
        }
    }

    Ok(())
}
