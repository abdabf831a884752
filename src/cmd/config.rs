//! Configuration view and validation commands (`genforge config`).

use anyhow::Result;
use genforge::config::{GENFORGE_DIR, GenforgeConfig, GenforgeToml};
use std::path::Path;

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &Path, command: Option<ConfigCommands>) -> Result<()> {
    let genforge_dir = project_dir.join(GENFORGE_DIR);
    let config_path = genforge_dir.join("genforge.toml");

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("genforge configuration");
            println!("======================");
            println!();

            let toml = if config_path.exists() {
                println!("Config file: {}", config_path.display());
                GenforgeToml::load(&config_path)?
            } else {
                println!("No genforge.toml found at {}", config_path.display());
                println!("Using default configuration.");
                GenforgeToml::default()
            };
            println!();
            print!("{}", toml::to_string_pretty(&toml)?);
            println!();

            // Effective values (with env/CLI overrides)
            let config = GenforgeConfig::new(project_dir.to_path_buf())?;
            println!("Effective values (with env overrides):");
            println!("  bind_addr = \"{}\"", config.bind_addr());
            println!("  db_path = \"{}\"", config.db_path().display());
            println!(
                "  executor_cmd = {}",
                config
                    .executor_cmd()
                    .map(|c| format!("\"{}\"", c))
                    .unwrap_or_else(|| "(unset)".to_string())
            );
            println!(
                "  repair_cmd = {}",
                config
                    .repair_cmd()
                    .map(|c| format!("\"{}\"", c))
                    .unwrap_or_else(|| "(unset)".to_string())
            );
            println!("  knowledge_file = \"{}\"", config.knowledge_file().display());
            println!();

            if !config_path.exists() {
                println!("Run 'genforge config init' to create a genforge.toml file.");
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No genforge.toml found. Using defaults (valid).");
                return Ok(());
            }

            let toml = GenforgeToml::load(&config_path)?;
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
                println!("genforge.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            std::fs::create_dir_all(&genforge_dir)?;
            GenforgeToml::default().save(&config_path)?;

            println!("Created genforge.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [pipeline] phases, executor_cmd, default_platform");
            println!("  - [healing] max_attempts, confidence_threshold, repair_cmd");
            println!("  - [observer] fallback_ms, poll_interval_ms");
            println!();
        }
    }

    Ok(())
}
