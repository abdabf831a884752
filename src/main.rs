use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use genforge::config::GenforgeConfig;
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "genforge")]
#[command(version, about = "Generation job orchestrator with autonomous healing")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Port to serve on (overrides genforge.toml and GENFORGE_PORT)
    #[arg(long, global = true)]
    pub port: Option<u16>,

    /// Job database path (overrides genforge.toml and GENFORGE_DB)
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// Base URL of a running server, for client commands
    #[arg(long, global = true, env = "GENFORGE_SERVER")]
    pub server: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the job server: HTTP API, progress websocket and job runner
    Serve,
    /// Submit a generation job
    Enqueue(EnqueueArgs),
    /// Show one job, or the most recent jobs when no id is given
    Status {
        id: Option<String>,

        /// How many jobs to list
        #[arg(long, default_value = "20")]
        limit: usize,

        /// Include the healing attempt history
        #[arg(long)]
        healing: bool,
    },
    /// Follow a job until it settles
    Watch { id: String },
    /// Cancel a queued or processing job
    Cancel { id: String },
    /// List repairs the healing engine has learned
    Knowledge {
        /// Read the knowledge file directly instead of asking the server
        #[arg(long)]
        local: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Args, Clone, Debug)]
pub struct EnqueueArgs {
    /// Prompt for the generator; shorthand for --request '{"prompt": ...}'
    #[arg(short, long)]
    pub prompt: Option<String>,

    /// Full request body as JSON
    #[arg(long)]
    pub request: Option<String>,

    /// Target platform (react, vue, svelte, nextjs, vanilla)
    #[arg(long)]
    pub platform: Option<String>,

    /// Session id; progress is also published on this topic
    #[arg(long)]
    pub session: Option<String>,

    /// Comma-separated phase list overriding the configured one
    #[arg(long)]
    pub phases: Option<String>,

    /// Follow the job after submitting it
    #[arg(short, long)]
    pub watch: bool,
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default genforge.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    // Config commands run before logging so they work with a broken genforge.toml.
    if let Commands::Config { command } = &cli.command {
        return cmd::cmd_config(&project_dir, command.clone());
    }

    let config = GenforgeConfig::with_cli_args(project_dir, cli.verbose, cli.port, cli.db.clone())?;
    let log_dir = config.toml.logging.dir.as_ref().map(|dir| config.genforge_dir.join(dir));
    let _log_guard = genforge::telemetry::init(
        &config.log_level(),
        &config.toml.logging.format,
        log_dir.as_deref(),
    )?;

    let server = cli.server.as_deref();
    match &cli.command {
        Commands::Serve => cmd::cmd_serve(&config).await?,
        Commands::Enqueue(args) => {
            let client = cmd::api_client(server, &config)?;
            let job_id = cmd::cmd_enqueue(&client, args).await?;
            if args.watch {
                cmd::cmd_watch(&client, config.observer_settings(), job_id.as_str()).await?;
            }
        }
        Commands::Status { id, limit, healing } => {
            let client = cmd::api_client(server, &config)?;
            cmd::cmd_status(&client, id.as_deref(), *limit, *healing).await?;
        }
        Commands::Watch { id } => {
            let client = cmd::api_client(server, &config)?;
            cmd::cmd_watch(&client, config.observer_settings(), id).await?;
        }
        Commands::Cancel { id } => {
            let client = cmd::api_client(server, &config)?;
            cmd::cmd_cancel(&client, id).await?;
        }
        Commands::Knowledge { local } => {
            let client = cmd::api_client(server, &config)?;
            cmd::cmd_knowledge(&client, &config, *local).await?;
        }
        Commands::Config { .. } => {}
    }

    Ok(())
}
