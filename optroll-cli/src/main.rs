use anyhow::Result;
use clap::{Parser, Subcommand};

use optroll_config::load_config;

mod market;
mod runtime;
mod tasks;
mod telemetry;

use tasks::TaskAddArgs;

#[derive(Parser)]
#[command(author, version, about = "Automated option roll agent")]
struct Cli {
    /// Increases logging verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Selects which configuration environment to load (maps to config/{env}.toml)
    #[arg(long, default_value = "default")]
    env: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent: recovery scan, market stream, dispatcher and workers
    Run,
    /// Manage watch tasks
    Task {
        #[command(subcommand)]
        action: TaskCommand,
    },
    /// Show the latest index price for an underlying
    Price {
        /// Underlying symbol, e.g. BTCUSDT (bare coins promote to USDT)
        symbol: String,
    },
    /// Show open option positions for a configured credential
    Positions {
        /// Credential table entry
        #[arg(long)]
        credential: i64,
    },
}

#[derive(Subcommand)]
enum TaskCommand {
    /// Create a new watch task
    Add(TaskAddArgs),
    /// Show active tasks
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(Some(&cli.env))?;

    let filter = match cli.verbose {
        0 => config.log_level.clone(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    telemetry::init_tracing(&filter, config.log_path.as_deref())?;

    match cli.command {
        Commands::Run => runtime::run_agent(config).await,
        Commands::Task { action } => match action {
            TaskCommand::Add(args) => tasks::add_task(&config, args),
            TaskCommand::List => tasks::list_tasks(&config),
        },
        Commands::Price { symbol } => market::show_index_price(&config, &symbol).await,
        Commands::Positions { credential } => market::show_positions(&config, credential).await,
    }
}
