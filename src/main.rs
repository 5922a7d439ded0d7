//! tuneworker - Background task workers for a desktop music player

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tuneworker::WorkerConfig;
use tuneworker::cli::{self, Cli, Commands, PluginCommands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging; stdout is reserved for worker messages
    let filter = if cli.verbose {
        "tuneworker=debug,reqwest=debug"
    } else {
        "tuneworker=info"
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    match cli.command {
        Commands::Serve { worker } => {
            let config = WorkerConfig::load(cli.config.as_deref())?;
            cli::commands::serve(worker, &config).await?;
        }
        Commands::Scan { paths, parallel } => {
            let config = WorkerConfig::load(cli.config.as_deref())?;
            cli::commands::scan(paths, parallel, &config).await?;
        }
        Commands::Plugin { command } => match command {
            PluginCommands::Run {
                module,
                method,
                args,
                store,
            } => {
                let config = WorkerConfig::load(cli.config.as_deref())?;
                cli::commands::plugin_run(&module, method, args, store, &config).await?;
            }
        },
        Commands::Config { init } => {
            cli::commands::show_config(cli.config.as_deref(), init)?;
        }
        Commands::Completion { shell } => {
            cli::commands::completion(shell);
        }
    }

    Ok(())
}
