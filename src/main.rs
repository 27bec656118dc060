use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use eddy::app::AppContext;
use eddy::cli::{commands, Cli, Commands};
use eddy::config::Config;

fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;

    match cli.command {
        Commands::Thread { board, id } => {
            commands::show_thread(&config, &board, id)?;
        }
        Commands::Catalog { board } => {
            commands::show_catalog(&config, &board)?;
        }
        Commands::Watch {
            threads,
            boards,
            thumbs,
        } => {
            let ctx = AppContext::new(config)?;
            commands::watch(&ctx, &threads, &boards, thumbs)?;
        }
        Commands::Cache => {
            commands::cache_stats(&config)?;
        }
    }

    Ok(())
}
