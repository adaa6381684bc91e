//! hostward - declarative firewall and compose provisioning for remote Linux hosts.

use anyhow::Result;
use clap::Parser;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use hostward::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = if cli.verbose {
        Level::DEBUG
    } else if cli.quiet {
        Level::WARN
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .without_time()
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let state = cli.state.as_deref();

    match cli.command {
        Commands::Plan => hostward::commands::plan::run(&cli.config, state).await,
        Commands::Apply { dry_run } => {
            hostward::commands::apply::run(&cli.config, state, dry_run).await
        }
        Commands::Destroy { yes } => hostward::commands::destroy::run(&cli.config, state, yes).await,
        Commands::Validate => hostward::commands::validate::run(&cli.config).await,
        Commands::Render { ref resource } => {
            hostward::commands::render::run(&cli.config, resource).await
        }
        Commands::Init => hostward::commands::init::run().await,
        Commands::Version => {
            println!("hostward {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}
