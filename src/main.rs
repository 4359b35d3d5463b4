//! destguard - DNS-driven egress firewall
//!
//! Admits outbound traffic only to destinations this host just resolved.

use anyhow::Result;
use clap::Parser;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use destguard::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = if cli.verbose {
        Level::DEBUG
    } else if cli.quiet {
        Level::ERROR
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

    match cli.command {
        Commands::Run { dry_run } => destguard::commands::run::run(dry_run, &cli.config).await,
        Commands::Status => destguard::commands::status::run(&cli.config).await,
        Commands::Remove => destguard::commands::remove::run(&cli.config).await,
        Commands::CheckConfig => destguard::commands::check_config::run(&cli.config).await,
        Commands::Version => {
            println!("destguard {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}
