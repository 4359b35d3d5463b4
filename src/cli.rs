//! CLI argument parsing with clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::DEFAULT_CONFIG_PATH;

#[derive(Parser)]
#[command(name = "destguard")]
#[command(
    author,
    version,
    about = "DNS-driven egress firewall: only destinations this host just resolved get through"
)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH, global = true)]
    pub config: PathBuf,

    /// Quiet mode (errors only)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Verbose mode (debug output)
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Build the firewall and admit destinations read from stdin
    ///
    /// Each input line is `<ttl> <address> [<address>...]`, one line per
    /// DNS answer. Runs until stdin closes or SIGINT/SIGTERM.
    Run {
        /// Keep the firewall in memory instead of programming nftables
        #[arg(long)]
        dry_run: bool,
    },

    /// Show the dynamic allow-sets currently in the kernel
    Status,

    /// Delete the destguard table and every rule in it
    Remove,

    /// Validate the configuration and print the derived ranges
    CheckConfig,

    /// Show version
    Version,
}
