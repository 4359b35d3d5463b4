//! # destguard - DNS-driven egress firewall for Linux
//!
//! Outbound traffic is rejected by default. Every address seen in a DNS answer
//! is admitted for the answer's TTL plus a short grace period, so the host can
//! reach exactly the destinations it just resolved.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        destguard                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  CLI (clap)                                                 │
//! │    └── Commands: run, status, remove, check-config         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Config (serde_yaml) ──> FirewallConfiguration              │
//! │    └── Range converter (ipnet): literals to [start, end)    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Guard                                                      │
//! │    ├── Topology builder: table, sets, default-deny chains   │
//! │    ├── Recovery: seed allow-list from the kernel sets       │
//! │    └── GuardHandle ──(bounded mpsc)──> Synchronizer task    │
//! │                                          └── AllowList      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  RuleEngine trait                                           │
//! │    ├── NftEngine (nft -f -, atomic scripts)                 │
//! │    └── MemoryEngine (tests, --dry-run)                      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```no_run
//! use destguard::config::Config;
//! use destguard::guard::DestinationGuard;
//! use destguard::netfilter::{check_root, NftEngine};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     check_root()?;
//!
//!     let config = Config::load("/etc/destguard/config.yaml")?;
//!     let (guard, worker) = DestinationGuard::start(&config.firewall()?, NftEngine::new())?;
//!
//!     // Admit 1.1.1.1 for 300s + grace
//!     guard.observed_answer(vec![vec![1, 1, 1, 1]], 300).await?;
//!
//!     guard.shutdown().await?;
//!     worker.await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`cli`] - Command-line interface definitions
//! - [`cmd_abstraction`] - Process execution seam (mockable)
//! - [`commands`] - CLI command implementations
//! - [`config`] - Configuration parsing and validation
//! - [`error`] - Error taxonomy
//! - [`guard`] - Guard lifecycle and ingestion API
//! - [`lock`] - Single-instance file lock
//! - [`netfilter`] - Rule-engine model, nft and in-memory engines
//! - [`range`] - Address/CIDR to interval range conversion
//! - [`recovery`] - Allow-list recovery at startup
//! - [`signal`] - Graceful shutdown signal handling
//! - [`store`] - In-memory allow-list and record pool
//! - [`synchronizer`] - Single-writer reconciliation task
//! - [`topology`] - Default-deny rule skeleton

pub mod cli;
pub mod cmd_abstraction;
pub mod commands;
pub mod config;
pub mod error;
pub mod guard;
pub mod lock;
pub mod netfilter;
pub mod range;
pub mod recovery;
pub mod signal;
pub mod store;
pub mod synchronizer;
pub mod topology;

pub use cli::{Cli, Commands};
pub use config::{Config, FirewallConfiguration, Mode};
pub use error::GuardError;
pub use guard::{DestinationGuard, DestinationGuardManager, GuardHandle};
