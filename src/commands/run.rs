//! Run command implementation.
//!
//! Reads one DNS answer per stdin line, `<ttl> <address> [<address>...]`,
//! and hands it to the guard until stdin closes or a signal arrives.

use anyhow::{Context, Result};
use std::net::IpAddr;
use std::path::Path;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use crate::config::Config;
use crate::guard::{DestinationGuard, GuardHandle};
use crate::lock::LockGuard;
use crate::netfilter::{check_root, ip_to_bytes, MemoryEngine, NftEngine, RuleEngine};
use crate::signal::{ShutdownGuard, ShutdownToken};

/// One parsed input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub ttl: u32,
    pub addresses: Vec<Vec<u8>>,
}

/// Parse `<ttl> <address> [<address>...]`. Blank lines and `#` comments yield `None`.
pub fn parse_observation(line: &str) -> Result<Option<Observation>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let mut fields = line.split_whitespace();
    let ttl_field = fields.next().unwrap_or_default();
    let ttl: u32 = ttl_field
        .parse()
        .with_context(|| format!("Invalid TTL '{}'", ttl_field))?;

    let addresses = fields
        .map(|field| {
            field
                .parse::<IpAddr>()
                .map(ip_to_bytes)
                .with_context(|| format!("Invalid address '{}'", field))
        })
        .collect::<Result<Vec<_>>>()?;

    if addresses.is_empty() {
        anyhow::bail!("No address after TTL {}", ttl);
    }

    Ok(Some(Observation { ttl, addresses }))
}

/// Run the guard
pub async fn run(dry_run: bool, config_path: &Path) -> Result<()> {
    let config = Config::load(config_path)?;
    let firewall = config.firewall()?;

    let (engine, _lock): (Box<dyn RuleEngine>, Option<LockGuard>) = if dry_run {
        info!("[DRY-RUN] Firewall kept in memory, nftables untouched");
        (Box::new(MemoryEngine::new()), None)
    } else {
        check_root()?;
        let lock = LockGuard::acquire()?;
        (Box::new(NftEngine::new()), Some(lock))
    };

    let (guard, worker) = DestinationGuard::start(&firewall, engine)?;
    let shutdown = ShutdownGuard::new();

    let result = feed(&guard, shutdown.token()).await;

    guard.shutdown().await.ok();
    worker.await.context("Synchronizer task panicked")?;
    result
}

/// Forward stdin observations until EOF or cancellation.
async fn feed(guard: &GuardHandle, token: ShutdownToken) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut line_no = 0usize;

    loop {
        let line = tokio::select! {
            _ = token.cancelled() => break,
            line = lines.next_line() => line.context("Failed to read stdin")?,
        };
        let Some(line) = line else {
            info!("Input closed, stopping");
            break;
        };
        line_no += 1;

        match parse_observation(&line) {
            Ok(Some(observation)) => {
                guard
                    .observed_answer(observation.addresses, observation.ttl)
                    .await?;
            }
            Ok(None) => {}
            Err(e) => warn!("Skipping input line {}: {:#}", line_no, e),
        }
    }

    Ok(())
}
