//! Remove command implementation.

use anyhow::{Context, Result};
use std::path::Path;
use tracing::info;

use crate::config::{Config, DEFAULT_TABLE};
use crate::netfilter::{check_root, NftEngine, RuleEngine, Table, Transaction};

/// Run the remove command
pub async fn run(config_path: &Path) -> Result<()> {
    check_root()?;

    // Fall back to the default table so removal works without a config
    let table_name = if config_path.exists() {
        Config::load(config_path)?.table
    } else {
        DEFAULT_TABLE.to_string()
    };
    let table = Table::new(table_name);

    info!("Removing table inet {}...", table.name);
    let mut tx = Transaction::new(&table);
    tx.delete_table();
    NftEngine::new()
        .commit(&tx)
        .with_context(|| format!("Failed to remove table inet {}", table.name))?;

    println!("[OK] destguard rules removed (config preserved)");
    Ok(())
}
