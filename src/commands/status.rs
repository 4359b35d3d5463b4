//! Status command implementation.

use anyhow::Result;
use std::path::Path;

use crate::config::Config;
use crate::netfilter::{check_root, ip_from_bytes, AddressFamily, NftEngine, RuleEngine, Table};
use crate::topology::Topology;

/// Run the status command
pub async fn run(config_path: &Path) -> Result<()> {
    check_root()?;

    let config = Config::load(config_path)?;
    let topology = Topology::for_table(&Table::new(config.table.clone()));
    let mut engine = NftEngine::new();

    println!();
    println!("Table: inet {}", topology.table.name);
    if let Some(mode) = config.mode {
        println!("Mode: {}", mode);
    }

    for family in AddressFamily::ALL {
        let set = topology.allow_set(family);
        match engine.set_elements(&topology.table, set) {
            Ok(elements) => {
                println!();
                println!("{} ({} entries):", set, elements.len());
                for element in &elements {
                    if let Some(ip) = ip_from_bytes(&element.key) {
                        println!("  {}", ip);
                    }
                }
            }
            Err(e) => {
                println!();
                println!("{}: NOT ACTIVE ({:#})", set, e);
            }
        }
    }
    println!();

    Ok(())
}
