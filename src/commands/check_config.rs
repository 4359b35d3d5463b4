//! Check-config command implementation.

use anyhow::Result;
use std::path::Path;

use crate::config::{Config, FirewallConfiguration};
use crate::netfilter::{AddressFamily, Hook};

/// Run the check-config command
pub async fn run(config_path: &Path) -> Result<()> {
    let config = Config::load(config_path)?;
    let firewall = config.firewall()?;

    println!();
    println!("[OK] {} is valid", config_path.display());
    print!("{}", describe(&firewall));
    Ok(())
}

/// Human-readable summary of what the firewall will allow permanently.
pub fn describe(firewall: &FirewallConfiguration) -> String {
    let mut out = String::new();
    out.push_str(&format!("Mode: {}\n", firewall.mode));
    out.push_str(&format!("Table: inet {}\n", firewall.table));
    out.push_str(&format!("Queue capacity: {}\n", firewall.queue_capacity));

    for hook in firewall.mode.hooks() {
        out.push_str(&format!("\n{} chain permanent ranges:\n", hook.name()));
        let mut any = false;
        for family in AddressFamily::ALL {
            for range in firewall.ranges_for(*hook, family) {
                out.push_str(&format!("  {}\n", range));
                any = true;
            }
        }
        if !any {
            out.push_str("  (none)\n");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Mode;
    use crate::range::range_of;

    #[test]
    fn test_describe_lists_ranges_per_hook() {
        let mut firewall = FirewallConfiguration::new(Mode::Both);
        firewall.allowed.v4.push(range_of("10.0.0.0/24").unwrap());
        firewall.forward.v6.push(range_of("2001:db8::/32").unwrap());

        let text = describe(&firewall);
        assert!(text.contains("Mode: both"));
        assert!(text.contains("output chain permanent ranges:\n  10.0.0.0 - 10.0.1.0 (exclusive)\n"));
        assert!(text.contains("2001:db8:: - 2001:db9:: (exclusive)"));
    }

    #[test]
    fn test_describe_without_ranges() {
        let text = describe(&FirewallConfiguration::new(Mode::Gateway));
        assert!(text.contains("forward chain permanent ranges:\n  (none)\n"));
        assert!(!text.contains("output chain"));
    }
}
