//! Seeding the allow-list from what a previous run left in the kernel.

use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::GuardError;
use crate::netfilter::{AddressFamily, RuleEngine};
use crate::store::AllowList;
use crate::topology::Topology;

/// Expiry given to recovered entries: long enough to outlive several
/// eviction ticks, short enough that nothing stale lingers.
pub const RECOVERY_GRACE: Duration = Duration::from_secs(330);

/// Read both dynamic sets back and track each element until `now + RECOVERY_GRACE`.
///
/// Returns the number of recovered entries. A failed read is fatal to startup.
pub fn recover<E: RuleEngine + ?Sized>(
    engine: &mut E,
    topology: &Topology,
    store: &mut AllowList,
    now: Instant,
) -> Result<usize, GuardError> {
    let expires_at = now + RECOVERY_GRACE;
    let mut recovered = 0;

    for family in AddressFamily::ALL {
        let set = topology.allow_set(family);
        let elements = engine
            .set_elements(&topology.table, set)
            .map_err(|e| GuardError::RecoveryReadFailed(format!("set {}: {:#}", set, e)))?;

        for element in elements {
            if AddressFamily::from_len(element.key.len()) != Some(family) {
                warn!(
                    "Ignoring {}-byte element in allow-set {}",
                    element.key.len(),
                    set
                );
                continue;
            }
            if store.insert(&element.key, expires_at).is_ok() {
                recovered += 1;
            }
        }
    }

    if recovered > 0 {
        info!("Recovered {} allow-list entries from the kernel", recovered);
    }
    Ok(recovered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FirewallConfiguration, Mode};
    use crate::netfilter::{MemoryEngine, Table};
    use crate::topology;

    fn table() -> Table {
        Table::new("destguard")
    }

    #[test]
    fn test_recover_seeds_store() {
        let mut engine = MemoryEngine::new();
        engine.seed_set(
            &table(),
            "allow_v4",
            AddressFamily::V4,
            &["1.1.1.1".parse().unwrap(), "8.8.8.8".parse().unwrap()],
        );
        engine.seed_set(
            &table(),
            "allow_v6",
            AddressFamily::V6,
            &["2001:db8::1".parse().unwrap()],
        );
        let topology =
            topology::build(&mut engine, &FirewallConfiguration::new(Mode::Local)).unwrap();

        let mut store = AllowList::new();
        let now = Instant::now();
        let count = recover(&mut engine, &topology, &mut store, now).unwrap();

        assert_eq!(count, 3);
        assert_eq!(
            store.get("8.8.8.8").unwrap().expires_at,
            now + RECOVERY_GRACE
        );
        assert!(store.get("2001:db8::1").is_some());
    }

    #[test]
    fn test_recover_empty_sets() {
        let mut engine = MemoryEngine::new();
        let topology =
            topology::build(&mut engine, &FirewallConfiguration::new(Mode::Both)).unwrap();
        let mut store = AllowList::new();
        assert_eq!(
            recover(&mut engine, &topology, &mut store, Instant::now()).unwrap(),
            0
        );
        assert!(store.is_empty());
    }

    #[test]
    fn test_recover_read_failure_is_fatal() {
        let mut engine = MemoryEngine::new();
        let topology =
            topology::build(&mut engine, &FirewallConfiguration::new(Mode::Local)).unwrap();
        engine.fail_reads(true);

        let mut store = AllowList::new();
        let err = recover(&mut engine, &topology, &mut store, Instant::now()).unwrap_err();
        assert!(matches!(err, GuardError::RecoveryReadFailed(_)));
    }

    #[test]
    fn test_recover_missing_set_is_fatal() {
        let mut engine = MemoryEngine::new();
        let topology = Topology::for_table(&table());
        let mut store = AllowList::new();
        assert!(recover(&mut engine, &topology, &mut store, Instant::now()).is_err());
    }
}
