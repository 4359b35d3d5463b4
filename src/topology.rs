//! Construction of the default-deny rule skeleton.
//!
//! The whole skeleton is one transaction: `add table` then `flush table`
//! makes re-runs idempotent, and the kernel applies it all or not at all.

use tracing::{debug, info};

use crate::config::FirewallConfiguration;
use crate::error::GuardError;
use crate::netfilter::{
    AddressFamily, Chain, ConntrackState, Hook, KeyType, Match, PerFamily, Policy, Rule,
    RuleEngine, Set, SetElement, Table, Transaction, Verdict, ND_ICMPV6_TYPES,
};

/// Dynamic allow-set of each family.
pub const ALLOW_SET_V4: &str = "allow_v4";
pub const ALLOW_SET_V6: &str = "allow_v6";

/// Handles the synchronizer and recovery need after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub table: Table,
    pub allow_sets: PerFamily<String>,
    /// Base chains armed by the mode.
    pub chains: Vec<Chain>,
}

impl Topology {
    pub fn for_table(table: &Table) -> Self {
        Self {
            table: table.clone(),
            allow_sets: PerFamily {
                v4: ALLOW_SET_V4.to_string(),
                v6: ALLOW_SET_V6.to_string(),
            },
            chains: Vec::new(),
        }
    }

    pub fn allow_set(&self, family: AddressFamily) -> &str {
        self.allow_sets.get(family)
    }
}

fn chain_for(hook: Hook) -> Chain {
    Chain::filter(hook.name(), hook, Policy::Drop)
}

/// Build the skeleton transaction without touching the kernel.
pub fn plan(config: &FirewallConfiguration) -> (Topology, Transaction) {
    let table = Table::new(config.table.clone());
    let mut topology = Topology::for_table(&table);
    let mut tx = Transaction::new(&table);

    tx.add_table().flush_table();

    for family in AddressFamily::ALL {
        tx.add_set(
            Set::dynamic(topology.allow_set(family), family),
            Vec::new(),
        );
    }

    // Anonymous set ids only need to be unique within the transaction
    let mut anon_id = 0usize;
    let mut next_anon = || {
        let name = format!("__set{}", anon_id);
        anon_id += 1;
        name
    };

    for hook in [Hook::Output, Hook::Forward] {
        let chain = chain_for(hook);
        if !config.mode.arms(hook) {
            // A mode change must not leave a rule-less drop chain behind
            tx.delete_chain(chain);
            continue;
        }

        let name = chain.name.clone();
        tx.add_chain(chain.clone());

        tx.add_rule(Rule::new(
            &name,
            Match::CtState(vec![ConntrackState::Invalid]),
            Verdict::Drop,
        ))
        .add_rule(Rule::new(
            &name,
            Match::CtState(vec![ConntrackState::Established, ConntrackState::Related]),
            Verdict::Accept,
        ))
        .add_rule(Rule::new(
            &name,
            Match::OutputInterface("lo".to_string()),
            Verdict::Accept,
        ));

        let icmp_set = next_anon();
        tx.add_set(
            Set::anonymous(&icmp_set, KeyType::Icmpv6Type, false),
            ND_ICMPV6_TYPES.iter().map(|t| SetElement::new(vec![*t])).collect(),
        )
        .add_rule(Rule::new(
            &name,
            Match::Icmpv6Type { set: icmp_set },
            Verdict::Accept,
        ));

        for family in AddressFamily::ALL {
            let ranges = config.ranges_for(hook, family);
            if ranges.is_empty() {
                continue;
            }
            let elements: Vec<SetElement> = ranges.iter().flat_map(|r| r.elements()).collect();
            let set = next_anon();
            tx.add_set(
                Set::anonymous(&set, family.key_type(), true),
                elements,
            )
            .add_rule(Rule::new(
                &name,
                Match::Destination { family, set },
                Verdict::Accept,
            ));
        }

        for family in AddressFamily::ALL {
            tx.add_rule(Rule::new(
                &name,
                Match::Destination {
                    family,
                    set: topology.allow_set(family).to_string(),
                },
                Verdict::Accept,
            ));
        }

        tx.add_rule(Rule::always(&name, Verdict::RejectAdminProhibited));
        topology.chains.push(chain);
    }

    (topology, tx)
}

/// Build and commit the skeleton. Any failure is fatal to startup.
pub fn build<E: RuleEngine + ?Sized>(
    engine: &mut E,
    config: &FirewallConfiguration,
) -> Result<Topology, GuardError> {
    let (topology, tx) = plan(config);
    debug!("Committing firewall topology ({} commands)", tx.len());

    engine
        .commit(&tx)
        .map_err(|e| GuardError::TopologyConstructionFailed(format!("{:#}", e)))?;

    let hooks: Vec<&str> = topology.chains.iter().map(|c| c.hook.name()).collect();
    info!(
        "Firewall topology ready: table inet {}, hooks [{}]",
        topology.table.name,
        hooks.join(", ")
    );
    Ok(topology)
}
