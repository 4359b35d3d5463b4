//! In-memory rule engine.
//!
//! Behaves like the kernel for everything destguard relies on: atomic
//! commits, `flush table` keeping named sets and their elements, and errors
//! for operations on missing objects. Clones share state, so a test can hand
//! one clone to the guard and inspect through another.

use anyhow::{anyhow, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{
    ip_from_bytes, AddressFamily, Chain, Command, KeyType, RuleEngine, Rule, Set, SetElement,
    Table, Transaction,
};

#[derive(Debug, Clone)]
struct SetState {
    set: Set,
    elements: BTreeSet<SetElementKey>,
}

/// Ordering key so set contents list deterministically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct SetElementKey {
    key: Vec<u8>,
    interval_end: bool,
}

impl From<&SetElement> for SetElementKey {
    fn from(element: &SetElement) -> Self {
        Self {
            key: element.key.clone(),
            interval_end: element.interval_end,
        }
    }
}

impl From<&SetElementKey> for SetElement {
    fn from(key: &SetElementKey) -> Self {
        Self {
            key: key.key.clone(),
            interval_end: key.interval_end,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct TableState {
    chains: BTreeMap<String, Chain>,
    sets: BTreeMap<String, SetState>,
    rules: Vec<Rule>,
}

#[derive(Debug, Default)]
struct EngineState {
    tables: BTreeMap<String, TableState>,
    commits: Vec<Transaction>,
    failed_commits: usize,
    fail_commits: usize,
    fail_reads: bool,
}

/// Rule engine over process memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryEngine {
    state: Arc<Mutex<EngineState>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        // A panicking test thread must not hide the state from the others
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make the next `count` commits fail without applying anything.
    pub fn fail_next_commits(&self, count: usize) {
        self.lock().fail_commits = count;
    }

    /// Make every set read fail until reset.
    pub fn fail_reads(&self, fail: bool) {
        self.lock().fail_reads = fail;
    }

    /// Create a dynamic set holding `addresses`, as a previous run would have left it.
    pub fn seed_set(&self, table: &Table, set: &str, family: AddressFamily, addresses: &[IpAddr]) {
        let mut state = self.lock();
        let table_state = state.tables.entry(table.name.clone()).or_default();
        let entry = table_state
            .sets
            .entry(set.to_string())
            .or_insert_with(|| SetState {
                set: Set::dynamic(set, family),
                elements: BTreeSet::new(),
            });
        for ip in addresses {
            entry.elements.insert(SetElementKey {
                key: super::ip_to_bytes(*ip),
                interval_end: false,
            });
        }
    }

    /// Successful commits, oldest first.
    pub fn commits(&self) -> Vec<Transaction> {
        self.lock().commits.clone()
    }

    pub fn commit_count(&self) -> usize {
        self.lock().commits.len()
    }

    pub fn failed_commit_count(&self) -> usize {
        self.lock().failed_commits
    }

    pub fn has_table(&self, table: &Table) -> bool {
        self.lock().tables.contains_key(&table.name)
    }

    /// Chains of a table, sorted by name.
    pub fn chains(&self, table: &Table) -> Vec<Chain> {
        self.lock()
            .tables
            .get(&table.name)
            .map(|t| t.chains.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Rules of a chain in evaluation order.
    pub fn rules(&self, table: &Table, chain: &str) -> Vec<Rule> {
        self.lock()
            .tables
            .get(&table.name)
            .map(|t| t.rules.iter().filter(|r| r.chain == chain).cloned().collect())
            .unwrap_or_default()
    }

    /// Definition and elements of any set, anonymous ones included.
    pub fn set(&self, table: &Table, set: &str) -> Option<(Set, Vec<SetElement>)> {
        self.lock().tables.get(&table.name).and_then(|t| {
            t.sets
                .get(set)
                .map(|s| (s.set.clone(), s.elements.iter().map(SetElement::from).collect()))
        })
    }

    /// Addresses currently held by a named set.
    pub fn addresses(&self, table: &Table, set: &str) -> Vec<IpAddr> {
        self.set(table, set)
            .map(|(_, elements)| {
                elements
                    .iter()
                    .filter_map(|e| ip_from_bytes(&e.key))
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn apply(tables: &mut BTreeMap<String, TableState>, tx: &Transaction) -> Result<()> {
    let name = &tx.table.name;
    for command in &tx.commands {
        if let Command::AddTable = command {
            tables.entry(name.clone()).or_default();
            continue;
        }
        if let Command::DeleteTable = command {
            tables.remove(name);
            continue;
        }

        let table = tables
            .get_mut(name)
            .ok_or_else(|| anyhow!("No such table: inet {}", name))?;

        match command {
            Command::AddTable | Command::DeleteTable => {}
            Command::FlushTable => {
                table.rules.clear();
                table.sets.retain(|_, s| !s.set.anonymous);
            }
            Command::AddChain(chain) => {
                table.chains.insert(chain.name.clone(), chain.clone());
            }
            Command::DeleteChain(chain) => {
                if table.rules.iter().any(|r| r.chain == chain.name) {
                    anyhow::bail!("Chain {} is not empty", chain.name);
                }
                table.chains.remove(&chain.name);
            }
            Command::AddSet { set, elements } => {
                check_widths(set.key, elements)?;
                let entry = table.sets.entry(set.name.clone()).or_insert_with(|| SetState {
                    set: set.clone(),
                    elements: BTreeSet::new(),
                });
                if entry.set.key != set.key {
                    anyhow::bail!("Set {} exists with a different type", set.name);
                }
                entry.elements.extend(elements.iter().map(SetElementKey::from));
            }
            Command::AddRule(rule) => {
                if !table.chains.contains_key(&rule.chain) {
                    anyhow::bail!("No such chain: {}", rule.chain);
                }
                table.rules.push(rule.clone());
            }
            Command::AddElements { set, elements } => {
                let state = table
                    .sets
                    .get_mut(set)
                    .ok_or_else(|| anyhow!("No such set: {}", set))?;
                check_widths(state.set.key, elements)?;
                state.elements.extend(elements.iter().map(SetElementKey::from));
            }
            Command::DeleteElements { set, elements } => {
                let state = table
                    .sets
                    .get_mut(set)
                    .ok_or_else(|| anyhow!("No such set: {}", set))?;
                for element in elements {
                    if !state.elements.remove(&SetElementKey::from(element)) {
                        anyhow::bail!("Element not in set {}", set);
                    }
                }
            }
        }
    }
    Ok(())
}

fn check_widths(key: KeyType, elements: &[SetElement]) -> Result<()> {
    let width = match key {
        KeyType::Ipv4Addr => 4,
        KeyType::Ipv6Addr => 16,
        KeyType::Icmpv6Type => 1,
    };
    if elements.iter().any(|e| e.key.len() != width) {
        anyhow::bail!("Element width does not match set type {}", key.nft_name());
    }
    Ok(())
}

impl RuleEngine for MemoryEngine {
    fn commit(&mut self, tx: &Transaction) -> Result<()> {
        let mut state = self.lock();
        if state.fail_commits > 0 {
            state.fail_commits -= 1;
            state.failed_commits += 1;
            anyhow::bail!("Injected commit failure");
        }

        // Work on a copy so a failing command leaves nothing behind
        let mut tables = state.tables.clone();
        if let Err(e) = apply(&mut tables, tx) {
            state.failed_commits += 1;
            return Err(e);
        }
        state.tables = tables;
        state.commits.push(tx.clone());
        Ok(())
    }

    fn set_elements(&mut self, table: &Table, set: &str) -> Result<Vec<SetElement>> {
        let state = self.lock();
        if state.fail_reads {
            anyhow::bail!("Injected read failure");
        }
        let set_state = state
            .tables
            .get(&table.name)
            .and_then(|t| t.sets.get(set))
            .ok_or_else(|| anyhow!("No such set: inet {} {}", table.name, set))?;
        Ok(set_state.elements.iter().map(SetElement::from).collect())
    }
}
