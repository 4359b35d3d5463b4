//! nftables backend driven through the `nft` binary.
//!
//! A [`Transaction`] is rendered into one script and fed to `nft -f -`, which
//! applies the whole script as a single netlink batch: either every command
//! lands or none does.

use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::OnceLock;
use tracing::debug;

use super::{
    ip_from_bytes, ip_to_bytes, Command, KeyType, Match, RuleEngine, Set, SetElement, Table,
    Transaction, Verdict, TABLE_FAMILY,
};
use crate::cmd_abstraction::{to_args, CommandExecutor, RealCommandExecutor};

const NFT_CANDIDATES: &[&str] = &["/usr/sbin/nft", "/sbin/nft", "/usr/bin/nft"];

/// Absolute path of the nft binary, falling back to a `PATH` lookup.
pub fn nft_path() -> &'static str {
    static PATH: OnceLock<&'static str> = OnceLock::new();
    PATH.get_or_init(|| {
        NFT_CANDIDATES
            .iter()
            .copied()
            .find(|candidate| Path::new(candidate).exists())
            .unwrap_or("nft")
    })
}

/// Table, chain and set names are spliced into scripts verbatim.
fn is_safe_identifier(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn check_identifier(kind: &str, name: &str) -> Result<()> {
    if !is_safe_identifier(name) {
        anyhow::bail!("Refusing unsafe nftables {} name: {:?}", kind, name);
    }
    Ok(())
}

/// Render a transaction as an nft script.
pub fn render_script(tx: &Transaction) -> Result<String> {
    let table = &tx.table.name;
    check_identifier("table", table)?;

    let mut script = String::new();
    let mut anonymous: HashMap<&str, (&Set, &[SetElement])> = HashMap::new();

    for command in &tx.commands {
        match command {
            Command::AddTable => {
                script.push_str(&format!("add table {} {}\n", TABLE_FAMILY, table));
            }
            Command::FlushTable => {
                script.push_str(&format!("flush table {} {}\n", TABLE_FAMILY, table));
            }
            Command::DeleteTable => {
                // Adding first keeps the delete valid when the table is absent
                script.push_str(&format!("add table {} {}\n", TABLE_FAMILY, table));
                script.push_str(&format!("delete table {} {}\n", TABLE_FAMILY, table));
            }
            Command::AddChain(chain) => {
                check_identifier("chain", &chain.name)?;
                script.push_str(&format!(
                    "add chain {} {} {} {{ type filter hook {} priority 0; policy {}; }}\n",
                    TABLE_FAMILY,
                    table,
                    chain.name,
                    chain.hook.name(),
                    chain.policy.name()
                ));
            }
            Command::DeleteChain(chain) => {
                check_identifier("chain", &chain.name)?;
                script.push_str(&format!(
                    "add chain {} {} {} {{ type filter hook {} priority 0; policy accept; }}\n",
                    TABLE_FAMILY,
                    table,
                    chain.name,
                    chain.hook.name()
                ));
                script.push_str(&format!(
                    "delete chain {} {} {}\n",
                    TABLE_FAMILY, table, chain.name
                ));
            }
            Command::AddSet { set, elements } => {
                if set.anonymous {
                    anonymous.insert(set.name.as_str(), (set, elements.as_slice()));
                    continue;
                }
                check_identifier("set", &set.name)?;
                script.push_str(&format!(
                    "add set {} {} {} {{ type {};{} }}\n",
                    TABLE_FAMILY,
                    table,
                    set.name,
                    set.key.nft_name(),
                    set_flags(set)
                ));
                if !elements.is_empty() {
                    script.push_str(&format!(
                        "add element {} {} {} {{ {} }}\n",
                        TABLE_FAMILY,
                        table,
                        set.name,
                        render_elements(set.key, set.interval, elements)?
                    ));
                }
            }
            Command::AddRule(rule) => {
                check_identifier("chain", &rule.chain)?;
                let mut statement = String::new();
                if let Some(matcher) = &rule.matcher {
                    statement.push_str(&render_match(matcher, &anonymous)?);
                    statement.push(' ');
                }
                statement.push_str(render_verdict(rule.verdict));
                script.push_str(&format!(
                    "add rule {} {} {} {}\n",
                    TABLE_FAMILY, table, rule.chain, statement
                ));
            }
            Command::AddElements { set, elements } => {
                check_identifier("set", set)?;
                script.push_str(&format!(
                    "add element {} {} {} {{ {} }}\n",
                    TABLE_FAMILY,
                    table,
                    set,
                    render_addresses(elements)?
                ));
            }
            Command::DeleteElements { set, elements } => {
                check_identifier("set", set)?;
                script.push_str(&format!(
                    "delete element {} {} {} {{ {} }}\n",
                    TABLE_FAMILY,
                    table,
                    set,
                    render_addresses(elements)?
                ));
            }
        }
    }

    Ok(script)
}

fn set_flags(set: &Set) -> String {
    let mut flags = Vec::new();
    if set.constant {
        flags.push("constant");
    }
    if set.interval {
        flags.push("interval");
    }
    if flags.is_empty() {
        String::new()
    } else {
        format!(" flags {};", flags.join(", "))
    }
}

fn render_match(
    matcher: &Match,
    anonymous: &HashMap<&str, (&Set, &[SetElement])>,
) -> Result<String> {
    let lookup = |set: &str| -> Result<String> {
        match anonymous.get(set) {
            Some((set, elements)) => Ok(format!(
                "{{ {} }}",
                render_elements(set.key, set.interval, elements)?
            )),
            None => {
                check_identifier("set", set)?;
                Ok(format!("@{}", set))
            }
        }
    };

    Ok(match matcher {
        Match::CtState(states) => {
            if states.is_empty() {
                anyhow::bail!("ct state match needs at least one state");
            }
            let names: Vec<&str> = states.iter().map(|s| s.name()).collect();
            format!("ct state {}", names.join(","))
        }
        Match::OutputInterface(name) => {
            check_identifier("interface", name)?;
            format!("meta oif \"{}\"", name)
        }
        Match::Icmpv6Type { set } => {
            format!("meta l4proto ipv6-icmp icmpv6 type {}", lookup(set)?)
        }
        Match::Destination { family, set } => {
            format!("{} {}", family.daddr_selector(), lookup(set)?)
        }
    })
}

fn render_verdict(verdict: Verdict) -> &'static str {
    match verdict {
        Verdict::Accept => "accept",
        Verdict::Drop => "drop",
        Verdict::RejectAdminProhibited => "reject with icmpx type admin-prohibited",
    }
}

fn render_addresses(elements: &[SetElement]) -> Result<String> {
    let rendered: Result<Vec<String>> = elements.iter().map(|e| render_address(&e.key)).collect();
    Ok(rendered?.join(", "))
}

fn render_address(key: &[u8]) -> Result<String> {
    ip_from_bytes(key)
        .map(|ip| ip.to_string())
        .ok_or_else(|| anyhow!("Set element of {} bytes is not an address", key.len()))
}

fn render_elements(key: KeyType, interval: bool, elements: &[SetElement]) -> Result<String> {
    if key == KeyType::Icmpv6Type {
        let types: Result<Vec<String>> = elements
            .iter()
            .map(|e| match e.key.as_slice() {
                [t] => Ok(t.to_string()),
                other => Err(anyhow!("ICMPv6 type element has {} bytes", other.len())),
            })
            .collect();
        return Ok(types?.join(", "));
    }

    let width = match key {
        KeyType::Ipv4Addr => 4,
        _ => 16,
    };
    if let Some(bad) = elements.iter().find(|e| e.key.len() != width) {
        anyhow::bail!(
            "Element of {} bytes in a {} set",
            bad.key.len(),
            key.nft_name()
        );
    }

    if !interval {
        return render_addresses(elements);
    }

    // nft writes intervals as inclusive ranges; the kernel form is a start
    // element followed by an exclusive end element.
    let mut parts = Vec::new();
    let mut iter = elements.iter().peekable();
    while let Some(element) = iter.next() {
        if element.interval_end {
            anyhow::bail!("Interval end element without a start");
        }
        let first = render_address(&element.key)?;
        let last = match iter.next_if(|next| next.interval_end) {
            Some(end) => {
                let last = predecessor(&end.key)
                    .ok_or_else(|| anyhow!("Interval end cannot be the zero address"))?;
                render_address(&last)?
            }
            None => render_address(&vec![0xff; width])?,
        };
        if first == last {
            parts.push(first);
        } else {
            parts.push(format!("{}-{}", first, last));
        }
    }
    Ok(parts.join(", "))
}

/// `bytes - 1` over the full width; `None` on underflow.
fn predecessor(bytes: &[u8]) -> Option<Vec<u8>> {
    let mut out = bytes.to_vec();
    for byte in out.iter_mut().rev() {
        if *byte > 0 {
            *byte -= 1;
            return Some(out);
        }
        *byte = 0xff;
    }
    None
}

/// Extract the addresses of a set from `nft -j list set` output.
fn parse_set_listing(output: &str) -> Result<Vec<SetElement>> {
    let doc: Value = serde_json::from_str(output).context("Failed to parse nft JSON output")?;
    let objects = doc
        .get("nftables")
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow!("nft JSON output has no \"nftables\" array"))?;

    let mut elements = Vec::new();
    for object in objects {
        // An empty set has no "elem" key at all
        let Some(elems) = object
            .get("set")
            .and_then(|set| set.get("elem"))
            .and_then(Value::as_array)
        else {
            continue;
        };

        for elem in elems {
            let text = match elem {
                Value::String(s) => Some(s.as_str()),
                Value::Object(_) => elem
                    .get("elem")
                    .and_then(|inner| inner.get("val"))
                    .and_then(Value::as_str),
                _ => None,
            }
            .ok_or_else(|| anyhow!("Unsupported set element in nft output: {}", elem))?;

            let ip: IpAddr = text
                .parse()
                .with_context(|| format!("Invalid address in nft output: {}", text))?;
            elements.push(SetElement::new(ip_to_bytes(ip)));
        }
    }

    Ok(elements)
}

/// Rule engine that shells out to `nft`.
pub struct NftEngine<E: CommandExecutor = RealCommandExecutor> {
    executor: E,
}

impl NftEngine<RealCommandExecutor> {
    pub fn new() -> Self {
        Self {
            executor: RealCommandExecutor::new(),
        }
    }
}

impl Default for NftEngine<RealCommandExecutor> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: CommandExecutor> NftEngine<E> {
    pub fn with_executor(executor: E) -> Self {
        Self { executor }
    }

    fn exec_script(&self, script: &str) -> Result<()> {
        debug!("Executing nft script:\n{}", script);
        self.executor
            .execute_with_stdin(nft_path(), &to_args(&["-f", "-"]), script)?
            .into_stdout("nft")?;
        Ok(())
    }
}

impl<E: CommandExecutor> RuleEngine for NftEngine<E> {
    fn commit(&mut self, tx: &Transaction) -> Result<()> {
        if tx.is_empty() {
            return Ok(());
        }
        let script = render_script(tx)?;
        self.exec_script(&script)
    }

    fn set_elements(&mut self, table: &Table, set: &str) -> Result<Vec<SetElement>> {
        check_identifier("table", &table.name)?;
        check_identifier("set", set)?;
        let args = to_args(&["-j", "list", "set", TABLE_FAMILY, &table.name, set]);
        let output = self.executor.execute(nft_path(), &args)?.into_stdout("nft")?;
        parse_set_listing(&output)
            .with_context(|| format!("Failed to read set {} {} {}", TABLE_FAMILY, table.name, set))
    }
}
