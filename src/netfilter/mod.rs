//! Packet-filter model and the rule-engine capability.
//!
//! The types here mirror the kernel primitives destguard drives: one `inet`
//! table, base chains hooked at output/forward, named and anonymous sets, and
//! rules built from a single match plus a verdict. A [`Transaction`] queues
//! commands and a [`RuleEngine`] commits it atomically.

mod memory;
mod nft;

use anyhow::Result;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

pub use memory::MemoryEngine;
pub use nft::{nft_path, render_script, NftEngine};

/// Family of the single filtering table.
pub const TABLE_FAMILY: &str = "inet";

/// ICMPv6 neighbor-discovery types needed for basic IPv6 operation:
/// router solicit/advert, neighbor solicit/advert.
pub const ND_ICMPV6_TYPES: [u8; 4] = [0x85, 0x86, 0x87, 0x88];

/// Address family, derived solely from the byte length of an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    pub const ALL: [AddressFamily; 2] = [AddressFamily::V4, AddressFamily::V6];

    /// 4 bytes is IPv4, 16 bytes is IPv6, anything else has no family.
    pub fn from_len(len: usize) -> Option<Self> {
        match len {
            4 => Some(Self::V4),
            16 => Some(Self::V6),
            _ => None,
        }
    }

    pub fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => Self::V4,
            IpAddr::V6(_) => Self::V6,
        }
    }

    pub fn byte_len(self) -> usize {
        match self {
            Self::V4 => 4,
            Self::V6 => 16,
        }
    }

    pub fn max_prefix_len(self) -> u8 {
        match self {
            Self::V4 => 32,
            Self::V6 => 128,
        }
    }

    pub fn key_type(self) -> KeyType {
        match self {
            Self::V4 => KeyType::Ipv4Addr,
            Self::V6 => KeyType::Ipv6Addr,
        }
    }

    /// Payload selector for the network-layer destination address.
    pub fn daddr_selector(self) -> &'static str {
        match self {
            Self::V4 => "ip daddr",
            Self::V6 => "ip6 daddr",
        }
    }
}

/// One value per address family.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PerFamily<T> {
    pub v4: T,
    pub v6: T,
}

impl<T> PerFamily<T> {
    pub fn get(&self, family: AddressFamily) -> &T {
        match family {
            AddressFamily::V4 => &self.v4,
            AddressFamily::V6 => &self.v6,
        }
    }

    pub fn get_mut(&mut self, family: AddressFamily) -> &mut T {
        match family {
            AddressFamily::V4 => &mut self.v4,
            AddressFamily::V6 => &mut self.v6,
        }
    }
}

/// Raw bytes of an address: 4 for IPv4, 16 for IPv6.
pub fn ip_to_bytes(ip: IpAddr) -> Vec<u8> {
    match ip {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

/// Inverse of [`ip_to_bytes`]; `None` for any other length.
pub fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    if let Ok(octets) = <[u8; 4]>::try_from(bytes) {
        return Some(IpAddr::V4(Ipv4Addr::from(octets)));
    }
    if let Ok(octets) = <[u8; 16]>::try_from(bytes) {
        return Some(IpAddr::V6(Ipv6Addr::from(octets)));
    }
    None
}

/// Set key data types used by destguard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyType {
    Ipv4Addr,
    Ipv6Addr,
    Icmpv6Type,
}

impl KeyType {
    pub fn nft_name(self) -> &'static str {
        match self {
            Self::Ipv4Addr => "ipv4_addr",
            Self::Ipv6Addr => "ipv6_addr",
            Self::Icmpv6Type => "icmpv6_type",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Table {
    pub name: String,
}

impl Table {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Netfilter hook a base chain is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    /// Locally generated traffic.
    Output,
    /// Traffic routed through the host.
    Forward,
}

impl Hook {
    pub fn name(self) -> &'static str {
        match self {
            Self::Output => "output",
            Self::Forward => "forward",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Policy {
    Accept,
    Drop,
}

impl Policy {
    pub fn name(self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Drop => "drop",
        }
    }
}

/// Base filter chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Chain {
    pub name: String,
    pub hook: Hook,
    pub policy: Policy,
}

impl Chain {
    pub fn filter(name: impl Into<String>, hook: Hook, policy: Policy) -> Self {
        Self {
            name: name.into(),
            hook,
            policy,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Set {
    pub name: String,
    pub key: KeyType,
    /// Bound to the rule that references it; dies with that rule.
    pub anonymous: bool,
    /// Elements cannot change after creation.
    pub constant: bool,
    /// Elements are range boundaries rather than discrete values.
    pub interval: bool,
}

impl Set {
    /// Named, runtime-updatable set of addresses.
    pub fn dynamic(name: impl Into<String>, family: AddressFamily) -> Self {
        Self {
            name: name.into(),
            key: family.key_type(),
            anonymous: false,
            constant: false,
            interval: false,
        }
    }

    /// Constant set owned by a single rule.
    pub fn anonymous(name: impl Into<String>, key: KeyType, interval: bool) -> Self {
        Self {
            name: name.into(),
            key,
            anonymous: true,
            constant: true,
            interval,
        }
    }
}

/// A set element as the kernel stores it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SetElement {
    pub key: Vec<u8>,
    /// Marks the exclusive upper bound of an interval.
    pub interval_end: bool,
}

impl SetElement {
    pub fn new(key: Vec<u8>) -> Self {
        Self {
            key,
            interval_end: false,
        }
    }

    pub fn interval_end(key: Vec<u8>) -> Self {
        Self {
            key,
            interval_end: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConntrackState {
    Invalid,
    Established,
    Related,
}

impl ConntrackState {
    pub fn name(self) -> &'static str {
        match self {
            Self::Invalid => "invalid",
            Self::Established => "established",
            Self::Related => "related",
        }
    }
}

/// Match expression of a rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Match {
    /// Connection-tracking state is any of the listed states.
    CtState(Vec<ConntrackState>),
    /// Packet leaves through the named interface.
    OutputInterface(String),
    /// ICMPv6 type is a member of the set.
    Icmpv6Type { set: String },
    /// Network-layer destination is a member of the set.
    Destination { family: AddressFamily, set: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verdict {
    Accept,
    Drop,
    /// Reject with an icmpx administratively-prohibited response.
    RejectAdminProhibited,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Rule {
    pub chain: String,
    pub matcher: Option<Match>,
    pub verdict: Verdict,
}

impl Rule {
    pub fn new(chain: impl Into<String>, matcher: Match, verdict: Verdict) -> Self {
        Self {
            chain: chain.into(),
            matcher: Some(matcher),
            verdict,
        }
    }

    /// Unconditional rule.
    pub fn always(chain: impl Into<String>, verdict: Verdict) -> Self {
        Self {
            chain: chain.into(),
            matcher: None,
            verdict,
        }
    }
}

/// One queued operation against the transaction's table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    AddTable,
    FlushTable,
    DeleteTable,
    AddChain(Chain),
    DeleteChain(Chain),
    AddSet { set: Set, elements: Vec<SetElement> },
    AddRule(Rule),
    AddElements { set: String, elements: Vec<SetElement> },
    DeleteElements { set: String, elements: Vec<SetElement> },
}

/// Ordered batch of commands applied in one atomic commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub table: Table,
    pub commands: Vec<Command>,
}

impl Transaction {
    pub fn new(table: &Table) -> Self {
        Self {
            table: table.clone(),
            commands: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn add_table(&mut self) -> &mut Self {
        self.push(Command::AddTable)
    }

    pub fn flush_table(&mut self) -> &mut Self {
        self.push(Command::FlushTable)
    }

    pub fn delete_table(&mut self) -> &mut Self {
        self.push(Command::DeleteTable)
    }

    pub fn add_chain(&mut self, chain: Chain) -> &mut Self {
        self.push(Command::AddChain(chain))
    }

    pub fn delete_chain(&mut self, chain: Chain) -> &mut Self {
        self.push(Command::DeleteChain(chain))
    }

    pub fn add_set(&mut self, set: Set, elements: Vec<SetElement>) -> &mut Self {
        self.push(Command::AddSet { set, elements })
    }

    pub fn add_rule(&mut self, rule: Rule) -> &mut Self {
        self.push(Command::AddRule(rule))
    }

    /// Queue element additions; an empty list queues nothing.
    pub fn add_elements(&mut self, set: &str, elements: Vec<SetElement>) -> &mut Self {
        if elements.is_empty() {
            return self;
        }
        self.push(Command::AddElements {
            set: set.to_string(),
            elements,
        })
    }

    /// Queue element removals; an empty list queues nothing.
    pub fn delete_elements(&mut self, set: &str, elements: Vec<SetElement>) -> &mut Self {
        if elements.is_empty() {
            return self;
        }
        self.push(Command::DeleteElements {
            set: set.to_string(),
            elements,
        })
    }

    fn push(&mut self, command: Command) -> &mut Self {
        self.commands.push(command);
        self
    }
}

/// Capability over the kernel rule engine.
///
/// Implementations must apply a transaction all-or-nothing.
pub trait RuleEngine: Send {
    /// Apply every queued command atomically.
    fn commit(&mut self, tx: &Transaction) -> Result<()>;

    /// Current elements of a named set.
    fn set_elements(&mut self, table: &Table, set: &str) -> Result<Vec<SetElement>>;
}

impl<E: RuleEngine + ?Sized> RuleEngine for Box<E> {
    fn commit(&mut self, tx: &Transaction) -> Result<()> {
        (**self).commit(tx)
    }

    fn set_elements(&mut self, table: &Table, set: &str) -> Result<Vec<SetElement>> {
        (**self).set_elements(table, set)
    }
}

/// Check if running as root (effective UID == 0)
pub fn check_root() -> Result<()> {
    // SAFETY: geteuid() has no preconditions and cannot fail.
    let euid = unsafe { libc::geteuid() };

    if euid != 0 {
        anyhow::bail!(
            "This operation requires root privileges. Please run with sudo.\n\
             Alternatively, ensure the process has the CAP_NET_ADMIN capability."
        )
    }
    Ok(())
}
