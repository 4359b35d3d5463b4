//! Configuration management for destguard.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::GuardError;
use crate::netfilter::{AddressFamily, Hook, PerFamily};
use crate::range::{range_of, AddressRange};

/// Default location of the configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/destguard/config.yaml";

pub const DEFAULT_TABLE: &str = "destguard";

pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Filtering points to arm. Required.
    pub mode: Option<Mode>,

    /// Destinations allowed on every armed filtering point
    pub allowed_ips: Vec<String>,

    /// Extra destinations for the output hook
    pub output: HookConfig,

    /// Extra destinations for the forward hook
    pub forward: HookConfig,

    /// nftables table name (inet family)
    pub table: String,

    /// Capacity of the observation queue
    pub queue_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: None,
            allowed_ips: Vec::new(),
            output: HookConfig::default(),
            forward: HookConfig::default(),
            table: DEFAULT_TABLE.to_string(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HookConfig {
    pub allowed_ips: Vec<String>,
}

/// Which filtering points are armed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Locally generated traffic only
    #[serde(alias = "nft-local")]
    Local,
    /// Routed traffic only
    #[serde(alias = "nft-gateway")]
    Gateway,
    /// Both hooks
    Both,
}

impl Mode {
    /// Hooks armed by this mode, output first.
    pub fn hooks(self) -> &'static [Hook] {
        match self {
            Mode::Local => &[Hook::Output],
            Mode::Gateway => &[Hook::Forward],
            Mode::Both => &[Hook::Output, Hook::Forward],
        }
    }

    pub fn arms(self, hook: Hook) -> bool {
        self.hooks().contains(&hook)
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Mode::Local => "local",
            Mode::Gateway => "gateway",
            Mode::Both => "both",
        };
        f.write_str(name)
    }
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path.as_ref()))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.mode.is_none() {
            anyhow::bail!("mode is required. Valid values: local, gateway, both");
        }

        if self.table.is_empty()
            || !self
                .table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            anyhow::bail!(
                "Invalid table name '{}'. Use only letters, digits and underscores",
                self.table
            );
        }

        if self.queue_capacity == 0 {
            anyhow::bail!("queue_capacity must be greater than 0");
        }

        // Surface bad literals here rather than at firewall construction
        self.firewall()?;

        Ok(())
    }

    /// Convert into the validated value object consumed by the guard.
    pub fn firewall(&self) -> Result<FirewallConfiguration, GuardError> {
        let mode = self
            .mode
            .ok_or_else(|| GuardError::Config("mode is required".to_string()))?;

        Ok(FirewallConfiguration {
            mode,
            table: self.table.clone(),
            allowed: split_ranges(&self.allowed_ips)?,
            output: split_ranges(&self.output.allowed_ips)?,
            forward: split_ranges(&self.forward.allowed_ips)?,
            queue_capacity: self.queue_capacity,
        })
    }

    /// Generate default configuration YAML
    pub fn generate_default_yaml() -> String {
        include_str!("../templates/config.yaml").to_string()
    }
}

/// Parse literals in order, split by family.
fn split_ranges(literals: &[String]) -> Result<PerFamily<Vec<AddressRange>>, GuardError> {
    let mut ranges: PerFamily<Vec<AddressRange>> = PerFamily::default();
    for literal in literals {
        let range = range_of(literal)?;
        ranges.get_mut(range.family()).push(range);
    }
    Ok(ranges)
}

/// Validated configuration of the firewall core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallConfiguration {
    pub mode: Mode,
    pub table: String,
    /// Permanent ranges for every armed hook
    pub allowed: PerFamily<Vec<AddressRange>>,
    /// Permanent ranges for the output hook only
    pub output: PerFamily<Vec<AddressRange>>,
    /// Permanent ranges for the forward hook only
    pub forward: PerFamily<Vec<AddressRange>>,
    pub queue_capacity: usize,
}

impl FirewallConfiguration {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            table: DEFAULT_TABLE.to_string(),
            allowed: PerFamily::default(),
            output: PerFamily::default(),
            forward: PerFamily::default(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    /// Global ranges followed by the hook's own, for one family.
    pub fn ranges_for(&self, hook: Hook, family: AddressFamily) -> Vec<AddressRange> {
        let specific = match hook {
            Hook::Output => &self.output,
            Hook::Forward => &self.forward,
        };
        self.allowed
            .get(family)
            .iter()
            .chain(specific.get(family).iter())
            .cloned()
            .collect()
    }
}
