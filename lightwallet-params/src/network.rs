//! Network definitions

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Network type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    /// Mainnet
    Mainnet,
    /// Testnet
    Testnet,
    /// Regtest (local development)
    Regtest,
}

impl NetworkType {
    /// Lowercase network name
    pub const fn name(self) -> &'static str {
        match self {
            NetworkType::Mainnet => "mainnet",
            NetworkType::Testnet => "testnet",
            NetworkType::Regtest => "regtest",
        }
    }
}

impl std::fmt::Display for NetworkType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for NetworkType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mainnet" | "main" => Ok(NetworkType::Mainnet),
            "testnet" | "test" => Ok(NetworkType::Testnet),
            "regtest" => Ok(NetworkType::Regtest),
            other => Err(Error::InvalidNetwork(other.to_string())),
        }
    }
}

/// Network configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Network {
    /// Network type
    pub network_type: NetworkType,
    /// Human-readable name
    pub name: &'static str,
    /// Chain name reported by indexing servers
    pub chain_name: &'static str,
    /// Sapling activation height
    pub sapling_activation_height: u32,
    /// Orchard activation height (if activated)
    pub orchard_activation_height: Option<u32>,
    /// Target block interval in seconds
    pub block_interval_secs: u32,
    /// Default birthday height (wallet creation)
    pub default_birthday_height: u32,
}

impl Network {
    /// Get mainnet parameters
    pub const fn mainnet() -> Self {
        Self {
            network_type: NetworkType::Mainnet,
            name: "mainnet",
            chain_name: "main",
            sapling_activation_height: 419_200,
            orchard_activation_height: Some(1_687_104),
            block_interval_secs: 75,
            default_birthday_height: 419_200,
        }
    }

    /// Get testnet parameters
    pub const fn testnet() -> Self {
        Self {
            network_type: NetworkType::Testnet,
            name: "testnet",
            chain_name: "test",
            sapling_activation_height: 280_000,
            orchard_activation_height: Some(1_842_420),
            block_interval_secs: 75,
            default_birthday_height: 280_000,
        }
    }

    /// Get regtest parameters
    pub const fn regtest() -> Self {
        Self {
            network_type: NetworkType::Regtest,
            name: "regtest",
            chain_name: "regtest",
            sapling_activation_height: 1,
            orchard_activation_height: Some(1),
            block_interval_secs: 75,
            default_birthday_height: 1,
        }
    }

    /// Get network by type
    pub const fn from_type(network_type: NetworkType) -> Self {
        match network_type {
            NetworkType::Mainnet => Self::mainnet(),
            NetworkType::Testnet => Self::testnet(),
            NetworkType::Regtest => Self::regtest(),
        }
    }

    /// Check if Sapling is activated at given height
    pub const fn is_sapling_active(&self, height: u32) -> bool {
        height >= self.sapling_activation_height
    }

    /// Check if Orchard is activated at given height
    pub const fn is_orchard_active(&self, height: u32) -> bool {
        if let Some(activation_height) = self.orchard_activation_height {
            height >= activation_height
        } else {
            false
        }
    }

    /// Whether a server-reported chain name refers to this network.
    ///
    /// Servers report `main`/`test`; wallets usually say `mainnet`/`testnet`.
    /// Both spellings are accepted, ignoring case.
    pub fn matches_chain_name(&self, server_chain_name: &str) -> bool {
        let reported = server_chain_name.trim();
        reported.eq_ignore_ascii_case(self.chain_name) || reported.eq_ignore_ascii_case(self.name)
    }
}
