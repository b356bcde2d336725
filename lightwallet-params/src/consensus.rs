//! Consensus parameters: network upgrades and block timing

use crate::network::{Network, NetworkType};

const MILLIS_PER_DAY: u64 = 86_400_000;

/// A network upgrade and the consensus branch it activates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkUpgrade {
    /// Upgrade name
    pub name: &'static str,
    /// First height at which the upgrade is active
    pub activation_height: u32,
    /// Consensus branch id in effect from the activation height
    pub branch_id: u32,
}

const MAINNET_UPGRADES: &[NetworkUpgrade] = &[
    NetworkUpgrade { name: "sapling", activation_height: 419_200, branch_id: 0x76b8_09bb },
    NetworkUpgrade { name: "blossom", activation_height: 653_600, branch_id: 0x2bb4_0e60 },
    NetworkUpgrade { name: "heartwood", activation_height: 903_000, branch_id: 0xf5b9_230b },
    NetworkUpgrade { name: "canopy", activation_height: 1_046_400, branch_id: 0xe9ff_75a6 },
    NetworkUpgrade { name: "nu5", activation_height: 1_687_104, branch_id: 0xc2d6_d0b4 },
    NetworkUpgrade { name: "nu6", activation_height: 2_726_400, branch_id: 0xc8e7_1055 },
];

const TESTNET_UPGRADES: &[NetworkUpgrade] = &[
    NetworkUpgrade { name: "sapling", activation_height: 280_000, branch_id: 0x76b8_09bb },
    NetworkUpgrade { name: "blossom", activation_height: 584_000, branch_id: 0x2bb4_0e60 },
    NetworkUpgrade { name: "heartwood", activation_height: 903_800, branch_id: 0xf5b9_230b },
    NetworkUpgrade { name: "canopy", activation_height: 1_028_500, branch_id: 0xe9ff_75a6 },
    NetworkUpgrade { name: "nu5", activation_height: 1_842_420, branch_id: 0xc2d6_d0b4 },
    NetworkUpgrade { name: "nu6", activation_height: 2_976_000, branch_id: 0xc8e7_1055 },
];

const REGTEST_UPGRADES: &[NetworkUpgrade] = &[
    NetworkUpgrade { name: "sapling", activation_height: 1, branch_id: 0x76b8_09bb },
    NetworkUpgrade { name: "nu5", activation_height: 1, branch_id: 0xc2d6_d0b4 },
];

/// Consensus parameters
#[derive(Debug, Clone)]
pub struct ConsensusParams {
    /// Network configuration
    pub network: Network,
    /// Network upgrades in activation order
    pub upgrades: &'static [NetworkUpgrade],
}

impl ConsensusParams {
    /// Create consensus params for mainnet
    pub fn mainnet() -> Self {
        Self {
            network: Network::mainnet(),
            upgrades: MAINNET_UPGRADES,
        }
    }

    /// Create consensus params for testnet
    pub fn testnet() -> Self {
        Self {
            network: Network::testnet(),
            upgrades: TESTNET_UPGRADES,
        }
    }

    /// Create consensus params for regtest
    pub fn regtest() -> Self {
        Self {
            network: Network::regtest(),
            upgrades: REGTEST_UPGRADES,
        }
    }

    /// Get consensus params by network type
    pub fn from_network(network_type: NetworkType) -> Self {
        match network_type {
            NetworkType::Mainnet => Self::mainnet(),
            NetworkType::Testnet => Self::testnet(),
            NetworkType::Regtest => Self::regtest(),
        }
    }

    /// Latest upgrade active at `height`, if any
    pub fn active_upgrade(&self, height: u32) -> Option<&NetworkUpgrade> {
        self.upgrades
            .iter()
            .rev()
            .find(|upgrade| height >= upgrade.activation_height)
    }

    /// Consensus branch id for `height`; 0 (Sprout) before Sapling.
    pub fn branch_id_for_height(&self, height: u32) -> u32 {
        self.active_upgrade(height)
            .map(|upgrade| upgrade.branch_id)
            .unwrap_or(0)
    }

    /// Expected number of blocks mined per day
    pub fn blocks_per_day(&self) -> u32 {
        let interval_ms = u64::from(self.network.block_interval_secs.max(1)) * 1_000;
        (MILLIS_PER_DAY / interval_ms) as u32
    }
}
