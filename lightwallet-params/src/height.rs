//! Network-scoped block heights

use serde::{Deserialize, Serialize};

use crate::{Error, Network, Result};

/// A block height.
///
/// Heights are 32-bit. Constructors that take a [`Network`] additionally
/// reject heights below the network's Sapling activation.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct BlockHeight(u32);

impl BlockHeight {
    /// Height zero
    pub const ZERO: BlockHeight = BlockHeight(0);

    /// Wrap a raw height without network validation
    pub const fn from_u32(value: u32) -> Self {
        Self(value)
    }

    /// Validate a height reported by a server or store against `network`
    pub fn new(network: &Network, value: u64) -> Result<Self> {
        let height = Self::from_u64(value)?;
        if height.0 < network.sapling_activation_height {
            return Err(Error::BelowActivation {
                height: value,
                activation: network.sapling_activation_height,
            });
        }
        Ok(height)
    }

    /// Convert from a wide integer, rejecting values above `u32::MAX`
    pub fn from_u64(value: u64) -> Result<Self> {
        u32::try_from(value)
            .map(Self)
            .map_err(|_| Error::HeightOutOfRange(value))
    }

    /// Raw height
    pub const fn value(self) -> u32 {
        self.0
    }

    /// `self + blocks`, `None` on overflow
    pub fn checked_add(self, blocks: u32) -> Option<Self> {
        self.0.checked_add(blocks).map(Self)
    }

    /// `self - blocks`, `None` below zero
    pub fn checked_sub(self, blocks: u32) -> Option<Self> {
        self.0.checked_sub(blocks).map(Self)
    }

    /// `self + blocks`, clamped at `u32::MAX`
    pub fn saturating_add(self, blocks: u32) -> Self {
        Self(self.0.saturating_add(blocks))
    }

    /// `self - blocks`, clamped at zero
    pub fn saturating_sub(self, blocks: u32) -> Self {
        Self(self.0.saturating_sub(blocks))
    }

    /// `self + blocks` with a typed error on overflow
    pub fn try_add(self, blocks: u32) -> Result<Self> {
        self.checked_add(blocks)
            .ok_or(Error::HeightOutOfRange(u64::from(self.0) + u64::from(blocks)))
    }

    /// `self - blocks`, rejecting results below the activation height of `network`
    pub fn try_sub(self, network: &Network, blocks: u32) -> Result<Self> {
        match self.checked_sub(blocks) {
            Some(height) => Self::new(network, u64::from(height.0)),
            None => Err(Error::BelowActivation {
                height: 0,
                activation: network.sapling_activation_height,
            }),
        }
    }
}

impl std::fmt::Display for BlockHeight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<BlockHeight> for u32 {
    fn from(height: BlockHeight) -> Self {
        height.0
    }
}

impl From<BlockHeight> for u64 {
    fn from(height: BlockHeight) -> Self {
        u64::from(height.0)
    }
}
