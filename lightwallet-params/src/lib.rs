//! Light wallet network parameters
//!
//! This crate provides network-specific constants, network upgrade tables and
//! the network-scoped [`BlockHeight`] value type used by the sync engine.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod consensus;
pub mod height;
pub mod network;

pub use consensus::{ConsensusParams, NetworkUpgrade};
pub use height::BlockHeight;
pub use network::{Network, NetworkType};

/// Error types for parameter operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Invalid network specified
    #[error("Invalid network: {0}")]
    InvalidNetwork(String),

    /// Height does not fit in 32 bits
    #[error("Block height out of range: {0}")]
    HeightOutOfRange(u64),

    /// Height precedes the network's shielded activation
    #[error("Block height {height} is below activation height {activation}")]
    BelowActivation {
        /// Requested height
        height: u64,
        /// Sapling activation height of the network
        activation: u32,
    },
}

/// Result type for parameter operations
pub type Result<T> = std::result::Result<T, Error>;
