//! Value types shared by the planner, the stages and the processor

use lightwallet_params::BlockHeight;
use serde::{Deserialize, Serialize};

/// Closed, inclusive height interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockRange {
    /// First height in the range
    pub start: BlockHeight,
    /// Last height in the range (inclusive)
    pub end: BlockHeight,
}

impl BlockRange {
    /// Create a range; `start > end` yields an empty range
    pub const fn new(start: BlockHeight, end: BlockHeight) -> Self {
        Self { start, end }
    }

    /// Number of heights covered
    pub fn len(&self) -> u64 {
        if self.is_empty() {
            0
        } else {
            u64::from(self.end) - u64::from(self.start) + 1
        }
    }

    /// True when the range covers no heights
    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }

    /// Whether `height` lies inside the range
    pub fn contains(&self, height: BlockHeight) -> bool {
        self.start <= height && height <= self.end
    }

    /// Smallest range covering both
    pub fn union(&self, other: &BlockRange) -> BlockRange {
        BlockRange::new(self.start.min(other.start), self.end.max(other.end))
    }
}

impl std::fmt::Display for BlockRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..={}", self.start, self.end)
    }
}

/// Backend scan priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ScanPriority {
    /// Range never needs scanning
    Ignored,
    /// Range already scanned
    Scanned,
    /// Historic blocks
    Historic,
    /// Adjacent to a scanned range
    OpenAdjacent,
    /// Contains a note the wallet needs witnesses for
    FoundNote,
    /// Near the chain tip
    ChainTip,
    /// Must be re-downloaded and re-validated before anything else
    Verify,
}

/// A backend-suggested range with its priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRange {
    /// Heights to scan
    pub range: BlockRange,
    /// Backend priority
    pub priority: ScanPriority,
}

impl ScanRange {
    /// Create a scan range
    pub const fn new(range: BlockRange, priority: ScanPriority) -> Self {
        Self { range, priority }
    }
}

/// Metadata of a downloaded compact block, as persisted in the block cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMeta {
    /// Block height
    pub height: BlockHeight,
    /// Block hash in internal byte order
    pub hash: Vec<u8>,
    /// Block time (unix seconds)
    pub time: u32,
    /// Sapling outputs in the block
    pub sapling_outputs_count: u32,
    /// Orchard actions in the block
    pub orchard_actions_count: u32,
}

impl BlockMeta {
    /// Hash in display (byte-reversed) hex
    pub fn display_hash(&self) -> String {
        let mut bytes = self.hash.clone();
        bytes.reverse();
        hex::encode(bytes)
    }
}

/// A bounded slice of one scan range moving through the stage pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBatch {
    /// Position within its scan range, starting at 1
    pub order: u64,
    /// Position across every range of the current run
    pub cross_ranges_order: u64,
    /// Heights covered
    pub range: BlockRange,
    /// Downloaded blocks, attached by the download stage
    pub blocks: Option<Vec<BlockMeta>>,
}

/// Snapshot of what the processor knows about the chain
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorInfo {
    /// Latest height reported by the server
    pub network_block_height: Option<BlockHeight>,
    /// Envelope of all currently suggested ranges
    pub overall_sync_range: Option<BlockRange>,
    /// Lowest height with transactions still awaiting enhancement
    pub first_unenhanced_height: Option<BlockHeight>,
}

/// Public processor state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncState {
    /// Constructed, not yet started
    Initialized,
    /// Downloading, scanning or enhancing
    Syncing,
    /// Caught up with the given range
    Synced(Option<BlockRange>),
    /// Server unreachable
    Disconnected,
    /// Stopped for good
    Stopped,
}

impl SyncState {
    /// Get display name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Initialized => "Initialized",
            Self::Syncing => "Syncing",
            Self::Synced(_) => "Synced",
            Self::Disconnected => "Disconnected",
            Self::Stopped => "Stopped",
        }
    }

    /// Whether the state is terminal
    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped)
    }
}

/// Shielded pool a subtree root belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShieldedProtocol {
    /// Sapling note commitment tree
    Sapling,
    /// Orchard note commitment tree
    Orchard,
}

/// Root of a completed note commitment subtree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtreeRoot {
    /// Subtree root hash
    pub root_hash: Vec<u8>,
    /// Hash of the block that completed the subtree
    pub completing_block_hash: Vec<u8>,
    /// Height of the block that completed the subtree
    pub completing_block_height: BlockHeight,
}

/// Server metadata used for setup verification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Consensus branch id as hex
    pub consensus_branch_id: String,
    /// Chain name ("main", "test", ...)
    pub chain_name: String,
    /// Server's latest block height
    pub block_height: u64,
}

/// A wallet transaction as known to the repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionOverview {
    /// Transaction id in internal byte order
    pub txid: Vec<u8>,
    /// Height the transaction was mined at, if mined
    pub mined_height: Option<BlockHeight>,
}

impl TransactionOverview {
    /// Txid in display (byte-reversed) hex
    pub fn txid_hex(&self) -> String {
        let mut bytes = self.txid.clone();
        bytes.reverse();
        hex::encode(bytes)
    }
}

/// Status recorded for a transaction that could not be enhanced normally
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    /// Server does not know the txid
    TxidNotRecognized,
    /// Transaction exists but is not mined
    NotInMainChain,
    /// Transaction mined at the given height
    Mined(BlockHeight),
}

/// Result of a backend rewind request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewindResult {
    /// Rewound to the given height
    Success(BlockHeight),
    /// Requested height is not a valid rewind target
    Invalid {
        /// Height that was requested
        requested: BlockHeight,
        /// Safe height the backend proposes instead
        safe_rewind_height: Option<BlockHeight>,
    },
}

/// What the backend reports after scanning a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanSummary {
    /// Heights actually scanned
    pub scanned_range: BlockRange,
    /// Notes received in the batch
    pub received_note_count: u64,
    /// Notes spent in the batch
    pub spent_note_count: u64,
}

/// A transparent unspent output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    /// Receiving address
    pub address: String,
    /// Funding transaction id
    pub txid: Vec<u8>,
    /// Output index
    pub index: u32,
    /// Output script
    pub script: Vec<u8>,
    /// Value in zatoshis
    pub value: u64,
    /// Mined height
    pub height: BlockHeight,
}

/// Balance of one account as computed by the backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountBalance {
    /// Spendable shielded value
    pub spendable: u64,
    /// Shielded value awaiting confirmations
    pub pending: u64,
    /// Transparent value
    pub transparent: u64,
}

impl AccountBalance {
    /// All value owned by the account
    pub fn total(&self) -> u64 {
        self.spendable + self.pending + self.transparent
    }
}
