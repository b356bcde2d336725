//! Collaborator contracts consumed by the processor.
//!
//! The processor never talks to a server, a database or the scanning code
//! directly. Everything goes through these traits so the wallet layer can
//! plug in its lightwalletd client, its SQLite stores and its scanner.

use async_trait::async_trait;
use lightwallet_params::BlockHeight;

use crate::error::{NetworkError, ScanError};
use crate::model::{
    AccountBalance, BlockMeta, BlockRange, RewindResult, ScanRange, ScanSummary, ServerInfo,
    ShieldedProtocol, SubtreeRoot, TransactionOverview, TransactionStatus, Utxo,
};

/// Indexing server
#[async_trait]
pub trait BlockSource: Send + Sync {
    /// Latest block height known to the server
    async fn latest_block_height(&self) -> Result<u64, NetworkError>;

    /// Download and cache the compact blocks in `range`
    async fn download_block_range(&self, range: BlockRange)
        -> Result<Vec<BlockMeta>, NetworkError>;

    /// Raw bytes of a full transaction
    async fn fetch_transaction(&self, txid: &[u8]) -> Result<Vec<u8>, NetworkError>;

    /// Completed subtree roots starting at `start_index`; `max_entries == 0` means all
    async fn subtree_roots(
        &self,
        start_index: u64,
        max_entries: u32,
        protocol: ShieldedProtocol,
    ) -> Result<Vec<SubtreeRoot>, NetworkError>;

    /// Server chain metadata
    async fn server_info(&self) -> Result<ServerInfo, NetworkError>;

    /// Transparent outputs received by `addresses` since `start_height`
    async fn fetch_utxos(
        &self,
        addresses: &[String],
        start_height: BlockHeight,
    ) -> Result<Vec<Utxo>, NetworkError>;

    /// Drop and re-establish the connection
    async fn reconnect(&self);

    /// Release connections; called once when the processor stops
    async fn stop(&self) {}
}

/// Scanning backend owning the authoritative derived wallet state
#[async_trait]
pub trait ScanBackend: Send + Sync {
    /// Scan up to `limit` cached blocks starting at `from_height`
    async fn scan_blocks(&self, from_height: BlockHeight, limit: u32)
        -> Result<ScanSummary, ScanError>;

    /// Tell the backend where the chain tip is so it can re-plan
    async fn update_chain_tip(&self, height: BlockHeight) -> anyhow::Result<()>;

    /// Ranges still to scan, highest priority first
    async fn suggest_scan_ranges(&self) -> anyhow::Result<Vec<ScanRange>>;

    /// Index of the next subtree root the backend is missing
    async fn next_subtree_index(&self, _protocol: ShieldedProtocol) -> anyhow::Result<u64> {
        Ok(0)
    }

    /// Store subtree roots for spend-before-sync
    async fn put_subtree_roots(
        &self,
        sapling_start_index: u64,
        sapling_roots: &[SubtreeRoot],
        orchard_start_index: u64,
        orchard_roots: &[SubtreeRoot],
    ) -> anyhow::Result<()>;

    /// Roll derived state back to `height`
    async fn rewind_to_height(&self, height: BlockHeight) -> anyhow::Result<RewindResult>;

    /// Nearest height at or below `height` the backend can rewind to
    async fn nearest_rewind_height(&self, height: BlockHeight) -> anyhow::Result<BlockHeight>;

    /// Decrypt a full transaction and store what belongs to the wallet
    async fn decrypt_and_store_transaction(
        &self,
        tx_bytes: &[u8],
        mined_height: Option<BlockHeight>,
    ) -> anyhow::Result<()>;

    /// Record a status for a transaction the server could not provide
    async fn set_transaction_status(
        &self,
        txid: &[u8],
        status: TransactionStatus,
    ) -> anyhow::Result<()>;

    /// Balance of `account`
    async fn balance(&self, account: u32) -> anyhow::Result<AccountBalance>;

    /// Consensus branch id the backend uses at `height`
    async fn branch_id_for_height(&self, height: BlockHeight) -> anyhow::Result<u32>;

    /// Transparent receivers of `account`
    async fn transparent_receivers(&self, account: u32) -> anyhow::Result<Vec<String>>;

    /// Insert or replace a transparent output
    async fn put_utxo(&self, utxo: &Utxo) -> anyhow::Result<()>;
}

/// Read side of the derived wallet data
#[async_trait]
pub trait DerivedDataRepository: Send + Sync {
    /// Highest fully scanned height
    async fn last_scanned_height(&self) -> anyhow::Result<Option<BlockHeight>>;

    /// Whether wallet storage exists and is migrated
    async fn is_initialized(&self) -> anyhow::Result<bool>;

    /// Number of accounts
    async fn account_count(&self) -> anyhow::Result<usize>;

    /// Transactions in `range` that still need enhancement
    async fn find_new_transactions(
        &self,
        range: BlockRange,
    ) -> anyhow::Result<Vec<TransactionOverview>>;

    /// Oldest transaction the wallet knows about
    async fn oldest_transaction(&self) -> anyhow::Result<Option<TransactionOverview>>;

    /// Number of transactions the wallet knows about
    async fn transaction_count(&self) -> anyhow::Result<u64>;

    /// Lowest height with a transaction awaiting enhancement
    async fn first_unenhanced_height(&self) -> anyhow::Result<Option<BlockHeight>>;

    /// Drop cached query results
    async fn invalidate(&self);
}

/// Raw compact block cache
#[async_trait]
pub trait CompactBlockCache: Send + Sync {
    /// Remove every cached block file
    async fn delete_all_compact_block_files(&self) -> anyhow::Result<()>;

    /// Remove the files of the given blocks
    async fn delete_compact_block_files(&self, blocks: &[BlockMeta]) -> anyhow::Result<()>;

    /// Cached block at `height`
    async fn find_compact_block(&self, height: BlockHeight) -> anyhow::Result<Option<BlockMeta>>;

    /// Drop cached blocks above `height`
    async fn rewind_to_height(&self, height: BlockHeight) -> anyhow::Result<()>;
}
