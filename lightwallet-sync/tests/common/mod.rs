//! In-memory collaborators shared by the integration tests.
//!
//! One `ChainState` backs all four collaborator traits so a scan, a rewind
//! or an enhancement is immediately visible to the others.

#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lightwallet_params::{BlockHeight, ConsensusParams, Network};
use lightwallet_sync::{
    AccountBalance, BlockMeta, BlockRange, BlockSource, Collaborators, CompactBlockCache,
    DerivedDataRepository, NetworkError, RewindResult, ScanBackend, ScanError, ScanPriority,
    ScanRange, ScanSummary, ServerInfo, ShieldedProtocol, SubtreeRoot, SyncConfig, SyncEngine,
    SyncState, TransactionOverview, TransactionStatus, Utxo,
};
use parking_lot::Mutex;

pub fn h(value: u32) -> BlockHeight {
    BlockHeight::from_u32(value)
}

pub fn range(start: u32, end: u32) -> BlockRange {
    BlockRange::new(h(start), h(end))
}

/// A wallet transaction living on the mock chain
#[derive(Debug, Clone)]
pub struct MockTransaction {
    pub txid: Vec<u8>,
    pub mined_height: u32,
    pub enhanced: bool,
}

/// Everything the mock collaborators know
#[derive(Debug)]
pub struct ChainState {
    pub tip: u32,
    pub last_scanned: Option<u32>,
    pub branch_id: String,
    pub chain_name: String,
    pub initialized: bool,
    pub accounts: usize,

    pub transactions: Vec<MockTransaction>,
    pub missing_txids: HashSet<Vec<u8>>,
    pub rejected_txids: HashSet<Vec<u8>>,
    pub statuses: Vec<(Vec<u8>, TransactionStatus)>,

    pub sapling_roots: Vec<SubtreeRoot>,
    pub stored_root_batches: usize,

    pub continuity_failures: u32,
    pub scan_failures: u32,
    pub tip_failures: u32,
    /// Polls answered with height 0
    pub bad_tip_polls: u32,
    pub download_failures: u32,
    pub delete_fails: bool,
    pub repository_fails: bool,
    pub balance_fails: bool,
    pub utxo_fails: bool,
    pub receivers: Vec<String>,
    pub utxos: Vec<Utxo>,
    pub stored_utxos: Vec<Utxo>,
    /// Answers to the next `suggest_scan_ranges` calls, ahead of the default
    pub scripted_ranges: VecDeque<Vec<ScanRange>>,
    pub scan_delay: Option<Duration>,

    pub tip_requests: usize,
    pub downloads: Vec<BlockRange>,
    pub scans: usize,
    pub suggest_requests: usize,
    pub rewinds: Vec<BlockHeight>,
    pub cache_rewinds: Vec<BlockHeight>,
    pub deletes: usize,
    pub delete_alls: usize,
    pub reconnects: usize,
    pub stops: usize,
    pub utxo_requests: usize,
}

impl ChainState {
    pub fn new(tip: u32, last_scanned: Option<u32>) -> Self {
        let consensus = ConsensusParams::regtest();
        Self {
            tip,
            last_scanned,
            branch_id: format!("{:x}", consensus.branch_id_for_height(tip)),
            chain_name: "regtest".to_string(),
            initialized: true,
            accounts: 1,
            transactions: Vec::new(),
            missing_txids: HashSet::new(),
            rejected_txids: HashSet::new(),
            statuses: Vec::new(),
            sapling_roots: Vec::new(),
            stored_root_batches: 0,
            continuity_failures: 0,
            scan_failures: 0,
            tip_failures: 0,
            bad_tip_polls: 0,
            download_failures: 0,
            delete_fails: false,
            repository_fails: false,
            balance_fails: false,
            utxo_fails: false,
            receivers: Vec::new(),
            utxos: Vec::new(),
            stored_utxos: Vec::new(),
            scripted_ranges: VecDeque::new(),
            scan_delay: None,
            tip_requests: 0,
            downloads: Vec::new(),
            scans: 0,
            suggest_requests: 0,
            rewinds: Vec::new(),
            cache_rewinds: Vec::new(),
            deletes: 0,
            delete_alls: 0,
            reconnects: 0,
            stops: 0,
            utxo_requests: 0,
        }
    }

    pub fn add_transaction(&mut self, txid: u8, mined_height: u32) {
        self.transactions.push(MockTransaction {
            txid: vec![txid; 32],
            mined_height,
            enhanced: false,
        });
    }

    fn scanned(&self) -> u32 {
        self.last_scanned.unwrap_or(0)
    }

    fn discovered(&self) -> impl Iterator<Item = &MockTransaction> {
        let scanned = self.scanned();
        self.transactions
            .iter()
            .filter(move |tx| tx.mined_height <= scanned)
    }

    fn overview(tx: &MockTransaction) -> TransactionOverview {
        TransactionOverview {
            txid: tx.txid.clone(),
            mined_height: Some(h(tx.mined_height)),
        }
    }
}

/// Shared handle implementing every collaborator trait
#[derive(Clone)]
pub struct MockChain {
    pub state: Arc<Mutex<ChainState>>,
}

impl MockChain {
    pub fn new(state: ChainState) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        let this = Arc::new(self.clone());
        Collaborators {
            source: this.clone(),
            backend: this.clone(),
            repository: this.clone(),
            cache: this,
        }
    }
}

fn backend_error(what: &str) -> anyhow::Error {
    anyhow::anyhow!("mock {} failure", what)
}

#[async_trait]
impl BlockSource for MockChain {
    async fn latest_block_height(&self) -> Result<u64, NetworkError> {
        let mut state = self.state.lock();
        state.tip_requests += 1;
        if state.tip_failures > 0 {
            state.tip_failures -= 1;
            return Err(NetworkError::Unavailable("connection refused".to_string()));
        }
        if state.bad_tip_polls > 0 {
            state.bad_tip_polls -= 1;
            return Ok(0);
        }
        Ok(u64::from(state.tip))
    }

    async fn download_block_range(
        &self,
        range: BlockRange,
    ) -> Result<Vec<BlockMeta>, NetworkError> {
        let mut state = self.state.lock();
        if state.download_failures > 0 {
            state.download_failures -= 1;
            return Err(NetworkError::Unavailable("stream reset".to_string()));
        }
        state.downloads.push(range);
        Ok((range.start.value()..=range.end.value())
            .map(|height| BlockMeta {
                height: h(height),
                hash: height.to_le_bytes().repeat(8),
                time: 1_700_000_000 + height,
                sapling_outputs_count: 2,
                orchard_actions_count: 0,
            })
            .collect())
    }

    async fn fetch_transaction(&self, txid: &[u8]) -> Result<Vec<u8>, NetworkError> {
        let state = self.state.lock();
        if state.missing_txids.contains(txid) {
            return Err(NetworkError::NotFound(hex::encode(txid)));
        }
        if state.rejected_txids.contains(txid) {
            return Err(NetworkError::Rejected {
                code: 13,
                message: "internal".to_string(),
            });
        }
        Ok(txid.to_vec())
    }

    async fn subtree_roots(
        &self,
        start_index: u64,
        _max_entries: u32,
        protocol: ShieldedProtocol,
    ) -> Result<Vec<SubtreeRoot>, NetworkError> {
        let state = self.state.lock();
        match protocol {
            ShieldedProtocol::Sapling => Ok(state
                .sapling_roots
                .iter()
                .skip(start_index as usize)
                .cloned()
                .collect()),
            ShieldedProtocol::Orchard => Ok(Vec::new()),
        }
    }

    async fn server_info(&self) -> Result<ServerInfo, NetworkError> {
        let state = self.state.lock();
        Ok(ServerInfo {
            consensus_branch_id: state.branch_id.clone(),
            chain_name: state.chain_name.clone(),
            block_height: u64::from(state.tip),
        })
    }

    async fn fetch_utxos(
        &self,
        _addresses: &[String],
        _start_height: BlockHeight,
    ) -> Result<Vec<Utxo>, NetworkError> {
        let mut state = self.state.lock();
        state.utxo_requests += 1;
        if state.utxo_fails {
            return Err(NetworkError::Rejected {
                code: 12,
                message: "unimplemented".to_string(),
            });
        }
        Ok(state.utxos.clone())
    }

    async fn reconnect(&self) {
        self.state.lock().reconnects += 1;
    }

    async fn stop(&self) {
        self.state.lock().stops += 1;
    }
}

#[async_trait]
impl ScanBackend for MockChain {
    async fn scan_blocks(
        &self,
        from_height: BlockHeight,
        limit: u32,
    ) -> Result<ScanSummary, ScanError> {
        let delay = self.state.lock().scan_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock();
        state.scans += 1;
        if state.continuity_failures > 0 {
            state.continuity_failures -= 1;
            return Err(ScanError::Continuity {
                height: Some(from_height),
                message: "prev hash mismatch".to_string(),
            });
        }
        if state.scan_failures > 0 {
            state.scan_failures -= 1;
            return Err(ScanError::Other(backend_error("scan")));
        }
        let end = from_height.saturating_add(limit.saturating_sub(1));
        state.last_scanned = Some(end.value());
        Ok(ScanSummary {
            scanned_range: BlockRange::new(from_height, end),
            received_note_count: 0,
            spent_note_count: 0,
        })
    }

    async fn update_chain_tip(&self, _height: BlockHeight) -> anyhow::Result<()> {
        Ok(())
    }

    async fn suggest_scan_ranges(&self) -> anyhow::Result<Vec<ScanRange>> {
        let mut state = self.state.lock();
        state.suggest_requests += 1;
        if let Some(ranges) = state.scripted_ranges.pop_front() {
            return Ok(ranges);
        }
        let start = state.scanned() + 1;
        if start > state.tip {
            return Ok(Vec::new());
        }
        Ok(vec![ScanRange::new(
            range(start, state.tip),
            ScanPriority::Historic,
        )])
    }

    async fn put_subtree_roots(
        &self,
        _sapling_start_index: u64,
        _sapling_roots: &[SubtreeRoot],
        _orchard_start_index: u64,
        _orchard_roots: &[SubtreeRoot],
    ) -> anyhow::Result<()> {
        self.state.lock().stored_root_batches += 1;
        Ok(())
    }

    async fn rewind_to_height(&self, height: BlockHeight) -> anyhow::Result<RewindResult> {
        let mut state = self.state.lock();
        state.rewinds.push(height);
        state.last_scanned = Some(height.value());
        Ok(RewindResult::Success(height))
    }

    async fn nearest_rewind_height(&self, height: BlockHeight) -> anyhow::Result<BlockHeight> {
        Ok(height)
    }

    async fn decrypt_and_store_transaction(
        &self,
        tx_bytes: &[u8],
        _mined_height: Option<BlockHeight>,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        for tx in state.transactions.iter_mut().filter(|tx| tx.txid == tx_bytes) {
            tx.enhanced = true;
        }
        Ok(())
    }

    async fn set_transaction_status(
        &self,
        txid: &[u8],
        status: TransactionStatus,
    ) -> anyhow::Result<()> {
        self.state.lock().statuses.push((txid.to_vec(), status));
        Ok(())
    }

    async fn balance(&self, _account: u32) -> anyhow::Result<AccountBalance> {
        if self.state.lock().balance_fails {
            return Err(backend_error("balance"));
        }
        Ok(AccountBalance {
            spendable: 5_000,
            pending: 1_000,
            transparent: 250,
        })
    }

    async fn branch_id_for_height(&self, height: BlockHeight) -> anyhow::Result<u32> {
        Ok(ConsensusParams::regtest().branch_id_for_height(height.value()))
    }

    async fn transparent_receivers(&self, _account: u32) -> anyhow::Result<Vec<String>> {
        Ok(self.state.lock().receivers.clone())
    }

    async fn put_utxo(&self, utxo: &Utxo) -> anyhow::Result<()> {
        self.state.lock().stored_utxos.push(utxo.clone());
        Ok(())
    }
}

#[async_trait]
impl DerivedDataRepository for MockChain {
    async fn last_scanned_height(&self) -> anyhow::Result<Option<BlockHeight>> {
        Ok(self.state.lock().last_scanned.map(h))
    }

    async fn is_initialized(&self) -> anyhow::Result<bool> {
        Ok(self.state.lock().initialized)
    }

    async fn account_count(&self) -> anyhow::Result<usize> {
        Ok(self.state.lock().accounts)
    }

    async fn find_new_transactions(
        &self,
        range: BlockRange,
    ) -> anyhow::Result<Vec<TransactionOverview>> {
        let state = self.state.lock();
        Ok(state
            .discovered()
            .filter(|tx| !tx.enhanced && range.contains(h(tx.mined_height)))
            .map(ChainState::overview)
            .collect())
    }

    async fn oldest_transaction(&self) -> anyhow::Result<Option<TransactionOverview>> {
        let state = self.state.lock();
        Ok(state
            .discovered()
            .min_by_key(|tx| tx.mined_height)
            .map(ChainState::overview))
    }

    async fn transaction_count(&self) -> anyhow::Result<u64> {
        Ok(self.state.lock().discovered().count() as u64)
    }

    async fn first_unenhanced_height(&self) -> anyhow::Result<Option<BlockHeight>> {
        let state = self.state.lock();
        if state.repository_fails {
            return Err(backend_error("repository"));
        }
        Ok(state
            .discovered()
            .filter(|tx| !tx.enhanced)
            .map(|tx| h(tx.mined_height))
            .min())
    }

    async fn invalidate(&self) {}
}

#[async_trait]
impl CompactBlockCache for MockChain {
    async fn delete_all_compact_block_files(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        state.delete_alls += 1;
        if state.delete_fails {
            return Err(backend_error("delete all"));
        }
        Ok(())
    }

    async fn delete_compact_block_files(&self, _blocks: &[BlockMeta]) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        state.deletes += 1;
        if state.delete_fails {
            return Err(backend_error("delete"));
        }
        Ok(())
    }

    async fn find_compact_block(&self, _height: BlockHeight) -> anyhow::Result<Option<BlockMeta>> {
        Ok(None)
    }

    async fn rewind_to_height(&self, height: BlockHeight) -> anyhow::Result<()> {
        self.state.lock().cache_rewinds.push(height);
        Ok(())
    }
}

/// Config with quiet polling so paused-clock tests move quickly
pub fn test_config() -> SyncConfig {
    SyncConfig {
        poll_jitter: false,
        ..SyncConfig::default()
    }
}

/// Regtest engine whose wallet birthday is height 1
pub fn engine(chain: &MockChain) -> Arc<SyncEngine> {
    engine_with_config(chain, test_config())
}

pub fn engine_with_config(chain: &MockChain, config: SyncConfig) -> Arc<SyncEngine> {
    Arc::new(
        SyncEngine::new(Network::regtest(), h(1), chain.collaborators(), config)
            .expect("valid config"),
    )
}

/// Wait until the engine reports `Synced`
pub async fn wait_for_synced(engine: &SyncEngine) -> SyncState {
    let mut states = engine.subscribe_state();
    let state = tokio::time::timeout(
        Duration::from_secs(3_600),
        states.wait_for(|state| matches!(state, SyncState::Synced(_))),
    )
    .await
    .expect("engine did not sync in time")
    .expect("state channel closed");
    *state
}
