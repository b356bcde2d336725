//! The compact block processor.
//!
//! Owns the sync state machine and the long-running loop that plans ranges,
//! pushes batches through the stages, enhances new transactions and repairs
//! reorgs. Mutating passes and rewinds share one lock so a manual rewind
//! never races the loop's own reorg handling.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use lightwallet_params::{BlockHeight, ConsensusParams, Network};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::cancel::CancelToken;
use crate::config::SyncConfig;
use crate::enhance::{EnhancementScheduler, TransactionEnhancer};
use crate::error::{Error, NetworkError, Result};
use crate::events::{SyncEvent, SyncEventLog};
use crate::model::{
    AccountBalance, BlockBatch, BlockRange, ProcessorInfo, ScanRange, ShieldedProtocol, SyncState,
};
use crate::outcome::{
    BatchOutcome, BlockProcessingResult, DeleteOutcome, DownloadOutcome, EnhanceOutcome,
    PreparationResult, StageFailure, SubtreeRootsResult, SyncingResult, VerifyDecision,
};
use crate::planner;
use crate::progress::{PerfCounters, PerfSnapshot, SyncObservers};
use crate::registry::{ProcessorKey, ProcessorRegistry, Registration};
use crate::reorg::ReorgRecovery;
use crate::retry::{self, retry_up_to, retry_up_to_and_continue, Backoff, RetryPolicy};
use crate::stages::StageExecutor;
use crate::traits::{BlockSource, CompactBlockCache, DerivedDataRepository, ScanBackend};

/// Blocks whose cached hashes are dumped after a chain error
const VALIDATION_DUMP_BLOCKS: u32 = 10;

/// Called with unexpected processing errors; return `true` to keep going
pub type ProcessorErrorListener = Arc<dyn Fn(&Error) -> bool + Send + Sync>;
/// Called with `(error_height, rewind_height)` when a chain error is handled
pub type ChainErrorListener = Arc<dyn Fn(BlockHeight, BlockHeight) + Send + Sync>;
/// Called with setup errors; return `true` to proceed anyway
pub type SetupErrorListener = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

#[derive(Clone, Default)]
struct Listeners {
    processor_error: Option<ProcessorErrorListener>,
    chain_error: Option<ChainErrorListener>,
    setup_error: Option<SetupErrorListener>,
}

/// Collaborators the processor drives
#[derive(Clone)]
pub struct Collaborators {
    /// Indexing server
    pub source: Arc<dyn BlockSource>,
    /// Scanning backend
    pub backend: Arc<dyn ScanBackend>,
    /// Derived data store
    pub repository: Arc<dyn DerivedDataRepository>,
    /// Raw block cache
    pub cache: Arc<dyn CompactBlockCache>,
}

/// Per-pass bookkeeping
struct PassContext {
    chain_tip: BlockHeight,
    global_order: u64,
    batch_count: u64,
    prepared_at: Instant,
    first_unenhanced: Option<BlockHeight>,
}

/// Compact block processor
pub struct SyncEngine {
    network: Network,
    consensus: ConsensusParams,
    config: SyncConfig,
    collaborators: Collaborators,
    stages: StageExecutor,
    enhancer: TransactionEnhancer,
    recovery: ReorgRecovery,
    observers: SyncObservers,
    perf: Arc<PerfCounters>,
    events: Mutex<SyncEventLog>,
    listeners: RwLock<Listeners>,
    processing_lock: tokio::sync::Mutex<()>,
    cancel: CancelToken,
    started: AtomicBool,
    released: AtomicBool,
    subtree_roots_stored: AtomicBool,
    failed_utxo_fetches: AtomicU32,
    consecutive_failures: AtomicU32,
    last_sync_range: Mutex<Option<BlockRange>>,
    registration: Mutex<Option<Registration>>,
}

impl SyncEngine {
    /// Create a processor for a wallet whose oldest account starts at `minimum_height`
    pub fn new(
        network: Network,
        minimum_height: BlockHeight,
        collaborators: Collaborators,
        config: SyncConfig,
    ) -> Result<Self> {
        config.validate()?;

        let activation = BlockHeight::from_u32(network.sapling_activation_height);
        let lower_bound =
            planner::lower_bound_height(activation, minimum_height, config.max_reorg_size);
        let cancel = CancelToken::new();
        let perf = Arc::new(PerfCounters::new());

        let stages = StageExecutor::new(
            collaborators.source.clone(),
            collaborators.backend.clone(),
            collaborators.cache.clone(),
            RetryPolicy::new(config.download_retries, config.retry_initial_backoff()),
            cancel.clone(),
            perf.clone(),
        );
        let enhancer = TransactionEnhancer::new(
            collaborators.source.clone(),
            collaborators.backend.clone(),
            collaborators.repository.clone(),
            RetryPolicy::new(
                config.transaction_fetch_retries,
                config.retry_initial_backoff(),
            ),
            cancel.clone(),
            perf.clone(),
        );

        tracing::debug!(
            "Creating processor for {} (lower bound {})",
            network.name,
            lower_bound
        );

        Ok(Self {
            consensus: ConsensusParams::from_network(network.network_type),
            network,
            recovery: ReorgRecovery::new(lower_bound, &config),
            observers: SyncObservers::new(lower_bound),
            events: Mutex::new(SyncEventLog::new(config.event_log_capacity)),
            config,
            collaborators,
            stages,
            enhancer,
            perf,
            listeners: RwLock::new(Listeners::default()),
            processing_lock: tokio::sync::Mutex::new(()),
            cancel,
            started: AtomicBool::new(false),
            released: AtomicBool::new(false),
            subtree_roots_stored: AtomicBool::new(false),
            failed_utxo_fetches: AtomicU32::new(0),
            consecutive_failures: AtomicU32::new(0),
            last_sync_range: Mutex::new(None),
            registration: Mutex::new(None),
        })
    }

    /// Create a processor after claiming `key` in `registry`.
    ///
    /// Fails with [`Error::ProcessorAlreadyRunning`] while another processor
    /// holds the key.
    pub fn register(
        registry: &ProcessorRegistry,
        key: ProcessorKey,
        network: Network,
        minimum_height: BlockHeight,
        collaborators: Collaborators,
        config: SyncConfig,
    ) -> Result<Self> {
        let registration = registry.try_register(key)?;
        Ok(Self::new(network, minimum_height, collaborators, config)?
            .with_registration(registration))
    }

    /// Hold `registration` until this processor stops
    pub fn with_registration(self, registration: Registration) -> Self {
        *self.registration.lock() = Some(registration);
        self
    }

    // ========================================================================
    // Listeners
    // ========================================================================

    /// Decide whether unexpected processing errors are retried
    pub fn set_processor_error_listener(
        &self,
        listener: impl Fn(&Error) -> bool + Send + Sync + 'static,
    ) {
        self.listeners.write().processor_error = Some(Arc::new(listener));
    }

    /// Observe handled chain errors
    pub fn set_chain_error_listener(
        &self,
        listener: impl Fn(BlockHeight, BlockHeight) + Send + Sync + 'static,
    ) {
        self.listeners.write().chain_error = Some(Arc::new(listener));
    }

    /// Decide whether setup errors are overridden
    pub fn set_setup_error_listener(
        &self,
        listener: impl Fn(&Error) -> bool + Send + Sync + 'static,
    ) {
        self.listeners.write().setup_error = Some(Arc::new(listener));
    }

    // ========================================================================
    // Observers
    // ========================================================================

    /// Current state
    pub fn state(&self) -> SyncState {
        self.observers.state()
    }

    /// Subscribe to state changes
    pub fn subscribe_state(&self) -> tokio::sync::watch::Receiver<SyncState> {
        self.observers.subscribe_state()
    }

    /// Current progress in `[0, 1]`
    pub fn progress(&self) -> f64 {
        self.observers.progress()
    }

    /// Subscribe to progress
    pub fn subscribe_progress(&self) -> tokio::sync::watch::Receiver<f64> {
        self.observers.subscribe_progress()
    }

    /// Latest processor info snapshot
    pub fn processor_info(&self) -> ProcessorInfo {
        self.observers.processor_info()
    }

    /// Subscribe to processor info
    pub fn subscribe_processor_info(&self) -> tokio::sync::watch::Receiver<ProcessorInfo> {
        self.observers.subscribe_processor_info()
    }

    /// Last chain tip reported by the server
    pub fn network_height(&self) -> Option<BlockHeight> {
        self.observers.network_height()
    }

    /// Subscribe to the server chain tip
    pub fn subscribe_network_height(
        &self,
    ) -> tokio::sync::watch::Receiver<Option<BlockHeight>> {
        self.observers.subscribe_network_height()
    }

    /// Published birthday height
    pub fn birthday_height(&self) -> BlockHeight {
        self.observers.birthday_height()
    }

    /// Subscribe to birthday height changes
    pub fn subscribe_birthday_height(&self) -> tokio::sync::watch::Receiver<BlockHeight> {
        self.observers.subscribe_birthday_height()
    }

    /// Lowest height this processor ever rewinds to
    pub fn lower_bound_height(&self) -> BlockHeight {
        self.recovery.lower_bound()
    }

    /// Consecutive chain errors since the last successful pass
    pub fn consecutive_chain_errors(&self) -> u32 {
        self.recovery.consecutive_errors()
    }

    /// Consecutive passes that failed outside the scanner
    pub fn consecutive_sync_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    /// Recent sync events, oldest first
    pub fn recent_events(&self) -> Vec<SyncEvent> {
        self.events.lock().events()
    }

    /// Batch timing counters
    pub fn perf_snapshot(&self) -> PerfSnapshot {
        self.perf.snapshot()
    }

    /// Network this processor syncs
    pub fn network(&self) -> &Network {
        &self.network
    }

    /// Active configuration
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Spawn the processing loop.
    ///
    /// The handle resolves once the processor stops: `Ok` after [`stop`],
    /// `Err` on a setup failure, an unrepairable reorg or repeated sync failures.
    ///
    /// [`stop`]: SyncEngine::stop
    pub fn start(self: &Arc<Self>) -> Result<JoinHandle<Result<()>>> {
        if self.cancel.is_cancelled() {
            return Err(Error::Stopped);
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyStarted);
        }
        let processor = Arc::clone(self);
        Ok(tokio::spawn(async move { processor.run().await }))
    }

    /// Stop the processor for good.
    ///
    /// The loop notices at its next safe point and finishes without
    /// interrupting a stage in progress.
    pub async fn stop(&self) {
        if self.cancel.cancel() {
            tracing::info!("Stopping compact block processor");
        }
        self.observers.set_state(SyncState::Stopped);
        if let Some(registration) = self.registration.lock().as_ref() {
            registration.mark_stopping();
        }
        if !self.started.load(Ordering::Acquire) {
            self.release().await;
        }
    }

    async fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.collaborators.source.stop().await;
        drop(self.registration.lock().take());
        tracing::debug!("Processor resources released");
    }

    async fn run(&self) -> Result<()> {
        let result = self.run_loop().await;
        if let Err(e) = &result {
            self.record(SyncEvent::Fatal {
                error: e.to_string(),
            });
            let listener = self.listeners.read().processor_error.clone();
            if let Some(listener) = listener {
                listener(e);
            }
        }
        self.cancel.cancel();
        self.observers.set_state(SyncState::Stopped);
        self.release().await;
        result
    }

    async fn run_loop(&self) -> Result<()> {
        tracing::info!("Compact block processor starting on {}", self.network.name);

        self.verify_setup().await?;
        self.update_birthday_height().await;
        self.clear_block_cache().await;

        let mut subtree_roots = self.fetch_subtree_roots().await;
        self.reset_error_counters();
        let mut backoff = Backoff::new(
            self.config.short_poll_interval(),
            self.config.max_backoff_interval(),
        );

        while !self.cancel.is_cancelled() {
            let pass = self
                .with_lock("process_new_blocks", self.process_new_blocks(&mut subtree_roots))
                .await;

            if self.cancel.is_cancelled() {
                break;
            }

            match pass {
                Ok(result) => {
                    backoff.reset();
                    self.handle_pass_result(result).await?;
                }
                Err(e) => {
                    if !self.report_processor_error(&e) {
                        return Err(e);
                    }
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        "Processing failed, retrying in {}ms: {}",
                        delay.as_millis(),
                        e
                    );
                    self.cancel.sleep(delay).await;
                }
            }
        }

        tracing::info!("Compact block processor stopped");
        Ok(())
    }

    async fn handle_pass_result(&self, result: BlockProcessingResult) -> Result<()> {
        match result {
            BlockProcessingResult::Reconnecting => {
                tracing::info!("Server unreachable, reconnecting");
                self.observers.set_state(SyncState::Disconnected);
                self.collaborators.source.reconnect().await;
                self.nap(true).await;
            }
            BlockProcessingResult::RestartSynchronization => {
                tracing::info!("Restarting synchronization with fresh ranges");
                self.reset_error_counters();
            }
            BlockProcessingResult::NoBlocksToProcess => {
                let range = *self.last_sync_range.lock();
                self.observers.set_progress(1.0);
                self.observers.set_state(SyncState::Synced(range));
                self.reset_error_counters();
                self.nap(false).await;
            }
            BlockProcessingResult::ContinuityError { failed_at, error } => {
                self.handle_chain_error(failed_at, &error).await?;
            }
            BlockProcessingResult::ScanFailure { failed_at, error } => {
                self.handle_chain_error(failed_at, &error).await?;
                self.nap(true).await;
            }
            BlockProcessingResult::SyncFailure { failed_at, error } => {
                self.check_error_and_fail(failed_at, error)?;
                self.nap(true).await;
            }
            BlockProcessingResult::Success => {
                self.reset_error_counters();
            }
        }
        Ok(())
    }

    /// Count a failure that left scanned data alone; fatal at the error ceiling
    fn check_error_and_fail(&self, failed_at: BlockHeight, error: Error) -> Result<()> {
        let attempts = self
            .consecutive_failures
            .fetch_add(1, Ordering::AcqRel)
            .saturating_add(1);
        if attempts >= self.config.max_consecutive_errors {
            tracing::error!(
                "Unable to resolve the error at {} after {} attempts: {}",
                failed_at,
                attempts,
                error
            );
            return Err(Error::FailedSynchronization {
                height: failed_at,
                attempts,
                source: Box::new(error),
            });
        }
        tracing::warn!(
            "Sync failed at {} (attempt {}/{}): {}",
            failed_at,
            attempts,
            self.config.max_consecutive_errors,
            error
        );
        Ok(())
    }

    fn reset_error_counters(&self) {
        self.recovery.reset();
        self.consecutive_failures.store(0, Ordering::Release);
    }

    async fn with_lock<T>(&self, name: &str, operation: impl Future<Output = T>) -> T {
        tracing::debug!("{}: acquiring processing lock", name);
        let _guard = self.processing_lock.lock().await;
        tracing::debug!("{}: processing lock acquired", name);
        let result = operation.await;
        tracing::debug!("{}: releasing processing lock", name);
        result
    }

    async fn nap(&self, short: bool) {
        let interval = if short {
            self.config.short_poll_interval()
        } else {
            self.config.poll_interval()
        };
        let delay = retry::aligned_poll_delay(
            chrono::Utc::now().timestamp_millis(),
            interval,
            self.config.poll_jitter,
        );
        tracing::debug!("Sleeping for {}ms", delay.as_millis());
        self.cancel.sleep(delay).await;
    }

    fn record(&self, event: SyncEvent) {
        self.events.lock().record(event);
    }

    fn report_processor_error(&self, error: &Error) -> bool {
        let listener = self.listeners.read().processor_error.clone();
        listener.map_or(true, |listener| listener(error))
    }

    // ========================================================================
    // Setup
    // ========================================================================

    async fn verify_setup(&self) -> Result<()> {
        let repository = &self.collaborators.repository;

        if !repository.is_initialized().await.map_err(Error::Repository)? {
            self.report_setup_error(Error::Uninitialized)?;
        }
        if repository.account_count().await.map_err(Error::Repository)? == 0 {
            self.report_setup_error(Error::NoAccount)?;
        }

        let info = match self.collaborators.source.server_info().await {
            Ok(info) => info,
            Err(e) => {
                self.observers.set_state(SyncState::Disconnected);
                return self.report_setup_error(Error::ServerInfoUnavailable(e));
            }
        };

        let server_height = match BlockHeight::new(&self.network, info.block_height) {
            Ok(height) => height,
            Err(_) => return self.report_setup_error(Error::BadBlockHeight(info.block_height)),
        };

        let client_branch = self
            .collaborators
            .backend
            .branch_id_for_height(server_height)
            .await
            .map_err(Error::Backend)?;
        let server_branch = info.consensus_branch_id.trim().trim_start_matches("0x");
        if u32::from_str_radix(server_branch, 16).ok() != Some(client_branch) {
            self.report_setup_error(Error::MismatchedConsensusBranch {
                client: format!("{:x}", client_branch),
                server: info.consensus_branch_id.clone(),
            })?;
        } else if !self.network.matches_chain_name(&info.chain_name) {
            self.report_setup_error(Error::MismatchedNetwork {
                client: self.network.name.to_string(),
                server: info.chain_name.clone(),
            })?;
        }

        tracing::info!(
            "Setup verified: chain {} at height {}, branch {:x}",
            info.chain_name,
            server_height,
            client_branch
        );
        Ok(())
    }

    fn report_setup_error(&self, error: Error) -> Result<()> {
        let listener = self.listeners.read().setup_error.clone();
        match listener {
            Some(listener) if listener(&error) => {
                tracing::warn!("Setup error overridden: {}", error);
                Ok(())
            }
            _ => {
                tracing::error!("Setup failed: {}", error);
                Err(error)
            }
        }
    }

    async fn clear_block_cache(&self) {
        let last_scanned = match self.collaborators.repository.last_scanned_height().await {
            Ok(height) => height,
            Err(e) => {
                tracing::warn!("Failed to read last scanned height: {}", e);
                None
            }
        };
        if let DeleteOutcome::Failed { failed_at, error } = self.stages.delete_all(last_scanned).await
        {
            self.record(SyncEvent::CacheCleanupFailed {
                height: failed_at,
                error: error.to_string(),
            });
        }
    }

    async fn fetch_subtree_roots(&self) -> SubtreeRootsResult {
        let backend = &self.collaborators.backend;
        let source = self.collaborators.source.as_ref();
        let policy = RetryPolicy::new(
            self.config.subtree_roots_retries,
            self.config.retry_initial_backoff(),
        );

        let mut start_indices = [0u64; 2];
        for (slot, protocol) in [ShieldedProtocol::Sapling, ShieldedProtocol::Orchard]
            .into_iter()
            .enumerate()
        {
            start_indices[slot] = backend.next_subtree_index(protocol).await.unwrap_or_else(|e| {
                tracing::warn!("Failed to read next {:?} subtree index: {}", protocol, e);
                0
            });
        }
        let [sapling_start_index, orchard_start_index] = start_indices;

        let sapling = retry_up_to(policy, &self.cancel, "Sapling subtree roots", move |_| {
            source.subtree_roots(sapling_start_index, 0, ShieldedProtocol::Sapling)
        })
        .await;
        let orchard = retry_up_to(policy, &self.cancel, "Orchard subtree roots", move |_| {
            source.subtree_roots(orchard_start_index, 0, ShieldedProtocol::Orchard)
        })
        .await;

        let result = match (sapling, orchard) {
            (Ok(sapling_roots), _) if sapling_roots.is_empty() => SubtreeRootsResult::Linear,
            (Ok(sapling_roots), Ok(orchard_roots)) => SubtreeRootsResult::SpendBeforeSync {
                sapling_start_index,
                sapling_roots,
                orchard_start_index,
                orchard_roots,
            },
            (Err(e), _) | (_, Err(e)) if e.is_retryable() => SubtreeRootsResult::FailureConnection,
            (Err(e), _) | (_, Err(e)) => SubtreeRootsResult::OtherFailure(Error::Network(e)),
        };

        match &result {
            SubtreeRootsResult::SpendBeforeSync {
                sapling_roots,
                orchard_roots,
                ..
            } => tracing::info!(
                "Spend-before-sync with {} Sapling and {} Orchard subtree roots",
                sapling_roots.len(),
                orchard_roots.len()
            ),
            SubtreeRootsResult::Linear => tracing::info!("No subtree roots, syncing linearly"),
            SubtreeRootsResult::FailureConnection => {
                tracing::warn!("Subtree roots unavailable, will retry")
            }
            SubtreeRootsResult::OtherFailure(e) => {
                tracing::warn!("Subtree roots rejected, syncing linearly: {}", e)
            }
        }
        result
    }

    // ========================================================================
    // Processing pass
    // ========================================================================

    async fn process_new_blocks(
        &self,
        subtree_roots: &mut SubtreeRootsResult,
    ) -> Result<BlockProcessingResult> {
        if matches!(subtree_roots, SubtreeRootsResult::FailureConnection) {
            *subtree_roots = self.fetch_subtree_roots().await;
            if matches!(subtree_roots, SubtreeRootsResult::FailureConnection) {
                return Ok(BlockProcessingResult::Reconnecting);
            }
        }

        if let SubtreeRootsResult::SpendBeforeSync {
            sapling_start_index,
            sapling_roots,
            orchard_start_index,
            orchard_roots,
        } = subtree_roots
        {
            if !self.subtree_roots_stored.load(Ordering::Acquire) {
                if let Err(e) = self
                    .collaborators
                    .backend
                    .put_subtree_roots(
                        *sapling_start_index,
                        sapling_roots,
                        *orchard_start_index,
                        orchard_roots,
                    )
                    .await
                {
                    return Ok(BlockProcessingResult::SyncFailure {
                        failed_at: self.lower_bound_height(),
                        error: Error::SubtreeRoots(e),
                    });
                }
                self.subtree_roots_stored.store(true, Ordering::Release);
            }
        }

        let (chain_tip, mut ranges, overall, first_unenhanced) =
            match self.prepare_chain_tip().await? {
                PreparationResult::Success {
                    chain_tip,
                    ranges,
                    overall,
                    first_unenhanced,
                } => (chain_tip, ranges, overall, first_unenhanced),
                PreparationResult::NoMoreBlocksToProcess => {
                    return Ok(BlockProcessingResult::NoBlocksToProcess)
                }
                PreparationResult::ConnectionFailure => {
                    return Ok(BlockProcessingResult::Reconnecting)
                }
                PreparationResult::ProcessFailure { failed_at, error } => {
                    return Ok(BlockProcessingResult::SyncFailure { failed_at, error })
                }
            };

        let batch_count = planner::batch_count(&ranges, self.config.batch_size);
        *self.last_sync_range.lock() = Some(overall);
        self.observers.set_progress(0.0);
        self.observers.set_state(SyncState::Syncing);
        self.record(SyncEvent::PassStarted {
            range: overall,
            batches: batch_count,
            timestamp: chrono::Utc::now().to_rfc3339(),
        });

        let mut pass = PassContext {
            chain_tip,
            global_order: 0,
            batch_count,
            prepared_at: Instant::now(),
            first_unenhanced,
        };

        while let VerifyDecision::ShouldVerify(verify_range) =
            planner::classify_verification(&ranges)
        {
            tracing::info!("Verifying range {}", verify_range);
            match self.sync_and_enhance_range(verify_range, &mut pass).await {
                SyncingResult::AllSuccess => {}
                SyncingResult::RestartSynchronization => {
                    return Ok(BlockProcessingResult::RestartSynchronization)
                }
                SyncingResult::Failed(failure) => return Ok(self.failure_result(failure).await),
            }

            // Verification rewrites the backend's trees, so its ranges are stale now.
            ranges = match self.collaborators.backend.suggest_scan_ranges().await {
                Ok(ranges) => ranges,
                Err(e) => {
                    return Ok(BlockProcessingResult::SyncFailure {
                        failed_at: self.lower_bound_height(),
                        error: Error::Backend(e),
                    })
                }
            };
            self.update_range_info(pass.chain_tip, &ranges).await?;
        }

        for scan_range in &ranges {
            tracing::debug!(
                "Syncing {:?} range {}",
                scan_range.priority,
                scan_range.range
            );
            match self.sync_and_enhance_range(scan_range.range, &mut pass).await {
                SyncingResult::AllSuccess => {}
                SyncingResult::RestartSynchronization => {
                    return Ok(BlockProcessingResult::RestartSynchronization)
                }
                SyncingResult::Failed(failure) => return Ok(self.failure_result(failure).await),
            }
        }

        Ok(BlockProcessingResult::Success)
    }

    async fn prepare_chain_tip(&self) -> Result<PreparationResult> {
        let source = self.collaborators.source.as_ref();
        let backend = &self.collaborators.backend;
        let policy = RetryPolicy::new(
            self.config.latest_height_retries,
            self.config.retry_initial_backoff(),
        );

        let raw_tip = match retry_up_to_and_continue(
            policy,
            &self.cancel,
            "Latest block height fetch",
            move |_| source.latest_block_height(),
        )
        .await
        {
            Some(raw_tip) => raw_tip,
            None => return Ok(PreparationResult::ConnectionFailure),
        };

        let chain_tip = match BlockHeight::new(&self.network, raw_tip) {
            Ok(height) => height,
            Err(_) => {
                return Ok(PreparationResult::ProcessFailure {
                    failed_at: self.lower_bound_height(),
                    error: Error::BadBlockHeight(raw_tip),
                })
            }
        };
        self.observers.set_network_height(chain_tip);

        if let Err(e) = backend.update_chain_tip(chain_tip).await {
            return Ok(PreparationResult::ProcessFailure {
                failed_at: self.lower_bound_height(),
                error: Error::Backend(e),
            });
        }

        let ranges = match backend.suggest_scan_ranges().await {
            Ok(ranges) => ranges,
            Err(e) => {
                return Ok(PreparationResult::ProcessFailure {
                    failed_at: self.lower_bound_height(),
                    error: Error::Backend(e),
                })
            }
        };

        let first_unenhanced = self.update_range_info(chain_tip, &ranges).await?;
        match planner::overall_range(&ranges) {
            None => {
                tracing::debug!("No ranges to scan below tip {}", chain_tip);
                Ok(PreparationResult::NoMoreBlocksToProcess)
            }
            Some(overall) => Ok(PreparationResult::Success {
                chain_tip,
                ranges,
                overall,
                first_unenhanced,
            }),
        }
    }

    /// Publish a fresh processor info snapshot; returns the repository's
    /// first unenhanced height.
    async fn update_range_info(
        &self,
        chain_tip: BlockHeight,
        ranges: &[ScanRange],
    ) -> Result<Option<BlockHeight>> {
        let first_unenhanced = self
            .collaborators
            .repository
            .first_unenhanced_height()
            .await
            .map_err(Error::Repository)?;
        let overall = planner::overall_range(ranges);

        self.observers.update_processor_info(|info| {
            info.network_block_height = Some(chain_tip);
            info.overall_sync_range = overall;
            info.first_unenhanced_height = match (info.first_unenhanced_height, first_unenhanced) {
                (Some(previous), Some(current)) => Some(previous.max(current)),
                (previous, current) => current.or(previous),
            };
        });
        Ok(first_unenhanced)
    }

    /// Map a batch failure to the pass result. A continuity error empties the
    /// whole block cache first: anything cached past the break belongs to the
    /// abandoned chain.
    async fn failure_result(&self, failure: StageFailure) -> BlockProcessingResult {
        if let StageFailure::Continuity { failed_at, .. } = &failure {
            let failed_at = *failed_at;
            if let DeleteOutcome::Failed { error, .. } = self.stages.delete_all(Some(failed_at)).await
            {
                self.record(SyncEvent::CacheCleanupFailed {
                    height: Some(failed_at),
                    error: error.to_string(),
                });
            }
        }
        failure.into()
    }

    /// Download, scan, clean up and enhance one range, batch by batch.
    ///
    /// The next batch downloads on its own task while the current one is
    /// scanned.
    async fn sync_and_enhance_range(
        &self,
        range: BlockRange,
        pass: &mut PassContext,
    ) -> SyncingResult {
        let batches = planner::partition_into_batches(range, self.config.batch_size, pass.global_order);
        let Some(last_order) = batches.last().map(|batch| batch.order) else {
            return SyncingResult::AllSuccess;
        };
        tracing::debug!("Range {} split into {} batches", range, batches.len());

        let mut scheduler = EnhancementScheduler::new(
            range.start,
            pass.first_unenhanced.take(),
            self.config.enhance_batch_size,
        );
        let mut prefetch: Option<JoinHandle<DownloadOutcome>> = None;
        let mut batches = batches.into_iter().peekable();

        while let Some(batch) = batches.next() {
            let download = match prefetch.take() {
                Some(handle) => join_download(&batch, handle).await,
                None => self.stages.download(&batch).await,
            };
            prefetch = batches.peek().map(|next| self.spawn_download(next.clone()));
            let is_last = batch.order == last_order;

            match self.stages.process_downloaded(batch, download).await {
                BatchOutcome::Scanned { batch, cleanup, .. } => {
                    pass.global_order = batch.cross_ranges_order;
                    self.observers
                        .set_progress(planner::progress(pass.global_order, pass.batch_count));
                    self.record(SyncEvent::BatchScanned {
                        order: batch.cross_ranges_order,
                        range: batch.range,
                    });

                    let cleanup_failed = match cleanup {
                        DeleteOutcome::Success => false,
                        DeleteOutcome::Failed { failed_at, error } => {
                            self.record(SyncEvent::CacheCleanupFailed {
                                height: failed_at,
                                error: error.to_string(),
                            });
                            true
                        }
                    };

                    scheduler.extend_to(batch.range.end);
                    if scheduler.should_enhance(cleanup_failed, is_last) {
                        self.run_enhancement(&mut scheduler).await;
                    }

                    if pass.prepared_at.elapsed() >= self.config.restart_timeout() {
                        tracing::info!(
                            "Ranges planned {}s ago are stale",
                            pass.prepared_at.elapsed().as_secs()
                        );
                        abort_prefetch(prefetch.take());
                        return SyncingResult::RestartSynchronization;
                    }
                    if self.cancel.is_cancelled() {
                        abort_prefetch(prefetch.take());
                        return SyncingResult::RestartSynchronization;
                    }
                }
                BatchOutcome::Failed(failure) => {
                    abort_prefetch(prefetch.take());
                    tracing::warn!(
                        "Batch failed in {} stage at {}: {}",
                        failure.stage(),
                        failure.failed_at(),
                        failure.error()
                    );
                    if scheduler.should_enhance(true, is_last) {
                        self.run_enhancement(&mut scheduler).await;
                    }
                    return SyncingResult::Failed(failure);
                }
            }
        }

        SyncingResult::AllSuccess
    }

    fn spawn_download(&self, batch: BlockBatch) -> JoinHandle<DownloadOutcome> {
        let stages = self.stages.clone();
        tokio::spawn(async move { stages.download(&batch).await })
    }

    async fn run_enhancement(&self, scheduler: &mut EnhancementScheduler) {
        let Some(window) = scheduler.take() else {
            return;
        };
        for outcome in self.enhancer.enhance(window).await {
            match outcome {
                EnhanceOutcome::UpdateBirthday => {
                    tracing::info!("First wallet transaction found, updating birthday");
                    self.update_birthday_height().await;
                }
                EnhanceOutcome::Failed { failed_at, error } => {
                    self.record(SyncEvent::EnhanceFailed {
                        height: failed_at,
                        error: error.to_string(),
                    });
                }
                EnhanceOutcome::Success { range, enhanced } => {
                    tracing::debug!("Enhanced {} transactions in {}", enhanced, range);
                }
            }
        }
    }

    // ========================================================================
    // Reorg handling
    // ========================================================================

    async fn handle_chain_error(&self, error_height: BlockHeight, cause: &Error) -> Result<()> {
        let plan = self.recovery.plan(error_height);
        tracing::warn!(
            "Chain error at {} ({}), rewinding to {} (attempt {}/{})",
            error_height,
            cause,
            plan.rewind_height,
            plan.attempt,
            self.config.max_consecutive_errors
        );
        self.print_validation_error_info(error_height).await;

        let listener = self.listeners.read().chain_error.clone();
        if let Some(listener) = listener {
            listener(error_height, plan.rewind_height);
        }
        self.record(SyncEvent::ChainError {
            error_height,
            rewind_height: plan.rewind_height,
            attempt: plan.attempt,
        });

        if let Err(e) = self.rewind_to_height(plan.rewind_height).await {
            tracing::warn!("Rewind to {} failed: {}", plan.rewind_height, e);
        }

        if plan.exhausted {
            return Err(Error::FailedReorgRepair {
                height: error_height,
                attempts: plan.attempt,
            });
        }
        Ok(())
    }

    async fn print_validation_error_info(&self, error_height: BlockHeight) {
        if !tracing::enabled!(tracing::Level::DEBUG) {
            return;
        }
        for offset in 0..=VALIDATION_DUMP_BLOCKS {
            let height = error_height.saturating_add(offset);
            match self.collaborators.cache.find_compact_block(height).await {
                Ok(Some(block)) => {
                    tracing::debug!("Cached block {}: {}", height, block.display_hash())
                }
                Ok(None) => tracing::debug!("No cached block at {}", height),
                Err(e) => {
                    tracing::debug!("Cache lookup at {} failed: {}", height, e);
                    break;
                }
            }
        }
    }

    async fn rewind_to_height(&self, target: BlockHeight) -> Result<Option<BlockHeight>> {
        self.with_lock("rewind_to_height", self.rewind_locked(target))
            .await
    }

    async fn rewind_locked(&self, target: BlockHeight) -> Result<Option<BlockHeight>> {
        let rewound = self
            .recovery
            .rewind(
                self.collaborators.backend.as_ref(),
                self.collaborators.cache.as_ref(),
                self.collaborators.repository.as_ref(),
                target,
            )
            .await?;

        if let Some(height) = rewound {
            self.observers.set_state(SyncState::Syncing);
            self.observers.set_progress(0.0);
            self.observers
                .update_processor_info(|info| info.overall_sync_range = None);
            self.record(SyncEvent::Rewound { height });
        }
        Ok(rewound)
    }

    // ========================================================================
    // Public operations
    // ========================================================================

    /// Rewind to the nearest valid height at or below `height`.
    ///
    /// Never goes below the rewind floor and does nothing when `height` is
    /// not below the last scanned height. Returns the height rewound to.
    pub async fn rewind_to_nearest_height(
        &self,
        height: BlockHeight,
    ) -> Result<Option<BlockHeight>> {
        self.with_lock("rewind_to_nearest_height", async {
            let target = self
                .recovery
                .nearest_rewind_height(self.collaborators.backend.as_ref(), height)
                .await?;
            tracing::info!("Rewinding to {} (requested {})", target, height);
            self.rewind_locked(target).await
        })
        .await
    }

    /// Drop roughly two weeks of scanned blocks
    pub async fn quick_rewind(&self) -> Result<Option<BlockHeight>> {
        let lower_bound = self.lower_bound_height();
        let last_scanned = self
            .collaborators
            .repository
            .last_scanned_height()
            .await
            .map_err(Error::Repository)?;
        let height = last_scanned.map_or(lower_bound, |h| h.max(lower_bound));
        let blocks = self
            .consensus
            .blocks_per_day()
            .saturating_mul(self.config.quick_rewind_days);
        let target = height.saturating_sub(blocks).max(lower_bound);
        tracing::info!("Quick rewind from {} to {}", height, target);
        self.rewind_to_nearest_height(target).await
    }

    /// Recompute the birthday estimate; never below the published value
    pub async fn calculate_birthday_height(&self) -> Result<BlockHeight> {
        let oldest = self
            .collaborators
            .repository
            .oldest_transaction()
            .await
            .map_err(Error::Repository)?
            .and_then(|tx| tx.mined_height);
        let estimate = planner::birthday_height(
            oldest,
            self.lower_bound_height(),
            self.config.max_reorg_size,
        );
        Ok(estimate.max(self.observers.birthday_height()))
    }

    async fn update_birthday_height(&self) {
        match self.calculate_birthday_height().await {
            Ok(height) => {
                if self.observers.raise_birthday_height(height) {
                    self.record(SyncEvent::BirthdayUpdated { height });
                }
            }
            Err(e) => tracing::warn!("Failed to calculate birthday height: {}", e),
        }
    }

    /// Fetch transparent outputs received by `account` since `since`.
    ///
    /// Returns the number stored, or `None` once too many refreshes have
    /// failed; the server probably does not support the request.
    pub async fn refresh_utxos(&self, account: u32, since: BlockHeight) -> Result<Option<usize>> {
        let failed = self.failed_utxo_fetches.load(Ordering::Acquire);
        if failed >= self.config.max_failed_utxo_fetches {
            tracing::debug!("Skipping UTXO refresh after {} failed attempts", failed);
            return Ok(None);
        }

        let backend = &self.collaborators.backend;
        let source = self.collaborators.source.as_ref();
        let addresses = backend
            .transparent_receivers(account)
            .await
            .map_err(Error::Backend)?;
        if addresses.is_empty() {
            return Ok(Some(0));
        }

        let policy = RetryPolicy::new(
            self.config.utxo_fetch_retries,
            self.config.retry_initial_backoff(),
        );
        let addresses = addresses.as_slice();
        let fetched = retry_up_to(policy, &self.cancel, "UTXO fetch", move |_| {
            source.fetch_utxos(addresses, since)
        })
        .await;

        let utxos = match fetched {
            Ok(utxos) => utxos,
            Err(e) => {
                let failures = self.failed_utxo_fetches.fetch_add(1, Ordering::AcqRel) + 1;
                if matches!(e, NetworkError::Unavailable(_)) {
                    self.observers.set_state(SyncState::Disconnected);
                }
                tracing::warn!(
                    "UTXO refresh failed ({}/{}): {}",
                    failures,
                    self.config.max_failed_utxo_fetches,
                    e
                );
                return Err(Error::FetchUtxos {
                    account,
                    message: e.to_string(),
                });
            }
        };

        for utxo in &utxos {
            backend.put_utxo(utxo).await.map_err(Error::Backend)?;
        }
        self.failed_utxo_fetches.store(0, Ordering::Release);
        tracing::debug!("Stored {} UTXOs for account {}", utxos.len(), account);
        Ok(Some(utxos.len()))
    }

    /// Balance of `account`
    pub async fn get_balance_info(&self, account: u32) -> Result<AccountBalance> {
        self.collaborators
            .backend
            .balance(account)
            .await
            .map_err(|source| Error::Balance { account, source })
    }
}

async fn join_download(batch: &BlockBatch, handle: JoinHandle<DownloadOutcome>) -> DownloadOutcome {
    match handle.await {
        Ok(outcome) => outcome,
        Err(e) => DownloadOutcome::Failed {
            failed_at: batch.range.start,
            error: Error::DownloadFailed {
                height: batch.range.start,
                source: NetworkError::Unavailable(format!("download task failed: {}", e)),
            },
        },
    }
}

fn abort_prefetch(prefetch: Option<JoinHandle<DownloadOutcome>>) {
    if let Some(handle) = prefetch {
        handle.abort();
    }
}

// Compile-time check that SyncEngine can be shared with the spawned loop.
#[allow(dead_code)]
fn _assert_sync_engine_send_sync() {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<SyncEngine>();
}
