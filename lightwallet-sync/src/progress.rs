//! Observable processor status and performance counters.
//!
//! Every stream is a `tokio::sync::watch` channel: a new subscriber sees the
//! latest value immediately and publishing never blocks, even with no
//! subscribers at all.

use std::sync::atomic::{AtomicU64, Ordering};

use lightwallet_params::BlockHeight;
use tokio::sync::watch;

use crate::model::{ProcessorInfo, SyncState};

/// Publishers for everything a wallet UI observes
#[derive(Debug)]
pub struct SyncObservers {
    state: watch::Sender<SyncState>,
    progress: watch::Sender<f64>,
    processor_info: watch::Sender<ProcessorInfo>,
    network_height: watch::Sender<Option<BlockHeight>>,
    birthday_height: watch::Sender<BlockHeight>,
}

impl SyncObservers {
    /// Fresh observers in the `Initialized` state
    pub fn new(birthday_height: BlockHeight) -> Self {
        Self {
            state: watch::Sender::new(SyncState::Initialized),
            progress: watch::Sender::new(0.0),
            processor_info: watch::Sender::new(ProcessorInfo::default()),
            network_height: watch::Sender::new(None),
            birthday_height: watch::Sender::new(birthday_height),
        }
    }

    // ========================================================================
    // State
    // ========================================================================

    /// Publish a new state. Nothing leaves `Stopped`.
    pub fn set_state(&self, next: SyncState) -> bool {
        self.state.send_if_modified(|current| {
            if current.is_stopped() || *current == next {
                return false;
            }
            tracing::debug!("State: {} -> {}", current.name(), next.name());
            *current = next;
            true
        })
    }

    /// Current state
    pub fn state(&self) -> SyncState {
        *self.state.borrow()
    }

    /// Subscribe to state changes
    pub fn subscribe_state(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    // ========================================================================
    // Progress
    // ========================================================================

    /// Publish progress in `[0, 1]`
    pub fn set_progress(&self, progress: f64) {
        let progress = if progress.is_nan() {
            0.0
        } else {
            progress.clamp(0.0, 1.0)
        };
        self.progress.send_replace(progress);
    }

    /// Current progress
    pub fn progress(&self) -> f64 {
        *self.progress.borrow()
    }

    /// Subscribe to progress
    pub fn subscribe_progress(&self) -> watch::Receiver<f64> {
        self.progress.subscribe()
    }

    // ========================================================================
    // Processor info
    // ========================================================================

    /// Replace the processor info snapshot
    pub fn set_processor_info(&self, info: ProcessorInfo) {
        self.processor_info.send_replace(info);
    }

    /// Modify a copy of the current snapshot and publish it
    pub fn update_processor_info(&self, update: impl FnOnce(&mut ProcessorInfo)) {
        let mut info = self.processor_info();
        update(&mut info);
        self.processor_info.send_replace(info);
    }

    /// Current processor info
    pub fn processor_info(&self) -> ProcessorInfo {
        self.processor_info.borrow().clone()
    }

    /// Subscribe to processor info
    pub fn subscribe_processor_info(&self) -> watch::Receiver<ProcessorInfo> {
        self.processor_info.subscribe()
    }

    /// Publish the server's chain tip
    pub fn set_network_height(&self, height: BlockHeight) {
        self.network_height.send_replace(Some(height));
    }

    /// Last known server chain tip
    pub fn network_height(&self) -> Option<BlockHeight> {
        *self.network_height.borrow()
    }

    /// Subscribe to the server chain tip
    pub fn subscribe_network_height(&self) -> watch::Receiver<Option<BlockHeight>> {
        self.network_height.subscribe()
    }

    // ========================================================================
    // Birthday
    // ========================================================================

    /// Publish `height` if it is above the current birthday
    pub fn raise_birthday_height(&self, height: BlockHeight) -> bool {
        self.birthday_height.send_if_modified(|current| {
            if height > *current {
                *current = height;
                true
            } else {
                false
            }
        })
    }

    /// Current birthday height
    pub fn birthday_height(&self) -> BlockHeight {
        *self.birthday_height.borrow()
    }

    /// Subscribe to birthday height changes
    pub fn subscribe_birthday_height(&self) -> watch::Receiver<BlockHeight> {
        self.birthday_height.subscribe()
    }
}

/// Batch timing counters
#[derive(Debug, Default)]
pub struct PerfCounters {
    /// Total blocks scanned
    pub blocks_processed: AtomicU64,
    /// Total notes received while scanning
    pub notes_received: AtomicU64,
    /// Last batch processing time in milliseconds
    pub last_batch_ms: AtomicU64,
    /// Total processing time in milliseconds
    pub total_time_ms: AtomicU64,
    /// Number of batches processed
    pub batches_processed: AtomicU64,
    /// Transactions enhanced
    pub transactions_enhanced: AtomicU64,
}

impl PerfCounters {
    /// Create new perf counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Record batch completion
    pub fn record_batch(&self, blocks: u64, notes: u64, duration_ms: u64) {
        self.blocks_processed.fetch_add(blocks, Ordering::Relaxed);
        self.notes_received.fetch_add(notes, Ordering::Relaxed);
        self.last_batch_ms.store(duration_ms, Ordering::Relaxed);
        self.total_time_ms.fetch_add(duration_ms, Ordering::Relaxed);
        self.batches_processed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record enhanced transactions
    pub fn record_enhanced(&self, count: u64) {
        self.transactions_enhanced.fetch_add(count, Ordering::Relaxed);
    }

    /// Get blocks per second
    pub fn blocks_per_second(&self) -> f64 {
        let blocks = self.blocks_processed.load(Ordering::Relaxed);
        let time_ms = self.total_time_ms.load(Ordering::Relaxed);
        if time_ms == 0 {
            return 0.0;
        }
        (blocks as f64) / (time_ms as f64 / 1000.0)
    }

    /// Get average batch time in ms
    pub fn avg_batch_ms(&self) -> u64 {
        let batches = self.batches_processed.load(Ordering::Relaxed);
        if batches == 0 {
            return 0;
        }
        self.total_time_ms.load(Ordering::Relaxed) / batches
    }

    /// Get snapshot of counters
    pub fn snapshot(&self) -> PerfSnapshot {
        PerfSnapshot {
            blocks_processed: self.blocks_processed.load(Ordering::Relaxed),
            batches_processed: self.batches_processed.load(Ordering::Relaxed),
            notes_received: self.notes_received.load(Ordering::Relaxed),
            transactions_enhanced: self.transactions_enhanced.load(Ordering::Relaxed),
            last_batch_ms: self.last_batch_ms.load(Ordering::Relaxed),
            avg_batch_ms: self.avg_batch_ms(),
            blocks_per_second: self.blocks_per_second(),
        }
    }
}

/// Snapshot of performance counters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PerfSnapshot {
    /// Total blocks scanned
    pub blocks_processed: u64,
    /// Number of batches processed
    pub batches_processed: u64,
    /// Total notes received
    pub notes_received: u64,
    /// Transactions enhanced
    pub transactions_enhanced: u64,
    /// Last batch processing time in milliseconds
    pub last_batch_ms: u64,
    /// Average batch processing time in milliseconds
    pub avg_batch_ms: u64,
    /// Scanning throughput
    pub blocks_per_second: f64,
}
