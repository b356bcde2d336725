//! Tagged outcomes the processor's control flow switches on.
//!
//! Each stage family has its own sum type. A failure variant short-circuits
//! the rest of the batch; the processor matches every variant explicitly.

use lightwallet_params::BlockHeight;

use crate::error::Error;
use crate::model::{BlockBatch, BlockMeta, BlockRange, ScanRange, ScanSummary, SubtreeRoot};

/// Download stage result
#[derive(Debug)]
pub enum DownloadOutcome {
    /// Blocks fetched and cached
    Success(Vec<BlockMeta>),
    /// Download failed after retries
    Failed {
        /// Batch start height
        failed_at: BlockHeight,
        /// Cause
        error: Error,
    },
}

/// Scan stage result
#[derive(Debug)]
pub enum ScanOutcome {
    /// Batch scanned
    Success(ScanSummary),
    /// Batch does not connect to the stored chain
    ContinuityError {
        /// One below the failing batch start
        failed_at: BlockHeight,
        /// Cause
        error: Error,
    },
    /// Any other scan failure
    Failed {
        /// Failing batch start
        failed_at: BlockHeight,
        /// Cause
        error: Error,
    },
}

/// Cache cleanup result
#[derive(Debug)]
pub enum DeleteOutcome {
    /// Cached files removed
    Success,
    /// Cleanup failed; retried at the next full sweep
    Failed {
        /// Height the cleanup was anchored at, if any
        failed_at: Option<BlockHeight>,
        /// Cause
        error: Error,
    },
}

/// One event produced while enhancing a range
#[derive(Debug)]
pub enum EnhanceOutcome {
    /// The first transaction the wallet has ever seen appeared
    UpdateBirthday,
    /// One transaction could not be enhanced
    Failed {
        /// Height of the transaction or range, if known
        failed_at: Option<BlockHeight>,
        /// Cause
        error: Error,
    },
    /// Enhancement of the range finished
    Success {
        /// Range that was enhanced
        range: BlockRange,
        /// Transactions decrypted and stored
        enhanced: usize,
    },
}

/// Failure that ends processing of a batch
#[derive(Debug)]
pub enum StageFailure {
    /// Download failed
    Download {
        /// Batch start
        failed_at: BlockHeight,
        /// Cause
        error: Error,
    },
    /// Scan failed
    Scan {
        /// Batch start
        failed_at: BlockHeight,
        /// Cause
        error: Error,
    },
    /// Chain continuity broken
    Continuity {
        /// One below the batch start
        failed_at: BlockHeight,
        /// Cause
        error: Error,
    },
}

impl StageFailure {
    /// Height the failure is anchored at
    pub fn failed_at(&self) -> BlockHeight {
        match self {
            StageFailure::Download { failed_at, .. }
            | StageFailure::Scan { failed_at, .. }
            | StageFailure::Continuity { failed_at, .. } => *failed_at,
        }
    }

    /// Short stage name for logs
    pub fn stage(&self) -> &'static str {
        match self {
            StageFailure::Download { .. } => "download",
            StageFailure::Scan { .. } => "scan",
            StageFailure::Continuity { .. } => "continuity",
        }
    }

    /// Underlying error
    pub fn error(&self) -> &Error {
        match self {
            StageFailure::Download { error, .. }
            | StageFailure::Scan { error, .. }
            | StageFailure::Continuity { error, .. } => error,
        }
    }
}

impl DownloadOutcome {
    /// Blocks, or the failure that ends the batch
    pub fn into_result(self) -> Result<Vec<BlockMeta>, StageFailure> {
        match self {
            DownloadOutcome::Success(blocks) => Ok(blocks),
            DownloadOutcome::Failed { failed_at, error } => {
                Err(StageFailure::Download { failed_at, error })
            }
        }
    }
}

impl ScanOutcome {
    /// Scan summary, or the failure that ends the batch
    pub fn into_result(self) -> Result<ScanSummary, StageFailure> {
        match self {
            ScanOutcome::Success(summary) => Ok(summary),
            ScanOutcome::ContinuityError { failed_at, error } => {
                Err(StageFailure::Continuity { failed_at, error })
            }
            ScanOutcome::Failed { failed_at, error } => Err(StageFailure::Scan { failed_at, error }),
        }
    }
}

/// Result of pushing one batch through download, scan and delete
#[derive(Debug)]
pub enum BatchOutcome {
    /// Batch scanned; cleanup result attached
    Scanned {
        /// The batch, with its blocks attached
        batch: BlockBatch,
        /// Backend scan summary
        summary: ScanSummary,
        /// Cache cleanup result
        cleanup: DeleteOutcome,
    },
    /// Batch stopped at a failing stage
    Failed(StageFailure),
}

/// Result of syncing and enhancing one scan range
#[derive(Debug)]
pub enum SyncingResult {
    /// Every batch of the range succeeded
    AllSuccess,
    /// Planning inputs went stale; start a fresh pass
    RestartSynchronization,
    /// A batch failed
    Failed(StageFailure),
}

/// Result of one planning and processing pass
#[derive(Debug)]
pub enum BlockProcessingResult {
    /// Nothing left to scan
    NoBlocksToProcess,
    /// Pass finished; more work may be available
    Success,
    /// Server unreachable
    Reconnecting,
    /// Restart immediately with fresh planning inputs
    RestartSynchronization,
    /// Pass failed before reaching the scanner; counted but never rewound
    SyncFailure {
        /// Height the failure is anchored at
        failed_at: BlockHeight,
        /// Cause
        error: Error,
    },
    /// Backend failed to scan a batch
    ScanFailure {
        /// Failing batch start
        failed_at: BlockHeight,
        /// Cause
        error: Error,
    },
    /// Chain continuity broken
    ContinuityError {
        /// One below the failing batch start
        failed_at: BlockHeight,
        /// Cause
        error: Error,
    },
}

impl From<StageFailure> for BlockProcessingResult {
    fn from(failure: StageFailure) -> Self {
        match failure {
            StageFailure::Continuity { failed_at, error } => {
                BlockProcessingResult::ContinuityError { failed_at, error }
            }
            StageFailure::Scan { failed_at, error } => {
                BlockProcessingResult::ScanFailure { failed_at, error }
            }
            StageFailure::Download { failed_at, error } => {
                BlockProcessingResult::SyncFailure { failed_at, error }
            }
        }
    }
}

/// Outcome of chain tip preparation for a pass
#[derive(Debug)]
pub enum PreparationResult {
    /// Ranges planned
    Success {
        /// Server chain tip
        chain_tip: BlockHeight,
        /// Suggested ranges in backend order
        ranges: Vec<ScanRange>,
        /// Envelope of the ranges
        overall: BlockRange,
        /// Lowest height still awaiting enhancement
        first_unenhanced: Option<BlockHeight>,
    },
    /// Nothing to scan
    NoMoreBlocksToProcess,
    /// Chain tip could not be fetched
    ConnectionFailure,
    /// Backend rejected the chain tip or could not suggest ranges
    ProcessFailure {
        /// Height the failure is anchored at
        failed_at: BlockHeight,
        /// Cause
        error: Error,
    },
}

/// Whether the first suggested range must be verified first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyDecision {
    /// Scan this range before anything else, then re-plan
    ShouldVerify(BlockRange),
    /// No verification needed
    NoVerify,
}

/// Sync strategy decided from the server's subtree roots
#[derive(Debug)]
pub enum SubtreeRootsResult {
    /// Roots available: spend-before-sync
    SpendBeforeSync {
        /// Index of the first Sapling root
        sapling_start_index: u64,
        /// Sapling roots
        sapling_roots: Vec<SubtreeRoot>,
        /// Index of the first Orchard root
        orchard_start_index: u64,
        /// Orchard roots
        orchard_roots: Vec<SubtreeRoot>,
    },
    /// Roots unavailable: linear sync
    Linear,
    /// Server unreachable; try again next iteration
    FailureConnection,
    /// Roots could not be fetched for another reason; linear fallback
    OtherFailure(Error),
}
