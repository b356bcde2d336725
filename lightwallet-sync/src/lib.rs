//! Compact block sync engine
//!
//! Drives a light wallet from its birthday to the chain tip: plans scan
//! ranges, downloads and scans compact blocks in batches, fetches full
//! transactions for the wallet's own activity and repairs chain reorgs.
//! Server, scanner and storage are plugged in through the traits in
//! [`traits`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::result_large_err)]

pub mod cancel;
pub mod config;
pub mod enhance;
pub mod error;
pub mod events;
pub mod model;
pub mod outcome;
pub mod planner;
pub mod processor;
pub mod progress;
pub mod registry;
pub mod reorg;
pub mod retry;
pub mod stages;
pub mod traits;

pub use cancel::CancelToken;
pub use config::SyncConfig;
pub use enhance::{EnhancementScheduler, TransactionEnhancer};
pub use error::{Error, NetworkError, Result, ScanError};
pub use events::{init_sync_logging, SyncEvent, SyncEventLog};
pub use model::{
    AccountBalance, BlockBatch, BlockMeta, BlockRange, ProcessorInfo, RewindResult, ScanPriority,
    ScanRange, ScanSummary, ServerInfo, ShieldedProtocol, SubtreeRoot, SyncState,
    TransactionOverview, TransactionStatus, Utxo,
};
pub use outcome::{
    BatchOutcome, BlockProcessingResult, DeleteOutcome, DownloadOutcome, EnhanceOutcome,
    PreparationResult, ScanOutcome, StageFailure, SubtreeRootsResult, SyncingResult,
    VerifyDecision,
};
pub use processor::{
    ChainErrorListener, Collaborators, ProcessorErrorListener, SetupErrorListener, SyncEngine,
};
pub use progress::{PerfCounters, PerfSnapshot, SyncObservers};
pub use registry::{Lifecycle, ProcessorKey, ProcessorRegistry, Registration};
pub use reorg::{RecoveryPlan, ReorgRecovery};
pub use retry::{Backoff, RetryPolicy};
pub use stages::StageExecutor;
pub use traits::{BlockSource, CompactBlockCache, DerivedDataRepository, ScanBackend};

pub use lightwallet_params::{BlockHeight, Network, NetworkType};
