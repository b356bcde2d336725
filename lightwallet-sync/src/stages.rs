//! Per-batch pipeline stages: download, scan and cache cleanup

use std::sync::Arc;

use lightwallet_params::BlockHeight;
use tokio::time::Instant;

use crate::cancel::CancelToken;
use crate::error::{Error, NetworkError, ScanError};
use crate::model::BlockBatch;
use crate::outcome::{BatchOutcome, DeleteOutcome, DownloadOutcome, ScanOutcome};
use crate::progress::PerfCounters;
use crate::retry::{retry_up_to, RetryPolicy};
use crate::traits::{BlockSource, CompactBlockCache, ScanBackend};

/// Runs the stages of one batch against the collaborators.
///
/// Cheap to clone so the next batch's download can run on its own task while
/// the current batch is scanned.
#[derive(Clone)]
pub struct StageExecutor {
    source: Arc<dyn BlockSource>,
    backend: Arc<dyn ScanBackend>,
    cache: Arc<dyn CompactBlockCache>,
    download_policy: RetryPolicy,
    cancel: CancelToken,
    perf: Arc<PerfCounters>,
}

impl StageExecutor {
    /// Create an executor
    pub fn new(
        source: Arc<dyn BlockSource>,
        backend: Arc<dyn ScanBackend>,
        cache: Arc<dyn CompactBlockCache>,
        download_policy: RetryPolicy,
        cancel: CancelToken,
        perf: Arc<PerfCounters>,
    ) -> Self {
        Self {
            source,
            backend,
            cache,
            download_policy,
            cancel,
            perf,
        }
    }

    /// Download the batch's blocks. An empty answer counts as a failure.
    pub async fn download(&self, batch: &BlockBatch) -> DownloadOutcome {
        let range = batch.range;
        let label = format!("Download of {}", range);
        let result = retry_up_to(self.download_policy, &self.cancel, &label, |_| async move {
            let blocks = self.source.download_block_range(range).await?;
            if blocks.is_empty() {
                return Err(NetworkError::NotFound(format!("no blocks in {}", range)));
            }
            Ok(blocks)
        })
        .await;

        match result {
            Ok(blocks) => {
                tracing::debug!("Downloaded {} blocks for batch {}", blocks.len(), range);
                DownloadOutcome::Success(blocks)
            }
            Err(source) => DownloadOutcome::Failed {
                failed_at: range.start,
                error: Error::DownloadFailed {
                    height: range.start,
                    source,
                },
            },
        }
    }

    /// Scan the batch. Continuity errors anchor one below the batch start.
    pub async fn scan(&self, batch: &BlockBatch) -> ScanOutcome {
        let start = batch.range.start;
        let limit = u32::try_from(batch.range.len()).unwrap_or(u32::MAX);

        match self.backend.scan_blocks(start, limit).await {
            Ok(summary) => ScanOutcome::Success(summary),
            Err(source @ ScanError::Continuity { .. }) => {
                let failed_at = start.saturating_sub(1);
                tracing::warn!("Continuity error while scanning {}: {}", batch.range, source);
                ScanOutcome::ContinuityError {
                    failed_at,
                    error: Error::ScanFailed {
                        height: failed_at,
                        source,
                    },
                }
            }
            Err(source) => {
                tracing::warn!("Failed to scan {}: {}", batch.range, source);
                ScanOutcome::Failed {
                    failed_at: start,
                    error: Error::ScanFailed {
                        height: start,
                        source,
                    },
                }
            }
        }
    }

    /// Remove the batch's cached block files
    pub async fn delete(&self, batch: &BlockBatch) -> DeleteOutcome {
        let blocks = batch.blocks.as_deref().unwrap_or_default();
        match self.cache.delete_compact_block_files(blocks).await {
            Ok(()) => DeleteOutcome::Success,
            Err(e) => DeleteOutcome::Failed {
                failed_at: Some(batch.range.start),
                error: Error::DeleteFailed(e),
            },
        }
    }

    /// Remove every cached block file
    pub async fn delete_all(&self, last_scanned: Option<BlockHeight>) -> DeleteOutcome {
        match self.cache.delete_all_compact_block_files().await {
            Ok(()) => {
                tracing::debug!("Cleared block cache (last scanned {:?})", last_scanned);
                DeleteOutcome::Success
            }
            Err(e) => DeleteOutcome::Failed {
                failed_at: last_scanned,
                error: Error::DeleteFailed(e),
            },
        }
    }

    /// Scan then clean up a batch whose download already finished.
    ///
    /// Stops at the first failing stage.
    pub async fn process_downloaded(
        &self,
        mut batch: BlockBatch,
        download: DownloadOutcome,
    ) -> BatchOutcome {
        let started = Instant::now();

        let blocks = match download.into_result() {
            Ok(blocks) => blocks,
            Err(failure) => return BatchOutcome::Failed(failure),
        };
        let block_count = blocks.len() as u64;
        batch.blocks = Some(blocks);

        let summary = match self.scan(&batch).await.into_result() {
            Ok(summary) => summary,
            Err(failure) => return BatchOutcome::Failed(failure),
        };

        let cleanup = self.delete(&batch).await;

        self.perf.record_batch(
            block_count,
            summary.received_note_count,
            started.elapsed().as_millis() as u64,
        );

        BatchOutcome::Scanned {
            batch,
            summary,
            cleanup,
        }
    }

    /// Download, scan and clean up one batch
    pub async fn process(&self, batch: BlockBatch) -> BatchOutcome {
        let download = self.download(&batch).await;
        self.process_downloaded(batch, download).await
    }
}
