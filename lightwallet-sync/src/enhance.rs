//! Transaction enhancement: the scheduling window and the enhancer itself

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use lightwallet_params::BlockHeight;

use crate::cancel::CancelToken;
use crate::error::{Error, NetworkError};
use crate::model::{BlockRange, TransactionOverview, TransactionStatus};
use crate::outcome::EnhanceOutcome;
use crate::progress::PerfCounters;
use crate::retry::{retry_up_to, RetryPolicy};
use crate::traits::{BlockSource, DerivedDataRepository, ScanBackend};

/// Running window of scanned heights whose transactions are not enhanced yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnhancementScheduler {
    start: BlockHeight,
    end: Option<BlockHeight>,
    threshold: u64,
}

impl EnhancementScheduler {
    /// Window for a range starting at `range_start`.
    ///
    /// Starts lower when earlier transactions are still unenhanced.
    pub fn new(
        range_start: BlockHeight,
        first_unenhanced: Option<BlockHeight>,
        threshold: u64,
    ) -> Self {
        let start = first_unenhanced.map_or(range_start, |h| h.min(range_start));
        let end = if start < range_start {
            Some(range_start.saturating_sub(1))
        } else {
            None
        };
        Self {
            start,
            end,
            threshold: threshold.max(1),
        }
    }

    /// Grow the window after a batch ending at `end` was scanned
    pub fn extend_to(&mut self, end: BlockHeight) {
        if end >= self.start {
            self.end = Some(self.end.map_or(end, |current| current.max(end)));
        }
    }

    /// Current window, `None` when empty
    pub fn window(&self) -> Option<BlockRange> {
        self.end.map(|end| BlockRange::new(self.start, end))
    }

    /// Enhance when the window is full, a stage failed or the range is done
    pub fn should_enhance(&self, upstream_failed: bool, last_batch: bool) -> bool {
        match self.window() {
            Some(window) => window.len() >= self.threshold || upstream_failed || last_batch,
            None => false,
        }
    }

    /// Hand out the window and restart it just above
    pub fn take(&mut self) -> Option<BlockRange> {
        let window = self.window()?;
        self.start = window.end.saturating_add(1);
        self.end = None;
        Some(window)
    }
}

/// Fetches and decrypts full transactions for newly found wallet transactions
pub struct TransactionEnhancer {
    source: Arc<dyn BlockSource>,
    backend: Arc<dyn ScanBackend>,
    repository: Arc<dyn DerivedDataRepository>,
    fetch_policy: RetryPolicy,
    cancel: CancelToken,
    perf: Arc<PerfCounters>,
    first_transaction_seen: AtomicBool,
}

impl TransactionEnhancer {
    /// Create an enhancer
    pub fn new(
        source: Arc<dyn BlockSource>,
        backend: Arc<dyn ScanBackend>,
        repository: Arc<dyn DerivedDataRepository>,
        fetch_policy: RetryPolicy,
        cancel: CancelToken,
        perf: Arc<PerfCounters>,
    ) -> Self {
        Self {
            source,
            backend,
            repository,
            fetch_policy,
            cancel,
            perf,
            first_transaction_seen: AtomicBool::new(false),
        }
    }

    /// Enhance every new transaction mined in `range`.
    ///
    /// Per-transaction failures are returned as outcomes and never stop the
    /// remaining transactions. The last outcome is always `Success` unless
    /// the repository could not be queried.
    pub async fn enhance(&self, range: BlockRange) -> Vec<EnhanceOutcome> {
        let mut outcomes = Vec::new();

        let transactions = match self.repository.find_new_transactions(range).await {
            Ok(transactions) => transactions,
            Err(e) => {
                outcomes.push(EnhanceOutcome::Failed {
                    failed_at: Some(range.start),
                    error: Error::Repository(e),
                });
                return outcomes;
            }
        };

        if transactions.is_empty() {
            tracing::debug!("No new transactions in {}", range);
        } else {
            tracing::debug!("Enhancing {} transactions in {}", transactions.len(), range);
            if self.is_first_transaction(transactions.len()).await {
                outcomes.push(EnhanceOutcome::UpdateBirthday);
            }
        }

        let mut enhanced = 0;
        for tx in &transactions {
            let Some(height) = tx.mined_height else {
                tracing::debug!("Skipping unmined transaction {}", tx.txid_hex());
                continue;
            };
            match self.enhance_transaction(tx, height).await {
                Ok(true) => enhanced += 1,
                Ok(false) => {}
                Err(error) => outcomes.push(EnhanceOutcome::Failed {
                    failed_at: Some(height),
                    error,
                }),
            }
        }

        self.perf.record_enhanced(enhanced as u64);
        self.repository.invalidate().await;
        outcomes.push(EnhanceOutcome::Success { range, enhanced });
        outcomes
    }

    /// True exactly once: when every transaction the wallet knows is new.
    async fn is_first_transaction(&self, new_count: usize) -> bool {
        if self.first_transaction_seen.load(Ordering::Acquire) {
            return false;
        }
        match self.repository.transaction_count().await {
            Ok(0) => false,
            Ok(total) => {
                let already_seen = self.first_transaction_seen.swap(true, Ordering::AcqRel);
                !already_seen && total == new_count as u64
            }
            Err(e) => {
                tracing::warn!("Failed to count transactions: {}", e);
                false
            }
        }
    }

    /// Returns `Ok(false)` when the server did not recognize the txid.
    async fn enhance_transaction(
        &self,
        tx: &TransactionOverview,
        height: BlockHeight,
    ) -> Result<bool, Error> {
        let txid = tx.txid.as_slice();
        let label = format!("Fetch of transaction {}", tx.txid_hex());
        let fetched = retry_up_to(self.fetch_policy, &self.cancel, &label, move |_| {
            self.source.fetch_transaction(txid)
        })
        .await;

        match fetched {
            Ok(bytes) => {
                self.backend
                    .decrypt_and_store_transaction(&bytes, Some(height))
                    .await
                    .map_err(|e| Error::EnhanceFailed {
                        txid: tx.txid_hex(),
                        message: format!("decrypt and store: {}", e),
                    })?;
                tracing::debug!("Enhanced transaction {} at {}", tx.txid_hex(), height);
                Ok(true)
            }
            Err(NetworkError::NotFound(_)) => {
                tracing::warn!("Transaction {} not recognized by the server", tx.txid_hex());
                self.backend
                    .set_transaction_status(txid, TransactionStatus::TxidNotRecognized)
                    .await
                    .map_err(|e| Error::EnhanceFailed {
                        txid: tx.txid_hex(),
                        message: format!("set status: {}", e),
                    })?;
                Ok(false)
            }
            Err(e) => Err(Error::EnhanceFailed {
                txid: tx.txid_hex(),
                message: e.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(value: u32) -> BlockHeight {
        BlockHeight::from_u32(value)
    }

    #[test]
    fn test_window_starts_empty_without_backlog() {
        let scheduler = EnhancementScheduler::new(h(500), None, 1000);
        assert_eq!(scheduler.window(), None);
        assert!(!scheduler.should_enhance(true, true));

        let scheduler = EnhancementScheduler::new(h(500), Some(h(700)), 1000);
        assert_eq!(scheduler.window(), None);
    }

    #[test]
    fn test_window_includes_backlog() {
        let mut scheduler = EnhancementScheduler::new(h(500), Some(h(450)), 1000);
        assert_eq!(scheduler.window(), Some(BlockRange::new(h(450), h(499))));
        scheduler.extend_to(h(599));
        assert_eq!(scheduler.window(), Some(BlockRange::new(h(450), h(599))));
    }

    #[test]
    fn test_fires_on_threshold_failure_or_last_batch() {
        let mut scheduler = EnhancementScheduler::new(h(100), None, 250);
        scheduler.extend_to(h(199));
        assert!(!scheduler.should_enhance(false, false));
        assert!(scheduler.should_enhance(true, false));
        assert!(scheduler.should_enhance(false, true));
        scheduler.extend_to(h(349));
        assert!(scheduler.should_enhance(false, false));
    }

    #[test]
    fn test_take_resets_above_window() {
        let mut scheduler = EnhancementScheduler::new(h(100), None, 100);
        scheduler.extend_to(h(199));
        assert_eq!(scheduler.take(), Some(BlockRange::new(h(100), h(199))));
        assert_eq!(scheduler.take(), None);
        scheduler.extend_to(h(299));
        assert_eq!(scheduler.window(), Some(BlockRange::new(h(200), h(299))));
    }
}
