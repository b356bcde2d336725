//! Chain reorg recovery: rewind targets, the rewind floor and the rewind itself

use std::sync::atomic::{AtomicU32, Ordering};

use lightwallet_params::BlockHeight;

use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::model::RewindResult;
use crate::traits::{CompactBlockCache, DerivedDataRepository, ScanBackend};

/// Extra blocks kept above `lower bound + max reorg` when rewinding
const REWIND_FLOOR_MARGIN: u32 = 2;

/// What to do about one chain error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryPlan {
    /// Height the error was detected at
    pub error_height: BlockHeight,
    /// Height to rewind to
    pub rewind_height: BlockHeight,
    /// Consecutive errors including this one
    pub attempt: u32,
    /// The error ceiling is reached; give up after rewinding
    pub exhausted: bool,
}

/// Tracks consecutive chain errors and computes safe rewind targets
#[derive(Debug)]
pub struct ReorgRecovery {
    lower_bound: BlockHeight,
    rewind_distance: u32,
    max_reorg_size: u32,
    max_consecutive_errors: u32,
    consecutive_errors: AtomicU32,
}

impl ReorgRecovery {
    /// Recovery bounded below by `lower_bound`
    pub fn new(lower_bound: BlockHeight, config: &SyncConfig) -> Self {
        Self {
            lower_bound,
            rewind_distance: config.rewind_distance,
            max_reorg_size: config.max_reorg_size,
            max_consecutive_errors: config.max_consecutive_errors,
            consecutive_errors: AtomicU32::new(0),
        }
    }

    /// Lowest height the processor ever rewinds to
    pub fn lower_bound(&self) -> BlockHeight {
        self.lower_bound
    }

    /// Rewind target for an error at `error_height` after `prior_errors`
    /// consecutive errors. Steps back further with every error, never more
    /// than the max reorg size and never below the lower bound.
    pub fn determine_lower_bound(&self, error_height: BlockHeight, prior_errors: u32) -> BlockHeight {
        let steps = prior_errors.saturating_add(1);
        let offset = self
            .rewind_distance
            .saturating_mul(steps)
            .min(self.max_reorg_size);
        error_height.saturating_sub(offset).max(self.lower_bound)
    }

    /// Count an error at `error_height` and plan the rewind
    pub fn plan(&self, error_height: BlockHeight) -> RecoveryPlan {
        let prior = self.consecutive_errors.fetch_add(1, Ordering::AcqRel);
        let attempt = prior.saturating_add(1);
        RecoveryPlan {
            error_height,
            rewind_height: self.determine_lower_bound(error_height, prior),
            attempt,
            exhausted: attempt >= self.max_consecutive_errors,
        }
    }

    /// Consecutive errors since the last success
    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors.load(Ordering::Acquire)
    }

    /// Forget earlier errors
    pub fn reset(&self) {
        self.consecutive_errors.store(0, Ordering::Release);
    }

    /// Lowest height a manual rewind may target
    pub fn rewind_floor(&self) -> BlockHeight {
        self.lower_bound
            .saturating_add(self.max_reorg_size)
            .saturating_add(REWIND_FLOOR_MARGIN)
    }

    /// `Some(floor)` when `height` lies below the rewind floor
    pub fn clamp_to_floor(&self, height: BlockHeight) -> Option<BlockHeight> {
        let floor = self.rewind_floor();
        (height < floor).then_some(floor)
    }

    /// Nearest valid rewind height for `height`, never below the floor
    pub async fn nearest_rewind_height(
        &self,
        backend: &dyn ScanBackend,
        height: BlockHeight,
    ) -> Result<BlockHeight> {
        if let Some(floor) = self.clamp_to_floor(height) {
            return Ok(floor);
        }
        let nearest = backend
            .nearest_rewind_height(height.saturating_sub(1))
            .await
            .map_err(Error::Backend)?;
        Ok(nearest.max(self.rewind_floor()))
    }

    /// Rewind backend and cache to `target`.
    ///
    /// Skipped (returns `None`) unless `target` is below the last scanned
    /// height. A backend that refuses the target is retried once at the safe
    /// height it proposes.
    pub async fn rewind(
        &self,
        backend: &dyn ScanBackend,
        cache: &dyn CompactBlockCache,
        repository: &dyn DerivedDataRepository,
        target: BlockHeight,
    ) -> Result<Option<BlockHeight>> {
        let last_local = repository
            .last_scanned_height()
            .await
            .map_err(Error::Repository)?;
        match last_local {
            Some(local) if target < local => {}
            _ => {
                tracing::debug!(
                    "Not rewinding to {}: at or above last scanned height {:?}",
                    target,
                    last_local
                );
                return Ok(None);
            }
        }

        let mut requested = target;
        let mut retried = false;
        loop {
            match backend
                .rewind_to_height(requested)
                .await
                .map_err(Error::Backend)?
            {
                RewindResult::Success(height) => {
                    cache.rewind_to_height(height).await.map_err(Error::Cache)?;
                    tracing::info!("Rewound to height {} (requested {})", height, target);
                    return Ok(Some(height));
                }
                RewindResult::Invalid {
                    safe_rewind_height: Some(safe),
                    ..
                } if !retried => {
                    tracing::warn!(
                        "Rewind to {} rejected, retrying at safe height {}",
                        requested,
                        safe
                    );
                    requested = safe;
                    retried = true;
                }
                RewindResult::Invalid { requested, .. } => {
                    return Err(Error::Backend(anyhow::anyhow!(
                        "backend refused to rewind to {}",
                        requested
                    )));
                }
            }
        }
    }
}
