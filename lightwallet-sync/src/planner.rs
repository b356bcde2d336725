//! Range planning: overall range, verification check and batch partitioning

use lightwallet_params::BlockHeight;

use crate::model::{BlockBatch, BlockRange, ScanPriority, ScanRange};
use crate::outcome::VerifyDecision;

/// Envelope of all suggested ranges; `None` when there is nothing to scan.
pub fn overall_range(ranges: &[ScanRange]) -> Option<BlockRange> {
    ranges
        .iter()
        .map(|scan_range| scan_range.range)
        .reduce(|acc, range| acc.union(&range))
}

/// Ranges arrive priority-sorted, so only the first can demand verification.
pub fn classify_verification(ranges: &[ScanRange]) -> VerifyDecision {
    match ranges.first() {
        Some(first) if first.priority == ScanPriority::Verify => {
            VerifyDecision::ShouldVerify(first.range)
        }
        _ => VerifyDecision::NoVerify,
    }
}

/// Split `range` into batches of at most `batch_size` blocks.
///
/// `order` runs 1..=N within the range; `cross_ranges_order` continues from
/// `running_global_index`.
pub fn partition_into_batches(
    range: BlockRange,
    batch_size: u32,
    running_global_index: u64,
) -> Vec<BlockBatch> {
    let batch_size = batch_size.max(1);
    let mut batches = Vec::with_capacity(batches_in(range, batch_size) as usize);
    let mut start = range.start;
    let mut order = 0u64;

    while !range.is_empty() && start <= range.end {
        order += 1;
        let end = start
            .checked_add(batch_size - 1)
            .map_or(range.end, |end| end.min(range.end));
        batches.push(BlockBatch {
            order,
            cross_ranges_order: running_global_index + order,
            range: BlockRange::new(start, end),
            blocks: None,
        });
        match end.checked_add(1) {
            Some(next) => start = next,
            None => break,
        }
    }

    batches
}

/// Number of batches the ranges split into
pub fn batch_count(ranges: &[ScanRange], batch_size: u32) -> u64 {
    let batch_size = batch_size.max(1);
    ranges
        .iter()
        .map(|scan_range| batches_in(scan_range.range, batch_size))
        .sum()
}

fn batches_in(range: BlockRange, batch_size: u32) -> u64 {
    range.len().div_ceil(u64::from(batch_size))
}

/// Fraction of a pass completed once `global_order` batches are scanned.
pub fn progress(global_order: u64, batch_count: u64) -> f64 {
    if batch_count == 0 {
        return 0.0;
    }
    global_order.min(batch_count) as f64 / batch_count as f64
}

/// `max(activation, minimum - max_reorg_size)`
pub fn lower_bound_height(
    activation: BlockHeight,
    minimum_height: BlockHeight,
    max_reorg_size: u32,
) -> BlockHeight {
    activation.max(minimum_height.saturating_sub(max_reorg_size))
}

/// Birthday estimate from the oldest mined wallet transaction.
///
/// Rounds down to a `max_reorg_size` boundary; never below `lower_bound`.
pub fn birthday_height(
    oldest_mined: Option<BlockHeight>,
    lower_bound: BlockHeight,
    max_reorg_size: u32,
) -> BlockHeight {
    let Some(oldest) = oldest_mined else {
        return lower_bound;
    };
    let step = max_reorg_size.max(1);
    let rounded = oldest.saturating_sub(oldest.value() % step);
    rounded.max(lower_bound)
}
