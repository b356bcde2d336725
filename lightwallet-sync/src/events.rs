//! Structured logging for sync observability
//!
//! Noteworthy processor events are logged with structured fields and kept in
//! a bounded in-memory log the wallet can show or export.

use std::collections::VecDeque;

use lightwallet_params::BlockHeight;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::model::BlockRange;

/// Sync event
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    /// A processing pass planned work
    PassStarted {
        /// Envelope of the planned ranges
        range: BlockRange,
        /// Batches in the pass
        batches: u64,
        /// RFC 3339 timestamp
        timestamp: String,
    },
    /// A batch was scanned
    BatchScanned {
        /// Batch position across the pass
        order: u64,
        /// Heights scanned
        range: BlockRange,
    },
    /// Cached block files could not be removed
    CacheCleanupFailed {
        /// Anchor height, if any
        height: Option<BlockHeight>,
        /// Cause
        error: String,
    },
    /// A transaction could not be enhanced
    EnhanceFailed {
        /// Anchor height, if any
        height: Option<BlockHeight>,
        /// Cause
        error: String,
    },
    /// A chain continuity error was handled
    ChainError {
        /// Height the error was detected at
        error_height: BlockHeight,
        /// Height chosen to rewind to
        rewind_height: BlockHeight,
        /// Consecutive chain errors so far
        attempt: u32,
    },
    /// Local state was rewound
    Rewound {
        /// New local tip
        height: BlockHeight,
    },
    /// Birthday height moved up
    BirthdayUpdated {
        /// New birthday height
        height: BlockHeight,
    },
    /// The processor gave up
    Fatal {
        /// Cause
        error: String,
    },
}

/// Bounded sync event log
#[derive(Debug)]
pub struct SyncEventLog {
    events: VecDeque<SyncEvent>,
    capacity: usize,
}

impl SyncEventLog {
    /// Create a log keeping at most `capacity` events
    pub fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Log an event and keep it
    pub fn record(&mut self, event: SyncEvent) {
        emit(&event);
        if self.capacity == 0 {
            return;
        }
        if self.events.len() == self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    /// Get all retained events, oldest first
    pub fn events(&self) -> Vec<SyncEvent> {
        self.events.iter().cloned().collect()
    }

    /// Retained events as JSON lines for export
    pub fn export_json(&self) -> Vec<String> {
        self.events
            .iter()
            .filter_map(|event| serde_json::to_string(event).ok())
            .collect()
    }

    /// Clear all events
    pub fn clear(&mut self) {
        self.events.clear();
        debug!("Sync event log cleared");
    }
}

fn emit(event: &SyncEvent) {
    match event {
        SyncEvent::PassStarted {
            range,
            batches,
            timestamp,
        } => info!(
            event = "sync_pass_started",
            range = %range,
            batches = %batches,
            timestamp = %timestamp,
            "Sync pass started"
        ),
        SyncEvent::BatchScanned { order, range } => debug!(
            event = "sync_batch_scanned",
            order = %order,
            range = %range,
            "Batch scanned"
        ),
        SyncEvent::CacheCleanupFailed { height, error } => warn!(
            event = "sync_cache_cleanup_failed",
            height = ?height,
            error = %error,
            "Block cache cleanup failed"
        ),
        SyncEvent::EnhanceFailed { height, error } => warn!(
            event = "sync_enhance_failed",
            height = ?height,
            error = %error,
            "Transaction enhancement failed"
        ),
        SyncEvent::ChainError {
            error_height,
            rewind_height,
            attempt,
        } => warn!(
            event = "sync_chain_error",
            error_height = %error_height,
            rewind_height = %rewind_height,
            attempt = %attempt,
            "Chain error detected"
        ),
        SyncEvent::Rewound { height } => info!(
            event = "sync_rewound",
            height = %height,
            "Local state rewound"
        ),
        SyncEvent::BirthdayUpdated { height } => info!(
            event = "sync_birthday_updated",
            height = %height,
            "Birthday height updated"
        ),
        SyncEvent::Fatal { error } => error!(
            event = "sync_fatal",
            error = %error,
            "Sync processor stopped on a fatal error"
        ),
    }
}

/// Initialize logging for the sync processor.
///
/// Honors `RUST_LOG`, defaulting to `info`. Safe to call more than once.
pub fn init_sync_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true);

    let installed = if json {
        builder.json().try_init().is_ok()
    } else {
        builder.try_init().is_ok()
    };

    if installed {
        info!("Sync logging initialized");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn height(value: u32) -> BlockHeight {
        BlockHeight::from_u32(value)
    }

    #[test]
    fn test_event_log_is_bounded() {
        let mut log = SyncEventLog::new(2);
        for h in [10, 20, 30] {
            log.record(SyncEvent::Rewound { height: height(h) });
        }
        assert_eq!(
            log.events(),
            vec![
                SyncEvent::Rewound { height: height(20) },
                SyncEvent::Rewound { height: height(30) },
            ]
        );
    }

    #[test]
    fn test_export_json() {
        let mut log = SyncEventLog::new(8);
        log.record(SyncEvent::ChainError {
            error_height: height(150),
            rewind_height: height(140),
            attempt: 1,
        });
        let lines = log.export_json();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains(r#""event":"chain_error""#));
        assert!(lines[0].contains(r#""rewind_height":140"#));
    }

    #[test]
    fn test_log_clear() {
        let mut log = SyncEventLog::new(8);
        log.record(SyncEvent::Fatal {
            error: "boom".into(),
        });
        log.clear();
        assert!(log.events().is_empty());
    }

    #[test]
    fn test_zero_capacity_keeps_nothing() {
        let mut log = SyncEventLog::new(0);
        log.record(SyncEvent::BirthdayUpdated { height: height(5) });
        assert!(log.events().is_empty());
    }

    #[test]
    fn test_init_logging_twice() {
        init_sync_logging(false);
        init_sync_logging(true);
    }
}
