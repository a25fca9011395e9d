// =============================================================================
// CompressionTransform — truncate oversized depth snapshots
// =============================================================================
//
// Depth messages past the level threshold are cut down to the top of book on
// each side. Input sides are assumed already ordered (bids descending, asks
// ascending), so truncation keeps the best levels. Non-depth messages pass
// through unchanged.
// =============================================================================

use std::time::Instant;

use serde_json::json;

use super::{Transform, TransformCounters, TransformStats};
use crate::error::FlowError;
use crate::model::{meta, MarketMessage, MessagePayload};

pub struct CompressionTransform {
    /// Total levels (bids + asks) above which compression triggers.
    threshold: usize,
    /// Levels retained per side after truncation.
    keep_per_side: usize,
    counters: TransformCounters,
}

impl CompressionTransform {
    pub fn new(threshold: usize, keep_per_side: usize) -> Self {
        Self {
            threshold,
            keep_per_side,
            counters: TransformCounters::default(),
        }
    }
}

impl Default for CompressionTransform {
    fn default() -> Self {
        Self::new(200, 50)
    }
}

impl Transform for CompressionTransform {
    fn name(&self) -> &'static str {
        "compression"
    }

    fn apply(&self, mut msg: MarketMessage) -> Result<MarketMessage, FlowError> {
        let started = Instant::now();

        if let MessagePayload::Depth(depth) = &mut msg.data {
            if depth.level_count() > self.threshold {
                let original_bids = depth.bids.len();
                let original_asks = depth.asks.len();

                depth.bids.truncate(self.keep_per_side);
                depth.asks.truncate(self.keep_per_side);

                let kept = depth.level_count();
                msg.set_meta(
                    meta::ORIGINAL_SIZE,
                    json!({"bids": original_bids, "asks": original_asks}),
                );
                msg.set_meta(meta::COMPRESSED, json!(true));
                msg.set_meta(
                    meta::COMPRESSION_RATIO,
                    json!(kept as f64 / (original_bids + original_asks) as f64),
                );
            }
        }

        self.counters.record_ok(started);
        Ok(msg)
    }

    fn stats(&self) -> TransformStats {
        self.counters.snapshot("compression")
    }
}
