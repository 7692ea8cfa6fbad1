//! Runtime-configurable tuning parameters for canopy.
//!
//! All values have sensible defaults. Override via environment variables
//! (prefixed `CANOPY_`) or by constructing a custom `CanopyConfig`.

use crate::types::ReduceMode;

/// Tuning parameters for the summation drivers.
#[derive(Debug, Clone)]
pub struct CanopyConfig {
    /// How the final sum is distributed after the reduction.
    pub reduce_mode: ReduceMode,

    /// Maximum number of (index, value) entries coalesced into one
    /// message-buffer send.
    pub max_message_length: usize,

    /// Single-tree driver: subtrees larger than this flush the outbox
    /// before evaluation, so peers waiting on earlier results are not
    /// stalled behind a long local computation.
    pub flush_threshold: u64,
}

impl Default for CanopyConfig {
    fn default() -> Self {
        Self {
            reduce_mode: ReduceMode::ReduceBroadcast,
            max_message_length: 256,
            flush_threshold: 16,
        }
    }
}

impl CanopyConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `CANOPY_REDUCE_MODE` (`bcast` or `reduce`)
    /// - `CANOPY_MAX_MESSAGE_LENGTH`
    /// - `CANOPY_FLUSH_THRESHOLD`
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("CANOPY_REDUCE_MODE") {
            match v.as_str() {
                "bcast" => cfg.reduce_mode = ReduceMode::ReduceBroadcast,
                "reduce" => cfg.reduce_mode = ReduceMode::ReduceOnly,
                other => tracing::warn!("unknown CANOPY_REDUCE_MODE {other:?}, keeping default"),
            }
        }
        if let Ok(v) = std::env::var("CANOPY_MAX_MESSAGE_LENGTH") {
            if let Ok(n) = v.parse::<usize>() {
                if n > 0 {
                    cfg.max_message_length = n;
                }
            }
        }
        if let Ok(v) = std::env::var("CANOPY_FLUSH_THRESHOLD") {
            if let Ok(n) = v.parse::<u64>() {
                cfg.flush_threshold = n;
            }
        }

        cfg
    }
}
