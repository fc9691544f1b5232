//! In-flight noise event (spec.md §3 "Noise Event"), produced by the
//! (out-of-scope) detector and consumed by the fan-out engine (C8).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoiseEvent {
    pub source_device_id: String,
    pub monitor_display_name: String,
    /// 0–100.
    pub peak_level: u8,
    pub timestamp_ms: i64,
}
