// =============================================================================
// Request-weight tracker for the futures REST API
// =============================================================================
//
// Binance reports the weight used in the current minute in the
// `X-MBX-USED-WEIGHT-1M` response header. The tracker keeps the latest value
// and refuses requests that would cross our own ceiling, which sits below the
// exchange's 2400/min hard limit.
// =============================================================================

use std::sync::atomic::{AtomicU32, Ordering};

use tracing::{debug, warn};

const USED_WEIGHT_HEADER: &str = "X-MBX-USED-WEIGHT-1M";

/// Weight at which requests are refused.
const WEIGHT_HARD_LIMIT: u32 = 2000;
const WEIGHT_WARN_THRESHOLD: u32 = 1600;

#[derive(Default)]
pub struct WeightTracker {
    used_weight_1m: AtomicU32,
}

impl WeightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_from_headers(&self, headers: &reqwest::header::HeaderMap) {
        let Some(weight) = headers
            .get(USED_WEIGHT_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u32>().ok())
        else {
            return;
        };
        self.record(weight);
    }

    fn record(&self, weight: u32) {
        let prev = self.used_weight_1m.swap(weight, Ordering::Relaxed);
        if weight >= WEIGHT_WARN_THRESHOLD && prev < WEIGHT_WARN_THRESHOLD {
            warn!(
                used_weight = weight,
                hard_limit = WEIGHT_HARD_LIMIT,
                "request weight crossed warning threshold"
            );
        }
        debug!(used_weight_1m = weight, "request weight updated");
    }

    /// Whether `weight` more can be spent this minute.
    pub fn can_send(&self, weight: u32) -> bool {
        let current = self.used_weight_1m.load(Ordering::Relaxed);
        let allowed = current.saturating_add(weight) <= WEIGHT_HARD_LIMIT;
        if !allowed {
            warn!(
                current_weight = current,
                requested_weight = weight,
                hard_limit = WEIGHT_HARD_LIMIT,
                "request blocked: would exceed weight limit"
            );
        }
        allowed
    }

    pub fn used_weight(&self) -> u32 {
        self.used_weight_1m.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for WeightTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeightTracker")
            .field("used_weight_1m", &self.used_weight())
            .finish()
    }
}
