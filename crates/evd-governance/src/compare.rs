//! Seam to the external backtest comparator used by drift contribution
//! checks. The core only needs the return deltas and a couple of
//! diagnostics; the engine itself lives outside this workspace.

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContributionCompareRequest {
    pub symbol: String,
    pub strategy_name: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub event_lookback_days: i64,
    pub event_decay_half_life_days: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContributionCompareOutcome {
    pub total_return_delta: f64,
    pub sharpe_delta: f64,
    pub event_row_ratio: f64,
    pub events_loaded: i64,
}

/// With-events vs. without-events backtest comparison over one window.
/// Implementations must be safe to call from the monitor task.
#[async_trait]
pub trait ContributionComparator: Send + Sync {
    async fn compare(&self, req: &ContributionCompareRequest) -> Result<ContributionCompareOutcome>;
}
