// =============================================================================
// Shared types used across the strategy runner
// =============================================================================

use serde::{Deserialize, Serialize};

/// Direction of a position or signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// +1 for long, -1 for short. Multiplies a price move into P&L.
    pub fn sign(self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }

    /// Exchange order side that opens a position in this direction.
    pub fn entry_order_side(self) -> &'static str {
        match self {
            Self::Long => "BUY",
            Self::Short => "SELL",
        }
    }

    /// Exchange order side that closes a position in this direction.
    pub fn exit_order_side(self) -> &'static str {
        match self {
            Self::Long => "SELL",
            Self::Short => "BUY",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "long"),
            Self::Short => write!(f, "short"),
        }
    }
}

/// Why a trade was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    EndOfData,
    /// Live only: the instance was stopped while a position was open.
    InstanceStopped,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StopLoss => write!(f, "STOP_LOSS"),
            Self::TakeProfit => write!(f, "TAKE_PROFIT"),
            Self::EndOfData => write!(f, "END_OF_DATA"),
            Self::InstanceStopped => write!(f, "INSTANCE_STOPPED"),
        }
    }
}

/// Identity of a running strategy instance: one per (symbol, strategy,
/// timeframe).
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct InstanceKey {
    pub symbol: String,
    pub strategy: String,
    pub timeframe: String,
}

impl InstanceKey {
    pub fn new(
        symbol: impl Into<String>,
        strategy: impl Into<String>,
        timeframe: impl Into<String>,
    ) -> Self {
        Self {
            symbol: symbol.into().to_uppercase(),
            strategy: strategy.into().to_lowercase(),
            timeframe: timeframe.into(),
        }
    }
}

impl std::fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}@{}", self.symbol, self.strategy, self.timeframe)
    }
}

/// Lifecycle of a strategy instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "STARTING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Stopping => write!(f, "STOPPING"),
            Self::Stopped => write!(f, "STOPPED"),
        }
    }
}

/// Whether orders go to the exchange or are filled locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionMode {
    Paper,
    Live,
}

impl Default for ExecutionMode {
    fn default() -> Self {
        Self::Paper
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Paper => write!(f, "Paper"),
            Self::Live => write!(f, "Live"),
        }
    }
}

/// Current UNIX time in milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
