// =============================================================================
// Backtest Module
// =============================================================================
//
// Annotated series -> closed trades -> metrics:
// - Single-position trade book shared with live instances (book)
// - Bar-by-bar state machine (engine)
// - Post-hoc performance metrics (metrics)
// - Request resolution and the end-to-end runner (report)

pub mod book;
pub mod engine;
pub mod metrics;
pub mod report;

pub use book::{EntryPlan, Position, TradeBook, TradeRecord};
pub use engine::{run, BacktestOutcome};
pub use metrics::BacktestMetrics;
pub use report::{resolve_range, run_backtest, BacktestReport, BacktestRequest};
