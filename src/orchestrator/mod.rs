// =============================================================================
// Orchestrator - control surface for live instances and backtests
// =============================================================================
//
// One dedicated thread per (symbol, strategy, timeframe). `start` registers
// the instance before its thread has seeded anything; `stop` cancels it and
// blocks until the thread has unwound and closed its live subscription.
// =============================================================================

pub mod instance;
pub mod registry;

use std::sync::Arc;

use tracing::{info, warn};

use crate::backtest::{run_backtest, BacktestReport, BacktestRequest};
use crate::broadcast::BroadcastSink;
use crate::candle_cache::CandleCache;
use crate::error::ControlError;
use crate::execution::ExecutionProvider;
use crate::market_data::is_supported_interval;
use crate::provider::MarketDataProvider;
use crate::runtime_config::{OrchestratorSettings, StrategyParams};
use crate::strategy::StrategyKind;
use crate::types::InstanceKey;

pub use instance::InstanceDeps;
pub use registry::{InstanceRegistry, InstanceStatus};

pub struct Orchestrator {
    registry: InstanceRegistry,
    deps: InstanceDeps,
    default_params: StrategyParams,
}

impl Orchestrator {
    pub fn new(
        cache: Arc<CandleCache>,
        provider: Arc<dyn MarketDataProvider>,
        execution: Arc<dyn ExecutionProvider>,
        sink: Arc<dyn BroadcastSink>,
        settings: OrchestratorSettings,
        default_params: StrategyParams,
    ) -> Self {
        Self {
            registry: InstanceRegistry::new(),
            deps: InstanceDeps {
                cache,
                provider,
                execution,
                sink,
                settings,
            },
            default_params,
        }
    }

    /// Start an instance. `params` falls back to the configured defaults and
    /// is fixed for the instance's lifetime.
    pub fn start(
        &self,
        symbol: &str,
        strategy: &str,
        timeframe: &str,
        params: Option<StrategyParams>,
    ) -> Result<InstanceKey, ControlError> {
        let kind = StrategyKind::from_name(strategy)?;
        let params = params.unwrap_or_else(|| self.default_params.clone());
        params
            .validate()
            .map_err(|e| ControlError::InvalidRequest(e.to_string()))?;
        if !is_supported_interval(timeframe) {
            return Err(ControlError::InvalidRequest(format!("unsupported timeframe: {timeframe:?}")));
        }

        let key = InstanceKey::new(symbol, kind.name(), timeframe);
        let deps = self.deps.clone();
        let thread_key = key.clone();
        self.registry.register(key.clone(), move |handle| {
            std::thread::Builder::new()
                .name(format!("strategy-{thread_key}"))
                .spawn(move || instance::run_on_thread(thread_key, params, deps, handle))
        })?;

        info!(instance = %key, "instance started");
        Ok(key)
    }

    /// Stop an instance and wait for it to unwind.
    pub async fn stop(&self, symbol: &str, strategy: &str, timeframe: &str) -> Result<(), ControlError> {
        let key = match StrategyKind::from_name(strategy) {
            Ok(kind) => InstanceKey::new(symbol, kind.name(), timeframe),
            Err(_) => return Err(ControlError::NotRunning(InstanceKey::new(symbol, strategy, timeframe))),
        };
        self.stop_key(&key).await
    }

    pub async fn stop_key(&self, key: &InstanceKey) -> Result<(), ControlError> {
        let thread = self.registry.begin_stop(key)?;
        info!(instance = %key, "stopping instance");

        if let Some(thread) = thread {
            match tokio::task::spawn_blocking(move || thread.join()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => warn!(instance = %key, "instance thread panicked"),
                Err(e) => warn!(instance = %key, error = %e, "failed to join instance thread"),
            }
        }

        self.registry.remove(key);
        info!(instance = %key, "instance stopped");
        Ok(())
    }

    /// Stop every registered instance. Used on shutdown.
    pub async fn stop_all(&self) {
        for key in self.registry.keys() {
            if let Err(e) = self.stop_key(&key).await {
                warn!(instance = %key, error = %e, "stop during shutdown failed");
            }
        }
    }

    pub fn status(&self, key: &InstanceKey) -> Option<InstanceStatus> {
        self.registry.status(key)
    }

    pub fn active_instances(&self) -> Vec<InstanceStatus> {
        self.registry.list()
    }

    pub async fn run_backtest(&self, request: &BacktestRequest) -> Result<BacktestReport, ControlError> {
        run_backtest(&self.deps.cache, request, &self.default_params).await
    }
}
