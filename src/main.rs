// =============================================================================
// Strategy Runner - Main Entry Point
// =============================================================================
//
// Orders are filled locally unless the config selects Live execution, which
// additionally requires BINANCE_API_KEY / BINANCE_API_SECRET.
// =============================================================================

use std::sync::Arc;

use anyhow::{bail, Context};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use strategy_runner::binance::BinanceClient;
use strategy_runner::broadcast::Broadcaster;
use strategy_runner::execution::{ExecutionProvider, PaperExecution};
use strategy_runner::runtime_config::RuntimeConfig;
use strategy_runner::store::SqliteCandleStore;
use strategy_runner::types::ExecutionMode;
use strategy_runner::{api, CandleCache, Orchestrator};

const DEFAULT_CONFIG_PATH: &str = "runtime_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Strategy Runner starting up");

    let config_path =
        std::env::var("RUNNER_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let mut config = RuntimeConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });
    config.apply_env_overrides();
    config
        .strategy_params
        .validate()
        .context("invalid default strategy_params")?;

    info!(
        execution_mode = %config.execution_mode,
        database = %config.database_path,
        rest = %config.rest_base_url,
        "Configuration resolved"
    );

    // ── 2. Storage & exchange client ─────────────────────────────────────
    let store = Arc::new(SqliteCandleStore::open(&config.database_path)?);

    let api_key = std::env::var("BINANCE_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("BINANCE_API_SECRET").unwrap_or_default();
    let live_credentials = !api_key.is_empty() && !api_secret.is_empty();
    let binance = Arc::new(BinanceClient::new(
        api_key,
        api_secret,
        config.rest_base_url.clone(),
        config.ws_base_url.clone(),
    )?);

    let execution: Arc<dyn ExecutionProvider> = match config.execution_mode {
        ExecutionMode::Paper => Arc::new(PaperExecution::new()),
        ExecutionMode::Live if live_credentials => binance.clone(),
        ExecutionMode::Live => {
            bail!("Live execution requires BINANCE_API_KEY and BINANCE_API_SECRET")
        }
    };

    // ── 3. Cache, broadcaster, orchestrator ──────────────────────────────
    let cache = Arc::new(CandleCache::new(store, binance.clone(), config.cache.clone()));
    let broadcaster = Arc::new(Broadcaster::new());
    let orchestrator = Arc::new(Orchestrator::new(
        cache,
        binance,
        execution,
        broadcaster.clone(),
        config.orchestrator.clone(),
        config.strategy_params.clone(),
    ));

    for spec in &config.autostart {
        match orchestrator.start(&spec.symbol, &spec.strategy, &spec.timeframe, spec.params.clone()) {
            Ok(key) => info!(instance = %key, "Autostarted instance"),
            Err(e) => error!(symbol = %spec.symbol, strategy = %spec.strategy, error = %e, "Autostart failed"),
        }
    }

    // ── 4. Broadcast feed ────────────────────────────────────────────────
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "Broadcast feed listening on /ws");

    let app = api::router(broadcaster);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "Broadcast feed server failed");
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 5. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received, stopping instances");

    orchestrator.stop_all().await;

    if let Err(e) = config.save(&config_path) {
        error!(error = %e, "Failed to save runtime config on shutdown");
    }

    info!("Strategy Runner shut down complete.");
    Ok(())
}
