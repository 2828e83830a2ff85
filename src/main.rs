// =============================================================================
// Copy-Trading Engine — Main Entry Point
// =============================================================================
//
// Loads the engine config, wires up the demo broker gateway, mapping store,
// and operator I/O sink, then starts every enabled route's pipeline under
// the Route Supervisor alongside the reconciliation scheduler, the
// daily-rollover scheduler, the connection-health poller, and the HTTP
// operator surface.
// =============================================================================

mod api;
mod app_state;
mod broker_gateway;
mod config;
mod copy_pipeline;
mod domain;
mod filter_chain;
mod mapping_store;
mod operator_io;
mod reconcile;
mod risk;
mod route_supervisor;
mod sizing;
mod types;

use std::sync::Arc;
use std::time::Duration;

use chrono::{Timelike, Utc};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::broker_gateway::{BrokerGateway, DemoGateway, SharedGateway};
use crate::config::EngineConfig;
use crate::mapping_store::MappingStore;
use crate::operator_io::OperatorIo;
use crate::types::AccountRef;

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("copy-trading engine starting up");

    // ── 1. Configuration ──────────────────────────────────────────────────
    let data_dir = env_or("DATA_DIR", "data");
    std::fs::create_dir_all(&data_dir).ok();
    let config_path = std::path::PathBuf::from(&data_dir).join("engine_config.json");

    let config = EngineConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load engine config, starting from defaults");
        EngineConfig::default()
    });

    info!(
        routes = config.routes.len(),
        rule_sets = config.rule_sets.len(),
        accounts = config.accounts.len(),
        "engine config ready"
    );

    // ── 2. Broker gateway (demo/paper backend) ─────────────────────────────
    let default_region = env_or("BROKER_DEFAULT_REGION", "demo");
    let _broker_token = std::env::var("BROKER_API_TOKEN").unwrap_or_default();

    let gateway = DemoGateway::new();
    for (account_id, account_config) in &config.accounts {
        let account = AccountRef {
            account_id: account_id.clone(),
            region: if account_config.region.is_empty() {
                default_region.clone()
            } else {
                account_config.region.clone()
            },
        };
        gateway.seed_account(account, account_config.reference_balance);
    }
    let gateway: SharedGateway = Arc::new(gateway);

    // ── 3. Mapping store ─────────────────────────────────────────────────
    let mapping_log_path = std::path::PathBuf::from(&data_dir).join("mappings.ndjson");
    let mapping_store = Arc::new(MappingStore::open(&mapping_log_path)?);

    // ── 4. Operator I/O ──────────────────────────────────────────────────
    let webhook_url = std::env::var("CHAT_WEBHOOK_URL").ok().filter(|s| !s.is_empty());
    let operator_io = Arc::new(OperatorIo::new(webhook_url));

    // ── 5. Application state / route supervisor ────────────────────────────
    let state = AppState::new(config, config_path, gateway, mapping_store, operator_io);
    state.supervisor.start_all();
    let _reload_task = state.supervisor.watch_config_reloads();

    // ── 6. Reconciliation scheduler ─────────────────────────────────────────
    // Reuses the same AppState::list_orphans path the `/orphans/list`
    // endpoint calls, so scheduled and on-demand scans share one alert
    // suppression table and never double-report an orphan within the
    // throttle window.
    {
        let state = state.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(state.reconcile_interval_secs().max(1)));
            loop {
                interval.tick().await;
                for route in state.supervisor.snapshot_routes() {
                    state.list_orphans(Some(&route.0.id)).await;
                }
            }
        });
    }

    // ── 7. Daily rollover scheduler ─────────────────────────────────────────
    {
        let state = state.clone();
        tokio::spawn(async move {
            loop {
                let now = Utc::now();
                let target_hour = state.rollover_utc_hour();
                let mut next = now
                    .date_naive()
                    .and_hms_opt(target_hour.min(23), 0, 0)
                    .unwrap()
                    .and_utc();
                if next <= now {
                    next += chrono::Duration::days(1);
                }
                let sleep_secs = (next - now).num_seconds().max(1) as u64;
                tokio::time::sleep(Duration::from_secs(sleep_secs)).await;

                let now = Utc::now();
                info!(hour = now.hour(), "running daily rollover across all routes");
                state.supervisor.daily_rollover_all(now);
            }
        });
    }

    // ── 8. Connection-health poller ─────────────────────────────────────────
    {
        let state = state.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                interval.tick().await;
                state.poll_connection_health().await;
            }
        });
    }

    // ── 9. HTTP operator surface ─────────────────────────────────────────────
    let bind_addr = env_or("HTTP_BIND_ADDR", "0.0.0.0:3001");
    {
        let state = state.clone();
        let bind_addr = bind_addr.clone();
        tokio::spawn(async move {
            let app = api::rest::router(state);
            let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
                Ok(listener) => listener,
                Err(e) => {
                    error!(addr = %bind_addr, error = %e, "failed to bind HTTP operator surface");
                    return;
                }
            };
            info!(addr = %bind_addr, "HTTP operator surface listening");
            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "HTTP server terminated");
            }
        });
    }

    info!("all subsystems running, press Ctrl+C to stop");

    // ── 10. Graceful shutdown ───────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, stopping routes");
    state.supervisor.shutdown().await;

    let shutdown_config_path = std::path::PathBuf::from(&data_dir).join("engine_config.json");
    if let Err(e) = state.config_snapshot().save(&shutdown_config_path) {
        error!(error = %e, "failed to save engine config on shutdown");
    }

    info!("copy-trading engine shut down complete");
    Ok(())
}
