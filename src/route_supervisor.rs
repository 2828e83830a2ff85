// =============================================================================
// Route Supervisor — route lifecycle, config reload, failure isolation
// =============================================================================
//
// Owns one `CopyPipeline` task per enabled route. Diffs incoming config
// reloads against the running set (stop removed/disabled, start
// added/enabled, restart changed) and restarts a crashed pipeline task with
// an exponential backoff schedule (1s, 2s, 4s, capped at 60s), the same
// `tokio::spawn` reconnect-with-backoff shape used for stream reconnects
// elsewhere in the engine, generalized to per-route supervision plus config
// diffing.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::broker_gateway::SharedGateway;
use crate::config::{EngineConfig, RuleSet};
use crate::copy_pipeline::{CopyPipeline, PipelineRoute, PipelineState};
use crate::domain::Route;
use crate::mapping_store::MappingStore;
use crate::operator_io::OperatorIo;
use crate::risk::RiskState;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Everything the supervisor needs to remember about one running route, used
/// both to drive the pipeline's lifecycle and to detect config drift on
/// reload.
struct RouteRuntime {
    route: Route,
    rule_set: RuleSet,
    risk_state: Arc<RiskState>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
    pipeline_slot: Arc<RwLock<Option<Arc<CopyPipeline>>>>,
}

/// Snapshot of one route's health, consumed by the `/routes` and
/// `/routes/stats` HTTP handlers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteStatus {
    pub route_id: String,
    pub route_name: String,
    pub enabled: bool,
    pub pipeline_state: String,
    pub risk: crate::risk::RiskView,
}

pub struct RouteSupervisor {
    gateway: SharedGateway,
    mapping_store: Arc<MappingStore>,
    operator_io: Arc<OperatorIo>,
    config: watch::Receiver<EngineConfig>,
    runtimes: RwLock<HashMap<String, RouteRuntime>>,
}

impl RouteSupervisor {
    pub fn new(
        gateway: SharedGateway,
        mapping_store: Arc<MappingStore>,
        operator_io: Arc<OperatorIo>,
        config: watch::Receiver<EngineConfig>,
    ) -> Self {
        Self {
            gateway,
            mapping_store,
            operator_io,
            config,
            runtimes: RwLock::new(HashMap::new()),
        }
    }

    /// Start every enabled route in the current config. Call once at
    /// startup before `watch_config_reloads`.
    pub fn start_all(self: &Arc<Self>) {
        let config = self.config.borrow().clone();
        for route in &config.routes {
            if !route.enabled {
                continue;
            }
            let Some(rule_set) = config.rule_set_for(route) else {
                warn!(route_id = %route.id, rule_set = %route.rule_set, "route references unknown rule set, skipping");
                continue;
            };
            self.spawn_route(route.clone(), rule_set.clone());
        }
    }

    /// Spawn a background task that watches the config-reload channel and
    /// diffs each new revision against the running set.
    pub fn watch_config_reloads(self: &Arc<Self>) -> JoinHandle<()> {
        let supervisor = self.clone();
        let mut rx = self.config.clone();
        tokio::spawn(async move {
            loop {
                if rx.changed().await.is_err() {
                    break;
                }
                let new_config = rx.borrow().clone();
                supervisor.reconcile_config(&new_config);
            }
        })
    }

    /// Apply a new config revision: stop routes that were removed or
    /// disabled, start routes that are new or newly enabled, and restart
    /// routes whose source/destination/rule-set changed.
    fn reconcile_config(self: &Arc<Self>, new_config: &EngineConfig) {
        let mut to_stop = Vec::new();
        let mut to_restart = Vec::new();
        {
            let runtimes = self.runtimes.read();
            for (route_id, runtime) in runtimes.iter() {
                match new_config.routes.iter().find(|r| &r.id == route_id) {
                    None => to_stop.push(route_id.clone()),
                    Some(route) if !route.enabled => to_stop.push(route_id.clone()),
                    Some(route) => {
                        let rule_set = new_config.rule_set_for(route);
                        let changed = route.source != runtime.route.source
                            || route.destination != runtime.route.destination
                            || route.rule_set != runtime.route.rule_set
                            || rule_set
                                .map(|rs| !rule_set_eq(rs, &runtime.rule_set))
                                .unwrap_or(true);
                        if changed {
                            to_restart.push(route_id.clone());
                        }
                    }
                }
            }
        }

        for route_id in &to_stop {
            self.stop_route(route_id);
        }
        for route_id in &to_restart {
            self.stop_route(route_id);
        }

        let running: Vec<String> = self.runtimes.read().keys().cloned().collect();
        for route in &new_config.routes {
            if !route.enabled || running.contains(&route.id) {
                continue;
            }
            let Some(rule_set) = new_config.rule_set_for(route) else {
                warn!(route_id = %route.id, "route references unknown rule set on reload, skipping");
                continue;
            };
            self.spawn_route(route.clone(), rule_set.clone());
        }
    }

    fn stop_route(&self, route_id: &str) {
        let runtime = self.runtimes.write().remove(route_id);
        if let Some(runtime) = runtime {
            let _ = runtime.shutdown_tx.send(true);
            runtime.task.abort();
            info!(route_id, "route stopped");
        }
    }

    /// Spawn the supervised task for one route: builds a fresh `RiskState`,
    /// then loops rebuilding and running a `CopyPipeline` until shutdown,
    /// restarting with exponential backoff whenever the pipeline returns
    /// early (stream closed, task panicked).
    fn spawn_route(self: &Arc<Self>, route: Route, rule_set: RuleSet) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let reference_balance = 10_000.0;
        let risk_state = Arc::new(RiskState::new(
            rule_set.risk.clone(),
            rule_set.phases.clone(),
            reference_balance,
            Utc::now(),
        ));

        let pipeline_route = PipelineRoute {
            id: route.id.clone(),
            name: route.name.clone(),
            source: route.source.clone(),
            destination: route.destination.clone(),
        };
        let gateway = self.gateway.clone();
        let mapping_store = self.mapping_store.clone();
        let operator_io = self.operator_io.clone();
        let risk_state_for_task = risk_state.clone();
        let rule_set_for_task = rule_set.clone();
        let route_id = route.id.clone();
        let pipeline_slot: Arc<RwLock<Option<Arc<CopyPipeline>>>> = Arc::new(RwLock::new(None));
        let pipeline_slot_for_task = pipeline_slot.clone();

        let task = tokio::spawn(async move {
            let mut backoff = INITIAL_BACKOFF;
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                let pipeline = Arc::new(CopyPipeline::new(
                    pipeline_route.clone(),
                    rule_set_for_task.clone(),
                    gateway.clone(),
                    mapping_store.clone(),
                    risk_state_for_task.clone(),
                    operator_io.clone(),
                ));
                *pipeline_slot_for_task.write() = Some(pipeline.clone());

                let run_rx = shutdown_rx.clone();
                let handle = tokio::spawn(pipeline.run(run_rx));

                match handle.await {
                    Ok(()) => {}
                    Err(e) => {
                        warn!(route_id = %route_id, error = %e, "pipeline task terminated unexpectedly");
                    }
                }

                if *shutdown_rx.borrow() {
                    break;
                }

                warn!(route_id = %route_id, backoff_secs = backoff.as_secs(), "restarting pipeline after backoff");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        });

        self.runtimes.write().insert(
            route.id.clone(),
            RouteRuntime {
                route,
                rule_set,
                risk_state,
                shutdown_tx,
                task,
                pipeline_slot,
            },
        );
    }

    /// Invoke `RiskState::daily_rollover` on every running route. Intended
    /// to be ticked once per day at `global_settings.rollover_utc_hour`;
    /// `RiskState` also self-heals on a missed tick.
    pub fn daily_rollover_all(&self, now: chrono::DateTime<Utc>) {
        let runtimes = self.runtimes.read();
        for runtime in runtimes.values() {
            runtime.risk_state.daily_rollover(now);
        }
    }

    /// Snapshot every running route's pipeline state and risk view, for the
    /// `GET /routes` and `GET /routes/stats` HTTP handlers.
    pub fn status_all(&self) -> Vec<RouteStatus> {
        let runtimes = self.runtimes.read();
        runtimes
            .values()
            .map(|runtime| RouteStatus {
                route_id: runtime.route.id.clone(),
                route_name: runtime.route.name.clone(),
                enabled: runtime.route.enabled,
                pipeline_state: runtime
                    .pipeline_slot
                    .read()
                    .as_ref()
                    .map(|p| format!("{:?}", p.state()))
                    .unwrap_or_else(|| format!("{:?}", PipelineState::Starting)),
                risk: runtime.risk_state.snapshot(),
            })
            .collect()
    }

    /// The risk state for a single route, used by the reconciler loop and
    /// the orphan-command handlers to resolve a route id to its live state.
    pub fn risk_state_for(&self, route_id: &str) -> Option<Arc<RiskState>> {
        self.runtimes.read().get(route_id).map(|r| r.risk_state.clone())
    }

    /// Every currently-running `(Route, RuleSet)` pair, consumed by the
    /// reconciliation scheduler to iterate all active routes each tick.
    pub fn snapshot_routes(&self) -> Vec<(Route, RuleSet)> {
        self.runtimes
            .read()
            .values()
            .map(|r| (r.route.clone(), r.rule_set.clone()))
            .collect()
    }

    /// Kill the risk state for a route, halting further copying without
    /// tearing down the pipeline task (used by an operator "kill switch").
    pub fn kill_route(&self, route_id: &str) -> bool {
        match self.runtimes.read().get(route_id) {
            Some(runtime) => {
                runtime.risk_state.kill();
                true
            }
            None => false,
        }
    }

    /// Stop and remove every running route (graceful shutdown).
    pub async fn shutdown(&self) {
        let route_ids: Vec<String> = self.runtimes.read().keys().cloned().collect();
        for route_id in route_ids {
            self.stop_route(&route_id);
        }
    }
}

/// Structural equality over the fields that affect a running pipeline or
/// risk state; notification preferences are intentionally excluded since
/// they're read live from config, not cached at spawn time.
fn rule_set_eq(a: &RuleSet, b: &RuleSet) -> bool {
    serde_json::to_string(a).ok() == serde_json::to_string(b).ok()
}
