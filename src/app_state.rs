// =============================================================================
// Application State — wires the engine's subsystems together
// =============================================================================
//
// One `AppState` per process, shared behind `Arc` with every HTTP handler and
// background task, holding `Arc` handles to every subsystem. Config lives
// behind a `tokio::sync::watch` channel: any mutation (route CRUD via the
// HTTP surface) clones the current revision, edits it, persists it
// atomically, then publishes it — the Route Supervisor picks up the new
// revision on its own reload task and diffs it against the running
// pipelines.
// =============================================================================

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use thiserror::Error;
use tokio::sync::watch;
use tracing::info;

use crate::broker_gateway::{BrokerGateway, CloseResult, GatewayError, ModifyResult, SharedGateway};
use crate::config::EngineConfig;
use crate::domain::{NotificationPrefs, Route};
use crate::mapping_store::MappingStore;
use crate::operator_io::OperatorIo;
use crate::reconcile::{OrphanEntry, OrphanReconciler};
use crate::route_supervisor::{RouteStatus, RouteSupervisor};
use crate::types::AccountRef;

/// Business-outcome errors for the route CRUD surface. Never panics or
/// bubbles raw I/O errors to the HTTP layer unannotated.
#[derive(Debug, Error)]
pub enum RouteOpError {
    #[error("a route with this id already exists")]
    Duplicate,
    #[error("no route with this id exists")]
    NotFound,
    #[error("unknown rule set: {0}")]
    UnknownRuleSet(String),
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Business-outcome errors for the orphan command surface.
#[derive(Debug, Error)]
pub enum OrphanCommandError {
    #[error("position is not owned by any configured route's destination account")]
    NotFound,
    #[error("broker gateway rejected the command: {0}")]
    Gateway(GatewayError),
}

/// A route's static config joined with its live pipeline/risk snapshot, if
/// the route is currently running. Disabled or not-yet-started routes carry
/// `pipeline_state: None`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RouteOverview {
    pub route: Route,
    pub pipeline_state: Option<String>,
    pub risk: Option<crate::risk::RiskView>,
}

/// Fields an operator may patch on an existing route via `PUT /routes/{id}`.
/// All fields optional; only present fields are applied.
#[derive(Debug, Default, serde::Deserialize)]
pub struct RoutePatch {
    pub name: Option<String>,
    pub source: Option<AccountRef>,
    pub destination: Option<AccountRef>,
    #[serde(rename = "ruleSet")]
    pub rule_set: Option<String>,
    pub enabled: Option<bool>,
    pub notifications: Option<NotificationPrefs>,
}

pub struct AppState {
    config_path: PathBuf,
    config_tx: watch::Sender<EngineConfig>,
    pub gateway: SharedGateway,
    pub mapping_store: Arc<MappingStore>,
    pub operator_io: Arc<OperatorIo>,
    pub supervisor: Arc<RouteSupervisor>,
    reconciler: OrphanReconciler,
}

impl AppState {
    /// Build the full wiring: a fresh config-reload channel seeded with
    /// `config`, a `RouteSupervisor` subscribed to it, and an
    /// `OrphanReconciler` sharing the same gateway/mapping store/alert sink.
    /// Does not start any routes — call `state.supervisor.start_all()` and
    /// `state.supervisor.watch_config_reloads()` once the state is ready.
    pub fn new(
        config: EngineConfig,
        config_path: PathBuf,
        gateway: SharedGateway,
        mapping_store: Arc<MappingStore>,
        operator_io: Arc<OperatorIo>,
    ) -> Arc<Self> {
        let (config_tx, config_rx) = watch::channel(config);
        let supervisor = Arc::new(RouteSupervisor::new(
            gateway.clone(),
            mapping_store.clone(),
            operator_io.clone(),
            config_rx,
        ));
        let reconciler = OrphanReconciler::new(gateway.clone(), mapping_store.clone(), operator_io.clone());

        Arc::new(Self {
            config_path,
            config_tx,
            gateway,
            mapping_store,
            operator_io,
            supervisor,
            reconciler,
        })
    }

    pub fn config_snapshot(&self) -> EngineConfig {
        self.config_tx.borrow().clone()
    }

    pub fn reconcile_interval_secs(&self) -> u64 {
        self.config_tx.borrow().global_settings.reconcile_interval_secs
    }

    pub fn rollover_utc_hour(&self) -> u32 {
        self.config_tx.borrow().global_settings.rollover_utc_hour
    }

    /// Persist `config` atomically and publish it on the reload channel.
    /// Route Supervisor picks the new revision up on its own task and diffs
    /// it against the running set. On failure the old config keeps running
    /// untouched — the in-memory revision is never swapped until the save
    /// to disk succeeds — and the operator is alerted once.
    async fn publish_config(&self, config: EngineConfig) -> anyhow::Result<()> {
        if let Err(e) = config.save(&self.config_path).context("failed to persist engine config") {
            self.operator_io
                .alert_now(crate::operator_io::Alert::ConfigReloadRejected { error: e.to_string() })
                .await;
            return Err(e);
        }
        if let Err(e) = self
            .config_tx
            .send(config)
            .map_err(|_| anyhow::anyhow!("config reload channel has no receivers"))
        {
            self.operator_io
                .alert_now(crate::operator_io::Alert::ConfigReloadRejected { error: e.to_string() })
                .await;
            return Err(e);
        }
        Ok(())
    }

    /// Every configured route joined with its live status, if running.
    /// Backs `GET /routes`.
    pub fn routes_overview(&self) -> Vec<RouteOverview> {
        let config = self.config_tx.borrow().clone();
        let running: std::collections::HashMap<String, RouteStatus> = self
            .supervisor
            .status_all()
            .into_iter()
            .map(|s| (s.route_id.clone(), s))
            .collect();

        config
            .routes
            .iter()
            .map(|route| {
                let status = running.get(&route.id);
                RouteOverview {
                    route: route.clone(),
                    pipeline_state: status.map(|s| s.pipeline_state.clone()),
                    risk: status.map(|s| s.risk.clone()),
                }
            })
            .collect()
    }

    /// Live metrics for currently running routes only. Backs
    /// `GET /routes/stats`.
    pub fn routes_stats(&self) -> Vec<RouteStatus> {
        self.supervisor.status_all()
    }

    /// Create a new route. Backs `POST /routes`. An empty id generates a
    /// fresh one; a collision with an existing route id is a conflict.
    pub async fn create_route(&self, mut route: Route) -> Result<Route, RouteOpError> {
        if route.id.trim().is_empty() {
            route.id = uuid::Uuid::new_v4().to_string();
        }

        let mut config = self.config_tx.borrow().clone();
        if config.routes.iter().any(|r| r.id == route.id) {
            return Err(RouteOpError::Duplicate);
        }
        if !config.rule_sets.contains_key(&route.rule_set) {
            return Err(RouteOpError::UnknownRuleSet(route.rule_set.clone()));
        }

        config.routes.push(route.clone());
        self.publish_config(config).await?;
        info!(route_id = %route.id, "route created");
        Ok(route)
    }

    /// Apply a partial update to an existing route. Backs `PUT /routes/{id}`.
    pub async fn update_route(&self, id: &str, patch: RoutePatch) -> Result<Route, RouteOpError> {
        let mut config = self.config_tx.borrow().clone();
        if !config.routes.iter().any(|r| r.id == id) {
            return Err(RouteOpError::NotFound);
        }
        if let Some(rule_set) = &patch.rule_set {
            if !config.rule_sets.contains_key(rule_set) {
                return Err(RouteOpError::UnknownRuleSet(rule_set.clone()));
            }
        }

        let route = config.routes.iter_mut().find(|r| r.id == id).expect("checked above");
        if let Some(name) = patch.name {
            route.name = name;
        }
        if let Some(source) = patch.source {
            route.source = source;
        }
        if let Some(destination) = patch.destination {
            route.destination = destination;
        }
        if let Some(rule_set) = patch.rule_set {
            route.rule_set = rule_set;
        }
        if let Some(enabled) = patch.enabled {
            route.enabled = enabled;
        }
        if let Some(notifications) = patch.notifications {
            route.notifications = notifications;
        }
        let updated = route.clone();

        self.publish_config(config).await?;
        info!(route_id = %id, "route updated");
        Ok(updated)
    }

    /// Flip a route's `enabled` flag. Backs `POST /routes/{id}/toggle`.
    pub async fn toggle_route(&self, id: &str, enabled: bool) -> Result<Route, RouteOpError> {
        let mut config = self.config_tx.borrow().clone();
        let Some(route) = config.routes.iter_mut().find(|r| r.id == id) else {
            return Err(RouteOpError::NotFound);
        };
        route.enabled = enabled;
        let updated = route.clone();

        self.publish_config(config).await?;
        info!(route_id = %id, enabled, "route toggled");
        Ok(updated)
    }

    /// Remove a route entirely. Backs `DELETE /routes/{id}`. Does not touch
    /// existing mappings or open positions — only stops future copying;
    /// operators close any resulting orphans explicitly.
    pub async fn delete_route(&self, id: &str) -> Result<(), RouteOpError> {
        let mut config = self.config_tx.borrow().clone();
        let before = config.routes.len();
        config.routes.retain(|r| r.id != id);
        if config.routes.len() == before {
            return Err(RouteOpError::NotFound);
        }

        self.publish_config(config).await?;
        info!(route_id = %id, "route deleted");
        Ok(())
    }

    /// Scan configured (enabled) routes for orphaned destination positions.
    /// Backs `GET /orphans/list`. Optionally scoped to one route.
    pub async fn list_orphans(&self, route_id: Option<&str>) -> Vec<OrphanEntry> {
        let config = self.config_tx.borrow().clone();
        let mut orphans = Vec::new();

        for route in config.routes.iter().filter(|r| r.enabled) {
            if let Some(filter) = route_id {
                if route.id != filter {
                    continue;
                }
            }
            let Some(rule_set) = config.rule_set_for(route) else {
                continue;
            };
            if let Ok((_, found)) = self.reconciler.reconcile_route(route, rule_set).await {
                orphans.extend(found);
            }
        }

        orphans
    }

    /// Resolve which configured route's destination account currently owns
    /// `position_id`, by scanning enabled routes' destination accounts.
    /// Operator commands only ever carry a bare position id, so this is how
    /// they resolve the owning account.
    async fn find_owning_route(&self, position_id: &str) -> Option<Route> {
        let config = self.config_tx.borrow().clone();
        for route in config.routes.iter().filter(|r| r.enabled) {
            if let Ok(positions) = self.gateway.get_positions(&route.destination).await {
                if positions.iter().any(|p| p.position_id == position_id) {
                    return Some(route.clone());
                }
            }
        }
        None
    }

    /// Close an orphaned destination position by operator command. Backs
    /// `POST /orphans/close`. Also removes any residual mapping so a
    /// subsequent reconcile pass doesn't re-report it.
    pub async fn close_orphan(&self, position_id: &str) -> Result<(), OrphanCommandError> {
        let route = self
            .find_owning_route(position_id)
            .await
            .ok_or(OrphanCommandError::NotFound)?;

        match self.gateway.close_position(&route.destination, position_id).await {
            CloseResult::Closed { profit } => {
                info!(route_id = %route.id, position_id, profit, "orphan closed by operator command");
                if let Some(mapping) =
                    self.mapping_store
                        .get_by_dest(&route.destination, position_id, &[route.source.clone()])
                {
                    let _ = self
                        .mapping_store
                        .delete(&mapping.source_account, &mapping.source_position_id);
                }
                Ok(())
            }
            CloseResult::Failure(e) => Err(OrphanCommandError::Gateway(e)),
        }
    }

    /// Set the stop-loss on an orphaned destination position. Backs
    /// `POST /orphans/set-stop-loss`.
    pub async fn set_orphan_stop_loss(&self, position_id: &str, stop_loss: f64) -> Result<(), OrphanCommandError> {
        let route = self
            .find_owning_route(position_id)
            .await
            .ok_or(OrphanCommandError::NotFound)?;
        match self
            .gateway
            .modify_position(&route.destination, position_id, Some(stop_loss), None)
            .await
        {
            ModifyResult::Ok => Ok(()),
            ModifyResult::Failure(e) => Err(OrphanCommandError::Gateway(e)),
        }
    }

    /// Set the take-profit on an orphaned destination position. Backs
    /// `POST /orphans/set-take-profit`.
    pub async fn set_orphan_take_profit(&self, position_id: &str, take_profit: f64) -> Result<(), OrphanCommandError> {
        let route = self
            .find_owning_route(position_id)
            .await
            .ok_or(OrphanCommandError::NotFound)?;
        match self
            .gateway
            .modify_position(&route.destination, position_id, None, Some(take_profit))
            .await
        {
            ModifyResult::Ok => Ok(()),
            ModifyResult::Failure(e) => Err(OrphanCommandError::Gateway(e)),
        }
    }

    /// Poll every configured account's consecutive-failure counter and alert
    /// on sustained connection trouble. The counter only ever drives this
    /// alert; it never gates a call. Intended to be ticked on a short
    /// interval from main.rs.
    pub async fn poll_connection_health(&self) {
        let config = self.config_tx.borrow().clone();
        let mut seen = std::collections::HashSet::new();
        for route in &config.routes {
            for account in [&route.source, &route.destination] {
                if !seen.insert(account.clone()) {
                    continue;
                }
                let failures = self.gateway.consecutive_failures(account);
                if failures >= 3 {
                    self.operator_io.alert_connection_issue(account, failures).await;
                }
            }
        }
    }
}
