// =============================================================================
// Copy Pipeline — per-route event-driven copy loop
// =============================================================================
//
// One instance per enabled route. States: Starting -> Syncing -> Running ->
// Degraded -> Stopped. Events for the same source position are serialized;
// events for different source positions may run in parallel up to a
// per-route concurrency cap (default 4). Backpressure drops the oldest
// queued `position-updated` event per source position — `created` and
// `removed` are never dropped.
//
// Each route runs its own task-per-concern `tokio::spawn` + reconnect loop,
// independent of every other route's pipeline.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{watch, Notify, Semaphore};
use tracing::{debug, info, warn};

use crate::broker_gateway::{BrokerGateway, CloseResult, ExecutionResult, GatewayError, SharedGateway, StreamEvent};
use crate::config::RuleSet;
use crate::domain::{MappingStatus, OrderRequest, Position, PositionMapping};
use crate::filter_chain::{CopyCandidate, FilterChain};
use crate::mapping_store::{MappingStore, PutOutcome};
use crate::operator_io::{Alert, OperatorIo};
use crate::risk::RiskState;
use crate::sizing::{SizingInput, SizingOutcome, SizingPolicy};
use crate::types::Side;

const DEFAULT_QUEUE_DEPTH: usize = 64;
const DEFAULT_CONCURRENCY_CAP: usize = 4;
const DEFAULT_DRAIN_BUDGET_SECS: u64 = 10;

/// Pipeline lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PipelineState {
    Starting = 0,
    Syncing = 1,
    Running = 2,
    Degraded = 3,
    Stopped = 4,
}

impl PipelineState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Starting,
            1 => Self::Syncing,
            2 => Self::Running,
            3 => Self::Degraded,
            _ => Self::Stopped,
        }
    }
}

#[derive(Debug, Clone)]
enum SourceEvent {
    Created(Position),
    Updated(Position),
    Removed { position_id: String },
}

/// A per-source-position FIFO queue that drops the oldest queued
/// `position-updated` event when full, never `created`/`removed`.
///
/// `draining` ensures at most one task is ever popping/handling events for
/// this position at a time, so events for the same source position are
/// processed strictly in arrival order even though dispatch is triggered
/// independently for every push.
struct PositionQueue {
    inner: SyncMutex<VecDeque<SourceEvent>>,
    notify: Notify,
    draining: AtomicBool,
}

impl PositionQueue {
    fn new() -> Self {
        Self {
            inner: SyncMutex::new(VecDeque::new()),
            notify: Notify::new(),
            draining: AtomicBool::new(false),
        }
    }

    fn push(&self, event: SourceEvent, depth: usize) {
        let mut queue = self.inner.lock();
        if queue.len() >= depth {
            if let Some(idx) = queue.iter().position(|e| matches!(e, SourceEvent::Updated(_))) {
                queue.remove(idx);
                debug!("dropped stale position-updated event under backpressure");
            }
        }
        queue.push_back(event);
        drop(queue);
        self.notify.notify_one();
    }

    async fn pop(&self) -> SourceEvent {
        loop {
            {
                let mut queue = self.inner.lock();
                if let Some(event) = queue.pop_front() {
                    return event;
                }
            }
            self.notify.notified().await;
        }
    }
}

/// Route configuration the pipeline needs, resolved once at construction.
/// SL/TP buffers and the mirror-on-update flag live on the route's rule set,
/// not here — see `RuleSet::sizing` and `RuleSet::mirror_sl_tp`.
#[derive(Debug, Clone)]
pub struct PipelineRoute {
    pub id: String,
    pub name: String,
    pub source: crate::types::AccountRef,
    pub destination: crate::types::AccountRef,
}

pub struct CopyPipeline {
    route: PipelineRoute,
    rule_set: RuleSet,
    gateway: SharedGateway,
    mapping_store: Arc<MappingStore>,
    risk_state: Arc<RiskState>,
    operator_io: Arc<OperatorIo>,
    state: AtomicU8,
    queues: SyncMutex<HashMap<String, Arc<PositionQueue>>>,
    concurrency: Arc<Semaphore>,
}

impl CopyPipeline {
    pub fn new(
        route: PipelineRoute,
        rule_set: RuleSet,
        gateway: SharedGateway,
        mapping_store: Arc<MappingStore>,
        risk_state: Arc<RiskState>,
        operator_io: Arc<OperatorIo>,
    ) -> Self {
        Self {
            route,
            rule_set,
            gateway,
            mapping_store,
            risk_state,
            operator_io,
            state: AtomicU8::new(PipelineState::Starting as u8),
            queues: SyncMutex::new(HashMap::new()),
            concurrency: Arc::new(Semaphore::new(DEFAULT_CONCURRENCY_CAP)),
        }
    }

    pub fn state(&self) -> PipelineState {
        PipelineState::from_u8(self.state.load(Ordering::Relaxed))
    }

    fn set_state(&self, state: PipelineState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    /// Run the pipeline until `shutdown` fires: startup snapshot and mapping
    /// re-materialization, then the event loop.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        self.set_state(PipelineState::Starting);

        let mut stream = match self.gateway.connect_stream(&self.route.source).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(route_id = %self.route.id, error = %e, "failed to connect source stream");
                self.set_state(PipelineState::Degraded);
                return;
            }
        };

        self.set_state(PipelineState::Syncing);
        if let Err(e) = self.sync_startup().await {
            warn!(route_id = %self.route.id, error = %e, "startup sync failed");
        }
        self.set_state(PipelineState::Running);
        info!(route_id = %self.route.id, "copy pipeline running");

        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                event = stream.recv() => {
                    match event {
                        Some(event) => self.dispatch(event).await,
                        None => {
                            warn!(route_id = %self.route.id, "source stream ended");
                            self.set_state(PipelineState::Degraded);
                            break;
                        }
                    }
                }
            }
        }

        self.drain().await;
        self.set_state(PipelineState::Stopped);
        info!(route_id = %self.route.id, "copy pipeline stopped");
    }

    /// Startup: take a full snapshot from both sides; for every destination
    /// position whose comment encodes a source id, re-materialize the active
    /// mapping if absent (idempotent).
    async fn sync_startup(&self) -> anyhow::Result<()> {
        let dest_positions = self
            .gateway
            .get_positions(&self.route.destination)
            .await
            .unwrap_or_default();
        let source_positions = self
            .gateway
            .get_positions(&self.route.source)
            .await
            .unwrap_or_default();

        let mut rematerialized = 0u32;
        for dest in &dest_positions {
            let Some(source_id) = dest.source_id_from_comment() else { continue };
            if self.mapping_store.get_by_source(&self.route.source, source_id).is_some() {
                continue;
            }
            let mapping = PositionMapping {
                source_account: self.route.source.clone(),
                source_position_id: source_id.to_string(),
                destination_account: self.route.destination.clone(),
                destination_position_id: dest.position_id.clone(),
                route_id: self.route.id.clone(),
                symbol: dest.symbol.clone(),
                open_time: dest.open_time,
                status: MappingStatus::Active,
                last_seen: Utc::now(),
            };
            if self.mapping_store.put(mapping)? == PutOutcome::Written {
                rematerialized += 1;
            }
        }

        info!(
            route_id = %self.route.id,
            dest_positions = dest_positions.len(),
            source_positions = source_positions.len(),
            rematerialized,
            "startup sync complete"
        );
        Ok(())
    }

    fn dispatch(self: &Arc<Self>, event: StreamEvent) {
        let (position_id, source_event) = match event {
            StreamEvent::PositionCreated(p) => (p.position_id.clone(), SourceEvent::Created(p)),
            StreamEvent::PositionUpdated(p) => (p.position_id.clone(), SourceEvent::Updated(p)),
            StreamEvent::PositionRemoved { position_id } => {
                (position_id.clone(), SourceEvent::Removed { position_id })
            }
            StreamEvent::AccountInfoUpdated(_) => return,
        };

        let queue = {
            let mut queues = self.queues.lock();
            queues
                .entry(position_id)
                .or_insert_with(|| Arc::new(PositionQueue::new()))
                .clone()
        };
        queue.push(source_event, DEFAULT_QUEUE_DEPTH);

        // Only the task that wins the compare-exchange becomes this
        // position's drainer; a dispatch that loses just relies on the
        // winning drainer to pick up the event it pushed.
        if queue
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let pipeline = Arc::clone(self);
            tokio::spawn(async move {
                pipeline.drain_loop(queue).await;
            });
        }
    }

    /// Serially process every event queued for one source position,
    /// bounded by the route's concurrency cap; exits once the queue is
    /// observed empty, releasing the drainer slot for a future dispatch.
    async fn drain_loop(self: Arc<Self>, queue: Arc<PositionQueue>) {
        loop {
            let event = {
                let mut inner = queue.inner.lock();
                inner.pop_front()
            };
            let Some(event) = event else {
                // Release the drainer slot, then re-check: a push that
                // raced us in between would otherwise be stranded with no
                // drainer watching it.
                queue.draining.store(false, Ordering::Release);
                let still_has_work = !queue.inner.lock().is_empty();
                if !still_has_work {
                    break;
                }
                if queue
                    .draining
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    // Another dispatch already reclaimed the drainer role.
                    break;
                }
                continue;
            };

            let permit = match self.concurrency.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            self.handle_event(event).await;
            drop(permit);
        }
    }

    async fn handle_event(&self, event: SourceEvent) {
        match event {
            SourceEvent::Created(position) => self.handle_created(position).await,
            SourceEvent::Updated(position) => self.handle_updated(position).await,
            SourceEvent::Removed { position_id } => self.handle_removed(&position_id).await,
        }
    }

    /// Per-event handling: position-created on source.
    async fn handle_created(&self, position: Position) {
        let now = Utc::now();

        let existing_mapping = self
            .mapping_store
            .get_by_source(&self.route.source, &position.position_id);
        if existing_mapping.is_some() {
            return;
        }

        let risk_view = self.risk_state.snapshot();
        let active_mappings = self.mapping_store.list_active_for_route(&self.route.id);
        let source_positions = self
            .gateway
            .get_positions(&self.route.source)
            .await
            .unwrap_or_default();

        let candidate = CopyCandidate {
            source_account: &self.route.source,
            source_position_id: &position.position_id,
            symbol: &position.symbol,
            side: position.side,
            volume: position.volume,
            open_price: position.open_price,
            now,
        };

        if let Some(reason) = FilterChain::evaluate(
            &candidate,
            &self.rule_set.filters,
            &risk_view,
            existing_mapping.as_ref(),
            &active_mappings,
            &source_positions,
        ) {
            debug!(route_id = %self.route.id, position_id = %position.position_id, %reason, "copy candidate denied by filter chain");
            return;
        }

        let symbol_open_positions = active_mappings
            .iter()
            .filter(|m| m.symbol == position.symbol)
            .count() as u32;
        match self.risk_state.on_event_ingress(
            now,
            &position.symbol,
            active_mappings.len() as u32,
            symbol_open_positions,
        ) {
            crate::risk::GateResult::Deny(reason) => {
                debug!(route_id = %self.route.id, position_id = %position.position_id, %reason, "copy candidate denied by risk gate");
                if matches!(
                    reason,
                    crate::risk::DenyReason::EmergencyStop | crate::risk::DenyReason::DailyLossReached
                ) {
                    self.operator_io
                        .alert_daily_limit_reached(&self.route.id, &self.route.name, &reason.to_string())
                        .await;
                }
                return;
            }
            crate::risk::GateResult::Allow => {}
        }

        let current_exposure: f64 = active_mappings.len() as f64;
        let symbol_is_squeeze_eligible = self.rule_set.sizing.squeeze_symbols.iter().any(|s| s == &position.symbol);
        let sizing_input = SizingInput {
            source_volume: position.volume,
            dest_balance: self
                .gateway
                .get_account_info(&self.route.destination)
                .await
                .map(|a| a.balance)
                .unwrap_or(self.rule_set.sizing.reference_balance),
            current_exposure,
            squeeze_score: None,
            is_long: matches!(position.side, Side::Long),
            symbol_is_squeeze_eligible,
        };
        let phase = self.risk_state.phase_tier();
        let volume = match SizingPolicy::compute(&sizing_input, &self.rule_set.sizing, &phase, risk_view.consecutive_losses) {
            SizingOutcome::Execute(volume) => volume,
            SizingOutcome::Skip => {
                debug!(route_id = %self.route.id, position_id = %position.position_id, "sizing skipped (below min lot)");
                return;
            }
        };

        // Real-time de-dup self-heal: scan destination for an existing
        // position whose comment already references this source position.
        let dest_positions = self
            .gateway
            .get_positions(&self.route.destination)
            .await
            .unwrap_or_default();
        if let Some(existing) = dest_positions
            .iter()
            .find(|p| p.source_id_from_comment() == Some(position.position_id.as_str()))
        {
            let mapping = PositionMapping {
                source_account: self.route.source.clone(),
                source_position_id: position.position_id.clone(),
                destination_account: self.route.destination.clone(),
                destination_position_id: existing.position_id.clone(),
                route_id: self.route.id.clone(),
                symbol: position.symbol.clone(),
                open_time: existing.open_time,
                status: MappingStatus::Active,
                last_seen: now,
            };
            if let Err(e) = self.mapping_store.put(mapping) {
                warn!(error = %e, "failed to self-heal mapping");
            }
            return;
        }

        let comment = encode_comment(&self.route.id, &position.position_id);
        let sl_buffer = self.rule_set.sizing.sl_buffer;
        let tp_buffer = self.rule_set.sizing.tp_buffer;
        let order = OrderRequest {
            symbol: position.symbol.clone(),
            side: position.side,
            volume,
            stop_loss: position.stop_loss.map(|sl| sl + sl_buffer * position.side.sign()),
            take_profit: position.take_profit.map(|tp| tp + tp_buffer * position.side.sign()),
            comment: Some(comment),
        };

        match self.gateway.execute_trade(&self.route.destination, &order).await {
            ExecutionResult::Success { broker_order_id } => {
                let mapping = PositionMapping {
                    source_account: self.route.source.clone(),
                    source_position_id: position.position_id.clone(),
                    destination_account: self.route.destination.clone(),
                    destination_position_id: broker_order_id,
                    route_id: self.route.id.clone(),
                    symbol: position.symbol.clone(),
                    open_time: now,
                    status: MappingStatus::Active,
                    last_seen: now,
                };
                if let Err(e) = self.mapping_store.put(mapping) {
                    warn!(error = %e, "failed to persist mapping after successful execution");
                }
                self.risk_state.on_trade_opened(&position.symbol, now);
                info!(route_id = %self.route.id, position_id = %position.position_id, volume, "copy executed");
            }
            ExecutionResult::Failure(e) => {
                warn!(route_id = %self.route.id, position_id = %position.position_id, error = %e, "copy execution failed");
                if matches!(e, GatewayError::SymbolUnknown { .. }) {
                    self.operator_io
                        .alert_unknown_symbol(&self.route.id, &self.route.name, &position.symbol)
                        .await;
                }
            }
        }
    }

    /// Per-event handling: position-removed on source.
    async fn handle_removed(&self, position_id: &str) {
        let Some(mapping) = self.mapping_store.get_by_source(&self.route.source, position_id) else {
            return;
        };
        if mapping.status != MappingStatus::Active {
            return;
        }

        match self
            .gateway
            .close_position(&self.route.destination, &mapping.destination_position_id)
            .await
        {
            CloseResult::Closed { profit } => {
                if let Err(e) = self.mapping_store.mark_closed(&self.route.source, position_id) {
                    warn!(error = %e, "failed to mark mapping closed");
                }
                let now = Utc::now();
                let emergency_stop = self.risk_state.on_trade_closed(&mapping.symbol, profit, now);
                info!(route_id = %self.route.id, position_id, profit, "source close mirrored");
                if let Some(equity_loss_pct) = emergency_stop {
                    self.trigger_emergency_stop(equity_loss_pct).await;
                }
            }
            CloseResult::Failure(e) => {
                warn!(
                    route_id = %self.route.id,
                    position_id,
                    error = %e,
                    "failed to close mirrored position; leaving mapping active for reconciler"
                );
            }
        }
    }

    /// Close every remaining open destination position for this route and
    /// fire a single `EmergencyStopTriggered` alert. Runs once, on the event
    /// that trips `RiskState::emergency_stopped`; subsequent events are
    /// denied by the risk gate before reaching this path. A position whose
    /// close fails is left active for the reconciler to pick up as an
    /// orphan, same as any other failed mirrored close.
    async fn trigger_emergency_stop(&self, equity_loss_pct: f64) {
        warn!(route_id = %self.route.id, equity_loss_pct, "emergency stop: closing all open route positions");

        for mapping in self.mapping_store.list_active_for_route(&self.route.id) {
            match self
                .gateway
                .close_position(&self.route.destination, &mapping.destination_position_id)
                .await
            {
                CloseResult::Closed { .. } => {
                    if let Err(e) = self
                        .mapping_store
                        .mark_closed(&mapping.source_account, &mapping.source_position_id)
                    {
                        warn!(error = %e, "failed to mark mapping closed during emergency stop");
                    }
                }
                CloseResult::Failure(e) => {
                    warn!(
                        route_id = %self.route.id,
                        position_id = %mapping.destination_position_id,
                        error = %e,
                        "emergency stop: failed to close position, leaving mapping active for reconciler"
                    );
                }
            }
        }

        self.operator_io
            .alert_now(Alert::EmergencyStopTriggered {
                route_name: self.route.name.clone(),
                equity_loss_pct,
            })
            .await;
    }

    /// Per-event handling: position-updated on source. Best effort; never
    /// affects mappings.
    async fn handle_updated(&self, position: Position) {
        if !self.rule_set.mirror_sl_tp {
            return;
        }
        let Some(mapping) = self
            .mapping_store
            .get_by_source(&self.route.source, &position.position_id)
        else {
            return;
        };
        if mapping.status != MappingStatus::Active {
            return;
        }

        let sl_buffer = self.rule_set.sizing.sl_buffer;
        let tp_buffer = self.rule_set.sizing.tp_buffer;
        let sl = position.stop_loss.map(|sl| sl + sl_buffer * position.side.sign());
        let tp = position.take_profit.map(|tp| tp + tp_buffer * position.side.sign());

        if let crate::broker_gateway::ModifyResult::Failure(e) = self
            .gateway
            .modify_position(&self.route.destination, &mapping.destination_position_id, sl, tp)
            .await
        {
            warn!(route_id = %self.route.id, position_id = %position.position_id, error = %e, "mirror sl/tp modify failed");
        }
    }

    /// Cooperative drain on stop, bounded by `DEFAULT_DRAIN_BUDGET_SECS`.
    /// Does not close destination positions.
    async fn drain(&self) {
        let budget = tokio::time::Duration::from_secs(DEFAULT_DRAIN_BUDGET_SECS);
        let _ = tokio::time::timeout(budget, async {
            loop {
                let pending: usize = {
                    let queues = self.queues.lock();
                    queues.values().map(|q| q.inner.lock().len()).sum()
                };
                if pending == 0 {
                    break;
                }
                tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
            }
        })
        .await;
    }
}

/// Encode the `copy:<route_id>:<source_position_id>` comment convention
/// (see `domain::Position::source_id_from_comment`).
fn encode_comment(route_id: &str, source_position_id: &str) -> String {
    format!("copy:{route_id}:{source_position_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker_gateway::DemoGateway;
    use crate::config::{PhaseConfig, RiskConfig};
    use crate::domain::MappingStatus;
    use crate::types::AccountRef;

    fn account(id: &str) -> AccountRef {
        AccountRef { account_id: id.into(), region: "demo".into() }
    }

    fn pipeline_route() -> PipelineRoute {
        PipelineRoute {
            id: "route-1".into(),
            name: "r1".into(),
            source: account("src"),
            destination: account("dst"),
        }
    }

    #[tokio::test]
    async fn emergency_stop_closes_every_open_route_position_and_alerts_once() {
        let gateway = DemoGateway::new();
        let route = pipeline_route();
        gateway.seed_account(route.source.clone(), 10_000.0);
        gateway.seed_account(route.destination.clone(), 10_000.0);

        let order = OrderRequest {
            symbol: "XAUUSD".into(),
            side: Side::Long,
            volume: 0.1,
            stop_loss: None,
            take_profit: None,
            comment: Some(encode_comment(&route.id, "s1")),
        };
        let ExecutionResult::Success { broker_order_id: dest_id } = gateway.execute_trade(&route.destination, &order).await else {
            panic!("expected success");
        };

        let mapping_store = Arc::new(MappingStore::open_in_memory());
        mapping_store
            .put(PositionMapping {
                source_account: route.source.clone(),
                source_position_id: "s1".into(),
                destination_account: route.destination.clone(),
                destination_position_id: dest_id.clone(),
                route_id: route.id.clone(),
                symbol: "XAUUSD".into(),
                open_time: Utc::now(),
                status: MappingStatus::Active,
                last_seen: Utc::now(),
            })
            .unwrap();

        let gateway: SharedGateway = Arc::new(gateway);
        let risk_state = Arc::new(RiskState::new(RiskConfig::default(), PhaseConfig::default(), 10_000.0, Utc::now()));
        let operator_io = Arc::new(OperatorIo::new(None));
        let pipeline = CopyPipeline::new(
            route.clone(),
            RuleSet::default(),
            gateway.clone(),
            mapping_store.clone(),
            risk_state.clone(),
            operator_io,
        );

        pipeline.trigger_emergency_stop(9.0).await;

        let remaining = gateway.get_positions(&route.destination).await.unwrap();
        assert!(remaining.iter().all(|p| p.position_id != dest_id));
        assert_eq!(
            mapping_store.get_by_source(&route.source, "s1").unwrap().status,
            MappingStatus::Closed
        );
    }

    #[tokio::test]
    async fn unknown_symbol_rejection_alerts_and_leaves_no_mapping() {
        let gateway = DemoGateway::new();
        let route = pipeline_route();
        gateway.seed_account(route.source.clone(), 10_000.0);
        gateway.seed_account(route.destination.clone(), 10_000.0);

        let gateway: SharedGateway = Arc::new(gateway);
        let mapping_store = Arc::new(MappingStore::open_in_memory());
        let risk_state = Arc::new(RiskState::new(RiskConfig::default(), PhaseConfig::default(), 10_000.0, Utc::now()));
        let operator_io = Arc::new(OperatorIo::new(None));
        let pipeline = CopyPipeline::new(
            route.clone(),
            RuleSet::default(),
            gateway,
            mapping_store.clone(),
            risk_state,
            operator_io,
        );

        let position = Position {
            position_id: "s1".into(),
            symbol: "UNKNOWN".into(),
            side: Side::Long,
            volume: 0.1,
            open_price: 100.0,
            open_time: Utc::now(),
            stop_loss: None,
            take_profit: None,
            comment: None,
            current_price: 0.0,
            profit: 0.0,
            route_id: None,
            source_position_id: None,
            sizing: None,
        };

        pipeline.handle_created(position).await;

        assert!(mapping_store.get_by_source(&route.source, "s1").is_none());
    }

    #[test]
    fn encode_comment_round_trips_with_source_id_from_comment() {
        let comment = encode_comment("route-1", "src-42");
        let position = Position {
            position_id: "d1".into(),
            symbol: "XAUUSD".into(),
            side: Side::Long,
            volume: 0.1,
            open_price: 2400.0,
            open_time: Utc::now(),
            stop_loss: None,
            take_profit: None,
            comment: Some(comment),
            current_price: 0.0,
            profit: 0.0,
            route_id: None,
            source_position_id: None,
            sizing: None,
        };
        assert_eq!(position.source_id_from_comment(), Some("src-42"));
    }

    #[tokio::test]
    async fn position_queue_drops_oldest_updated_under_pressure() {
        let queue = PositionQueue::new();
        let base_position = Position {
            position_id: "p1".into(),
            symbol: "XAUUSD".into(),
            side: Side::Long,
            volume: 0.1,
            open_price: 2400.0,
            open_time: Utc::now(),
            stop_loss: None,
            take_profit: None,
            comment: None,
            current_price: 0.0,
            profit: 0.0,
            route_id: None,
            source_position_id: None,
            sizing: None,
        };

        queue.push(SourceEvent::Created(base_position.clone()), 2);
        queue.push(SourceEvent::Updated(base_position.clone()), 2);
        queue.push(SourceEvent::Updated(base_position.clone()), 2);

        // depth cap 2: the first Updated should have been evicted, Created survives.
        let first = queue.pop().await;
        assert!(matches!(first, SourceEvent::Created(_)));
        let second = queue.pop().await;
        assert!(matches!(second, SourceEvent::Updated(_)));
    }

    #[tokio::test]
    async fn position_queue_never_drops_created_or_removed() {
        let queue = PositionQueue::new();
        let base_position = Position {
            position_id: "p1".into(),
            symbol: "XAUUSD".into(),
            side: Side::Long,
            volume: 0.1,
            open_price: 2400.0,
            open_time: Utc::now(),
            stop_loss: None,
            take_profit: None,
            comment: None,
            current_price: 0.0,
            profit: 0.0,
            route_id: None,
            source_position_id: None,
            sizing: None,
        };

        queue.push(SourceEvent::Created(base_position.clone()), 1);
        queue.push(SourceEvent::Removed { position_id: "p1".into() }, 1);

        let first = queue.pop().await;
        assert!(matches!(first, SourceEvent::Created(_)));
        let second = queue.pop().await;
        assert!(matches!(second, SourceEvent::Removed { .. }));
    }
}
