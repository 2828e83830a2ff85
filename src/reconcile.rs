// =============================================================================
// Orphan Reconciler — background mapped/orphan classification
// =============================================================================
//
// SAFETY POLICY: this module reports every orphan it discovers but will
// **never** automatically close a destination position unless the owning
// route explicitly opts in (`autoClose = true`). Report-only is the default;
// silently cancelling a customer's open position is never the safe guess.
// =============================================================================

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::broker_gateway::{BrokerGateway, CloseResult, SharedGateway};
use crate::config::RuleSet;
use crate::domain::{OrphanReason, Route};
use crate::mapping_store::MappingStore;
use crate::operator_io::OperatorIo;

/// Summary of a single reconciliation pass over one route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub route_id: String,
    pub healthy: u32,
    pub orphans_found: u32,
    pub orphans_alerted: u32,
    pub orphans_auto_closed: u32,
}

/// A classified orphan destination position, used both by the report and by
/// the `/orphans/list` HTTP surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrphanEntry {
    pub route_id: String,
    pub route_name: String,
    pub destination_position_id: String,
    pub symbol: String,
    pub volume: f64,
    pub profit: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub open_time: chrono::DateTime<Utc>,
    pub reason: OrphanReason,
}

pub struct OrphanReconciler {
    gateway: SharedGateway,
    mapping_store: std::sync::Arc<MappingStore>,
    operator_io: std::sync::Arc<OperatorIo>,
}

impl OrphanReconciler {
    pub fn new(
        gateway: SharedGateway,
        mapping_store: std::sync::Arc<MappingStore>,
        operator_io: std::sync::Arc<OperatorIo>,
    ) -> Self {
        Self { gateway, mapping_store, operator_io }
    }

    /// Run one reconciliation pass for `route`.
    pub async fn reconcile_route(&self, route: &Route, rule_set: &RuleSet) -> Result<(ReconcileReport, Vec<OrphanEntry>)> {
        let source_positions = self
            .gateway
            .get_positions(&route.source)
            .await
            .unwrap_or_default();
        let dest_positions = self
            .gateway
            .get_positions(&route.destination)
            .await
            .unwrap_or_default();

        let mut report = ReconcileReport {
            route_id: route.id.clone(),
            healthy: 0,
            orphans_found: 0,
            orphans_alerted: 0,
            orphans_auto_closed: 0,
        };
        let mut orphans = Vec::new();

        for dest_position in &dest_positions {
            let mapping = self
                .mapping_store
                .get_by_dest(&route.destination, &dest_position.position_id, &[route.source.clone()]);

            let reason = match &mapping {
                Some(m) if m.route_id != route.id => continue,
                Some(_) => {
                    let source_id = dest_position.source_id_from_comment();
                    let source_present = source_id
                        .map(|sid| source_positions.iter().any(|p| p.position_id == sid))
                        .unwrap_or(true);
                    if source_present {
                        report.healthy += 1;
                        None
                    } else {
                        Some(OrphanReason::SourceClosed)
                    }
                }
                None => Some(OrphanReason::NoMapping),
            };

            let Some(reason) = reason else { continue };

            report.orphans_found += 1;
            orphans.push(OrphanEntry {
                route_id: route.id.clone(),
                route_name: route.name.clone(),
                destination_position_id: dest_position.position_id.clone(),
                symbol: dest_position.symbol.clone(),
                volume: dest_position.volume,
                profit: dest_position.profit,
                stop_loss: dest_position.stop_loss,
                take_profit: dest_position.take_profit,
                open_time: dest_position.open_time,
                reason,
            });

            if route.notifications.orphan_alerts {
                let sent = self
                    .operator_io
                    .alert_orphan(
                        &route.destination,
                        &route.name,
                        &dest_position.symbol,
                        &dest_position.position_id,
                        dest_position.volume,
                        dest_position.profit,
                        &reason.to_string(),
                    )
                    .await;
                if sent {
                    report.orphans_alerted += 1;
                }
            }

            if rule_set.auto_close_orphans {
                match self.gateway.close_position(&route.destination, &dest_position.position_id).await {
                    CloseResult::Closed { profit } => {
                        info!(
                            route_id = %route.id,
                            position_id = %dest_position.position_id,
                            profit,
                            "orphan auto-closed"
                        );
                        if let Some(mapping) = &mapping {
                            let _ = self
                                .mapping_store
                                .delete(&mapping.source_account, &mapping.source_position_id);
                        }
                        report.orphans_auto_closed += 1;
                    }
                    CloseResult::Failure(e) => {
                        warn!(route_id = %route.id, position_id = %dest_position.position_id, error = %e, "orphan auto-close failed");
                    }
                }
            }
        }

        Ok((report, orphans))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::broker_gateway::{DemoGateway, ExecutionResult};
    use crate::config::RuleSet;
    use crate::domain::{MappingStatus, OrderRequest, PositionMapping};
    use crate::mapping_store::MappingStore;
    use crate::types::{AccountRef, Side};

    fn account(id: &str) -> AccountRef {
        AccountRef { account_id: id.into(), region: "demo".into() }
    }

    fn route() -> Route {
        Route {
            id: "route-1".into(),
            name: "r1".into(),
            source: account("src"),
            destination: account("dst"),
            rule_set: "default".into(),
            enabled: true,
            notifications: Default::default(),
        }
    }

    async fn open(gateway: &DemoGateway, account: &AccountRef, comment: Option<String>) -> String {
        let order = OrderRequest {
            symbol: "XAUUSD".into(),
            side: Side::Long,
            volume: 0.1,
            stop_loss: None,
            take_profit: None,
            comment,
        };
        match gateway.execute_trade(account, &order).await {
            ExecutionResult::Success { broker_order_id } => broker_order_id,
            ExecutionResult::Failure(e) => panic!("unexpected failure: {e}"),
        }
    }

    fn mapping(route: &Route, src_id: &str, dst_id: &str) -> PositionMapping {
        PositionMapping {
            source_account: route.source.clone(),
            source_position_id: src_id.into(),
            destination_account: route.destination.clone(),
            destination_position_id: dst_id.into(),
            route_id: route.id.clone(),
            symbol: "XAUUSD".into(),
            open_time: Utc::now(),
            status: MappingStatus::Active,
            last_seen: Utc::now(),
        }
    }

    #[tokio::test]
    async fn mirrored_position_with_live_source_is_healthy() {
        let gateway = DemoGateway::new();
        let route = route();
        gateway.seed_account(route.source.clone(), 100_000.0);
        gateway.seed_account(route.destination.clone(), 100_000.0);

        let src_id = open(&gateway, &route.source, None).await;
        let dst_id = open(&gateway, &route.destination, Some(format!("copy:{}:{src_id}", route.id))).await;

        let mapping_store = Arc::new(MappingStore::open_in_memory());
        mapping_store.put(mapping(&route, &src_id, &dst_id)).unwrap();

        let gateway: SharedGateway = Arc::new(gateway);
        let operator_io = Arc::new(OperatorIo::new(None));
        let reconciler = OrphanReconciler::new(gateway, mapping_store, operator_io);

        let (report, orphans) = reconciler.reconcile_route(&route, &RuleSet::default()).await.unwrap();
        assert_eq!(report.healthy, 1);
        assert_eq!(report.orphans_found, 0);
        assert!(orphans.is_empty());
    }

    #[tokio::test]
    async fn mapped_position_whose_source_closed_is_orphan() {
        let gateway = DemoGateway::new();
        let route = route();
        gateway.seed_account(route.source.clone(), 100_000.0);
        gateway.seed_account(route.destination.clone(), 100_000.0);

        let src_id = open(&gateway, &route.source, None).await;
        let dst_id = open(&gateway, &route.destination, Some(format!("copy:{}:{src_id}", route.id))).await;
        gateway.close_position(&route.source, &src_id).await;

        let mapping_store = Arc::new(MappingStore::open_in_memory());
        mapping_store.put(mapping(&route, &src_id, &dst_id)).unwrap();

        let gateway: SharedGateway = Arc::new(gateway);
        let operator_io = Arc::new(OperatorIo::new(None));
        let reconciler = OrphanReconciler::new(gateway, mapping_store, operator_io);

        let (report, orphans) = reconciler.reconcile_route(&route, &RuleSet::default()).await.unwrap();
        assert_eq!(report.orphans_found, 1);
        assert_eq!(orphans[0].reason, OrphanReason::SourceClosed);
    }

    #[tokio::test]
    async fn destination_position_with_no_mapping_is_orphan() {
        let gateway = DemoGateway::new();
        let route = route();
        gateway.seed_account(route.source.clone(), 100_000.0);
        gateway.seed_account(route.destination.clone(), 100_000.0);

        open(&gateway, &route.destination, Some("manual trade".into())).await;

        let mapping_store = Arc::new(MappingStore::open_in_memory());
        let gateway: SharedGateway = Arc::new(gateway);
        let operator_io = Arc::new(OperatorIo::new(None));
        let reconciler = OrphanReconciler::new(gateway, mapping_store, operator_io);

        let (report, orphans) = reconciler.reconcile_route(&route, &RuleSet::default()).await.unwrap();
        assert_eq!(report.orphans_found, 1);
        assert_eq!(orphans[0].reason, OrphanReason::NoMapping);
    }

    #[tokio::test]
    async fn auto_close_orphans_closes_position_and_removes_mapping() {
        let gateway = DemoGateway::new();
        let route = route();
        gateway.seed_account(route.source.clone(), 100_000.0);
        gateway.seed_account(route.destination.clone(), 100_000.0);

        let src_id = open(&gateway, &route.source, None).await;
        let dst_id = open(&gateway, &route.destination, Some(format!("copy:{}:{src_id}", route.id))).await;
        gateway.close_position(&route.source, &src_id).await;

        let mapping_store = Arc::new(MappingStore::open_in_memory());
        mapping_store.put(mapping(&route, &src_id, &dst_id)).unwrap();

        let gateway: SharedGateway = Arc::new(gateway);
        let operator_io = Arc::new(OperatorIo::new(None));
        let reconciler = OrphanReconciler::new(gateway.clone(), mapping_store.clone(), operator_io);

        let mut rule_set = RuleSet::default();
        rule_set.auto_close_orphans = true;
        let (report, _) = reconciler.reconcile_route(&route, &rule_set).await.unwrap();
        assert_eq!(report.orphans_auto_closed, 1);

        let remaining = gateway.get_positions(&route.destination).await.unwrap();
        assert!(remaining.iter().all(|p| p.position_id != dst_id));
        assert!(mapping_store.get_by_source(&route.source, &src_id).is_none());
    }

    #[tokio::test]
    async fn report_only_default_never_closes_positions() {
        let gateway = DemoGateway::new();
        let route = route();
        gateway.seed_account(route.source.clone(), 100_000.0);
        gateway.seed_account(route.destination.clone(), 100_000.0);

        let src_id = open(&gateway, &route.source, None).await;
        let dst_id = open(&gateway, &route.destination, Some(format!("copy:{}:{src_id}", route.id))).await;
        gateway.close_position(&route.source, &src_id).await;

        let mapping_store = Arc::new(MappingStore::open_in_memory());
        mapping_store.put(mapping(&route, &src_id, &dst_id)).unwrap();

        let gateway: SharedGateway = Arc::new(gateway);
        let operator_io = Arc::new(OperatorIo::new(None));
        let reconciler = OrphanReconciler::new(gateway.clone(), mapping_store, operator_io);

        let (report, _) = reconciler.reconcile_route(&route, &RuleSet::default()).await.unwrap();
        assert_eq!(report.orphans_auto_closed, 0);

        let remaining = gateway.get_positions(&route.destination).await.unwrap();
        assert!(remaining.iter().any(|p| p.position_id == dst_id));
    }
}
