// =============================================================================
// Broker Gateway — opaque façade over the broker API
// =============================================================================
//
// The engine's only window onto broker accounts. Streaming connection,
// position queries, trade execution, modify, close. `get_positions` and all
// trade operations never block the caller on a transient fault — they
// return a failure variant. Consecutive failures are tracked per account
// with a lock-free atomic counter and solely drive a connection-issue alert,
// throttled upstream by Operator I/O; the counter never gates a call.
//
// The low-level broker wire protocol is out of scope here, so the concrete
// implementation is a deterministic demo/paper execution backend rather
// than a real broker integration.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::domain::{OrderRequest, Position};
use crate::types::{AccountInfo, AccountRef, Side};

/// Closed set of gateway failure kinds.
#[derive(Debug, Error, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum GatewayError {
    #[error("order rejected: {reason}")]
    Rejected { reason: String },
    #[error("insufficient margin")]
    InsufficientMargin,
    #[error("unknown symbol: {symbol}")]
    SymbolUnknown { symbol: String },
    #[error("transient failure")]
    Transient,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExecutionResult {
    Success { broker_order_id: String },
    Failure(GatewayError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CloseResult {
    Closed { profit: f64 },
    Failure(GatewayError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ModifyResult {
    Ok,
    Failure(GatewayError),
}

/// Events emitted on a connected account stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StreamEvent {
    PositionCreated(Position),
    PositionUpdated(Position),
    PositionRemoved { position_id: String },
    AccountInfoUpdated(AccountInfo),
}

/// Opaque façade the rest of the engine depends on. One concrete
/// implementation per deployment; the engine only ever sees this trait.
#[async_trait]
pub trait BrokerGateway: Send + Sync {
    async fn connect_stream(&self, account: &AccountRef) -> anyhow::Result<mpsc::Receiver<StreamEvent>>;
    async fn get_positions(&self, account: &AccountRef) -> Result<Vec<Position>, GatewayError>;
    async fn execute_trade(&self, account: &AccountRef, order: &OrderRequest) -> ExecutionResult;
    async fn modify_position(
        &self,
        account: &AccountRef,
        position_id: &str,
        sl: Option<f64>,
        tp: Option<f64>,
    ) -> ModifyResult;
    async fn close_position(&self, account: &AccountRef, position_id: &str) -> CloseResult;
    async fn get_account_info(&self, account: &AccountRef) -> Result<AccountInfo, GatewayError>;

    /// Current consecutive-failure count for `account`. Read-only — tracking
    /// never blocks a call.
    fn consecutive_failures(&self, account: &AccountRef) -> u32;
}

struct AccountBook {
    positions: Vec<Position>,
    account_info: AccountInfo,
    stream_sender: Option<mpsc::Sender<StreamEvent>>,
}

/// Deterministic paper-trading gateway. Fills every well-formed order
/// immediately at the requested price; rejects orders for the sentinel
/// symbol `"UNKNOWN"` or when requested notional would exceed available
/// margin, so the engine's reject/insufficient-margin paths are exercisable
/// without a live broker.
pub struct DemoGateway {
    books: RwLock<HashMap<AccountRef, AccountBook>>,
    failures: RwLock<HashMap<AccountRef, AtomicU32>>,
}

impl DemoGateway {
    pub fn new() -> Self {
        Self {
            books: RwLock::new(HashMap::new()),
            failures: RwLock::new(HashMap::new()),
        }
    }

    /// Seed an account with a starting balance, used by main.rs/tests to
    /// bootstrap demo accounts before routes start.
    pub fn seed_account(&self, account: AccountRef, balance: f64) {
        let mut books = self.books.write();
        books.entry(account).or_insert_with(|| AccountBook {
            positions: Vec::new(),
            account_info: AccountInfo {
                balance,
                equity: balance,
                margin: 0.0,
                free_margin: balance,
                currency: "USD".into(),
                leverage: 100.0,
            },
            stream_sender: None,
        });
    }

    fn record_failure(&self, account: &AccountRef) {
        let mut failures = self.failures.write();
        let counter = failures.entry(account.clone()).or_insert_with(|| AtomicU32::new(0));
        let n = counter.fetch_add(1, Ordering::Relaxed) + 1;
        if n == 3 {
            warn!(account = %account, failures = n, "broker gateway: sustained consecutive failures");
        }
    }

    fn record_success(&self, account: &AccountRef) {
        let failures = self.failures.read();
        if let Some(counter) = failures.get(account) {
            counter.store(0, Ordering::Relaxed);
        }
    }

    fn emit(&self, account: &AccountRef, event: StreamEvent) {
        let books = self.books.read();
        if let Some(book) = books.get(account) {
            if let Some(sender) = &book.stream_sender {
                // Best-effort: a full channel means a slow/disconnected
                // consumer, which the pipeline will observe as staleness
                // via its own timeouts rather than this call blocking.
                let _ = sender.try_send(event);
            }
        }
    }
}

impl Default for DemoGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerGateway for DemoGateway {
    async fn connect_stream(&self, account: &AccountRef) -> anyhow::Result<mpsc::Receiver<StreamEvent>> {
        let (tx, rx) = mpsc::channel(256);
        let mut books = self.books.write();
        let book = books.entry(account.clone()).or_insert_with(|| AccountBook {
            positions: Vec::new(),
            account_info: AccountInfo {
                balance: 0.0,
                equity: 0.0,
                margin: 0.0,
                free_margin: 0.0,
                currency: "USD".into(),
                leverage: 100.0,
            },
            stream_sender: None,
        });
        book.stream_sender = Some(tx);
        info!(account = %account, "broker gateway: stream connected");
        Ok(rx)
    }

    async fn get_positions(&self, account: &AccountRef) -> Result<Vec<Position>, GatewayError> {
        let books = self.books.read();
        match books.get(account) {
            Some(book) => {
                self.record_success(account);
                Ok(book.positions.clone())
            }
            None => {
                self.record_success(account);
                Ok(Vec::new())
            }
        }
    }

    async fn execute_trade(&self, account: &AccountRef, order: &OrderRequest) -> ExecutionResult {
        if order.symbol.eq_ignore_ascii_case("UNKNOWN") {
            self.record_failure(account);
            return ExecutionResult::Failure(GatewayError::SymbolUnknown {
                symbol: order.symbol.clone(),
            });
        }

        let mut books = self.books.write();
        let Some(book) = books.get_mut(account) else {
            self.record_failure(account);
            return ExecutionResult::Failure(GatewayError::Transient);
        };

        let notional = order.volume * 100_000.0;
        if notional > book.account_info.free_margin * book.account_info.leverage {
            self.record_failure(account);
            return ExecutionResult::Failure(GatewayError::InsufficientMargin);
        }

        let order_id = uuid::Uuid::new_v4().to_string();
        let position = Position {
            position_id: order_id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            volume: order.volume,
            open_price: 0.0,
            open_time: Utc::now(),
            stop_loss: order.stop_loss,
            take_profit: order.take_profit,
            comment: order.comment.clone(),
            current_price: 0.0,
            profit: 0.0,
            route_id: None,
            source_position_id: None,
            sizing: None,
        };
        book.positions.push(position);
        book.account_info.margin += notional / book.account_info.leverage;
        book.account_info.free_margin = (book.account_info.balance - book.account_info.margin).max(0.0);
        drop(books);

        self.record_success(account);
        ExecutionResult::Success { broker_order_id: order_id }
    }

    async fn modify_position(
        &self,
        account: &AccountRef,
        position_id: &str,
        sl: Option<f64>,
        tp: Option<f64>,
    ) -> ModifyResult {
        let mut books = self.books.write();
        let Some(book) = books.get_mut(account) else {
            self.record_failure(account);
            return ModifyResult::Failure(GatewayError::Transient);
        };
        match book.positions.iter_mut().find(|p| p.position_id == position_id) {
            Some(position) => {
                if sl.is_some() {
                    position.stop_loss = sl;
                }
                if tp.is_some() {
                    position.take_profit = tp;
                }
                drop(books);
                self.record_success(account);
                ModifyResult::Ok
            }
            None => {
                drop(books);
                self.record_failure(account);
                ModifyResult::Failure(GatewayError::Rejected {
                    reason: "position not found".into(),
                })
            }
        }
    }

    async fn close_position(&self, account: &AccountRef, position_id: &str) -> CloseResult {
        let mut books = self.books.write();
        let Some(book) = books.get_mut(account) else {
            self.record_failure(account);
            return CloseResult::Failure(GatewayError::Transient);
        };
        match book.positions.iter().position(|p| p.position_id == position_id) {
            Some(idx) => {
                let position = book.positions.remove(idx);
                let profit = position.profit;
                book.account_info.balance += profit;
                book.account_info.equity = book.account_info.balance;
                drop(books);
                self.record_success(account);
                CloseResult::Closed { profit }
            }
            None => {
                drop(books);
                self.record_failure(account);
                CloseResult::Failure(GatewayError::Rejected {
                    reason: "position not found".into(),
                })
            }
        }
    }

    async fn get_account_info(&self, account: &AccountRef) -> Result<AccountInfo, GatewayError> {
        let books = self.books.read();
        match books.get(account) {
            Some(book) => {
                self.record_success(account);
                Ok(book.account_info.clone())
            }
            None => {
                self.record_success(account);
                Err(GatewayError::Transient)
            }
        }
    }

    fn consecutive_failures(&self, account: &AccountRef) -> u32 {
        let failures = self.failures.read();
        failures
            .get(account)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

/// Shared handle to the configured gateway implementation.
pub type SharedGateway = Arc<dyn BrokerGateway>;

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> AccountRef {
        AccountRef { account_id: "acct-1".into(), region: "us".into() }
    }

    #[tokio::test]
    async fn execute_trade_succeeds_and_resets_failure_counter() {
        let gw = DemoGateway::new();
        let acct = account();
        gw.seed_account(acct.clone(), 10_000.0);

        let order = OrderRequest {
            symbol: "XAUUSD".into(),
            side: Side::Long,
            volume: 0.1,
            stop_loss: None,
            take_profit: None,
            comment: Some("copy:r1:s1".into()),
        };
        let result = gw.execute_trade(&acct, &order).await;
        assert!(matches!(result, ExecutionResult::Success { .. }));
        assert_eq!(gw.consecutive_failures(&acct), 0);
    }

    #[tokio::test]
    async fn execute_trade_rejects_unknown_symbol() {
        let gw = DemoGateway::new();
        let acct = account();
        gw.seed_account(acct.clone(), 10_000.0);

        let order = OrderRequest {
            symbol: "UNKNOWN".into(),
            side: Side::Long,
            volume: 0.1,
            stop_loss: None,
            take_profit: None,
            comment: None,
        };
        let result = gw.execute_trade(&acct, &order).await;
        assert!(matches!(
            result,
            ExecutionResult::Failure(GatewayError::SymbolUnknown { .. })
        ));
        assert_eq!(gw.consecutive_failures(&acct), 1);
    }

    #[tokio::test]
    async fn close_position_removes_it_and_credits_profit() {
        let gw = DemoGateway::new();
        let acct = account();
        gw.seed_account(acct.clone(), 10_000.0);

        let order = OrderRequest {
            symbol: "XAUUSD".into(),
            side: Side::Long,
            volume: 0.1,
            stop_loss: None,
            take_profit: None,
            comment: None,
        };
        let result = gw.execute_trade(&acct, &order).await;
        let ExecutionResult::Success { broker_order_id } = result else {
            panic!("expected success");
        };

        let close = gw.close_position(&acct, &broker_order_id).await;
        assert!(matches!(close, CloseResult::Closed { .. }));

        let positions = gw.get_positions(&acct).await.unwrap();
        assert!(positions.is_empty());
    }

    #[tokio::test]
    async fn repeated_failures_accumulate_then_reset_on_success() {
        let gw = DemoGateway::new();
        let acct = account();
        gw.seed_account(acct.clone(), 10_000.0);

        for _ in 0..3 {
            let order = OrderRequest {
                symbol: "UNKNOWN".into(),
                side: Side::Long,
                volume: 0.1,
                stop_loss: None,
                take_profit: None,
                comment: None,
            };
            gw.execute_trade(&acct, &order).await;
        }
        assert_eq!(gw.consecutive_failures(&acct), 3);

        let order = OrderRequest {
            symbol: "XAUUSD".into(),
            side: Side::Long,
            volume: 0.1,
            stop_loss: None,
            take_profit: None,
            comment: None,
        };
        gw.execute_trade(&acct, &order).await;
        assert_eq!(gw.consecutive_failures(&acct), 0);
    }
}
