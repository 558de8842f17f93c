//! Position settlement.
//!
//! Every close, whatever path detected it, funnels through here. The
//! store's atomic open-to-closed transition is the serialization point:
//! racing triggers both call in, exactly one wins the write, the loser
//! gets `AlreadyClosed` and treats it as a benign no-op.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::application::ports::{
    Notification, NotificationKind, NotifierPort, PositionClose, PositionStorePort, StoreError,
};
use crate::config::EngineConfig;
use crate::domain::{
    AccountId, CloseReason, OrderId, PnlBreakdown, Position, Symbol, Timestamp, TriggeredBy, pnl,
};
use crate::health::{ComponentHealth, RollingStats, RollingTracker};

/// Machine-readable reason a close request was refused or degraded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseErrorCode {
    /// No position with that order ID.
    NotFound,
    /// Caller does not own the position.
    NotOwned,
    /// Position was already closed; settlement happened elsewhere.
    AlreadyClosed,
    /// Position carries no TP/SL threshold (automatic paths only).
    NoThresholds,
    /// No usable price was available for the close.
    PriceUnavailable,
    /// The store rejected or failed the transition.
    StoreError,
    /// Status transition succeeded but the balance credit did not.
    BalanceError,
}

impl std::fmt::Display for CloseErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => write!(f, "not_found"),
            Self::NotOwned => write!(f, "not_owned"),
            Self::AlreadyClosed => write!(f, "already_closed"),
            Self::NoThresholds => write!(f, "no_thresholds"),
            Self::PriceUnavailable => write!(f, "price_unavailable"),
            Self::StoreError => write!(f, "store_error"),
            Self::BalanceError => write!(f, "balance_error"),
        }
    }
}

/// Outcome of a close attempt.
#[derive(Debug, Clone)]
pub struct ClosureResult {
    /// Order the attempt was for.
    pub order_id: OrderId,
    /// Whether the open-to-closed transition was won by this call.
    pub success: bool,
    /// Whether the balance credit landed (only meaningful on success).
    pub balance_settled: bool,
    /// Failure or degradation code.
    pub error: Option<CloseErrorCode>,
    /// P&L breakdown of the close, when one was computed.
    pub breakdown: Option<PnlBreakdown>,
    /// Price used for the close.
    pub close_price: Option<Decimal>,
    /// Close reason, when the close went through.
    pub reason: Option<CloseReason>,
    /// Account balance after the credit, when it landed.
    pub new_balance: Option<Decimal>,
    /// When the close was recorded.
    pub closed_at: Option<Timestamp>,
}

impl ClosureResult {
    /// A close attempt that never reached the status transition.
    #[must_use]
    pub fn refused(order_id: OrderId, error: CloseErrorCode) -> Self {
        Self {
            order_id,
            success: false,
            balance_settled: false,
            error: Some(error),
            breakdown: None,
            close_price: None,
            reason: None,
            new_balance: None,
            closed_at: None,
        }
    }
}

/// A settled closure, published to interested components.
#[derive(Debug, Clone)]
pub struct ClosureEvent {
    /// Closed order.
    pub order_id: OrderId,
    /// Owning account.
    pub account_id: AccountId,
    /// Market symbol.
    pub symbol: Symbol,
    /// Final profit after commission.
    pub profit: Decimal,
    /// Price the close settled at.
    pub close_price: Decimal,
    /// Why it closed.
    pub reason: CloseReason,
    /// Which path detected the crossing.
    pub triggered_by: TriggeredBy,
}

/// A balance credit that failed after the status write succeeded.
///
/// The position is closed either way; the credit is retried until it
/// lands so funds are never silently lost.
#[derive(Debug, Clone, Serialize)]
pub struct PendingCredit {
    /// Account owed the credit.
    pub account_id: AccountId,
    /// Order that produced it.
    pub order_id: OrderId,
    /// Amount still owed.
    pub amount: Decimal,
    /// Retry attempts so far.
    pub attempts: u32,
}

/// Aggregate settlement counters plus the rolling window snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ClosureStats {
    /// Closes won via take-profit.
    pub take_profit_closes: u64,
    /// Closes won via stop-loss.
    pub stop_loss_closes: u64,
    /// Manual closes routed through the engine.
    pub manual_closes: u64,
    /// Sum of final profits across settled closes.
    pub total_profit: Decimal,
    /// Rolling success/latency window.
    pub rolling: RollingStats,
}

#[derive(Debug, Default)]
struct Counters {
    take_profit: u64,
    stop_loss: u64,
    manual: u64,
    total_profit: Decimal,
}

/// Settlement service: validates, transitions, pays out, notifies.
pub struct SettlementService<S: PositionStorePort, N: NotifierPort> {
    store: Arc<S>,
    notifier: Arc<N>,
    commission_rate: Decimal,
    tracker: Mutex<RollingTracker>,
    counters: Mutex<Counters>,
    pending_credits: Mutex<Vec<PendingCredit>>,
    closure_tx: broadcast::Sender<ClosureEvent>,
}

impl<S: PositionStorePort, N: NotifierPort + 'static> SettlementService<S, N> {
    /// Create a settlement service over the given store and notifier.
    #[must_use]
    pub fn new(store: Arc<S>, notifier: Arc<N>, config: &EngineConfig) -> Self {
        let (closure_tx, _) = broadcast::channel(256);
        Self {
            store,
            notifier,
            commission_rate: config.commission_rate,
            tracker: Mutex::new(RollingTracker::new(config.health.window())),
            counters: Mutex::new(Counters::default()),
            pending_credits: Mutex::new(Vec::new()),
            closure_tx,
        }
    }

    /// Subscribe to settled-closure events.
    #[must_use]
    pub fn closures(&self) -> broadcast::Receiver<ClosureEvent> {
        self.closure_tx.subscribe()
    }

    /// Commission rate this service settles with.
    #[must_use]
    pub const fn commission_rate(&self) -> Decimal {
        self.commission_rate
    }

    /// Close a position at a known price.
    ///
    /// `expected_owner` enables the ownership check for caller-initiated
    /// closes; automatic paths pass `None`. Idempotent: a lost race
    /// reports [`CloseErrorCode::AlreadyClosed`] and changes nothing.
    pub async fn close_position(
        &self,
        order_id: &OrderId,
        close_price: Decimal,
        reason: CloseReason,
        triggered_by: TriggeredBy,
        expected_owner: Option<&AccountId>,
    ) -> ClosureResult {
        let started = Instant::now();

        let position = match self.store.get_position(order_id).await {
            Ok(Some(position)) => position,
            Ok(None) => {
                self.tracker.lock().record_failure();
                return ClosureResult::refused(order_id.clone(), CloseErrorCode::NotFound);
            }
            Err(e) => {
                warn!(order_id = %order_id, error = %e, "position lookup failed");
                self.tracker.lock().record_failure();
                return ClosureResult::refused(order_id.clone(), CloseErrorCode::StoreError);
            }
        };

        if let Some(owner) = expected_owner
            && owner != &position.account_id
        {
            // Not a settlement failure; do not count against health.
            return ClosureResult::refused(order_id.clone(), CloseErrorCode::NotOwned);
        }

        if !position.is_open() {
            debug!(order_id = %order_id, "close requested on already-closed position");
            return ClosureResult::refused(order_id.clone(), CloseErrorCode::AlreadyClosed);
        }

        let breakdown = pnl::compute(
            position.direction,
            position.amount,
            position.leverage,
            position.open_price,
            close_price,
            self.commission_rate,
        );

        let close = PositionClose {
            close_price,
            profit: breakdown.final_profit,
            reason,
            triggered_by,
            closed_at: Timestamp::now(),
        };

        match self.store.set_closed(order_id, &close).await {
            Ok(()) => {}
            Err(StoreError::AlreadyClosed { .. }) => {
                // Lost the race; the winner settles.
                debug!(order_id = %order_id, "lost close race");
                return ClosureResult::refused(order_id.clone(), CloseErrorCode::AlreadyClosed);
            }
            Err(StoreError::NotFound { .. }) => {
                self.tracker.lock().record_failure();
                return ClosureResult::refused(order_id.clone(), CloseErrorCode::NotFound);
            }
            Err(e) => {
                error!(order_id = %order_id, error = %e, "close transition failed");
                self.tracker.lock().record_failure();
                return ClosureResult::refused(order_id.clone(), CloseErrorCode::StoreError);
            }
        }

        // Transition won; everything after this is payout and bookkeeping.
        let (balance_settled, new_balance) = self.settle_funds(&position, &breakdown).await;
        self.record_stats(&position, &breakdown).await;
        self.announce(&position, &breakdown, close_price, reason, triggered_by);

        {
            let mut counters = self.counters.lock();
            match reason {
                CloseReason::TakeProfit => counters.take_profit += 1,
                CloseReason::StopLoss => counters.stop_loss += 1,
                CloseReason::Manual => counters.manual += 1,
            }
            counters.total_profit += breakdown.final_profit;
        }

        if balance_settled {
            self.tracker.lock().record_success(started.elapsed());
        } else {
            self.tracker.lock().record_failure();
        }

        info!(
            order_id = %order_id,
            account_id = %position.account_id,
            symbol = %position.symbol,
            reason = %reason,
            triggered_by = %triggered_by,
            close_price = %close_price,
            profit = %breakdown.final_profit,
            profit_pct = %breakdown.profit_pct,
            "position closed"
        );

        ClosureResult {
            order_id: order_id.clone(),
            success: true,
            balance_settled,
            error: (!balance_settled).then_some(CloseErrorCode::BalanceError),
            breakdown: Some(breakdown),
            close_price: Some(close_price),
            reason: Some(reason),
            new_balance,
            closed_at: Some(close.closed_at),
        }
    }

    /// Credit the stake plus final profit back to the account, floored
    /// at zero so a loss never takes more than the stake. Returns
    /// whether the credit is settled and the resulting balance when the
    /// store reported one.
    async fn settle_funds(
        &self,
        position: &Position,
        breakdown: &PnlBreakdown,
    ) -> (bool, Option<Decimal>) {
        let credit = (position.amount + breakdown.final_profit).max(Decimal::ZERO);

        match self
            .store
            .adjust_available_balance(&position.account_id, credit)
            .await
        {
            Ok(balance) => {
                debug!(
                    account_id = %position.account_id,
                    credit = %credit,
                    balance = %balance,
                    "balance credited"
                );
                (true, Some(balance))
            }
            Err(e) if credit.is_zero() => {
                // Nothing owed; the failure only cost us the balance echo.
                warn!(
                    account_id = %position.account_id,
                    error = %e,
                    "zero-credit balance read failed"
                );
                (true, None)
            }
            Err(e) => {
                error!(
                    account_id = %position.account_id,
                    order_id = %position.order_id,
                    credit = %credit,
                    error = %e,
                    "balance credit failed after close, queued for retry"
                );
                self.pending_credits.lock().push(PendingCredit {
                    account_id: position.account_id.clone(),
                    order_id: position.order_id.clone(),
                    amount: credit,
                    attempts: 0,
                });
                (false, None)
            }
        }
    }

    async fn record_stats(&self, position: &Position, breakdown: &PnlBreakdown) {
        if let Err(e) = self
            .store
            .record_trade_stats(
                &position.account_id,
                breakdown.final_profit,
                breakdown.volume,
            )
            .await
        {
            warn!(account_id = %position.account_id, error = %e, "trade stats update failed");
        }
    }

    fn announce(
        &self,
        position: &Position,
        breakdown: &PnlBreakdown,
        close_price: Decimal,
        reason: CloseReason,
        triggered_by: TriggeredBy,
    ) {
        let kind = if breakdown.final_profit >= Decimal::ZERO {
            NotificationKind::ProfitClose
        } else {
            NotificationKind::LossClose
        };
        let notification = Notification {
            account_id: position.account_id.clone(),
            kind,
            title: format!("{} position closed", position.symbol),
            message: format!(
                "{} closed at {} ({}): {}",
                position.order_id, close_price, reason, breakdown.final_profit
            ),
        };
        let notifier = Arc::clone(&self.notifier);
        tokio::spawn(async move {
            if let Err(e) = notifier.notify(notification).await {
                warn!(error = %e, "closure notification failed");
            }
        });

        let _ = self.closure_tx.send(ClosureEvent {
            order_id: position.order_id.clone(),
            account_id: position.account_id.clone(),
            symbol: position.symbol.clone(),
            profit: breakdown.final_profit,
            close_price,
            reason,
            triggered_by,
        });
    }

    /// Retry queued balance credits; returns how many remain unpaid.
    pub async fn retry_pending_credits(&self) -> usize {
        let pending = std::mem::take(&mut *self.pending_credits.lock());
        if pending.is_empty() {
            return 0;
        }

        let mut still_pending = Vec::new();
        for mut credit in pending {
            match self
                .store
                .adjust_available_balance(&credit.account_id, credit.amount)
                .await
            {
                Ok(_) => {
                    info!(
                        account_id = %credit.account_id,
                        order_id = %credit.order_id,
                        amount = %credit.amount,
                        attempts = credit.attempts + 1,
                        "pending balance credit settled"
                    );
                }
                Err(e) => {
                    credit.attempts += 1;
                    warn!(
                        account_id = %credit.account_id,
                        amount = %credit.amount,
                        attempts = credit.attempts,
                        error = %e,
                        "pending balance credit retry failed"
                    );
                    still_pending.push(credit);
                }
            }
        }

        let remaining = still_pending.len();
        self.pending_credits.lock().extend(still_pending);
        remaining
    }

    /// Snapshot of unpaid credits.
    #[must_use]
    pub fn pending_credits(&self) -> Vec<PendingCredit> {
        self.pending_credits.lock().clone()
    }

    /// Settlement counters plus the rolling window snapshot.
    #[must_use]
    pub fn stats(&self) -> ClosureStats {
        let counters = self.counters.lock();
        ClosureStats {
            take_profit_closes: counters.take_profit,
            stop_loss_closes: counters.stop_loss,
            manual_closes: counters.manual,
            total_profit: counters.total_profit,
            rolling: self.tracker.lock().snapshot(),
        }
    }

    /// Settlement health: unpaid credits make it unhealthy.
    #[must_use]
    pub fn health(&self) -> ComponentHealth {
        if self.pending_credits.lock().is_empty() {
            ComponentHealth::healthy("settlement")
        } else {
            ComponentHealth::unhealthy("settlement", vec!["pending_balance_credits".to_string()])
        }
    }
}
