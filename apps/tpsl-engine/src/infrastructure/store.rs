//! In-memory position store adapter.
//!
//! Backs the bundled binary and the test suites. The closed transition
//! holds the map lock across the check and the write, giving the same
//! atomicity a production store provides with a conditional update.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::application::ports::{PositionClose, PositionStorePort, StoreError};
use crate::domain::{AccountId, OrderId, Position, PositionStatus};

/// Per-account trading statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TradeStats {
    /// Settled closes.
    pub trades: u64,
    /// Sum of final profits.
    pub total_profit: Decimal,
    /// Sum of notional volumes.
    pub total_volume: Decimal,
}

/// In-memory [`PositionStorePort`] adapter with fault injection.
#[derive(Debug, Default)]
pub struct InMemoryPositionStore {
    positions: Mutex<HashMap<OrderId, Position>>,
    closes: Mutex<HashMap<OrderId, PositionClose>>,
    balances: Mutex<HashMap<AccountId, Decimal>>,
    stats: Mutex<HashMap<AccountId, TradeStats>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    fail_balance: AtomicBool,
}

impl InMemoryPositionStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a position.
    pub fn insert_position(&self, position: Position) {
        self.positions
            .lock()
            .insert(position.order_id.clone(), position);
    }

    /// Current available balance for an account (zero when unknown).
    #[must_use]
    pub fn available_balance(&self, account_id: &AccountId) -> Decimal {
        self.balances
            .lock()
            .get(account_id)
            .copied()
            .unwrap_or_default()
    }

    /// Seed an account balance.
    pub fn set_balance(&self, account_id: &AccountId, balance: Decimal) {
        self.balances.lock().insert(account_id.clone(), balance);
    }

    /// Recorded close details for an order, if it was closed here.
    #[must_use]
    pub fn close_record(&self, order_id: &OrderId) -> Option<PositionClose> {
        self.closes.lock().get(order_id).cloned()
    }

    /// Trading statistics for an account.
    #[must_use]
    pub fn trade_stats(&self, account_id: &AccountId) -> TradeStats {
        self.stats
            .lock()
            .get(account_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Toggle failure injection on reads.
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Toggle failure injection on close writes.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Toggle failure injection on balance operations.
    pub fn fail_balance_ops(&self, fail: bool) {
        self.fail_balance.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl PositionStorePort for InMemoryPositionStore {
    async fn get_position(&self, order_id: &OrderId) -> Result<Option<Position>, StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Timeout {
                message: "injected read failure".to_string(),
            });
        }
        Ok(self.positions.lock().get(order_id).cloned())
    }

    async fn set_closed(
        &self,
        order_id: &OrderId,
        close: &PositionClose,
    ) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend {
                message: "injected write failure".to_string(),
            });
        }

        let mut positions = self.positions.lock();
        let Some(position) = positions.get_mut(order_id) else {
            return Err(StoreError::NotFound {
                order_id: order_id.clone(),
            });
        };
        if position.status != PositionStatus::Open {
            return Err(StoreError::AlreadyClosed {
                order_id: order_id.clone(),
            });
        }

        position.status = PositionStatus::Closed;
        drop(positions);
        self.closes.lock().insert(order_id.clone(), close.clone());
        Ok(())
    }

    async fn adjust_available_balance(
        &self,
        account_id: &AccountId,
        delta: Decimal,
    ) -> Result<Decimal, StoreError> {
        if self.fail_balance.load(Ordering::SeqCst) {
            return Err(StoreError::Backend {
                message: "injected balance failure".to_string(),
            });
        }

        let mut balances = self.balances.lock();
        let balance = balances.entry(account_id.clone()).or_default();
        *balance += delta;
        Ok(*balance)
    }

    async fn record_trade_stats(
        &self,
        account_id: &AccountId,
        profit: Decimal,
        volume: Decimal,
    ) -> Result<(), StoreError> {
        let mut stats = self.stats.lock();
        let entry = stats.entry(account_id.clone()).or_default();
        entry.trades += 1;
        entry.total_profit += profit;
        entry.total_volume += volume;
        Ok(())
    }
}
