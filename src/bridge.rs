use std::sync::Arc;

use uuid::Uuid;

use crate::engine::TransactionEngine;

/// Result shape the external economy-bridge API expects from a provider:
/// the amount moved, the balance after the call, and success or a
/// user-facing failure message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeOutcome {
    Success,
    Failure(String),
}

#[derive(Debug, Clone)]
pub struct BridgeResponse {
    pub amount: i64,
    pub balance: i64,
    pub outcome: BridgeOutcome,
}

impl BridgeResponse {
    fn success(amount: i64, balance: i64) -> Self {
        Self { amount, balance, outcome: BridgeOutcome::Success }
    }

    fn failure(balance: i64, message: String) -> Self {
        Self { amount: 0, balance, outcome: BridgeOutcome::Failure(message) }
    }

    pub fn succeeded(&self) -> bool {
        self.outcome == BridgeOutcome::Success
    }
}

/// The economy-provider contract the host resolves: a fixed method set,
/// implemented exactly once by [`BridgeAdapter`]. Amounts are minor units.
pub trait EconomyBridge: Send + Sync {
    fn has_account(&self, player: Uuid) -> bool;
    fn balance(&self, player: Uuid, currency: &str) -> i64;
    fn deposit(&self, player: Uuid, currency: &str, amount: i64, reason: &str) -> BridgeResponse;
    fn withdraw(&self, player: Uuid, currency: &str, amount: i64, reason: &str) -> BridgeResponse;
    fn format(&self, amount: i64, currency: &str) -> String;
}

/// Pure translation onto the engine; holds no state of its own.
pub struct BridgeAdapter {
    engine: Arc<TransactionEngine>,
}

const BRIDGE_ACTOR: &str = "bridge";

impl BridgeAdapter {
    pub fn new(engine: Arc<TransactionEngine>) -> Self {
        Self { engine }
    }

    fn current_balance(&self, player: Uuid, currency: &str) -> i64 {
        self.engine.balance(player, currency).unwrap_or_else(|e| {
            tracing::error!(%player, currency, error = %e, "bridge balance read failed");
            0
        })
    }
}

impl EconomyBridge for BridgeAdapter {
    fn has_account(&self, player: Uuid) -> bool {
        let currency = self.engine.currencies().default_currency().name.clone();
        self.engine.has_account(player, &currency).unwrap_or(false)
    }

    fn balance(&self, player: Uuid, currency: &str) -> i64 {
        self.current_balance(player, currency)
    }

    fn deposit(&self, player: Uuid, currency: &str, amount: i64, reason: &str) -> BridgeResponse {
        if amount <= 0 {
            return BridgeResponse::failure(
                self.current_balance(player, currency),
                "amount must be positive".to_string(),
            );
        }
        match self.engine.apply(player, currency, amount, BRIDGE_ACTOR, reason) {
            Ok(balance) => BridgeResponse::success(amount, balance),
            Err(e) => BridgeResponse::failure(self.current_balance(player, currency), e.to_string()),
        }
    }

    fn withdraw(&self, player: Uuid, currency: &str, amount: i64, reason: &str) -> BridgeResponse {
        if amount <= 0 {
            return BridgeResponse::failure(
                self.current_balance(player, currency),
                "amount must be positive".to_string(),
            );
        }
        match self.engine.apply(player, currency, -amount, BRIDGE_ACTOR, reason) {
            Ok(balance) => BridgeResponse::success(amount, balance),
            Err(e) => BridgeResponse::failure(self.current_balance(player, currency), e.to_string()),
        }
    }

    fn format(&self, amount: i64, currency: &str) -> String {
        self.engine
            .format(currency, amount)
            .unwrap_or_else(|_| amount.to_string())
    }
}
