use std::sync::Arc;

use uuid::Uuid;

use coinledger_core::AccountKey;

use crate::engine::TransactionEngine;

/// Read-only lookups for the external placeholder-text provider.
///
/// These are called at display frequency (scoreboards, chat formats, tab
/// lists), so they are served from the balance cache exclusively — never a
/// backend round trip. A player with no cached entry renders the currency's
/// starting balance, which is what lazy creation would produce.
pub struct PlaceholderSource {
    engine: Arc<TransactionEngine>,
}

impl PlaceholderSource {
    pub fn new(engine: Arc<TransactionEngine>) -> Self {
        Self { engine }
    }

    /// Supported identifiers: `balance`, `balance_formatted`, and the same
    /// with a `_<currency>` suffix. Unknown identifiers return `None` so
    /// the provider can fall through to other expansions.
    pub fn lookup(&self, player: Uuid, identifier: &str) -> Option<String> {
        let (formatted, currency_name) = if identifier == "balance" {
            (false, None)
        } else if identifier == "balance_formatted" {
            (true, None)
        } else if let Some(name) = identifier.strip_prefix("balance_formatted_") {
            (true, Some(name))
        } else if let Some(name) = identifier.strip_prefix("balance_") {
            (false, Some(name))
        } else {
            return None;
        };

        let currencies = self.engine.currencies();
        let currency = match currency_name {
            Some(name) => currencies.get(name).ok()?,
            None => currencies.default_currency(),
        };

        let key = AccountKey::new(player, currency.name.clone());
        let balance = self
            .engine
            .cache()
            .peek(&key)
            .map(|cached| cached.balance)
            .unwrap_or(currency.starting_balance);

        Some(if formatted {
            currency.format(balance)
        } else {
            balance.to_string()
        })
    }
}
