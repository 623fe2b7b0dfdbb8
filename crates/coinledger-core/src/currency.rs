use std::collections::BTreeMap;
use std::sync::Arc;

use rust_decimal::Decimal;

use crate::error::LedgerError;

/// A registered currency. Immutable for the server's lifetime: changing
/// `decimals` after balances exist would silently rescale every stored
/// amount.
#[derive(Debug, Clone)]
pub struct Currency {
    pub name: Arc<str>,
    pub symbol: String,
    pub decimals: u32,
    /// Balance granted on lazy account creation, in minor units.
    pub starting_balance: i64,
    /// When true the balance may go negative.
    pub overdraft: bool,
    pub name_singular: String,
    pub name_plural: String,
}

impl Currency {
    /// Renders minor units with the currency's scale, e.g. 12345 -> "$123.45".
    pub fn format(&self, minor_units: i64) -> String {
        let mut amount = Decimal::new(minor_units, self.decimals);
        amount.rescale(self.decimals);
        format!("{}{}", self.symbol, amount)
    }
}

/// All currencies known to the server, built once at startup from the
/// resolved configuration.
#[derive(Debug)]
pub struct CurrencyRegistry {
    by_name: BTreeMap<Arc<str>, Arc<Currency>>,
    default_name: Arc<str>,
}

impl CurrencyRegistry {
    /// The first currency in `currencies` becomes the default.
    pub fn new(currencies: Vec<Currency>) -> Result<Self, LedgerError> {
        if currencies.is_empty() {
            return Err(LedgerError::UnknownCurrency(
                "no currencies configured".to_string(),
            ));
        }
        let default_name = currencies[0].name.clone();
        let mut by_name = BTreeMap::new();
        for currency in currencies {
            if by_name
                .insert(currency.name.clone(), Arc::new(currency))
                .is_some()
            {
                return Err(LedgerError::ConstraintViolation(
                    "duplicate currency name in configuration".to_string(),
                ));
            }
        }
        Ok(Self { by_name, default_name })
    }

    pub fn get(&self, name: &str) -> Result<&Arc<Currency>, LedgerError> {
        self.by_name
            .get(name)
            .ok_or_else(|| LedgerError::UnknownCurrency(name.to_string()))
    }

    pub fn default_currency(&self) -> &Arc<Currency> {
        &self.by_name[&self.default_name]
    }

    pub fn names(&self) -> impl Iterator<Item = &Arc<str>> {
        self.by_name.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coins() -> Currency {
        Currency {
            name: Arc::from("coins"),
            symbol: "$".to_string(),
            decimals: 2,
            starting_balance: 10_000,
            overdraft: false,
            name_singular: "coin".to_string(),
            name_plural: "coins".to_string(),
        }
    }

    #[test]
    fn format_pads_to_scale() {
        let c = coins();
        assert_eq!(c.format(0), "$0.00");
        assert_eq!(c.format(5), "$0.05");
        assert_eq!(c.format(12_345), "$123.45");
        assert_eq!(c.format(-250), "$-2.50");
    }

    #[test]
    fn format_with_zero_decimals() {
        let mut c = coins();
        c.decimals = 0;
        c.symbol = String::new();
        assert_eq!(c.format(42), "42");
    }

    #[test]
    fn registry_defaults_to_first_and_rejects_duplicates() {
        let registry = CurrencyRegistry::new(vec![coins()]).unwrap();
        assert_eq!(registry.default_currency().name.as_ref(), "coins");
        assert!(registry.get("gems").is_err());

        let err = CurrencyRegistry::new(vec![coins(), coins()]).unwrap_err();
        assert!(matches!(err, LedgerError::ConstraintViolation(_)));
    }
}
