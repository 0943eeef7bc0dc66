//! Trading pair metadata from the exchange's market directory.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};

/// One trading pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Market {
    /// Exchange symbol, e.g. `BTCUST` or `DOGE:USD`.
    pub name: String,
    pub base: String,
    pub quote: String,
}

impl Market {
    /// Split an exchange pair symbol into base and quote currency.
    ///
    /// Long symbols carry an explicit `BASE:QUOTE` separator; classic
    /// symbols are base plus a three-letter quote suffix.
    pub fn from_symbol(name: &str) -> Result<Self> {
        if let Some((base, quote)) = name.split_once(':') {
            if base.is_empty() || quote.is_empty() {
                return Err(CoreError::InvalidMarket(name.to_string()));
            }
            return Ok(Self {
                name: name.to_string(),
                base: base.to_string(),
                quote: quote.to_string(),
            });
        }
        if name.len() > 3 {
            let (base, quote) = name.split_at(name.len() - 3);
            return Ok(Self {
                name: name.to_string(),
                base: base.to_string(),
                quote: quote.to_string(),
            });
        }
        Err(CoreError::InvalidMarket(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suffix_symbol() {
        let m = Market::from_symbol("BTCUST").unwrap();
        assert_eq!(m.base, "BTC");
        assert_eq!(m.quote, "UST");
    }

    #[test]
    fn test_colon_symbol() {
        let m = Market::from_symbol("DOGE:USD").unwrap();
        assert_eq!(m.base, "DOGE");
        assert_eq!(m.quote, "USD");
    }

    #[test]
    fn test_short_symbol_rejected() {
        assert!(Market::from_symbol("BTC").is_err());
        assert!(Market::from_symbol(":USD").is_err());
    }
}
