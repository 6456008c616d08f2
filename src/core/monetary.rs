/// Ledger monetary system
///
/// Amounts are integer base units. One coin is 100,000,000 base units, the
/// same split Bitcoin uses for satoshis, so fractional fees such as 0.1 coin
/// are exact.
///
/// Number of base units in one coin
pub const SATOSHIS_PER_COIN: u64 = 100_000_000;

/// Default block reward in base units (50 coins)
pub const INITIAL_BLOCK_REWARD: u64 = 50 * SATOSHIS_PER_COIN;

/// Default emission cap in base units (21 million coins)
pub const DEFAULT_SUPPLY_CAP: u64 = 21_000_000 * SATOSHIS_PER_COIN;

/// Utility functions for monetary conversions
pub mod conversions {
    use super::*;
    use crate::error::{BlockchainError, Result};

    /// Convert coins to base units, rounding to the nearest unit
    ///
    /// # Examples
    /// ```
    /// use ledger_forge::core::monetary::conversions::coins_to_satoshis;
    /// assert_eq!(coins_to_satoshis(1.0), 100_000_000);
    /// assert_eq!(coins_to_satoshis(0.1), 10_000_000);
    /// ```
    pub fn coins_to_satoshis(coins: f64) -> u64 {
        (coins * SATOSHIS_PER_COIN as f64).round() as u64
    }

    /// Convert base units to coins
    pub fn satoshis_to_coins(satoshis: u64) -> f64 {
        satoshis as f64 / SATOSHIS_PER_COIN as f64
    }

    /// Format base units as a human-readable string
    ///
    /// # Examples
    /// ```
    /// use ledger_forge::core::monetary::conversions::format_satoshis;
    /// assert_eq!(format_satoshis(100_000_000), "1.00000000 coins");
    /// ```
    pub fn format_satoshis(satoshis: u64) -> String {
        format!("{:.8} coins", satoshis_to_coins(satoshis))
    }

    /// Exact coin rendering of a signed account balance, any magnitude
    pub fn format_balance(balance: i128) -> String {
        let per_coin = u128::from(SATOSHIS_PER_COIN);
        let magnitude = balance.unsigned_abs();
        let sign = if balance < 0 { "-" } else { "" };
        format!(
            "{sign}{}.{:08} coins",
            magnitude / per_coin,
            magnitude % per_coin
        )
    }

    /// Parse a decimal coin amount such as `"10"` or `"0.1"` into base units
    pub fn parse_coins(text: &str) -> Result<u64> {
        let coins: f64 = text
            .trim()
            .parse()
            .map_err(|e| BlockchainError::InvalidTransaction(format!("bad amount {text}: {e}")))?;
        if !coins.is_finite() || coins < 0.0 {
            return Err(BlockchainError::InvalidTransaction(format!(
                "amount must be a non-negative number, got {text}"
            )));
        }
        if coins * SATOSHIS_PER_COIN as f64 > u64::MAX as f64 {
            return Err(BlockchainError::InvalidTransaction(format!(
                "amount {text} overflows"
            )));
        }
        Ok(coins_to_satoshis(coins))
    }
}

#[cfg(test)]
mod tests {
    use super::conversions::*;
    use super::*;

    #[test]
    fn test_monetary_constants() {
        assert_eq!(SATOSHIS_PER_COIN, 100_000_000);
        assert_eq!(INITIAL_BLOCK_REWARD, 50 * SATOSHIS_PER_COIN);
        const _: () = assert!(INITIAL_BLOCK_REWARD < DEFAULT_SUPPLY_CAP);
    }

    #[test]
    fn test_conversions() {
        assert_eq!(coins_to_satoshis(1.0), SATOSHIS_PER_COIN);
        assert_eq!(coins_to_satoshis(0.1), SATOSHIS_PER_COIN / 10);
        assert_eq!(satoshis_to_coins(SATOSHIS_PER_COIN / 2), 0.5);
        assert_eq!(format_satoshis(1_000), "0.00001000 coins");
    }

    #[test]
    fn test_format_balance_is_exact_beyond_u64() {
        assert_eq!(format_balance(0), "0.00000000 coins");
        assert_eq!(format_balance(-1_000), "-0.00001000 coins");
        assert_eq!(format_balance(250_000_000), "2.50000000 coins");

        let huge = i128::from(u64::MAX) * 3 + 7;
        assert_eq!(
            format_balance(-huge),
            "-553402322211.28654852 coins"
        );
    }

    #[test]
    fn test_parse_coins() {
        assert_eq!(parse_coins("10").unwrap(), 10 * SATOSHIS_PER_COIN);
        assert_eq!(parse_coins(" 0.1 ").unwrap(), 10_000_000);
        assert!(parse_coins("-1").is_err());
        assert!(parse_coins("abc").is_err());
        assert!(parse_coins("NaN").is_err());
    }
}
