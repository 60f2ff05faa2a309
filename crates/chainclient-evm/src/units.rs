//! Fixed-point rendering of token amounts.

use alloy_primitives::U256;

/// Fractional digits a [`DecCoin`] is rendered with.
pub const DEC_COIN_PRECISION: u8 = 18;

fn pow10(exp: u8) -> U256 {
    U256::from(10u64).pow(U256::from(exp))
}

/// Render `amount` base units as a decimal with exactly `decimals`
/// fractional digits.
///
/// ```
/// use alloy_primitives::U256;
/// use chainclient_evm::format_units;
///
/// assert_eq!(format_units(U256::from(1_500_000u64), 6), "1.500000");
/// ```
pub fn format_units(amount: U256, decimals: u8) -> String {
    if decimals == 0 {
        return amount.to_string();
    }
    let scale = pow10(decimals);
    let int = amount / scale;
    let frac = amount % scale;
    format!("{int}.{:0>width$}", frac.to_string(), width = decimals as usize)
}

/// A coin amount in a denomination's base units, rendered in the display
/// denomination with [`DEC_COIN_PRECISION`] fractional digits.
///
/// `DecCoin::new(U256::from(1), 6, "atom")` is one micro-atom and renders as
/// `0.000001000000000000atom`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecCoin {
    pub amount: U256,
    /// Decimals of the base unit relative to the display denomination.
    pub decimals: u8,
    pub denom: String,
}

impl DecCoin {
    pub fn new(amount: U256, decimals: u8, denom: impl Into<String>) -> Self {
        Self {
            amount,
            decimals,
            denom: denom.into(),
        }
    }

    /// The amount scaled to [`DEC_COIN_PRECISION`] decimals. Digits beyond
    /// that precision are truncated.
    pub fn scaled(&self) -> U256 {
        if self.decimals <= DEC_COIN_PRECISION {
            self.amount
                .saturating_mul(pow10(DEC_COIN_PRECISION - self.decimals))
        } else {
            self.amount / pow10(self.decimals - DEC_COIN_PRECISION)
        }
    }
}

impl std::fmt::Display for DecCoin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", format_units(self.scaled(), DEC_COIN_PRECISION), self.denom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_units_pads_fraction() {
        assert_eq!(format_units(U256::ZERO, 18), "0.000000000000000000");
        assert_eq!(format_units(U256::from(10u64).pow(U256::from(18)), 18), "1.000000000000000000");
        assert_eq!(format_units(U256::from(123u64), 2), "1.23");
        assert_eq!(format_units(U256::from(7u64), 0), "7");
    }

    #[test]
    fn micro_atom_decimals() {
        assert_eq!(DecCoin::new(U256::ZERO, 6, "atom").to_string(), "0.000000000000000000atom");
        assert_eq!(DecCoin::new(U256::from(1u64), 6, "atom").to_string(), "0.000001000000000000atom");
        assert_eq!(
            DecCoin::new(U256::from(100_000_000_000u64), 6, "atom").to_string(),
            "100000.000000000000000000atom"
        );
    }

    #[test]
    fn excess_precision_truncates() {
        let coin = DecCoin::new(U256::from(123_456u64), 20, "x");
        assert_eq!(coin.scaled(), U256::from(1_234u64));
    }
}
