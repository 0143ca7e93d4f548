//! Subscription tiers and the fixed price table.
//!
//! Prices are exact amounts in nanotons (the ledger's smallest unit). Matching is integer
//! equality; there are no ranges and no decimal arithmetic anywhere on the payment path.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Nanotons per TON.
pub const NANOTONS_PER_TON: u64 = 1_000_000_000;

/// Validity period granted by one payment (30 days).
pub const SUBSCRIPTION_PERIOD_SECS: u64 = 30 * 24 * 3600;

/// Entitlement level. Discriminant is the on-chain tier code; ordering is rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Tier {
    Free = 0,
    Starter = 1,
    Pro = 2,
    Elite = 3,
}

impl Tier {
    pub const ALL: [Tier; 4] = [Tier::Free, Tier::Starter, Tier::Pro, Tier::Elite];

    /// Total mapping from a tier code. Anything outside 0..=3 is `Free`.
    pub fn from_code(code: i128) -> Self {
        match code {
            1 => Tier::Starter,
            2 => Tier::Pro,
            3 => Tier::Elite,
            _ => Tier::Free,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn is_paid(self) -> bool {
        self != Tier::Free
    }

    /// Assistant queries allowed per day on this tier; `None` is unlimited.
    pub fn daily_query_limit(self) -> Option<u32> {
        match self {
            Tier::Free => Some(10),
            Tier::Starter => Some(100),
            Tier::Pro => Some(500),
            Tier::Elite => None,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Tier::Free => "free",
            Tier::Starter => "starter",
            Tier::Pro => "pro",
            Tier::Elite => "elite",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for Tier {
    type Err = UnknownTier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "free" => Ok(Tier::Free),
            "starter" => Ok(Tier::Starter),
            "pro" => Ok(Tier::Pro),
            "elite" => Ok(Tier::Elite),
            _ => Err(UnknownTier(s.to_string())),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown tier {0:?}")]
pub struct UnknownTier(pub String);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PriceTableError {
    #[error("amount {0} is listed more than once")]
    DuplicateAmount(u64),
    #[error("free tier cannot have a price")]
    FreeTierPriced,
    #[error("zero amount is not a valid price")]
    ZeroAmount,
}

/// Immutable mapping from an exact payment amount to the tier it buys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceTierTable {
    prices: BTreeMap<u64, Tier>,
}

impl PriceTierTable {
    pub fn new(entries: impl IntoIterator<Item = (u64, Tier)>) -> Result<Self, PriceTableError> {
        let mut prices = BTreeMap::new();
        for (amount, tier) in entries {
            if tier == Tier::Free {
                return Err(PriceTableError::FreeTierPriced);
            }
            if amount == 0 {
                return Err(PriceTableError::ZeroAmount);
            }
            if prices.insert(amount, tier).is_some() {
                return Err(PriceTableError::DuplicateAmount(amount));
            }
        }
        Ok(Self { prices })
    }

    /// Tier bought by exactly `amount` nanotons, if any.
    pub fn lookup(&self, amount: u64) -> Option<Tier> {
        self.prices.get(&amount).copied()
    }

    /// Price of `tier`, if it is for sale.
    pub fn price_of(&self, tier: Tier) -> Option<u64> {
        self.prices
            .iter()
            .find(|(_, t)| **t == tier)
            .map(|(amount, _)| *amount)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, Tier)> + '_ {
        self.prices.iter().map(|(a, t)| (*a, *t))
    }
}

impl Default for PriceTierTable {
    fn default() -> Self {
        Self {
            prices: BTreeMap::from([
                (30 * NANOTONS_PER_TON, Tier::Starter),
                (130 * NANOTONS_PER_TON, Tier::Pro),
                (300 * NANOTONS_PER_TON, Tier::Elite),
            ]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_discriminants() {
        assert_eq!(Tier::Free as u8, 0);
        assert_eq!(Tier::Starter as u8, 1);
        assert_eq!(Tier::Pro as u8, 2);
        assert_eq!(Tier::Elite as u8, 3);
    }

    #[test]
    fn tiers_order_by_rank() {
        assert!(Tier::Free < Tier::Starter);
        assert!(Tier::Starter < Tier::Pro);
        assert!(Tier::Pro < Tier::Elite);
    }

    #[test]
    fn unknown_codes_are_free() {
        for tier in Tier::ALL {
            assert_eq!(Tier::from_code(tier.code() as i128), tier);
        }
        assert_eq!(Tier::from_code(4), Tier::Free);
        assert_eq!(Tier::from_code(-1), Tier::Free);
        assert_eq!(Tier::from_code(i128::MAX), Tier::Free);
    }

    #[test]
    fn parses_display_names() {
        for tier in Tier::ALL {
            assert_eq!(tier.to_string().parse::<Tier>(), Ok(tier));
        }
        assert_eq!("PRO".parse::<Tier>(), Ok(Tier::Pro));
        assert!("gold".parse::<Tier>().is_err());
    }

    #[test]
    fn default_table_matches_exact_amounts_only() {
        let table = PriceTierTable::default();
        let starter = table.price_of(Tier::Starter).unwrap();
        assert_eq!(table.lookup(starter), Some(Tier::Starter));
        assert_eq!(table.lookup(starter - 1), None);
        assert_eq!(table.lookup(starter + 1), None);
        assert_eq!(table.lookup(table.price_of(Tier::Elite).unwrap()), Some(Tier::Elite));
        assert_eq!(table.price_of(Tier::Free), None);
    }

    #[test]
    fn default_prices_in_nanotons() {
        let table = PriceTierTable::default();
        assert_eq!(table.price_of(Tier::Starter), Some(30_000_000_000));
        assert_eq!(table.price_of(Tier::Pro), Some(130_000_000_000));
        assert_eq!(table.price_of(Tier::Elite), Some(300_000_000_000));
        // 200 TON was the Pro+ price; there is no tier code for it, so it buys nothing
        assert_eq!(table.lookup(200 * NANOTONS_PER_TON), None);
    }

    #[test]
    fn query_limits_grow_with_rank() {
        assert_eq!(Tier::Free.daily_query_limit(), Some(10));
        assert_eq!(Tier::Starter.daily_query_limit(), Some(100));
        assert_eq!(Tier::Pro.daily_query_limit(), Some(500));
        assert_eq!(Tier::Elite.daily_query_limit(), None);
    }

    #[test]
    fn table_rejects_overlap_and_free_price() {
        assert_eq!(
            PriceTierTable::new([(10, Tier::Pro), (10, Tier::Elite)]),
            Err(PriceTableError::DuplicateAmount(10))
        );
        assert_eq!(
            PriceTierTable::new([(10, Tier::Free)]),
            Err(PriceTableError::FreeTierPriced)
        );
        assert_eq!(
            PriceTierTable::new([(0, Tier::Pro)]),
            Err(PriceTableError::ZeroAmount)
        );
    }
}
