//! Domain types shared across the workspace.

use std::fmt;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::str::FromStr;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Broker order types accepted by the stager.
///
/// `PegMid` has no literal broker equivalent and is mapped to `Relative`
/// when the order ticket is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    SnapMid,
    SnapMkt,
    Limit,
    Market,
    Stop,
    StopLimit,
    Relative,
    Trail,
    TrailLimit,
    PegMid,
}

impl fmt::Display for OrderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::SnapMid => "SNAP MID",
            Self::SnapMkt => "SNAP MKT",
            Self::Limit => "LMT",
            Self::Market => "MKT",
            Self::Stop => "STP",
            Self::StopLimit => "STP LMT",
            Self::Relative => "REL",
            Self::Trail => "TRAIL",
            Self::TrailLimit => "TRAIL LIMIT",
            Self::PegMid => "PEG MID",
        };
        write!(f, "{s}")
    }
}

impl FromStr for OrderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "SNAP MID" => Ok(Self::SnapMid),
            "SNAP MKT" => Ok(Self::SnapMkt),
            "LMT" => Ok(Self::Limit),
            "MKT" => Ok(Self::Market),
            "STP" => Ok(Self::Stop),
            "STP LMT" => Ok(Self::StopLimit),
            "REL" => Ok(Self::Relative),
            "TRAIL" => Ok(Self::Trail),
            "TRAIL LIMIT" => Ok(Self::TrailLimit),
            "PEG MID" => Ok(Self::PegMid),
            other => Err(format!("unknown order type: {other}")),
        }
    }
}

/// Identity key of a signal: two orders are "the same" when these match.
///
/// The trigger price is derived from the strikes, so it is redundant in the
/// key, but keeping it makes the duplicate-detection contract explicit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignalKey {
    pub expiry: NaiveDate,
    pub long_strike: Decimal,
    pub short_strike: Decimal,
    pub trigger_price: Decimal,
}

/// A normalized trading signal. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    /// Expiry, already adjusted backward to a trading day.
    pub expiry: NaiveDate,
    /// Long call strike, rounded to the nearest $5.
    pub long_strike: Decimal,
    /// Short call strike, rounded to the nearest $5.
    pub short_strike: Decimal,
    /// Arithmetic mean of the two rounded strikes. Never user-supplied.
    pub trigger_price: Decimal,
    pub order_kind: OrderKind,
    pub limit_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub snap_mid_offset: Option<Decimal>,
    /// How many identical copies of this signal appeared in its gathering
    /// batch. The same number of identical orders may legitimately exist.
    pub allowed_duplicates: usize,
}

impl Signal {
    pub fn key(&self) -> SignalKey {
        SignalKey {
            expiry: self.expiry,
            long_strike: self.long_strike,
            short_strike: self.short_strike,
            trigger_price: self.trigger_price,
        }
    }

    /// Human-readable identifier used in logs and the content hash.
    pub fn identifier(&self, underlying: &str) -> String {
        format!(
            "{underlying}-{}-{}-{}-{}",
            self.expiry, self.long_strike, self.short_strike, self.trigger_price
        )
    }
}

/// Stable content hash of a staged order's identity, kept on the managed
/// order for reconciliation in logs.
pub fn signal_hash(identifier: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    identifier.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn make_signal() -> Signal {
        Signal {
            expiry: NaiveDate::from_ymd_opt(2025, 12, 31).unwrap(),
            long_strike: dec!(5900),
            short_strike: dec!(5905),
            trigger_price: dec!(5902.5),
            order_kind: OrderKind::SnapMid,
            limit_price: None,
            stop_price: None,
            snap_mid_offset: None,
            allowed_duplicates: 1,
        }
    }

    #[test]
    fn order_kind_round_trips_through_display() {
        for kind in [
            OrderKind::SnapMid,
            OrderKind::SnapMkt,
            OrderKind::Limit,
            OrderKind::Market,
            OrderKind::Stop,
            OrderKind::StopLimit,
            OrderKind::Relative,
            OrderKind::Trail,
            OrderKind::TrailLimit,
            OrderKind::PegMid,
        ] {
            assert_eq!(kind.to_string().parse::<OrderKind>().unwrap(), kind);
        }
    }

    #[test]
    fn unknown_order_kind_is_rejected() {
        assert!("MOC".parse::<OrderKind>().is_err());
    }

    #[test]
    fn identical_signals_share_a_key() {
        let a = make_signal();
        let mut b = make_signal();
        b.allowed_duplicates = 2;
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn hash_is_stable_for_equal_identifiers() {
        let s = make_signal();
        let id = s.identifier("SPX");
        assert_eq!(signal_hash(&id), signal_hash(&id));
        assert_eq!(id, "SPX-2025-12-31-5900-5905-5902.5");
    }
}
