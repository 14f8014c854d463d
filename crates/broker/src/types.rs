//! Wire-level types exchanged with the broker transport.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Option right (call or put).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OptionRight {
    Call,
    Put,
}

impl std::fmt::Display for OptionRight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Call => write!(f, "C"),
            Self::Put => write!(f, "P"),
        }
    }
}

/// What kind of instrument a spec describes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstrumentKind {
    Index,
    Option {
        expiry: NaiveDate,
        strike: Decimal,
        right: OptionRight,
    },
}

/// A symbolic instrument description, resolved by the broker into a
/// numeric instrument id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstrumentSpec {
    pub symbol: String,
    pub kind: InstrumentKind,
    pub exchange: String,
    pub currency: String,
}

impl InstrumentSpec {
    pub fn index(symbol: &str, exchange: &str) -> Self {
        Self {
            symbol: symbol.to_uppercase(),
            kind: InstrumentKind::Index,
            exchange: exchange.to_string(),
            currency: "USD".to_string(),
        }
    }

    pub fn option(
        symbol: &str,
        exchange: &str,
        expiry: NaiveDate,
        strike: Decimal,
        right: OptionRight,
    ) -> Self {
        Self {
            symbol: symbol.to_uppercase(),
            kind: InstrumentKind::Option {
                expiry,
                strike,
                right,
            },
            exchange: exchange.to_string(),
            currency: "USD".to_string(),
        }
    }

    /// Log-friendly description (e.g., "SPX 2025-12-31 5900C").
    pub fn display_name(&self) -> String {
        match &self.kind {
            InstrumentKind::Index => self.symbol.clone(),
            InstrumentKind::Option {
                expiry,
                strike,
                right,
            } => format!("{} {} {}{}", self.symbol, expiry, strike, right),
        }
    }
}

/// Side of a combo leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LegSide {
    Buy,
    Sell,
}

/// One leg of a combo contract, referencing a resolved instrument id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComboLeg {
    pub instrument_id: i64,
    pub ratio: u32,
    pub side: LegSide,
    pub exchange: String,
}

/// A multi-leg combo contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComboContract {
    pub symbol: String,
    pub currency: String,
    pub exchange: String,
    pub legs: Vec<ComboLeg>,
}

impl ComboContract {
    /// Leg instrument ids, ascending. This is the duplicate-detection key.
    pub fn sorted_leg_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.legs.iter().map(|l| l.instrument_id).collect();
        ids.sort_unstable();
        ids
    }
}

/// A price condition attached to an order, evaluated by the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceCondition {
    pub instrument_id: i64,
    pub exchange: String,
    pub threshold: Decimal,
    /// True = trigger when the price rises to or above the threshold.
    pub above: bool,
}

/// The order definition sent to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderTicket {
    pub action: LegSide,
    pub quantity: u32,
    pub kind: spread_stager_core::types::OrderKind,
    pub time_in_force: String,
    pub account: String,
    /// Staged orders are placed with this false; activation flips it.
    pub transmit: bool,
    pub limit_price: Option<Decimal>,
    pub aux_price: Option<Decimal>,
    pub condition: Option<PriceCondition>,
}

/// Broker-reported order status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatusKind {
    PreSubmitted,
    Submitted,
    Filled,
    Cancelled,
    Inactive,
    Rejected,
}

impl OrderStatusKind {
    /// Statuses that park an order in the error-recovery set.
    pub fn is_blocking(&self) -> bool {
        matches!(self, Self::Inactive | Self::Rejected)
    }
}

/// Read-only snapshot of an order already known to the broker, used only
/// for duplicate detection. Refreshed once per daily cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExistingOrder {
    pub order_id: i64,
    pub is_combo: bool,
    /// Leg instrument ids, sorted ascending.
    pub leg_ids: Vec<i64>,
    /// Price-condition threshold, if the order carries one.
    pub trigger_price: Option<Decimal>,
}
