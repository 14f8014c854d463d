use chrono_tz::Tz;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::OrderKind;

/// Immutable application configuration, constructed once at startup and
/// passed into every component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub broker: BrokerConfig,
    pub trading: TradingConfig,
    pub signals: SignalsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Gateway/TWS host (use 127.0.0.1, not localhost — TWS may block IPv6).
    pub host: String,
    /// Gateway port (7496 = live TWS, 7497 = paper).
    pub port: u16,
    /// Client ID (unique per connection).
    pub client_id: i32,
    /// Account the staged orders are placed against.
    pub account: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    /// Underlying index symbol (e.g., "SPX").
    pub underlying_symbol: String,
    /// Exchange for the underlying and the trigger condition.
    pub underlying_exchange: String,
    /// Exchange routing for the option legs.
    pub option_exchange: String,
    /// Exchange timezone for session boundaries.
    pub timezone: Tz,
    /// Order type used when a signal does not carry one.
    pub default_order_kind: OrderKind,
    /// Default limit price for limit-style defaults, if any.
    pub default_limit_price: Option<Decimal>,
    /// Default stop price for stop-style defaults, if any.
    pub default_stop_price: Option<Decimal>,
    /// Offset applied to SNAP MID orders when the signal has none.
    pub snap_mid_offset: Decimal,
    /// Seconds to wait after the open before requesting the official open print.
    pub settle_after_open_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalsConfig {
    /// Block-extraction pattern for the upstream feed. The default matches
    /// the feed's production wire format.
    pub pattern: String,
}

/// Production pattern: expiry date, short strike, long strike, guarded by
/// the feed's untriggered marker token.
pub const DEFAULT_SIGNAL_PATTERN: &str =
    r"到期日:\s*(\d{4}-\d{2}-\d{2})\s*SC:\s*([\d.]+)\s*LC:\s*([\d.]+)[^未觸發]*未觸發";

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig {
                host: "127.0.0.1".to_string(),
                port: 7497,
                client_id: 144,
                account: String::new(),
            },
            trading: TradingConfig {
                underlying_symbol: "SPX".to_string(),
                underlying_exchange: "CBOE".to_string(),
                option_exchange: "SMART".to_string(),
                timezone: chrono_tz::US::Eastern,
                default_order_kind: OrderKind::SnapMid,
                default_limit_price: None,
                default_stop_price: None,
                snap_mid_offset: Decimal::new(5, 1), // 0.5
                settle_after_open_secs: 30,
            },
            signals: SignalsConfig {
                pattern: DEFAULT_SIGNAL_PATTERN.to_string(),
            },
        }
    }
}
