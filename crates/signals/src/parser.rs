//! Extracts candidate signal blocks from raw feed text and normalizes them.

use std::collections::HashMap;

use chrono::NaiveDate;
use regex::Regex;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use thiserror::Error;
use tracing::warn;

use spread_stager_core::clock::previous_trading_day;
use spread_stager_core::config::TradingConfig;
use spread_stager_core::types::{OrderKind, Signal, SignalKey};

#[derive(Error, Debug)]
pub enum SignalParserError {
    #[error("invalid signal pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// Defaults applied to every normalized signal; the feed only carries
/// expiry and strikes.
#[derive(Debug, Clone)]
pub struct SignalDefaults {
    pub order_kind: OrderKind,
    pub limit_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
}

impl From<&TradingConfig> for SignalDefaults {
    fn from(trading: &TradingConfig) -> Self {
        Self {
            order_kind: trading.default_order_kind,
            limit_price: trading.default_limit_price,
            stop_price: trading.default_stop_price,
        }
    }
}

/// Rounds a raw strike to the nearest $5 multiple.
///
/// Tie rule: a `.5` midpoint between two multiples rounds away from zero,
/// so 5902.5 → 5905. Pinned by tests; do not change silently.
pub fn round_to_strike(value: Decimal) -> Decimal {
    ((value / dec!(5)).round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        * dec!(5))
    .normalize()
}

pub struct SignalParser {
    pattern: Regex,
    defaults: SignalDefaults,
}

impl SignalParser {
    pub fn new(pattern: &str, defaults: SignalDefaults) -> Result<Self, SignalParserError> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            defaults,
        })
    }

    /// Extracts and normalizes every signal block in `text`.
    ///
    /// Malformed blocks are skipped with a warning; the scan continues.
    /// `allowed_duplicates` on each signal is the number of signals in this
    /// batch sharing its identity key, so a line repeated twice in the feed
    /// legitimately stages two orders.
    pub fn parse_batch(&self, text: &str) -> Vec<Signal> {
        let mut batch: Vec<Signal> = Vec::new();
        for caps in self.pattern.captures_iter(text) {
            match self.normalize(&caps) {
                Some(signal) => batch.push(signal),
                None => warn!(block = &caps[0], "Skipping malformed signal block"),
            }
        }

        let mut counts: HashMap<SignalKey, usize> = HashMap::new();
        for signal in &batch {
            *counts.entry(signal.key()).or_insert(0) += 1;
        }
        for signal in &mut batch {
            signal.allowed_duplicates = counts[&signal.key()];
        }
        batch
    }

    fn normalize(&self, caps: &regex::Captures<'_>) -> Option<Signal> {
        let raw_expiry = NaiveDate::parse_from_str(caps.get(1)?.as_str(), "%Y-%m-%d").ok()?;
        let short_strike = round_to_strike(caps.get(2)?.as_str().parse::<Decimal>().ok()?);
        let long_strike = round_to_strike(caps.get(3)?.as_str().parse::<Decimal>().ok()?);
        // Derived, never taken from the feed.
        let trigger_price = (long_strike + short_strike) / dec!(2);

        Some(Signal {
            expiry: previous_trading_day(raw_expiry),
            long_strike,
            short_strike,
            trigger_price,
            order_kind: self.defaults.order_kind,
            limit_price: self.defaults.limit_price,
            stop_price: self.defaults.stop_price,
            snap_mid_offset: None,
            allowed_duplicates: 1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spread_stager_core::config::DEFAULT_SIGNAL_PATTERN;

    fn parser() -> SignalParser {
        SignalParser::new(
            DEFAULT_SIGNAL_PATTERN,
            SignalDefaults {
                order_kind: OrderKind::SnapMid,
                limit_price: None,
                stop_price: None,
            },
        )
        .unwrap()
    }

    fn block(expiry: &str, sc: &str, lc: &str) -> String {
        format!("到期日: {expiry} SC: {sc} LC: {lc} 狀態: 未觸發\n")
    }

    #[test]
    fn strike_rounding_vector() {
        assert_eq!(round_to_strike(dec!(5902)), dec!(5900));
        assert_eq!(round_to_strike(dec!(5903)), dec!(5905));
        assert_eq!(round_to_strike(dec!(5897)), dec!(5895));
        assert_eq!(round_to_strike(dec!(5900)), dec!(5900));
        // The documented tie rule: midpoints round away from zero.
        assert_eq!(round_to_strike(dec!(5902.5)), dec!(5905));
    }

    #[test]
    fn trigger_is_the_exact_strike_mean() {
        let signals = parser().parse_batch(&block("2025-12-31", "5905", "5900"));
        assert_eq!(signals.len(), 1);
        let s = &signals[0];
        assert_eq!(s.long_strike, dec!(5900));
        assert_eq!(s.short_strike, dec!(5905));
        assert_eq!(s.trigger_price, dec!(5902.5));
        assert_eq!(s.trigger_price, (s.long_strike + s.short_strike) / dec!(2));
    }

    #[test]
    fn strikes_round_independently_before_the_mean() {
        // 5902 -> 5900, 5908 -> 5910; mean of rounded values, not raw.
        let signals = parser().parse_batch(&block("2025-12-31", "5908", "5902"));
        assert_eq!(signals[0].long_strike, dec!(5900));
        assert_eq!(signals[0].short_strike, dec!(5910));
        assert_eq!(signals[0].trigger_price, dec!(5905));
    }

    #[test]
    fn expiry_rolls_back_to_a_trading_day() {
        // 2025-06-15 is a Sunday; nearest trading day at or before is Friday the 13th.
        let signals = parser().parse_batch(&block("2025-06-15", "5905", "5900"));
        assert_eq!(
            signals[0].expiry,
            NaiveDate::from_ymd_opt(2025, 6, 13).unwrap()
        );
    }

    #[test]
    fn blocks_without_the_untriggered_marker_are_ignored() {
        let text = "到期日: 2025-12-31 SC: 5905 LC: 5900 狀態: 已觸發\n";
        assert!(parser().parse_batch(text).is_empty());
    }

    #[test]
    fn malformed_blocks_are_skipped_and_the_scan_continues() {
        let mut text = block("2025-13-45", "5905", "5900"); // impossible date
        text.push_str(&block("2025-12-31", "5905", "5900"));
        let signals = parser().parse_batch(&text);
        assert_eq!(signals.len(), 1);
        assert_eq!(
            signals[0].expiry,
            NaiveDate::from_ymd_opt(2025, 12, 31).unwrap()
        );
    }

    #[test]
    fn duplicate_allowance_counts_identical_batch_lines() {
        let mut text = block("2025-12-31", "5905", "5900");
        text.push_str(&block("2025-12-31", "5905", "5900"));
        text.push_str(&block("2025-12-31", "5930", "5925"));
        let signals = parser().parse_batch(&text);
        assert_eq!(signals.len(), 3);
        assert_eq!(signals[0].allowed_duplicates, 2);
        assert_eq!(signals[1].allowed_duplicates, 2);
        assert_eq!(signals[2].allowed_duplicates, 1);
    }

    #[test]
    fn rounding_can_merge_near_identical_lines_into_duplicates() {
        // 5902 and 5903 both round toward the same pair? No: 5902->5900,
        // 5903->5905. Use 5901/5902 which both round to 5900.
        let mut text = block("2025-12-31", "5906", "5901");
        text.push_str(&block("2025-12-31", "5907", "5902"));
        let signals = parser().parse_batch(&text);
        assert_eq!(signals[0].key(), signals[1].key());
        assert_eq!(signals[0].allowed_duplicates, 2);
        assert_eq!(signals[1].allowed_duplicates, 2);
    }

    #[test]
    fn empty_text_yields_an_empty_batch() {
        assert!(parser().parse_batch("").is_empty());
    }
}
