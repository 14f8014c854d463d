//! Builds combo conditional orders from signals and places them
//! untransmitted, with duplicate suppression against both the broker's
//! snapshot and the current session's managed set.

use std::sync::Arc;

use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{debug, info, warn};

use spread_stager_broker::resolver::{InstrumentResolver, ResolveError};
use spread_stager_broker::session::{BrokerSession, SessionError};
use spread_stager_broker::types::{
    ComboContract, ComboLeg, ExistingOrder, LegSide, OptionRight, OrderTicket, PriceCondition,
};
use spread_stager_core::config::{AppConfig, TradingConfig};
use spread_stager_core::types::{signal_hash, OrderKind, Signal};

#[derive(Error, Debug)]
pub enum StageError {
    #[error("leg resolution failed: {0}")]
    Resolution(#[from] ResolveError),

    #[error("{kind} order requires a {field}")]
    MissingField { kind: OrderKind, field: &'static str },

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// An order this process staged, scoped to the current daily cycle.
/// Never persisted: cross-restart duplicate protection comes from
/// re-querying the broker's own order list each cycle.
#[derive(Debug, Clone)]
pub struct ManagedOrder {
    /// Broker order id. Reassigned when the order is retransmitted.
    pub order_id: i64,
    pub trigger_price: Decimal,
    pub long_strike: Decimal,
    pub short_strike: Decimal,
    pub contract: ComboContract,
    pub ticket: OrderTicket,
    /// Content hash of the staged identity, for log reconciliation.
    pub content_hash: u64,
}

impl ManagedOrder {
    pub fn sorted_leg_ids(&self) -> Vec<i64> {
        self.contract.sorted_leg_ids()
    }
}

/// True iff staging one more order for this (leg ids, trigger) pair would
/// exceed the signal's duplicate allowance.
///
/// With `allowed_duplicates = N`, the Nth identical occurrence is accepted
/// and the (N+1)th rejected.
pub fn is_duplicate(
    leg_ids: &[i64],
    trigger_price: Decimal,
    existing: &[ExistingOrder],
    managed: &[ManagedOrder],
    allowed_duplicates: usize,
) -> bool {
    let existing_matches = existing
        .iter()
        .filter(|o| {
            o.is_combo && o.leg_ids == leg_ids && o.trigger_price == Some(trigger_price)
        })
        .count();
    let managed_matches = managed
        .iter()
        .filter(|m| m.sorted_leg_ids() == leg_ids && m.trigger_price == trigger_price)
        .count();
    existing_matches + managed_matches >= allowed_duplicates
}

/// Builds the two-leg combo: buy the long leg, sell the short leg, 1:1.
/// Legs are stored sorted ascending by resolved instrument id.
pub fn build_combo(
    trading: &TradingConfig,
    long_leg_id: i64,
    short_leg_id: i64,
) -> ComboContract {
    let mut legs = vec![
        ComboLeg {
            instrument_id: long_leg_id,
            ratio: 1,
            side: LegSide::Buy,
            exchange: trading.option_exchange.clone(),
        },
        ComboLeg {
            instrument_id: short_leg_id,
            ratio: 1,
            side: LegSide::Sell,
            exchange: trading.option_exchange.clone(),
        },
    ];
    legs.sort_by_key(|leg| leg.instrument_id);
    ComboContract {
        symbol: trading.underlying_symbol.clone(),
        currency: "USD".to_string(),
        exchange: trading.option_exchange.clone(),
        legs,
    }
}

/// Populates the order ticket from the signal, applying the per-order-type
/// required-field table. `PEG MID` has no literal broker equivalent and is
/// mapped to the relative type here; it must carry a price cap.
pub fn build_ticket(
    trading: &TradingConfig,
    account: &str,
    signal: &Signal,
    trigger_instrument_id: i64,
    transmit: bool,
) -> Result<OrderTicket, StageError> {
    let mut kind = signal.order_kind;
    let mut limit_price = None;
    let mut aux_price = None;

    match signal.order_kind {
        OrderKind::Limit => {
            limit_price = Some(signal.limit_price.ok_or(StageError::MissingField {
                kind,
                field: "limit price",
            })?);
        }
        OrderKind::Stop => {
            aux_price = Some(signal.stop_price.ok_or(StageError::MissingField {
                kind,
                field: "stop price",
            })?);
        }
        OrderKind::StopLimit => {
            limit_price = Some(signal.limit_price.ok_or(StageError::MissingField {
                kind,
                field: "limit price",
            })?);
            aux_price = Some(signal.stop_price.ok_or(StageError::MissingField {
                kind,
                field: "stop price",
            })?);
        }
        OrderKind::SnapMid => {
            // The broker carries the snap offset in the aux price field.
            aux_price = Some(signal.snap_mid_offset.unwrap_or(trading.snap_mid_offset));
        }
        OrderKind::PegMid => {
            let cap = signal.limit_price.ok_or(StageError::MissingField {
                kind,
                field: "price cap",
            })?;
            kind = OrderKind::Relative;
            limit_price = Some(cap);
            aux_price = signal.snap_mid_offset;
        }
        OrderKind::SnapMkt
        | OrderKind::Market
        | OrderKind::Relative
        | OrderKind::Trail
        | OrderKind::TrailLimit => {
            limit_price = signal.limit_price;
            aux_price = signal.stop_price;
        }
    }

    Ok(OrderTicket {
        action: LegSide::Buy,
        quantity: 1,
        kind,
        time_in_force: "DAY".to_string(),
        account: account.to_string(),
        transmit,
        limit_price,
        aux_price,
        condition: Some(PriceCondition {
            instrument_id: trigger_instrument_id,
            exchange: trading.underlying_exchange.clone(),
            threshold: signal.trigger_price,
            above: true,
        }),
    })
}

pub struct OrderStager {
    session: Arc<BrokerSession>,
    resolver: Arc<InstrumentResolver>,
    trading: TradingConfig,
    account: String,
}

impl OrderStager {
    pub fn new(
        session: Arc<BrokerSession>,
        resolver: Arc<InstrumentResolver>,
        config: &AppConfig,
    ) -> Self {
        Self {
            session,
            resolver,
            trading: config.trading.clone(),
            account: config.broker.account.clone(),
        }
    }

    /// Stages one signal: resolve both legs, suppress duplicates, place
    /// the combo untransmitted. `Ok(None)` is a deliberate duplicate skip.
    pub async fn stage(
        &self,
        signal: &Signal,
        trigger_instrument_id: i64,
        existing: &[ExistingOrder],
        managed: &[ManagedOrder],
    ) -> Result<Option<ManagedOrder>, StageError> {
        let long_leg_id = self
            .resolver
            .resolve_option(signal.expiry, signal.long_strike, OptionRight::Call)
            .await?;
        let short_leg_id = self
            .resolver
            .resolve_option(signal.expiry, signal.short_strike, OptionRight::Call)
            .await?;
        self.stage_resolved(
            signal,
            long_leg_id,
            short_leg_id,
            trigger_instrument_id,
            existing,
            managed,
            false,
        )
        .await
    }

    /// Places an order for a signal whose legs are already resolved.
    /// Recovery uses this with `transmit = true` — the market is open, so
    /// the staged intermediate is skipped.
    #[allow(clippy::too_many_arguments)]
    pub async fn stage_resolved(
        &self,
        signal: &Signal,
        long_leg_id: i64,
        short_leg_id: i64,
        trigger_instrument_id: i64,
        existing: &[ExistingOrder],
        managed: &[ManagedOrder],
        transmit: bool,
    ) -> Result<Option<ManagedOrder>, StageError> {
        let contract = build_combo(&self.trading, long_leg_id, short_leg_id);
        let leg_ids = contract.sorted_leg_ids();

        if is_duplicate(
            &leg_ids,
            signal.trigger_price,
            existing,
            managed,
            signal.allowed_duplicates,
        ) {
            info!(
                long = %signal.long_strike,
                short = %signal.short_strike,
                trigger = %signal.trigger_price,
                allowed = signal.allowed_duplicates,
                "Duplicate order suppressed"
            );
            return Ok(None);
        }

        let ticket = build_ticket(
            &self.trading,
            &self.account,
            signal,
            trigger_instrument_id,
            transmit,
        )?;
        let order_id = self.session.take_order_id();
        self.session.place_order(order_id, &contract, &ticket).await?;
        info!(
            order_id,
            kind = %ticket.kind,
            trigger = %signal.trigger_price,
            transmit,
            "Order placed"
        );

        Ok(Some(ManagedOrder {
            order_id,
            trigger_price: signal.trigger_price,
            long_strike: signal.long_strike,
            short_strike: signal.short_strike,
            contract,
            ticket,
            content_hash: signal_hash(&signal.identifier(&self.trading.underlying_symbol)),
        }))
    }

    /// Stages a whole batch. Any single-signal failure is isolated: the
    /// signal is deferred to the backlog and the batch continues.
    pub async fn process_batch(
        &self,
        signals: &[Signal],
        trigger_instrument_id: i64,
        existing: &[ExistingOrder],
        managed: &mut Vec<ManagedOrder>,
        backlog: &mut Vec<Signal>,
    ) {
        for signal in signals {
            match self
                .stage(signal, trigger_instrument_id, existing, managed)
                .await
            {
                Ok(Some(order)) => managed.push(order),
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        long = %signal.long_strike,
                        short = %signal.short_strike,
                        expiry = %signal.expiry,
                        error = %e,
                        "Could not stage signal; deferring to recovery backlog"
                    );
                    if backlog.iter().any(|s| s.key() == signal.key()) {
                        debug!("Signal already in backlog; skipping duplicate entry");
                    } else {
                        backlog.push(signal.clone());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    fn trading() -> TradingConfig {
        AppConfig::default().trading
    }

    fn signal(kind: OrderKind) -> Signal {
        Signal {
            expiry: NaiveDate::from_ymd_opt(2025, 12, 31).unwrap(),
            long_strike: dec!(5900),
            short_strike: dec!(5905),
            trigger_price: dec!(5902.5),
            order_kind: kind,
            limit_price: None,
            stop_price: None,
            snap_mid_offset: None,
            allowed_duplicates: 1,
        }
    }

    fn managed_with(leg_ids: (i64, i64), trigger: Decimal) -> ManagedOrder {
        let contract = build_combo(&trading(), leg_ids.0, leg_ids.1);
        ManagedOrder {
            order_id: 1,
            trigger_price: trigger,
            long_strike: dec!(5900),
            short_strike: dec!(5905),
            contract,
            ticket: build_ticket(&trading(), "", &signal(OrderKind::SnapMid), 9, false).unwrap(),
            content_hash: 0,
        }
    }

    #[test]
    fn duplicate_boundary_is_exactly_monotonic() {
        let existing: Vec<ExistingOrder> = Vec::new();
        for allowed in 1..=3usize {
            let mut managed = Vec::new();
            // The first `allowed` occurrences are accepted...
            for _ in 0..allowed {
                assert!(!is_duplicate(
                    &[111, 222],
                    dec!(5902.5),
                    &existing,
                    &managed,
                    allowed
                ));
                managed.push(managed_with((111, 222), dec!(5902.5)));
            }
            // ...and the next one is rejected.
            assert!(is_duplicate(
                &[111, 222],
                dec!(5902.5),
                &existing,
                &managed,
                allowed
            ));
        }
    }

    #[test]
    fn existing_broker_orders_count_toward_the_allowance() {
        let existing = vec![ExistingOrder {
            order_id: 7,
            is_combo: true,
            leg_ids: vec![111, 222],
            trigger_price: Some(dec!(5902.5)),
        }];
        assert!(is_duplicate(&[111, 222], dec!(5902.5), &existing, &[], 1));
        // A different trigger is a different order.
        assert!(!is_duplicate(&[111, 222], dec!(5910), &existing, &[], 1));
        // Non-combo orders never match.
        let plain = vec![ExistingOrder {
            order_id: 8,
            is_combo: false,
            leg_ids: vec![111, 222],
            trigger_price: Some(dec!(5902.5)),
        }];
        assert!(!is_duplicate(&[111, 222], dec!(5902.5), &plain, &[], 1));
    }

    #[test]
    fn combo_legs_are_sorted_ascending_with_sides_kept() {
        // Long leg resolves to the higher id; sorting must not swap sides.
        let contract = build_combo(&trading(), 222, 111);
        assert_eq!(contract.sorted_leg_ids(), vec![111, 222]);
        assert_eq!(contract.legs[0].instrument_id, 111);
        assert_eq!(contract.legs[0].side, LegSide::Sell);
        assert_eq!(contract.legs[1].instrument_id, 222);
        assert_eq!(contract.legs[1].side, LegSide::Buy);
    }

    #[test]
    fn limit_order_requires_a_limit_price() {
        let err = build_ticket(&trading(), "", &signal(OrderKind::Limit), 9, false).unwrap_err();
        assert!(matches!(
            err,
            StageError::MissingField {
                kind: OrderKind::Limit,
                field: "limit price"
            }
        ));
        let mut s = signal(OrderKind::Limit);
        s.limit_price = Some(dec!(1.25));
        let ticket = build_ticket(&trading(), "", &s, 9, false).unwrap();
        assert_eq!(ticket.limit_price, Some(dec!(1.25)));
    }

    #[test]
    fn stop_limit_requires_both_prices() {
        let mut s = signal(OrderKind::StopLimit);
        s.limit_price = Some(dec!(1.25));
        assert!(build_ticket(&trading(), "", &s, 9, false).is_err());
        s.stop_price = Some(dec!(1.10));
        let ticket = build_ticket(&trading(), "", &s, 9, false).unwrap();
        assert_eq!(ticket.limit_price, Some(dec!(1.25)));
        assert_eq!(ticket.aux_price, Some(dec!(1.10)));
    }

    #[test]
    fn snap_mid_offset_defaults_from_config() {
        let ticket = build_ticket(&trading(), "", &signal(OrderKind::SnapMid), 9, false).unwrap();
        assert_eq!(ticket.aux_price, Some(dec!(0.5)));

        let mut s = signal(OrderKind::SnapMid);
        s.snap_mid_offset = Some(dec!(0.25));
        let ticket = build_ticket(&trading(), "", &s, 9, false).unwrap();
        assert_eq!(ticket.aux_price, Some(dec!(0.25)));
    }

    #[test]
    fn peg_mid_maps_to_relative_and_requires_a_cap() {
        let err = build_ticket(&trading(), "", &signal(OrderKind::PegMid), 9, false).unwrap_err();
        assert!(matches!(
            err,
            StageError::MissingField {
                kind: OrderKind::PegMid,
                field: "price cap"
            }
        ));
        let mut s = signal(OrderKind::PegMid);
        s.limit_price = Some(dec!(2.50));
        let ticket = build_ticket(&trading(), "", &s, 9, false).unwrap();
        assert_eq!(ticket.kind, OrderKind::Relative);
        assert_eq!(ticket.limit_price, Some(dec!(2.50)));
    }

    #[test]
    fn ticket_carries_the_price_condition_on_the_trigger_instrument() {
        let ticket =
            build_ticket(&trading(), "DU12345", &signal(OrderKind::SnapMid), 416904, false)
                .unwrap();
        let condition = ticket.condition.unwrap();
        assert_eq!(condition.instrument_id, 416904);
        assert_eq!(condition.threshold, dec!(5902.5));
        assert!(condition.above);
        assert!(!ticket.transmit);
        assert_eq!(ticket.account, "DU12345");
    }
}
