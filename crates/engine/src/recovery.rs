//! Post-open error recovery: retries rejected orders and unresolved
//! backlog signals against the live price feed until market close.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use spread_stager_broker::resolver::InstrumentResolver;
use spread_stager_broker::session::BrokerSession;
use spread_stager_broker::types::{ExistingOrder, OptionRight};
use spread_stager_core::types::Signal;

use crate::stager::{ManagedOrder, OrderStager};

const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(30);
/// One-shot substitution distance when a leg keeps failing to resolve.
const STRIKE_FALLBACK: Decimal = rust_decimal_macros::dec!(5);

/// Runs recovery until market close, or earlier once nothing is blocked.
///
/// Retries are strike-gated: nothing is attempted until the live price has
/// reached the minimum long-leg strike across all blocked work, to avoid
/// futile resolution calls while clearly out of range. Whatever remains at
/// close is dropped; the next cycle starts from empty state.
#[allow(clippy::too_many_arguments)]
pub async fn run_until_close(
    session: &Arc<BrokerSession>,
    resolver: &InstrumentResolver,
    stager: &OrderStager,
    managed: &mut Vec<ManagedOrder>,
    backlog: &mut Vec<Signal>,
    existing: &[ExistingOrder],
    trigger_instrument_id: i64,
    close_time: DateTime<Tz>,
    poll: Duration,
) {
    let tz = close_time.timezone();
    let mut last_status: Option<Instant> = None;
    let mut throttled = |message: &str, live: Option<Decimal>| {
        let due = last_status.map_or(true, |t| t.elapsed() >= STATUS_LOG_INTERVAL);
        if due {
            info!(live = ?live, "{message}");
            last_status = Some(Instant::now());
        }
    };

    loop {
        if Utc::now().with_timezone(&tz) >= close_time {
            info!("Market close reached; dropping remaining recovery work");
            break;
        }

        let errors = session.error_order_ids();
        if errors.is_empty() && backlog.is_empty() {
            info!("No blocked orders or backlog signals remain");
            break;
        }

        // An error id with no managed counterpart was resolved elsewhere.
        for order_id in &errors {
            if !managed.iter().any(|m| m.order_id == *order_id) {
                debug!(order_id, "Blocked order no longer managed; clearing");
                session.clear_error_order_id(*order_id);
            }
        }

        let live = session.last_price();
        let mut long_strikes: Vec<Decimal> = managed
            .iter()
            .filter(|m| errors.contains(&m.order_id))
            .map(|m| m.long_strike)
            .collect();
        long_strikes.extend(backlog.iter().map(|s| s.long_strike));

        let (Some(live), Some(min_strike)) = (live, long_strikes.iter().min().copied()) else {
            throttled("Waiting for live price or actionable recovery work", live);
            tokio::time::sleep(poll).await;
            continue;
        };

        if live < min_strike {
            throttled("Live price below recovery gate", Some(live));
            tokio::time::sleep(poll).await;
            continue;
        }

        info!(live = %live, gate = %min_strike, "Live price reached recovery gate");
        retry_blocked_orders(session, managed, live).await;
        retry_backlog(
            resolver,
            stager,
            managed,
            backlog,
            existing,
            trigger_instrument_id,
            live,
        )
        .await;

        tokio::time::sleep(poll).await;
    }
}

/// Reissues each blocked order whose own long-leg strike the live price
/// has reached, under a fresh id with `transmit = true`.
async fn retry_blocked_orders(
    session: &Arc<BrokerSession>,
    managed: &mut [ManagedOrder],
    live: Decimal,
) {
    for order_id in session.error_order_ids() {
        let Some(order) = managed.iter_mut().find(|m| m.order_id == order_id) else {
            continue;
        };
        if live < order.long_strike {
            debug!(order_id, long = %order.long_strike, live = %live, "Retry gate not met");
            continue;
        }
        let new_id = session.take_order_id();
        order.ticket.transmit = true;
        match session
            .place_order(new_id, &order.contract, &order.ticket)
            .await
        {
            Ok(()) => {
                info!(old_id = order_id, new_id, "Reissued blocked order live");
                session.clear_error_order_id(order_id);
                order.order_id = new_id;
            }
            Err(e) => warn!(order_id, error = %e, "Reissue failed; will retry"),
        }
    }
}

/// Re-resolves gated backlog signals and places them directly transmitted.
/// The staged/untransmitted intermediate is skipped — the market is open.
#[allow(clippy::too_many_arguments)]
async fn retry_backlog(
    resolver: &InstrumentResolver,
    stager: &OrderStager,
    managed: &mut Vec<ManagedOrder>,
    backlog: &mut Vec<Signal>,
    existing: &[ExistingOrder],
    trigger_instrument_id: i64,
    live: Decimal,
) {
    let mut remaining = Vec::new();
    for signal in backlog.drain(..) {
        if live < signal.long_strike {
            remaining.push(signal);
            continue;
        }

        let long_leg =
            resolve_with_fallback(resolver, &signal, signal.long_strike, -STRIKE_FALLBACK).await;
        let short_leg =
            resolve_with_fallback(resolver, &signal, signal.short_strike, STRIKE_FALLBACK).await;
        let (Some(long_leg_id), Some(short_leg_id)) = (long_leg, short_leg) else {
            remaining.push(signal);
            continue;
        };

        match stager
            .stage_resolved(
                &signal,
                long_leg_id,
                short_leg_id,
                trigger_instrument_id,
                existing,
                managed,
                true,
            )
            .await
        {
            Ok(Some(order)) => {
                info!(order_id = order.order_id, trigger = %order.trigger_price, "Backlog signal placed live");
                managed.push(order);
            }
            Ok(None) => {
                info!(trigger = %signal.trigger_price, "Backlog signal was a duplicate; dropping");
            }
            Err(e) => {
                warn!(trigger = %signal.trigger_price, error = %e, "Backlog retry failed");
                remaining.push(signal);
            }
        }
    }
    *backlog = remaining;
}

/// Resolves a leg; on failure, makes a single substitution attempt at
/// `strike + offset` before giving up for this pass.
async fn resolve_with_fallback(
    resolver: &InstrumentResolver,
    signal: &Signal,
    strike: Decimal,
    offset: Decimal,
) -> Option<i64> {
    match resolver
        .resolve_option(signal.expiry, strike, OptionRight::Call)
        .await
    {
        Ok(id) => Some(id),
        Err(e) => {
            warn!(strike = %strike, error = %e, "Leg resolution failed; trying substitute strike");
            resolver
                .resolve_option(signal.expiry, strike + offset, OptionRight::Call)
                .await
                .ok()
        }
    }
}
