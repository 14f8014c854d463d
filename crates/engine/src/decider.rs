//! The one-shot GO/NO-GO pass against the official opening print.

use std::time::Duration;

use rust_decimal::Decimal;
use tracing::{info, warn};

use spread_stager_broker::session::{BrokerSession, SessionError};
use spread_stager_broker::types::InstrumentSpec;

use crate::stager::ManagedOrder;

pub const OPEN_PRICE_ATTEMPTS: u32 = 5;
pub const OPEN_PRICE_TIMEOUT: Duration = Duration::from_secs(10);

/// Fetches the underlying's official opening print.
///
/// `None` after exhaustion is terminal for the day: staged orders stay
/// parked untransmitted, never transmitted blind.
pub async fn fetch_open_price(
    session: &BrokerSession,
    spec: &InstrumentSpec,
    attempts: u32,
    timeout: Duration,
) -> Option<Decimal> {
    let price = session.fetch_historical_open(spec, attempts, timeout).await;
    if price.is_none() {
        warn!(
            attempts,
            "Open price unavailable after retries; will not transmit"
        );
    }
    price
}

/// Runs the GO/NO-GO decision over every staged order, exactly once per
/// cycle.
///
/// Orders are processed in ascending trigger order (stable tie-break by
/// insertion order). `open_price >= trigger` cancels the order; otherwise
/// it is resubmitted under the same id with `transmit = true`.
pub async fn decide(
    session: &BrokerSession,
    managed: &mut [ManagedOrder],
    open_price: Decimal,
) -> Result<(), SessionError> {
    managed.sort_by(|a, b| a.trigger_price.cmp(&b.trigger_price));

    for order in managed.iter_mut() {
        if open_price >= order.trigger_price {
            info!(
                order_id = order.order_id,
                open = %open_price,
                trigger = %order.trigger_price,
                "NO-GO: open at or above trigger; cancelling"
            );
            session.cancel_order(order.order_id).await?;
        } else {
            info!(
                order_id = order.order_id,
                open = %open_price,
                trigger = %order.trigger_price,
                "GO: open below trigger; transmitting"
            );
            order.ticket.transmit = true;
            session
                .place_order(order.order_id, &order.contract, &order.ticket)
                .await?;
        }
    }
    Ok(())
}
