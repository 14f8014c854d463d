//! Scripted in-process broker transport.
//!
//! Backs the integration tests and the cli's paper mode: a small book of
//! resolvable instruments, an optional opening print, a replayable tick
//! stream, and failure injection for connects, resolutions, and placements.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use tokio::sync::mpsc;

use crate::transport::{BrokerEvent, BrokerTransport, TransportError};
use crate::types::{
    ComboContract, ExistingOrder, InstrumentKind, InstrumentSpec, OptionRight, OrderStatusKind,
    OrderTicket,
};

/// An order the sim has accepted, kept for assertions.
#[derive(Debug, Clone)]
pub struct PlacedOrder {
    pub order_id: i64,
    pub contract: ComboContract,
    pub ticket: OrderTicket,
}

#[derive(Default)]
struct SimInner {
    events: Option<mpsc::UnboundedSender<BrokerEvent>>,
    instruments: HashMap<(String, InstrumentKind), i64>,
    existing_orders: Vec<ExistingOrder>,
    open_price: Option<Decimal>,
    queued_ticks: Vec<Decimal>,
    streaming: bool,
    placed: Vec<PlacedOrder>,
    cancelled: Vec<i64>,
    next_order_id: i64,
    fail_connects_remaining: u32,
    suppress_ready: bool,
    silence_resolutions: bool,
    resolution_delay: Duration,
    reject_placements_remaining: u32,
    connect_calls: u32,
    disconnect_calls: u32,
}

/// Simulated broker transport.
pub struct SimTransport {
    inner: Mutex<SimInner>,
}

impl SimTransport {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SimInner {
                next_order_id: 1,
                ..SimInner::default()
            }),
        }
    }

    pub fn add_index(&self, symbol: &str, instrument_id: i64) {
        let spec = InstrumentSpec::index(symbol, "CBOE");
        self.inner
            .lock()
            .unwrap()
            .instruments
            .insert((spec.symbol, spec.kind), instrument_id);
    }

    pub fn add_option(
        &self,
        expiry: NaiveDate,
        strike: Decimal,
        right: OptionRight,
        instrument_id: i64,
    ) {
        let spec = InstrumentSpec::option("SPX", "SMART", expiry, strike, right);
        self.inner
            .lock()
            .unwrap()
            .instruments
            .insert((spec.symbol, spec.kind), instrument_id);
    }

    pub fn seed_existing_order(&self, order: ExistingOrder) {
        self.inner.lock().unwrap().existing_orders.push(order);
    }

    pub fn set_open_price(&self, price: Decimal) {
        self.inner.lock().unwrap().open_price = Some(price);
    }

    /// Delivers a live tick if a stream is running, otherwise queues it
    /// for the next `stream_price` call.
    pub fn push_live_price(&self, price: Decimal) {
        let mut inner = self.inner.lock().unwrap();
        if inner.streaming {
            if let Some(tx) = &inner.events {
                let _ = tx.send(BrokerEvent::PriceTick {
                    request_id: 0,
                    price,
                });
                return;
            }
        }
        inner.queued_ticks.push(price);
    }

    pub fn fail_connects(&self, count: u32) {
        self.inner.lock().unwrap().fail_connects_remaining = count;
    }

    /// Connect succeeds but the ready handshake never arrives.
    pub fn suppress_ready(&self) {
        self.inner.lock().unwrap().suppress_ready = true;
    }

    /// Resolution requests go unanswered (exercises lookup timeouts).
    pub fn silence_resolutions(&self) {
        self.inner.lock().unwrap().silence_resolutions = true;
    }

    pub fn set_resolution_delay(&self, delay: Duration) {
        self.inner.lock().unwrap().resolution_delay = delay;
    }

    /// The next `count` placements are reported Inactive.
    pub fn reject_next_placements(&self, count: u32) {
        self.inner.lock().unwrap().reject_placements_remaining = count;
    }

    pub fn placed_orders(&self) -> Vec<PlacedOrder> {
        self.inner.lock().unwrap().placed.clone()
    }

    pub fn cancelled_orders(&self) -> Vec<i64> {
        self.inner.lock().unwrap().cancelled.clone()
    }

    pub fn connect_calls(&self) -> u32 {
        self.inner.lock().unwrap().connect_calls
    }

    pub fn disconnect_calls(&self) -> u32 {
        self.inner.lock().unwrap().disconnect_calls
    }

    fn send(&self, event: BrokerEvent) {
        if let Some(tx) = &self.inner.lock().unwrap().events {
            let _ = tx.send(event);
        }
    }
}

impl Default for SimTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerTransport for SimTransport {
    async fn connect(
        &self,
        events: mpsc::UnboundedSender<BrokerEvent>,
    ) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.connect_calls += 1;
        if inner.fail_connects_remaining > 0 {
            inner.fail_connects_remaining -= 1;
            return Err(TransportError::Connect("simulated refusal".to_string()));
        }
        inner.events = Some(events.clone());
        if !inner.suppress_ready {
            let _ = events.send(BrokerEvent::Ready {
                next_order_id: inner.next_order_id,
            });
        }
        Ok(())
    }

    async fn disconnect(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.disconnect_calls += 1;
        inner.events = None;
        inner.streaming = false;
    }

    async fn resolve_instrument(
        &self,
        request_id: i64,
        spec: &InstrumentSpec,
    ) -> Result<(), TransportError> {
        let (events, ids, delay) = {
            let inner = self.inner.lock().unwrap();
            if inner.silence_resolutions {
                return Ok(());
            }
            let ids = inner
                .instruments
                .get(&(spec.symbol.clone(), spec.kind.clone()))
                .map(|id| vec![*id])
                .unwrap_or_default();
            (inner.events.clone(), ids, inner.resolution_delay)
        };
        let Some(events) = events else {
            return Err(TransportError::NotConnected);
        };
        if delay.is_zero() {
            let _ = events.send(BrokerEvent::InstrumentResolved {
                request_id,
                instrument_ids: ids,
            });
        } else {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = events.send(BrokerEvent::InstrumentResolved {
                    request_id,
                    instrument_ids: ids,
                });
            });
        }
        Ok(())
    }

    async fn fetch_historical_open(
        &self,
        request_id: i64,
        _spec: &InstrumentSpec,
    ) -> Result<(), TransportError> {
        let open = self.inner.lock().unwrap().open_price;
        if let Some(open) = open {
            self.send(BrokerEvent::HistoricalOpen { request_id, open });
        }
        Ok(())
    }

    async fn list_open_orders(&self, _request_id: i64) -> Result<(), TransportError> {
        let orders = self.inner.lock().unwrap().existing_orders.clone();
        for order in orders {
            self.send(BrokerEvent::OpenOrder(order));
        }
        self.send(BrokerEvent::OpenOrdersEnd);
        Ok(())
    }

    async fn stream_price(
        &self,
        request_id: i64,
        _spec: &InstrumentSpec,
    ) -> Result<(), TransportError> {
        let (events, ticks) = {
            let mut inner = self.inner.lock().unwrap();
            inner.streaming = true;
            (inner.events.clone(), std::mem::take(&mut inner.queued_ticks))
        };
        let Some(events) = events else {
            return Err(TransportError::NotConnected);
        };
        for price in ticks {
            let _ = events.send(BrokerEvent::PriceTick { request_id, price });
        }
        Ok(())
    }

    async fn place_order(
        &self,
        order_id: i64,
        contract: &ComboContract,
        ticket: &OrderTicket,
    ) -> Result<(), TransportError> {
        let status = {
            let mut inner = self.inner.lock().unwrap();
            inner.placed.push(PlacedOrder {
                order_id,
                contract: contract.clone(),
                ticket: ticket.clone(),
            });
            if order_id >= inner.next_order_id {
                inner.next_order_id = order_id + 1;
            }
            if inner.reject_placements_remaining > 0 {
                inner.reject_placements_remaining -= 1;
                OrderStatusKind::Inactive
            } else {
                OrderStatusKind::PreSubmitted
            }
        };
        self.send(BrokerEvent::OrderStatus { order_id, status });
        Ok(())
    }

    async fn cancel_order(&self, order_id: i64) -> Result<(), TransportError> {
        self.inner.lock().unwrap().cancelled.push(order_id);
        self.send(BrokerEvent::OrderStatus {
            order_id,
            status: OrderStatusKind::Cancelled,
        });
        Ok(())
    }
}
