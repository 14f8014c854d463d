//! The broker transport seam.
//!
//! Request calls are fire-and-forget; every result comes back as a
//! [`BrokerEvent`] pushed onto the channel handed over at connect time.
//! The session never depends on a concrete transport, only on this shape.

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::types::{ComboContract, ExistingOrder, InstrumentSpec, OrderStatusKind, OrderTicket};

/// Errors raised by a transport implementation.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("not connected")]
    NotConnected,

    #[error("send failed: {0}")]
    Send(String),
}

/// Asynchronous callbacks from the broker, delivered in arrival order.
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    /// Handshake complete; carries the broker's next valid order id.
    Ready { next_order_id: i64 },
    /// Result of an instrument lookup. An empty id list means no match.
    InstrumentResolved {
        request_id: i64,
        instrument_ids: Vec<i64>,
    },
    /// Official opening print from a historical-data request.
    HistoricalOpen { request_id: i64, open: Decimal },
    /// One order from an open-orders listing.
    OpenOrder(ExistingOrder),
    /// End marker for an open-orders listing.
    OpenOrdersEnd,
    /// Status change for a placed order.
    OrderStatus {
        order_id: i64,
        status: OrderStatusKind,
    },
    /// Live price tick from a streaming subscription.
    PriceTick { request_id: i64, price: Decimal },
    /// Broker-side error report, possibly tied to a request.
    Fault {
        request_id: Option<i64>,
        code: i32,
        message: String,
    },
}

/// Connection-oriented broker transport.
///
/// Implementations own the socket and the protocol encoding. All request
/// methods return as soon as the request is written; results arrive
/// exclusively on the event channel.
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Open the connection and start delivering events on `events`.
    async fn connect(
        &self,
        events: mpsc::UnboundedSender<BrokerEvent>,
    ) -> Result<(), TransportError>;

    /// Tear down the connection. Safe to call on a half-open connection.
    async fn disconnect(&self);

    async fn resolve_instrument(
        &self,
        request_id: i64,
        spec: &InstrumentSpec,
    ) -> Result<(), TransportError>;

    async fn fetch_historical_open(
        &self,
        request_id: i64,
        spec: &InstrumentSpec,
    ) -> Result<(), TransportError>;

    async fn list_open_orders(&self, request_id: i64) -> Result<(), TransportError>;

    async fn stream_price(
        &self,
        request_id: i64,
        spec: &InstrumentSpec,
    ) -> Result<(), TransportError>;

    async fn place_order(
        &self,
        order_id: i64,
        contract: &ComboContract,
        ticket: &OrderTicket,
    ) -> Result<(), TransportError>;

    async fn cancel_order(&self, order_id: i64) -> Result<(), TransportError>;
}
