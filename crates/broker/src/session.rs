//! `BrokerSession`: the correlation layer over a callback-only transport.
//!
//! One dispatch task consumes the transport's event queue and is the only
//! code that touches session state; pipeline code issues requests and
//! blocks on completion signals, always bounded by a timeout.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::transport::{BrokerEvent, BrokerTransport, TransportError};
use crate::types::{ComboContract, ExistingOrder, InstrumentSpec, OrderTicket};

/// Errors raised by the session layer.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("failed to connect after {attempts} attempts")]
    Connection { attempts: u32 },

    #[error("lookup timed out for {desc} (request id {request_id})")]
    LookupTimeout { desc: String, request_id: i64 },

    #[error("no instrument matched {desc}")]
    NotFound { desc: String },

    #[error("broker session disconnected")]
    Disconnected,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Timeout and backoff knobs, defaulted for production. Tests shrink these
/// to millisecond scale and exercise the same code paths.
#[derive(Debug, Clone)]
pub struct SessionTuning {
    pub connect_attempts: u32,
    pub handshake_timeout: Duration,
    /// Connect backoff grows linearly: `connect_backoff × attempt`.
    pub connect_backoff: Duration,
    /// Retry backoff for correlated requests, also `× attempt`.
    pub request_backoff: Duration,
    pub resolve_timeout: Duration,
    pub resolve_attempts: u32,
    pub resolve_backoff: Duration,
}

impl Default for SessionTuning {
    fn default() -> Self {
        Self {
            connect_attempts: 5,
            handshake_timeout: Duration::from_secs(10),
            connect_backoff: Duration::from_millis(1500),
            request_backoff: Duration::from_secs(1),
            resolve_timeout: Duration::from_secs(7),
            resolve_attempts: 3,
            resolve_backoff: Duration::from_millis(500),
        }
    }
}

impl SessionTuning {
    /// Millisecond-scale tuning for tests.
    pub fn fast() -> Self {
        Self {
            connect_attempts: 3,
            handshake_timeout: Duration::from_millis(100),
            connect_backoff: Duration::from_millis(5),
            request_backoff: Duration::from_millis(5),
            resolve_timeout: Duration::from_millis(150),
            resolve_attempts: 3,
            resolve_backoff: Duration::from_millis(5),
        }
    }
}

/// A resettable completion signal: one lookup cycle arms it, the dispatch
/// task fires it.
pub struct CompletionFlag {
    tx: watch::Sender<bool>,
}

impl CompletionFlag {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn reset(&self) {
        self.tx.send_replace(false);
    }

    pub fn set(&self) {
        self.tx.send_replace(true);
    }

    /// Waits up to `timeout` for the flag. Returns false on expiry.
    pub async fn wait(&self, timeout: Duration) -> bool {
        let mut rx = self.tx.subscribe();
        let outcome = tokio::time::timeout(timeout, rx.wait_for(|set| *set)).await;
        matches!(outcome, Ok(Ok(_)))
    }
}

impl Default for CompletionFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Request ids are scoped to the process, not the session: a reconnect
/// must never reuse an id a broker callback might still reference.
static NEXT_REQUEST_ID: AtomicI64 = AtomicI64::new(1);

/// Shared session state. Mutated only by the dispatch task (via `apply`)
/// and by the issuing side's bookkeeping (counter bumps, pending-entry
/// removal on timeout).
struct SessionState {
    next_order_id: Mutex<i64>,
    ready: CompletionFlag,
    pending_resolutions: Mutex<HashMap<i64, oneshot::Sender<Vec<i64>>>>,
    open_orders: Mutex<Vec<ExistingOrder>>,
    open_orders_done: CompletionFlag,
    open_price: Mutex<Option<Decimal>>,
    open_price_done: CompletionFlag,
    last_price: Mutex<Option<Decimal>>,
    error_order_ids: Mutex<HashSet<i64>>,
}

impl SessionState {
    fn new() -> Self {
        Self {
            next_order_id: Mutex::new(0),
            ready: CompletionFlag::new(),
            pending_resolutions: Mutex::new(HashMap::new()),
            open_orders: Mutex::new(Vec::new()),
            open_orders_done: CompletionFlag::new(),
            open_price: Mutex::new(None),
            open_price_done: CompletionFlag::new(),
            last_price: Mutex::new(None),
            error_order_ids: Mutex::new(HashSet::new()),
        }
    }

    fn apply(&self, event: BrokerEvent) {
        match event {
            BrokerEvent::Ready { next_order_id } => {
                let mut next = self.next_order_id.lock().unwrap();
                if next_order_id > *next {
                    *next = next_order_id;
                }
                drop(next);
                self.ready.set();
            }
            BrokerEvent::InstrumentResolved {
                request_id,
                instrument_ids,
            } => {
                let sender = self.pending_resolutions.lock().unwrap().remove(&request_id);
                match sender {
                    // Caller gone (timed out): a late callback is not an error.
                    None => debug!(request_id, "Dropping resolution for unknown request id"),
                    Some(tx) => {
                        let _ = tx.send(instrument_ids);
                    }
                }
            }
            BrokerEvent::HistoricalOpen { request_id, open } => {
                debug!(request_id, open = %open, "Historical open received");
                *self.open_price.lock().unwrap() = Some(open);
                self.open_price_done.set();
            }
            BrokerEvent::OpenOrder(order) => {
                self.open_orders.lock().unwrap().push(order);
            }
            BrokerEvent::OpenOrdersEnd => {
                self.open_orders_done.set();
            }
            BrokerEvent::OrderStatus { order_id, status } => {
                if status.is_blocking() {
                    warn!(order_id, ?status, "Order reported blocked; queued for recovery");
                    self.error_order_ids.lock().unwrap().insert(order_id);
                } else {
                    debug!(order_id, ?status, "Order status");
                }
            }
            BrokerEvent::PriceTick { price, .. } => {
                *self.last_price.lock().unwrap() = Some(price);
            }
            BrokerEvent::Fault {
                request_id,
                code,
                message,
            } => {
                warn!(?request_id, code, message, "Broker fault");
            }
        }
    }
}

/// A ready broker session: connected transport plus a running dispatch task.
pub struct BrokerSession {
    transport: Arc<dyn BrokerTransport>,
    state: Arc<SessionState>,
    tuning: SessionTuning,
    dispatch: Mutex<Option<JoinHandle<()>>>,
}

impl BrokerSession {
    /// Connects with retry: Disconnected → Connecting → Ready.
    ///
    /// Each attempt waits `handshake_timeout` for the broker's ready event;
    /// a failed attempt tears the half-open connection down before the next
    /// one. Backoff grows linearly with the attempt number.
    pub async fn connect(
        transport: Arc<dyn BrokerTransport>,
        tuning: SessionTuning,
    ) -> Result<Self, SessionError> {
        let attempts = tuning.connect_attempts;
        for attempt in 1..=attempts {
            info!(attempt, attempts, "Connecting to broker");
            let state = Arc::new(SessionState::new());
            let (tx, mut rx) = mpsc::unbounded_channel();

            match transport.connect(tx).await {
                Err(e) => {
                    warn!(attempt, error = %e, "Connect attempt failed");
                    // The connection may be half-open; always tear down.
                    transport.disconnect().await;
                }
                Ok(()) => {
                    let dispatch_state = Arc::clone(&state);
                    let dispatch = tokio::spawn(async move {
                        while let Some(event) = rx.recv().await {
                            dispatch_state.apply(event);
                        }
                        debug!("Dispatch loop ended");
                    });

                    if state.ready.wait(tuning.handshake_timeout).await {
                        let next_order_id = *state.next_order_id.lock().unwrap();
                        info!(next_order_id, "Broker session ready");
                        return Ok(Self {
                            transport,
                            state,
                            tuning,
                            dispatch: Mutex::new(Some(dispatch)),
                        });
                    }

                    warn!(attempt, "Handshake timed out; tearing down");
                    dispatch.abort();
                    transport.disconnect().await;
                }
            }

            if attempt < attempts {
                tokio::time::sleep(tuning.connect_backoff * attempt).await;
            }
        }
        Err(SessionError::Connection { attempts })
    }

    pub fn tuning(&self) -> &SessionTuning {
        &self.tuning
    }

    /// Next request id: monotonic counter starting at 1. Process-lifetime
    /// unique — reconnects continue the sequence — and distinct under
    /// concurrent callers.
    pub fn issue_request_id(&self) -> i64 {
        NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
    }

    /// Next broker order id, seeded by the handshake.
    pub fn take_order_id(&self) -> i64 {
        let mut next = self.state.next_order_id.lock().unwrap();
        let id = *next;
        *next += 1;
        id
    }

    /// Raises the order-id counter so it clears every id in the broker's
    /// existing-order snapshot.
    pub fn bump_order_id_floor(&self, min_next: i64) {
        let mut next = self.state.next_order_id.lock().unwrap();
        if min_next > *next {
            info!(from = *next, to = min_next, "Adjusting next order id past existing orders");
            *next = min_next;
        }
    }

    /// Generic retrying request primitive.
    ///
    /// Per attempt: run `before_each`, reset the completion flag, fire the
    /// request, wait up to `timeout`. Linear backoff between attempts.
    /// Returns false once the attempt budget is exhausted.
    pub async fn request_with_retry<Before, Req, Fut>(
        &self,
        desc: &str,
        attempts: u32,
        timeout: Duration,
        flag: &CompletionFlag,
        mut before_each: Before,
        mut request: Req,
    ) -> bool
    where
        Before: FnMut(),
        Req: FnMut() -> Fut,
        Fut: Future<Output = Result<(), TransportError>>,
    {
        for attempt in 1..=attempts {
            before_each();
            flag.reset();
            if let Err(e) = request().await {
                warn!(desc, attempt, attempts, error = %e, "Request send failed");
            } else if flag.wait(timeout).await {
                return true;
            } else {
                warn!(desc, attempt, attempts, "Request timed out; retrying");
            }
            if attempt < attempts {
                tokio::time::sleep(self.tuning.request_backoff * attempt).await;
            }
        }
        false
    }

    /// Resolves a symbolic instrument spec to a broker instrument id.
    ///
    /// Registers a per-request completion entry so concurrent lookups stay
    /// isolated. The entry is removed on every exit path; a callback that
    /// arrives after removal is silently dropped by the dispatch task.
    pub async fn resolve_instrument(
        &self,
        spec: &InstrumentSpec,
        timeout: Duration,
    ) -> Result<i64, SessionError> {
        let request_id = self.issue_request_id();
        let desc = spec.display_name();
        let (tx, rx) = oneshot::channel();
        self.state
            .pending_resolutions
            .lock()
            .unwrap()
            .insert(request_id, tx);

        if let Err(e) = self.transport.resolve_instrument(request_id, spec).await {
            self.state
                .pending_resolutions
                .lock()
                .unwrap()
                .remove(&request_id);
            return Err(e.into());
        }

        match tokio::time::timeout(timeout, rx).await {
            Err(_elapsed) => {
                self.state
                    .pending_resolutions
                    .lock()
                    .unwrap()
                    .remove(&request_id);
                Err(SessionError::LookupTimeout { desc, request_id })
            }
            // Sender dropped without a result: dispatch loop is gone.
            Ok(Err(_)) => Err(SessionError::Disconnected),
            Ok(Ok(ids)) => {
                debug!(request_id, ?ids, desc, "Instrument resolved");
                ids.first()
                    .copied()
                    .ok_or(SessionError::NotFound { desc })
            }
        }
    }

    /// Fetches the broker's open/filled order snapshot. Retries internally;
    /// exhaustion is non-fatal and yields whatever accumulated (usually the
    /// empty set).
    pub async fn fetch_existing_orders(
        &self,
        attempts: u32,
        timeout: Duration,
    ) -> Vec<ExistingOrder> {
        let ok = self
            .request_with_retry(
                "open orders",
                attempts,
                timeout,
                &self.state.open_orders_done,
                || self.state.open_orders.lock().unwrap().clear(),
                || {
                    let transport = Arc::clone(&self.transport);
                    let request_id = self.issue_request_id();
                    async move { transport.list_open_orders(request_id).await }
                },
            )
            .await;
        if !ok {
            warn!("Open-order snapshot failed after retries; continuing with empty set");
        }
        let orders = self.state.open_orders.lock().unwrap().clone();
        info!(count = orders.len(), "Existing order snapshot");
        orders
    }

    /// Requests the official opening print. The price cell is cleared
    /// before each attempt; `None` after exhaustion.
    pub async fn fetch_historical_open(
        &self,
        spec: &InstrumentSpec,
        attempts: u32,
        timeout: Duration,
    ) -> Option<Decimal> {
        let ok = self
            .request_with_retry(
                "open price",
                attempts,
                timeout,
                &self.state.open_price_done,
                || *self.state.open_price.lock().unwrap() = None,
                || {
                    let transport = Arc::clone(&self.transport);
                    let request_id = self.issue_request_id();
                    let spec = spec.clone();
                    async move { transport.fetch_historical_open(request_id, &spec).await }
                },
            )
            .await;
        if ok {
            *self.state.open_price.lock().unwrap()
        } else {
            None
        }
    }

    /// Starts the live price stream for `spec`.
    pub async fn start_price_stream(&self, spec: &InstrumentSpec) -> Result<(), SessionError> {
        let request_id = self.issue_request_id();
        info!(request_id, spec = spec.display_name(), "Starting live price stream");
        self.transport.stream_price(request_id, spec).await?;
        Ok(())
    }

    /// Most recent live tick, if any has arrived.
    pub fn last_price(&self) -> Option<Decimal> {
        *self.state.last_price.lock().unwrap()
    }

    /// Snapshot of order ids currently reported blocked.
    pub fn error_order_ids(&self) -> HashSet<i64> {
        self.state.error_order_ids.lock().unwrap().clone()
    }

    pub fn clear_error_order_id(&self, order_id: i64) {
        self.state.error_order_ids.lock().unwrap().remove(&order_id);
    }

    pub async fn place_order(
        &self,
        order_id: i64,
        contract: &ComboContract,
        ticket: &OrderTicket,
    ) -> Result<(), SessionError> {
        self.transport.place_order(order_id, contract, ticket).await?;
        Ok(())
    }

    pub async fn cancel_order(&self, order_id: i64) -> Result<(), SessionError> {
        self.transport.cancel_order(order_id).await?;
        Ok(())
    }

    /// Stops the dispatch task and closes the connection.
    pub async fn disconnect(&self) {
        if let Some(handle) = self.dispatch.lock().unwrap().take() {
            handle.abort();
        }
        self.transport.disconnect().await;
        info!("Broker session disconnected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimTransport;
    use crate::types::OptionRight;
    use chrono::NaiveDate;
    use futures::future::join_all;
    use rust_decimal_macros::dec;

    fn expiry() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 12, 31).unwrap()
    }

    async fn ready_session(sim: &Arc<SimTransport>) -> BrokerSession {
        BrokerSession::connect(Arc::clone(sim) as Arc<dyn BrokerTransport>, SessionTuning::fast())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn request_ids_are_distinct_under_heavy_concurrency() {
        let sim = Arc::new(SimTransport::new());
        let session = Arc::new(ready_session(&sim).await);

        let tasks: Vec<_> = (0..500)
            .map(|_| {
                let session = Arc::clone(&session);
                tokio::spawn(async move { session.issue_request_id() })
            })
            .collect();

        let mut ids: Vec<i64> = join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 500, "issued ids must all be distinct");
    }

    #[tokio::test]
    async fn connect_fails_after_exactly_the_attempt_budget() {
        let sim = Arc::new(SimTransport::new());
        sim.fail_connects(u32::MAX);
        let result =
            BrokerSession::connect(Arc::clone(&sim) as Arc<dyn BrokerTransport>, SessionTuning::fast())
                .await;
        match result {
            Err(SessionError::Connection { attempts }) => assert_eq!(attempts, 3),
            Err(other) => panic!("expected Connection error, got {other}"),
            Ok(_) => panic!("expected Connection error, got a ready session"),
        }
        assert_eq!(sim.connect_calls(), 3);
    }

    #[tokio::test]
    async fn connect_recovers_when_a_later_attempt_succeeds() {
        let sim = Arc::new(SimTransport::new());
        sim.fail_connects(2);
        let session =
            BrokerSession::connect(Arc::clone(&sim) as Arc<dyn BrokerTransport>, SessionTuning::fast())
                .await
                .unwrap();
        assert_eq!(sim.connect_calls(), 3);
        // Each failed attempt tears its half-open connection down.
        assert_eq!(sim.disconnect_calls(), 2);
        session.disconnect().await;
    }

    #[tokio::test]
    async fn request_ids_keep_advancing_across_reconnects() {
        let sim = Arc::new(SimTransport::new());
        let session = ready_session(&sim).await;
        let before = session.issue_request_id();
        session.disconnect().await;

        let session = ready_session(&sim).await;
        let after = session.issue_request_id();
        assert!(
            after > before,
            "a new session must never reissue id {before}"
        );
    }

    #[tokio::test]
    async fn handshake_timeout_tears_down_and_retries() {
        let sim = Arc::new(SimTransport::new());
        sim.suppress_ready();
        let result =
            BrokerSession::connect(Arc::clone(&sim) as Arc<dyn BrokerTransport>, SessionTuning::fast())
                .await;
        assert!(matches!(result, Err(SessionError::Connection { .. })));
        assert_eq!(sim.disconnect_calls(), 3);
    }

    #[tokio::test]
    async fn concurrent_resolutions_stay_isolated() {
        let sim = Arc::new(SimTransport::new());
        for i in 0..10u32 {
            sim.add_option(expiry(), dec!(5800) + Decimal::from(i * 5), OptionRight::Call, 1000 + i64::from(i));
        }
        sim.set_resolution_delay(Duration::from_millis(30));
        let session = Arc::new(ready_session(&sim).await);

        let lookups: Vec<_> = (0..10u32)
            .map(|i| {
                let session = Arc::clone(&session);
                tokio::spawn(async move {
                    let spec = InstrumentSpec::option(
                        "SPX",
                        "SMART",
                        expiry(),
                        dec!(5800) + Decimal::from(i * 5),
                        OptionRight::Call,
                    );
                    session
                        .resolve_instrument(&spec, Duration::from_millis(500))
                        .await
                        .unwrap()
                })
            })
            .collect();

        let ids: Vec<i64> = join_all(lookups).await.into_iter().map(|r| r.unwrap()).collect();
        // Each lookup must receive its own instrument, not a neighbor's.
        assert_eq!(ids, (0..10).map(|i| 1000 + i64::from(i)).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn unknown_instrument_times_out_with_lookup_timeout() {
        let sim = Arc::new(SimTransport::new());
        sim.silence_resolutions();
        let session = ready_session(&sim).await;
        let spec = InstrumentSpec::option("SPX", "SMART", expiry(), dec!(5900), OptionRight::Call);
        let err = session
            .resolve_instrument(&spec, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::LookupTimeout { .. }));
    }

    #[tokio::test]
    async fn empty_resolution_maps_to_not_found() {
        let sim = Arc::new(SimTransport::new());
        let session = ready_session(&sim).await;
        // Nothing seeded: the sim answers with an empty id list.
        let spec = InstrumentSpec::option("SPX", "SMART", expiry(), dec!(5900), OptionRight::Call);
        let err = session
            .resolve_instrument(&spec, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::NotFound { .. }));
    }

    #[tokio::test]
    async fn late_resolution_callback_is_ignored() {
        let sim = Arc::new(SimTransport::new());
        sim.add_option(expiry(), dec!(5900), OptionRight::Call, 111);
        sim.set_resolution_delay(Duration::from_millis(120));
        let session = ready_session(&sim).await;

        let spec = InstrumentSpec::option("SPX", "SMART", expiry(), dec!(5900), OptionRight::Call);
        let err = session
            .resolve_instrument(&spec, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::LookupTimeout { .. }));

        // Let the late callback land, then verify the session still works.
        tokio::time::sleep(Duration::from_millis(200)).await;
        sim.set_resolution_delay(Duration::ZERO);
        let id = session
            .resolve_instrument(&spec, Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(id, 111);
    }

    #[tokio::test]
    async fn open_price_fetch_returns_none_when_broker_never_answers() {
        let sim = Arc::new(SimTransport::new());
        let session = ready_session(&sim).await;
        let spec = InstrumentSpec::index("SPX", "CBOE");
        let price = session
            .fetch_historical_open(&spec, 2, Duration::from_millis(30))
            .await;
        assert!(price.is_none());
    }

    #[tokio::test]
    async fn open_price_fetch_returns_the_official_print() {
        let sim = Arc::new(SimTransport::new());
        sim.set_open_price(dec!(5905.25));
        let session = ready_session(&sim).await;
        let spec = InstrumentSpec::index("SPX", "CBOE");
        let price = session
            .fetch_historical_open(&spec, 2, Duration::from_millis(200))
            .await;
        assert_eq!(price, Some(dec!(5905.25)));
    }

    #[tokio::test]
    async fn blocked_statuses_accumulate_in_the_error_set() {
        let sim = Arc::new(SimTransport::new());
        sim.reject_next_placements(1);
        let session = ready_session(&sim).await;

        let contract = ComboContract {
            symbol: "SPX".to_string(),
            currency: "USD".to_string(),
            exchange: "SMART".to_string(),
            legs: vec![],
        };
        let ticket = OrderTicket {
            action: crate::types::LegSide::Buy,
            quantity: 1,
            kind: spread_stager_core::types::OrderKind::SnapMid,
            time_in_force: "DAY".to_string(),
            account: String::new(),
            transmit: false,
            limit_price: None,
            aux_price: None,
            condition: None,
        };
        let order_id = session.take_order_id();
        session.place_order(order_id, &contract, &ticket).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(session.error_order_ids().contains(&order_id));

        session.clear_error_order_id(order_id);
        assert!(session.error_order_ids().is_empty());
    }

    #[tokio::test]
    async fn completion_flag_reset_discards_earlier_completions() {
        let flag = CompletionFlag::new();
        flag.set();
        assert!(flag.wait(Duration::from_millis(10)).await);
        flag.reset();
        assert!(!flag.wait(Duration::from_millis(10)).await);
    }
}
