//! The daily supervisor: composes connect, snapshot, gather, stage, the
//! open-wait, the GO/NO-GO pass, and recovery into an infinite
//! fault-tolerant loop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{error, info, warn};

use spread_stager_broker::resolver::InstrumentResolver;
use spread_stager_broker::session::{BrokerSession, SessionTuning};
use spread_stager_broker::transport::BrokerTransport;
use spread_stager_core::clock::{
    await_open, market_close_for, next_wake_time, trading_day_open, DayChoice,
};
use spread_stager_core::config::AppConfig;
use spread_stager_signals::SignalGatherer;

use crate::decider;
use crate::recovery;
use crate::stager::{ManagedOrder, OrderStager};

/// Pacing knobs for one daily iteration, defaulted for production.
#[derive(Debug, Clone)]
pub struct CycleTuning {
    pub session: SessionTuning,
    pub open_order_attempts: u32,
    pub open_order_timeout: Duration,
    pub open_price_attempts: u32,
    pub open_price_timeout: Duration,
    /// Settle delay after connect, before gathering signals.
    pub settle_delay: Duration,
    /// Delay after the GO/NO-GO pass before the second gathering pass.
    pub regather_delay: Duration,
    /// Delay before retrying a failed iteration.
    pub iteration_retry_delay: Duration,
    pub recovery_poll: Duration,
}

impl Default for CycleTuning {
    fn default() -> Self {
        Self {
            session: SessionTuning::default(),
            open_order_attempts: 3,
            open_order_timeout: Duration::from_secs(8),
            open_price_attempts: decider::OPEN_PRICE_ATTEMPTS,
            open_price_timeout: decider::OPEN_PRICE_TIMEOUT,
            settle_delay: Duration::from_secs(5),
            regather_delay: Duration::from_secs(120),
            iteration_retry_delay: Duration::from_secs(60),
            recovery_poll: Duration::from_secs(1),
        }
    }
}

pub struct DailyCycle {
    config: AppConfig,
    tuning: CycleTuning,
    transport: Arc<dyn BrokerTransport>,
    gatherer: SignalGatherer,
    day_choice: DayChoice,
}

impl DailyCycle {
    pub fn new(
        config: AppConfig,
        tuning: CycleTuning,
        transport: Arc<dyn BrokerTransport>,
        gatherer: SignalGatherer,
        day_choice: DayChoice,
    ) -> Self {
        Self {
            config,
            tuning,
            transport,
            gatherer,
            day_choice,
        }
    }

    /// Runs forever. Any error inside one iteration is caught, logged, and
    /// the iteration retried after a fixed delay; the process never
    /// terminates on a recoverable error.
    ///
    /// `DayChoice::Next` only applies to the first iteration (an evening
    /// start targeting the following session); after the pre-market wake,
    /// every later iteration stages for the day it wakes on.
    pub async fn run(&self) {
        let mut day_choice = self.day_choice;
        loop {
            match self.run_once(day_choice).await {
                Ok(()) => day_choice = DayChoice::Today,
                Err(e) => {
                    error!(error = %e, "Daily cycle iteration failed; retrying after delay");
                    tokio::time::sleep(self.tuning.iteration_retry_delay).await;
                }
            }
        }
    }

    async fn run_once(&self, day_choice: DayChoice) -> Result<()> {
        let session = Arc::new(
            BrokerSession::connect(Arc::clone(&self.transport), self.tuning.session.clone())
                .await
                .context("broker connection failed")?,
        );

        let outcome = self.run_day(&session, day_choice).await;
        session.disconnect().await;
        outcome?;

        self.sleep_until_wake().await;
        Ok(())
    }

    async fn run_day(&self, session: &Arc<BrokerSession>, day_choice: DayChoice) -> Result<()> {
        let trading = &self.config.trading;
        let tz = trading.timezone;

        let existing = session
            .fetch_existing_orders(self.tuning.open_order_attempts, self.tuning.open_order_timeout)
            .await;
        if let Some(max_id) = existing.iter().map(|o| o.order_id).max() {
            session.bump_order_id_floor(max_id + 1);
        }

        let resolver = Arc::new(InstrumentResolver::new(
            Arc::clone(session),
            &trading.underlying_symbol,
            &trading.underlying_exchange,
            &trading.option_exchange,
        ));
        let trigger_instrument_id = resolver
            .resolve_index()
            .await
            .context("could not resolve the underlying index instrument")?;

        // Let any startup callbacks settle before gathering.
        tokio::time::sleep(self.tuning.settle_delay).await;

        let signals = self.gatherer.gather(true).await;
        let stager = OrderStager::new(Arc::clone(session), Arc::clone(&resolver), &self.config);
        let mut managed: Vec<ManagedOrder> = Vec::new();
        let mut backlog = Vec::new();
        stager
            .process_batch(&signals, trigger_instrument_id, &existing, &mut managed, &mut backlog)
            .await;

        let open = trading_day_open(tz, day_choice);
        let close = market_close_for(open);
        info!(
            open = %open,
            staged = managed.len(),
            deferred = backlog.len(),
            "Staging complete; waiting for market open"
        );
        await_open(open).await;

        info!(
            secs = trading.settle_after_open_secs,
            "Waiting for the broker to publish the official open"
        );
        tokio::time::sleep(Duration::from_secs(trading.settle_after_open_secs)).await;

        let index_spec = resolver.index_spec();
        let Some(open_price) = decider::fetch_open_price(
            session,
            &index_spec,
            self.tuning.open_price_attempts,
            self.tuning.open_price_timeout,
        )
        .await
        else {
            warn!("Open price unobtainable; staged orders stay parked for the day");
            return Ok(());
        };
        info!(open_price = %open_price, symbol = trading.underlying_symbol, "Official open price");

        decider::decide(session, &mut managed, open_price).await?;
        session.start_price_stream(&index_spec).await?;

        // Second gathering pass shortly after the open; no manual fallback.
        tokio::time::sleep(self.tuning.regather_delay).await;
        let late_signals = self.gatherer.gather(false).await;
        if !late_signals.is_empty() {
            info!(count = late_signals.len(), "Post-open signals found");
            stager
                .process_batch(
                    &late_signals,
                    trigger_instrument_id,
                    &existing,
                    &mut managed,
                    &mut backlog,
                )
                .await;
        }

        recovery::run_until_close(
            session,
            &resolver,
            &stager,
            &mut managed,
            &mut backlog,
            &existing,
            trigger_instrument_id,
            close,
            self.tuning.recovery_poll,
        )
        .await;

        // Linger to close even when recovery drained early.
        loop {
            let now = Utc::now().with_timezone(&tz);
            if now >= close {
                break;
            }
            let remaining = (close - now).to_std().unwrap_or(Duration::from_secs(1));
            tokio::time::sleep(remaining.min(Duration::from_secs(60))).await;
        }
        info!("Market close reached; day complete");
        Ok(())
    }

    async fn sleep_until_wake(&self) {
        let tz = self.config.trading.timezone;
        let now = Utc::now().with_timezone(&tz);
        let wake = next_wake_time(now);
        let sleep_for = (wake - now).to_std().unwrap_or(Duration::from_secs(1));
        info!(wake = %wake, secs = sleep_for.as_secs(), "Sleeping until next pre-market wake");
        tokio::time::sleep(sleep_for).await;
        info!("Waking for the new trading day");
    }
}
