//! Resolves symbolic option/index legs to broker instrument ids, with
//! bounded retries on top of the session's correlated lookups.

use std::sync::Arc;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::session::BrokerSession;
use crate::types::{InstrumentSpec, OptionRight};

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("could not resolve {desc} after {attempts} attempts")]
    Exhausted { desc: String, attempts: u32 },
}

/// Per-cycle instrument resolver. The index id is resolved at most once
/// per cycle and cached.
pub struct InstrumentResolver {
    session: Arc<BrokerSession>,
    underlying_symbol: String,
    underlying_exchange: String,
    option_exchange: String,
    index_id: Mutex<Option<i64>>,
}

impl InstrumentResolver {
    pub fn new(
        session: Arc<BrokerSession>,
        underlying_symbol: &str,
        underlying_exchange: &str,
        option_exchange: &str,
    ) -> Self {
        Self {
            session,
            underlying_symbol: underlying_symbol.to_string(),
            underlying_exchange: underlying_exchange.to_string(),
            option_exchange: option_exchange.to_string(),
            index_id: Mutex::new(None),
        }
    }

    pub fn option_spec(&self, expiry: NaiveDate, strike: Decimal, right: OptionRight) -> InstrumentSpec {
        InstrumentSpec::option(
            &self.underlying_symbol,
            &self.option_exchange,
            expiry,
            strike,
            right,
        )
    }

    pub fn index_spec(&self) -> InstrumentSpec {
        InstrumentSpec::index(&self.underlying_symbol, &self.underlying_exchange)
    }

    /// Resolves one option leg with linear-backoff retries.
    pub async fn resolve_option(
        &self,
        expiry: NaiveDate,
        strike: Decimal,
        right: OptionRight,
    ) -> Result<i64, ResolveError> {
        self.resolve_with_retry(self.option_spec(expiry, strike, right))
            .await
    }

    /// Resolves the underlying index id, cached for the rest of the cycle.
    pub async fn resolve_index(&self) -> Result<i64, ResolveError> {
        let mut cached = self.index_id.lock().await;
        if let Some(id) = *cached {
            return Ok(id);
        }
        let id = self.resolve_with_retry(self.index_spec()).await?;
        info!(instrument_id = id, symbol = self.underlying_symbol, "Index instrument resolved");
        *cached = Some(id);
        Ok(id)
    }

    async fn resolve_with_retry(&self, spec: InstrumentSpec) -> Result<i64, ResolveError> {
        let tuning = self.session.tuning().clone();
        let desc = spec.display_name();
        for attempt in 1..=tuning.resolve_attempts {
            match self
                .session
                .resolve_instrument(&spec, tuning.resolve_timeout)
                .await
            {
                Ok(id) => return Ok(id),
                Err(e) => warn!(
                    desc,
                    attempt,
                    attempts = tuning.resolve_attempts,
                    error = %e,
                    "Instrument resolution failed"
                ),
            }
            if attempt < tuning.resolve_attempts {
                tokio::time::sleep(tuning.resolve_backoff * attempt).await;
            }
        }
        Err(ResolveError::Exhausted {
            desc,
            attempts: tuning.resolve_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionTuning;
    use crate::sim::SimTransport;
    use crate::transport::BrokerTransport;
    use rust_decimal_macros::dec;

    async fn resolver_over(sim: &Arc<SimTransport>) -> InstrumentResolver {
        let session = Arc::new(
            BrokerSession::connect(
                Arc::clone(sim) as Arc<dyn BrokerTransport>,
                SessionTuning::fast(),
            )
            .await
            .unwrap(),
        );
        InstrumentResolver::new(session, "SPX", "CBOE", "SMART")
    }

    #[tokio::test]
    async fn index_id_is_cached_after_first_resolution() {
        let sim = Arc::new(SimTransport::new());
        sim.add_index("SPX", 416904);
        let resolver = resolver_over(&sim).await;
        assert_eq!(resolver.resolve_index().await.unwrap(), 416904);
        assert_eq!(resolver.resolve_index().await.unwrap(), 416904);
    }

    #[tokio::test]
    async fn option_resolution_exhausts_after_three_attempts() {
        let sim = Arc::new(SimTransport::new());
        sim.silence_resolutions();
        let resolver = resolver_over(&sim).await;
        let expiry = chrono::NaiveDate::from_ymd_opt(2025, 12, 31).unwrap();
        let err = resolver
            .resolve_option(expiry, dec!(5900), OptionRight::Call)
            .await
            .unwrap_err();
        let ResolveError::Exhausted { attempts, .. } = err;
        assert_eq!(attempts, 3);
    }
}
