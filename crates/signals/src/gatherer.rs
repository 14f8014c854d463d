//! Composes the feed source, the parser, and the manual-entry fallback.

use std::sync::Arc;

use tracing::{info, warn};

use spread_stager_core::types::Signal;

use crate::parser::SignalParser;
use crate::source::SignalSource;

pub struct SignalGatherer {
    source: Arc<dyn SignalSource>,
    manual: Option<Arc<dyn SignalSource>>,
    parser: SignalParser,
}

impl SignalGatherer {
    pub fn new(
        source: Arc<dyn SignalSource>,
        manual: Option<Arc<dyn SignalSource>>,
        parser: SignalParser,
    ) -> Self {
        Self {
            source,
            manual,
            parser,
        }
    }

    /// Gathers one batch of normalized signals.
    ///
    /// Feed absence or a feed error is non-fatal (empty batch). When the
    /// feed yields nothing and fallback is allowed, the same extraction
    /// runs once over a manually supplied block of text.
    pub async fn gather(&self, allow_manual_fallback: bool) -> Vec<Signal> {
        let text = match self.source.latest_message().await {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "Signal feed unavailable; treating as no signals");
                None
            }
        };

        let mut batch = match text {
            Some(text) => self.parser.parse_batch(&text),
            None => Vec::new(),
        };

        if batch.is_empty() && allow_manual_fallback {
            if let Some(manual) = &self.manual {
                match manual.latest_message().await {
                    Ok(Some(text)) => batch = self.parser.parse_batch(&text),
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "Manual signal entry failed"),
                }
            }
        }

        info!(count = batch.len(), "Gathered signal batch");
        batch
    }
}
