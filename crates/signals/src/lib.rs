//! Signal gathering: pulls raw text from the upstream feed, extracts
//! candidate blocks, and normalizes them into validated [`Signal`]s with
//! per-batch duplicate allowances.
//!
//! [`Signal`]: spread_stager_core::types::Signal

pub mod gatherer;
pub mod parser;
pub mod source;

pub use gatherer::SignalGatherer;
pub use parser::{SignalParser, SignalParserError};
pub use source::{FileSource, SignalSource, StaticSource};
