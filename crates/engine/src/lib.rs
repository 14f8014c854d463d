//! The signal-to-order pipeline: staging, the one-shot GO/NO-GO pass,
//! post-open error recovery, and the daily supervisor loop.

pub mod cycle;
pub mod decider;
pub mod recovery;
pub mod stager;

pub use cycle::{CycleTuning, DailyCycle};
pub use stager::{is_duplicate, ManagedOrder, OrderStager, StageError};
