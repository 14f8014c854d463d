//! Core types, configuration, and market calendar for the spread stager.
//!
//! Everything here is pure: no sockets, no broker protocol. The broker and
//! engine crates build on these types.

pub mod clock;
pub mod config;
pub mod config_loader;
pub mod types;

pub use config::AppConfig;
pub use config_loader::ConfigLoader;
