//! Broker session correlation layer.
//!
//! Turns the broker's callback-only, connection-oriented protocol into
//! timeout-bounded, retryable request/response operations. The transport
//! itself is a collaborator behind [`transport::BrokerTransport`]; all
//! results arrive as [`transport::BrokerEvent`]s on an internal queue that
//! a single dispatch task consumes.

pub mod resolver;
pub mod session;
pub mod sim;
pub mod transport;
pub mod types;

pub use resolver::{InstrumentResolver, ResolveError};
pub use session::{BrokerSession, SessionError, SessionTuning};
pub use transport::{BrokerEvent, BrokerTransport, TransportError};
