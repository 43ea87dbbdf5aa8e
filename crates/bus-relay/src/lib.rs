//! Message-filtering relay between a contained D-Bus peer and a real bus.
//!
//! # Architecture
//!
//! ```text
//! inside peer  <--unix-->  bus-relay  <--unix-->  outside bus
//!                              |
//!                       [Classifier] -> policy_engine::Policy
//!                              |
//!                         [Audit Sink]
//! ```
//!
//! The [`Proxy`] listens on the inside socket and pairs every accepted
//! connection with a fresh connection to the outside bus. A
//! [`RelaySession`] relays the SASL handshake, then splits the byte stream
//! into whole messages and pumps both directions concurrently. Each message
//! is classified: bus driver traffic passes, replies pass only when they
//! answer an admitted call, eavesdropped copies are dropped, and every other
//! call or signal is judged by the current policy. Admitted messages are
//! forwarded byte for byte.
//!
//! Policy updates arrive through the [`control`] channel and take effect
//! for the next message without restarting sessions.

pub mod address;
pub mod auth;
pub mod classify;
pub mod control;
pub mod listener;
pub mod pending;
pub mod session;
pub mod wire;

#[cfg(test)]
pub(crate) mod testing;

pub use address::{AddressError, BusAddress};
pub use auth::AuthError;
pub use classify::{Classification, Classifier, Envelope};
pub use control::ControlSource;
pub use listener::{Proxy, ProxyConfig};
pub use session::{RelaySession, SessionConfig, SessionError, SessionState};
pub use wire::{DecodeError, MessageCodec, WireError};
