//! # policy-engine
//!
//! Access-control core of the D-Bus proxy. This crate parses the JSON rule
//! configuration, compiles it into an immutable [`Policy`], and decides for
//! each message crossing the proxy whether it is admitted or denied.
//!
//! A policy is a pair of allow-lists (session bus and system bus). A
//! message is admitted when any rule of its bus kind matches; rule order
//! never matters and an empty list denies everything.
//!
//! ## Quick start
//!
//! ```rust
//! use policy_engine::{loader, BusKind, Decision, Direction, Query};
//!
//! let policy = loader::parse_str(r#"{
//!     "dbus-gateway-config-session": [
//!         {"direction": "outgoing", "interface": "com.example.*", "object-path": "*", "method": "*"}
//!     ],
//!     "dbus-gateway-config-system": []
//! }"#).unwrap();
//!
//! let q = Query::new(Direction::Outgoing, "com.example.Player", "/player", "Play");
//! assert_eq!(policy.decide(BusKind::Session, &q), Decision::Admit);
//! ```

mod decision;
mod evaluator;
pub mod loader;
pub mod matcher;
mod rule;
mod schema;
mod store;

pub use decision::{Decision, PolicyDecision};
pub use evaluator::{BusKind, Policy};
pub use loader::ParseError;
pub use matcher::{Direction, DirectionPattern, InterfacePattern, MethodPattern, PathPattern, PatternError};
pub use rule::{Query, Rule};
pub use schema::{ConfigDocument, MethodField, RuleRecord};
pub use store::{PolicyReader, PolicyStore};
