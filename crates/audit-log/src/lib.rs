//! Append-only JSON-lines audit trail for the D-Bus proxy.
//!
//! Every admission decision, session lifecycle change and policy reload can
//! be recorded as one newline-terminated JSON object. Writing happens on a
//! background task so the relay never blocks on disk I/O.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use audit_log::{AuditEntry, AuditEventType, AuditSink, AuditSource};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (sink, _handle) = AuditSink::start("/var/log/dbus-proxy/audit.jsonl").await?;
//!
//! sink.log(AuditEntry::new(
//!     AuditEventType::ProxyStarted,
//!     AuditSource::new("dbus-proxy"),
//!     serde_json::json!({"bus": "session"}),
//! ))
//! .await;
//! # Ok(())
//! # }
//! ```

pub mod entry;
pub mod sink;
pub mod writer;

pub use entry::{AuditEntry, AuditEventType, AuditSource, MessageRecord};
pub use sink::AuditSink;
pub use writer::{AuditWriteError, AuditWriter};
