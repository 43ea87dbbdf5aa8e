//! Out-of-band configuration channel.
//!
//! Policy documents arrive one per line, separately from bus traffic. A
//! valid document atomically replaces the active policy; an invalid one is
//! reported and the previous policy stays in force.

use std::path::{Path, PathBuf};

use audit_log::{AuditEntry, AuditEventType, AuditSink, AuditSource};
use futures_util::StreamExt;
use policy_engine::{loader, BusKind, ParseError, PolicyStore};
use tokio::io::AsyncRead;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;

/// Largest configuration document accepted on one line.
pub const MAX_DOCUMENT_LEN: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlSource {
    Stdin,
    /// A named pipe, reopened each time its writer disconnects.
    Fifo(PathBuf),
}

/// Parse `document` and, if valid, install it as the active policy.
pub async fn apply_document(document: &str, store: &PolicyStore, audit: &AuditSink) -> Result<(), ParseError> {
    match loader::parse_str(document) {
        Ok(policy) => {
            let session_rules = policy.rules(BusKind::Session).len();
            let system_rules = policy.rules(BusKind::System).len();
            store.replace(policy);
            audit
                .log(AuditEntry::new(
                    AuditEventType::PolicyReloaded,
                    AuditSource::new("control"),
                    serde_json::json!({
                        "session_rules": session_rules,
                        "system_rules": system_rules,
                    }),
                ))
                .await;
            Ok(())
        }
        Err(err) => {
            reject(err.to_string(), audit).await;
            Err(err)
        }
    }
}

async fn reject(reason: String, audit: &AuditSink) {
    tracing::warn!(error = %reason, "configuration rejected, keeping previous policy");
    audit
        .log(AuditEntry::new(
            AuditEventType::ConfigRejected,
            AuditSource::new("control"),
            serde_json::json!({ "error": reason }),
        ))
        .await;
}

/// Lines that cannot be decoded are rejected documents, not a broken channel.
fn is_bad_line(err: &LinesCodecError) -> bool {
    match err {
        LinesCodecError::MaxLineLengthExceeded => true,
        LinesCodecError::Io(io) => io.kind() == std::io::ErrorKind::InvalidData,
    }
}

/// Apply every document read from `reader` until EOF or cancellation.
pub async fn run_control<R>(
    reader: R,
    store: &PolicyStore,
    audit: &AuditSink,
    cancel: &CancellationToken,
) -> Result<(), LinesCodecError>
where
    R: AsyncRead + Unpin,
{
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_DOCUMENT_LEN));
    // After a decode error the stream yields one `None`, then keeps reading.
    let mut resuming = false;

    loop {
        let line = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            next = lines.next() => match next {
                Some(Ok(line)) => line,
                Some(Err(err)) if is_bad_line(&err) => {
                    reject(err.to_string(), audit).await;
                    resuming = true;
                    continue;
                }
                Some(Err(err)) => return Err(err),
                None if resuming => {
                    resuming = false;
                    continue;
                }
                None => return Ok(()),
            },
        };
        resuming = false;

        if line.trim().is_empty() {
            continue;
        }
        // Rejections are already logged and audited.
        let _ = apply_document(&line, store, audit).await;
    }
}

/// Serve the configured control source until cancellation. On stdin, EOF
/// ends the loop; a FIFO is reopened for the next writer.
pub async fn serve(source: ControlSource, store: &PolicyStore, audit: &AuditSink, cancel: &CancellationToken) {
    match source {
        ControlSource::Stdin => {
            if let Err(err) = run_control(tokio::io::stdin(), store, audit, cancel).await {
                tracing::error!(%err, "control channel failed");
            }
            tracing::info!("control channel closed, policy stays as is");
        }
        ControlSource::Fifo(path) => serve_fifo(&path, store, audit, cancel).await,
    }
}

async fn serve_fifo(path: &Path, store: &PolicyStore, audit: &AuditSink, cancel: &CancellationToken) {
    while !cancel.is_cancelled() {
        let file = tokio::select! {
            _ = cancel.cancelled() => return,
            opened = tokio::fs::File::open(path) => opened,
        };
        match file {
            Ok(file) => {
                tracing::debug!(path = %path.display(), "control writer connected");
                if let Err(err) = run_control(file, store, audit, cancel).await {
                    tracing::warn!(%err, "control stream error");
                }
            }
            Err(err) => {
                tracing::error!(path = %path.display(), %err, "cannot open control channel");
                return;
            }
        }
    }
}
