use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::entry::AuditEntry;
use crate::writer::{AuditWriteError, AuditWriter};

const CHANNEL_BUFFER: usize = 1024;

/// Flush the writer after this long without new entries.
const FLUSH_INTERVAL_SECS: u64 = 1;

/// Cloneable handle for submitting [`AuditEntry`] values to the background
/// writer task.
///
/// The relay data path uses [`record`](Self::record), which never waits: when
/// the channel is full the entry is dropped and counted. Control-plane
/// events go through [`log`](Self::log), which waits for room.
#[derive(Clone)]
pub struct AuditSink {
    tx: Option<mpsc::Sender<AuditEntry>>,
    dropped: Arc<AtomicU64>,
}

impl AuditSink {
    /// Spawn the background writer appending to `path`.
    ///
    /// The task writes each entry as a JSON line, flushes when the channel
    /// has been idle for a second, and flushes once more before exiting when
    /// the last sink clone is dropped. I/O errors are logged and the entry is
    /// skipped.
    pub async fn start(path: impl AsRef<Path>) -> Result<(Self, JoinHandle<()>), AuditWriteError> {
        let (tx, rx) = mpsc::channel::<AuditEntry>(CHANNEL_BUFFER);
        let mut writer = AuditWriter::open(path).await?;

        let handle = tokio::spawn(async move {
            run_writer_loop(&mut writer, rx).await;
        });

        Ok((
            Self {
                tx: Some(tx),
                dropped: Arc::new(AtomicU64::new(0)),
            },
            handle,
        ))
    }

    /// A sink that discards everything. Used when no audit log is configured.
    pub fn disabled() -> Self {
        Self {
            tx: None,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Submit an entry, waiting for channel capacity.
    pub async fn log(&self, entry: AuditEntry) {
        let Some(tx) = &self.tx else { return };
        if let Err(err) = tx.send(entry).await {
            tracing::warn!(
                event_type = ?err.0.event_type,
                "audit sink closed, entry dropped"
            );
        }
    }

    /// Submit an entry without waiting. Returns `false` if it was dropped.
    pub fn record(&self, entry: AuditEntry) -> bool {
        let Some(tx) = &self.tx else { return true };
        match tx.try_send(entry) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(entry)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if total.is_power_of_two() {
                    tracing::warn!(
                        event_type = ?entry.event_type,
                        dropped_total = total,
                        "audit channel full, dropping entries"
                    );
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Entries discarded by [`record`](Self::record) because the channel
    /// was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

async fn run_writer_loop(writer: &mut AuditWriter, mut rx: mpsc::Receiver<AuditEntry>) {
    let flush_interval = tokio::time::Duration::from_secs(FLUSH_INTERVAL_SECS);
    let mut dirty = false;

    loop {
        match tokio::time::timeout(flush_interval, rx.recv()).await {
            Ok(Some(entry)) => {
                if let Err(err) = writer.write(&entry).await {
                    tracing::error!(%err, "failed to write audit entry");
                } else {
                    dirty = true;
                }
            }
            Ok(None) => {
                if dirty {
                    if let Err(err) = writer.flush().await {
                        tracing::error!(%err, "failed to flush audit log on shutdown");
                    }
                }
                tracing::debug!("audit writer shutting down");
                return;
            }
            Err(_) => {
                if dirty {
                    if let Err(err) = writer.flush().await {
                        tracing::error!(%err, "periodic audit log flush failed");
                    } else {
                        dirty = false;
                    }
                }
            }
        }
    }
}
