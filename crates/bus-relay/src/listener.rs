use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use audit_log::AuditSink;
use policy_engine::PolicyReader;
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::address::BusAddress;
use crate::session::{RelaySession, SessionConfig, SessionError};

/// Pause after a failed `accept` so a persistent error does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Configuration for the inside listener.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Socket path the contained peer connects to.
    pub inside_path: PathBuf,
    /// Bus every accepted connection is paired with.
    pub outside: BusAddress,
    pub session: SessionConfig,
}

/// Accepts inside connections and runs one [`RelaySession`] per connection.
pub struct Proxy {
    config: Arc<ProxyConfig>,
    listener: UnixListener,
    policy: PolicyReader,
    audit: AuditSink,
}

impl Proxy {
    /// Bind the inside socket, replacing a stale socket file left behind by
    /// an earlier run.
    pub fn bind(config: ProxyConfig, policy: PolicyReader, audit: AuditSink) -> std::io::Result<Self> {
        remove_stale_socket(&config.inside_path)?;
        let listener = UnixListener::bind(&config.inside_path)?;
        tracing::info!(
            inside = %config.inside_path.display(),
            outside = %config.outside,
            bus = %config.session.bus,
            "proxy listening"
        );
        Ok(Self {
            config: Arc::new(config),
            listener,
            policy,
            audit,
        })
    }

    pub fn inside_path(&self) -> &Path {
        &self.config.inside_path
    }

    /// Accept connections until `shutdown` fires, then cancel every session,
    /// wait for them to finish and remove the socket file.
    pub async fn run(self, shutdown: CancellationToken) -> std::io::Result<()> {
        let mut sessions: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(err) = finished {
                        tracing::error!(%err, "session task panicked");
                    }
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let session = RelaySession::new(
                            self.config.session.clone(),
                            self.policy.clone(),
                            self.audit.clone(),
                            shutdown.child_token(),
                        );
                        let config = Arc::clone(&self.config);
                        sessions.spawn(handle_connection(session, stream, config));
                    }
                    Err(err) => {
                        tracing::warn!(%err, "failed to accept inside connection");
                        pause_after_accept_error(&shutdown).await;
                    }
                },
            }
        }

        tracing::info!(active = sessions.len(), "proxy shutting down");
        while let Some(finished) = sessions.join_next().await {
            if let Err(err) = finished {
                tracing::error!(%err, "session task panicked");
            }
        }

        drop(self.listener);
        match std::fs::remove_file(&self.config.inside_path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }
}

async fn handle_connection(session: RelaySession, inside: UnixStream, config: Arc<ProxyConfig>) {
    let session_id = session.id();
    let outside = match config.outside.connect().await {
        Ok(stream) => stream,
        Err(source) => {
            let err = SessionError::Connect {
                address: config.outside.to_string(),
                source,
            };
            tracing::error!(%session_id, %err, "dropping inside connection");
            return;
        }
    };

    // Outcome is logged and audited by the session itself.
    let _ = session.run(inside, outside).await;
}

async fn pause_after_accept_error(shutdown: &CancellationToken) {
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
    }
}

fn remove_stale_socket(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::FileTypeExt;

    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {
            tracing::debug!(path = %path.display(), "removing stale socket");
            std::fs::remove_file(path)
        }
        Ok(_) => Err(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            format!("{} exists and is not a socket", path.display()),
        )),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}
