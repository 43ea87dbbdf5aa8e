use std::time::Duration;

use audit_log::{AuditEntry, AuditEventType, AuditSink, AuditSource, MessageRecord};
use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use policy_engine::{BusKind, Direction, PolicyReader};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::auth::{relay_handshake, AuthError};
use crate::classify::{Classification, Classifier, Envelope};
use crate::pending::{PendingReplies, ReplyKey};
use crate::wire::{Header, WireError};

pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_PENDING_REPLIES: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Endpoints are open but no policy has been installed yet. Driver
    /// traffic flows, everything the policy would judge is denied.
    AwaitingConfig,
    Active,
    /// One side has gone away; the other pump is finishing.
    Closing,
    Closed,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub bus: BusKind,
    pub auth_timeout: Duration,
    pub max_pending_replies: usize,
}

impl SessionConfig {
    pub fn new(bus: BusKind) -> Self {
        Self {
            bus,
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
            max_pending_replies: DEFAULT_MAX_PENDING_REPLIES,
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to connect to outside bus {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("{direction} transport failed: {source}")]
    Transport {
        direction: Direction,
        #[source]
        source: WireError,
    },
}

/// One inside connection paired with its outside connection.
///
/// Two pumps run concurrently, one per direction. Each classifies every
/// message, consults the current policy snapshot where needed and forwards
/// admitted frames unchanged. The only thing they share is the policy; a
/// pump that admits a call tells the opposite pump over a channel so the
/// reply can be let through.
pub struct RelaySession {
    id: uuid::Uuid,
    config: SessionConfig,
    policy: PolicyReader,
    audit: AuditSink,
    cancel: CancellationToken,
    state: watch::Sender<SessionState>,
}

impl RelaySession {
    /// `cancel` should be a child of the process shutdown token.
    pub fn new(config: SessionConfig, policy: PolicyReader, audit: AuditSink, cancel: CancellationToken) -> Self {
        let (state, _) = watch::channel(SessionState::AwaitingConfig);
        Self {
            id: uuid::Uuid::new_v4(),
            config,
            policy,
            audit,
            cancel,
            state,
        }
    }

    pub fn id(&self) -> uuid::Uuid {
        self.id
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Relay until either endpoint closes, a transport error occurs or the
    /// session is cancelled. Both endpoints are dropped on return.
    pub async fn run<C, B>(self, inside: C, outside: B) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
        B: AsyncRead + AsyncWrite + Unpin,
    {
        info!(session_id = %self.id, bus = %self.config.bus, "session opened");
        self.audit_lifecycle(AuditEventType::SessionOpened, serde_json::json!({
            "bus": self.config.bus.as_str(),
        }));

        let result = self.relay(inside, outside).await;

        self.begin_closing();
        self.state.send_replace(SessionState::Closed);

        match &result {
            Ok(()) => info!(session_id = %self.id, "session closed"),
            Err(err) => warn!(session_id = %self.id, %err, "session closed with error"),
        }
        self.audit_lifecycle(AuditEventType::SessionClosed, serde_json::json!({
            "bus": self.config.bus.as_str(),
            "error": result.as_ref().err().map(ToString::to_string),
        }));

        result
    }

    async fn relay<C, B>(&self, inside: C, outside: B) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
        B: AsyncRead + AsyncWrite + Unpin,
    {
        let handshake = tokio::time::timeout(self.config.auth_timeout, relay_handshake(inside, outside));
        let (client, bus) = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(()),
            res = handshake => res.map_err(|_| AuthError::Timeout)??,
        };

        let (client_tx, client_rx) = client.split::<Bytes>();
        let (bus_tx, bus_rx) = bus.split::<Bytes>();
        let (to_incoming, incoming_admitted) = mpsc::unbounded_channel();
        let (to_outgoing, outgoing_admitted) = mpsc::unbounded_channel();

        let mut outgoing = Pump::new(self, Direction::Outgoing, outgoing_admitted, to_incoming);
        let mut incoming = Pump::new(self, Direction::Incoming, incoming_admitted, to_outgoing);

        let (out_result, in_result, ()) = tokio::join!(
            outgoing.run(client_rx, bus_tx),
            incoming.run(bus_rx, client_tx),
            self.activate(),
        );
        out_result.and(in_result)
    }

    /// Move to `Active` once a policy is available.
    async fn activate(&self) {
        let mut reader = self.policy.clone();
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            policy = reader.wait_for_policy() => {
                if policy.is_some() {
                    let activated = self.state.send_if_modified(|s| {
                        if *s == SessionState::AwaitingConfig {
                            *s = SessionState::Active;
                            true
                        } else {
                            false
                        }
                    });
                    if activated {
                        debug!(session_id = %self.id, "session active");
                    }
                }
            }
        }
    }

    fn begin_closing(&self) {
        self.state.send_if_modified(|s| match s {
            SessionState::AwaitingConfig | SessionState::Active => {
                *s = SessionState::Closing;
                true
            }
            _ => false,
        });
        self.cancel.cancel();
    }

    fn audit_lifecycle(&self, kind: AuditEventType, details: serde_json::Value) {
        self.audit.record(AuditEntry::new(
            kind,
            AuditSource::for_session("bus-relay", self.id),
            details,
        ));
    }
}

/// One direction of a session.
struct Pump<'s> {
    session: &'s RelaySession,
    direction: Direction,
    classifier: Classifier,
    /// Calls admitted the other way whose replies this pump may pass.
    pending: PendingReplies,
    admitted: mpsc::UnboundedReceiver<ReplyKey>,
    notify: mpsc::UnboundedSender<ReplyKey>,
}

impl<'s> Pump<'s> {
    fn new(
        session: &'s RelaySession,
        direction: Direction,
        admitted: mpsc::UnboundedReceiver<ReplyKey>,
        notify: mpsc::UnboundedSender<ReplyKey>,
    ) -> Self {
        Self {
            session,
            direction,
            classifier: Classifier::new(direction),
            pending: PendingReplies::new(session.config.max_pending_replies),
            admitted,
            notify,
        }
    }

    /// Keys admitted by the other pump are moved into the bounded table as
    /// soon as they arrive, whether or not this side has traffic.
    async fn run<S, K>(&mut self, mut source: S, mut sink: K) -> Result<(), SessionError>
    where
        S: Stream<Item = Result<Bytes, WireError>> + Unpin,
        K: Sink<Bytes, Error = WireError> + Unpin,
    {
        let cancel = self.session.cancel.clone();
        let direction = self.direction;
        let transport = |source| SessionError::Transport { direction, source };

        let result = 'relay: loop {
            let frame = tokio::select! {
                biased;
                Some(key) = self.admitted.recv() => {
                    self.pending.insert(key);
                    continue;
                }
                _ = cancel.cancelled() => break Ok(()),
                next = source.next() => match next {
                    Some(Ok(frame)) => frame,
                    Some(Err(err)) => break Err(transport(err)),
                    None => {
                        debug!(session_id = %self.session.id, %direction, "endpoint closed");
                        break Ok(());
                    }
                },
            };

            if !self.admit(&frame) {
                continue;
            }

            let send = sink.send(frame);
            tokio::pin!(send);
            loop {
                tokio::select! {
                    biased;
                    Some(key) = self.admitted.recv() => self.pending.insert(key),
                    _ = cancel.cancelled() => break 'relay Ok(()),
                    sent = &mut send => match sent {
                        Ok(()) => break,
                        Err(err) => break 'relay Err(transport(err)),
                    },
                }
            }
        };

        self.session.begin_closing();
        result
    }

    fn admit(&mut self, frame: &Bytes) -> bool {
        while let Ok(key) = self.admitted.try_recv() {
            self.pending.insert(key);
        }

        let (header, class) = match self.classifier.classify(frame) {
            Ok(classified) => classified,
            Err(err) => {
                warn!(
                    session_id = %self.session.id,
                    direction = %self.direction,
                    %err,
                    "undecodable message denied"
                );
                self.audit_decision(AuditEventType::MessageDenied, None, &err.to_string());
                return false;
            }
        };

        match class {
            Classification::Control => {
                trace!(
                    session_id = %self.session.id,
                    direction = %self.direction,
                    member = header.member.as_deref().unwrap_or(""),
                    "bus driver traffic"
                );
                true
            }
            Classification::Observed => {
                trace!(
                    session_id = %self.session.id,
                    sender = header.sender.as_deref().unwrap_or(""),
                    destination = header.destination.as_deref().unwrap_or(""),
                    "eavesdropped message dropped"
                );
                false
            }
            Classification::Reply {
                reply_serial,
                destination,
            } => self.admit_reply(&header, reply_serial, destination),
            Classification::Boundary(envelope) => self.admit_boundary(&header, &envelope),
        }
    }

    fn admit_reply(&mut self, header: &Header, reply_serial: u32, destination: Option<String>) -> bool {
        let key = match (self.direction, destination) {
            (Direction::Incoming, _) => Some(ReplyKey::inside(reply_serial)),
            (Direction::Outgoing, Some(caller)) => Some(ReplyKey::outside(caller, reply_serial)),
            (Direction::Outgoing, None) => None,
        };

        if key.is_some_and(|k| self.pending.take(&k)) {
            trace!(session_id = %self.session.id, direction = %self.direction, reply_serial, "reply admitted");
            return true;
        }

        info!(
            session_id = %self.session.id,
            direction = %self.direction,
            reply_serial,
            "rejected reply to a call that was not admitted"
        );
        self.audit_decision(
            AuditEventType::MessageDenied,
            Some(header),
            "reply to a call that was not admitted",
        );
        false
    }

    fn admit_boundary(&mut self, header: &Header, envelope: &Envelope) -> bool {
        let Some(policy) = self.session.policy.snapshot() else {
            info!(
                session_id = %self.session.id,
                direction = %self.direction,
                interface = %envelope.interface,
                path = %envelope.object_path,
                member = %envelope.method,
                "rejected call, no configuration loaded"
            );
            self.audit_decision(AuditEventType::MessageDenied, Some(header), "no configuration loaded");
            return false;
        };

        let verdict = policy.evaluate(self.session.config.bus, &envelope.query());

        if !verdict.decision.is_admit() {
            info!(
                session_id = %self.session.id,
                direction = %self.direction,
                interface = %envelope.interface,
                path = %envelope.object_path,
                member = %envelope.method,
                reason = %verdict.reason,
                "rejected call"
            );
            self.audit_decision(AuditEventType::MessageDenied, Some(header), &verdict.reason);
            return false;
        }

        debug!(
            session_id = %self.session.id,
            direction = %self.direction,
            interface = %envelope.interface,
            path = %envelope.object_path,
            member = %envelope.method,
            rule = ?verdict.matched_rule,
            "accepted call"
        );

        if header.expects_reply() {
            let key = match self.direction {
                Direction::Outgoing => Some(ReplyKey::inside(header.serial)),
                Direction::Incoming => header
                    .sender
                    .as_deref()
                    .map(|caller| ReplyKey::outside(caller, header.serial)),
            };
            // Sent before the call is written, so the other pump has it by
            // the time any reply can arrive. A closed receiver means that
            // pump has already stopped.
            if let Some(key) = key {
                let _ = self.notify.send(key);
            }
        }

        self.audit_decision(AuditEventType::MessageAdmitted, Some(header), &verdict.reason);
        true
    }

    fn audit_decision(&self, kind: AuditEventType, header: Option<&Header>, reason: &str) {
        if !self.session.audit.is_enabled() {
            return;
        }
        let mut entry = AuditEntry::new(
            kind,
            AuditSource::for_session("bus-relay", self.session.id),
            serde_json::json!({
                "bus": self.session.config.bus.as_str(),
                "reason": reason,
            }),
        );
        if let Some(h) = header {
            entry = entry.with_message(MessageRecord {
                direction: self.direction.as_str().to_string(),
                kind: h.message_type.as_str().to_string(),
                interface: h.interface.clone(),
                path: h.path.clone(),
                member: h.member.clone(),
                serial: h.serial,
            });
        }
        self.session.audit.record(entry);
    }
}
