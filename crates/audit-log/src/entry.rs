use serde::{Deserialize, Serialize};

/// One line of the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: uuid::Uuid,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub event_type: AuditEventType,
    pub source: AuditSource,
    pub details: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<MessageRecord>,
}

impl AuditEntry {
    pub fn new(event_type: AuditEventType, source: AuditSource, details: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            timestamp: chrono::Utc::now(),
            event_type,
            source,
            details,
            message: None,
        }
    }

    /// Attach the relayed (or dropped) message this entry is about.
    pub fn with_message(mut self, message: MessageRecord) -> Self {
        self.message = Some(message);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    ProxyStarted,
    ProxyStopped,
    SessionOpened,
    SessionClosed,
    MessageAdmitted,
    MessageDenied,
    PolicyReloaded,
    ConfigRejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditSource {
    pub component: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl AuditSource {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            session_id: None,
        }
    }

    pub fn for_session(component: impl Into<String>, session_id: impl ToString) -> Self {
        Self {
            component: component.into(),
            session_id: Some(session_id.to_string()),
        }
    }
}

/// The header fields of a message that a decision was made about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub direction: String,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub member: Option<String>,
    pub serial: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_snake_case_event_and_skips_empty_fields() {
        let entry = AuditEntry::new(
            AuditEventType::PolicyReloaded,
            AuditSource::new("control"),
            serde_json::json!({"session_rules": 2}),
        );
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["event_type"], "policy_reloaded");
        assert!(json.get("message").is_none());
        assert!(json["source"].get("session_id").is_none());
    }

    #[test]
    fn message_record_round_trips_through_entry() {
        let entry = AuditEntry::new(
            AuditEventType::MessageDenied,
            AuditSource::for_session("relay", 7),
            serde_json::json!({"reason": "no rule matched"}),
        )
        .with_message(MessageRecord {
            direction: "outgoing".into(),
            kind: "method_call".into(),
            interface: Some("com.X.A".into()),
            path: Some("/Obj".into()),
            member: Some("Call".into()),
            serial: 12,
        });

        let line = serde_json::to_string(&entry).unwrap();
        let back: AuditEntry = serde_json::from_str(&line).unwrap();
        assert_eq!(back.event_type, AuditEventType::MessageDenied);
        assert_eq!(back.source.session_id.as_deref(), Some("7"));
        assert_eq!(back.message.unwrap().member.as_deref(), Some("Call"));
    }
}
