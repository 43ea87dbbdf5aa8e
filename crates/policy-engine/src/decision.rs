/// Admit or deny; the only two outcomes of a policy evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Relay the message unchanged.
    Admit,
    /// Drop the message silently.
    Deny,
}

impl Decision {
    pub fn is_admit(self) -> bool {
        self == Decision::Admit
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Decision::Admit => "admit",
            Decision::Deny => "deny",
        }
    }
}

/// A decision plus the context needed to log it.
#[derive(Debug, Clone)]
pub struct PolicyDecision {
    pub decision: Decision,
    /// Position of a matching rule in its list. Informational only: any
    /// matching rule admits, so which one is reported never changes the
    /// outcome.
    pub matched_rule: Option<usize>,
    /// Human-readable reason explaining the decision.
    pub reason: String,
}

impl PolicyDecision {
    pub fn admit(rule_index: usize) -> Self {
        Self {
            decision: Decision::Admit,
            matched_rule: Some(rule_index),
            reason: format!("matched rule #{rule_index}"),
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            decision: Decision::Deny,
            matched_rule: None,
            reason: reason.into(),
        }
    }
}
