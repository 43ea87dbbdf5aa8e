use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use crate::evaluator::{BusKind, Policy};

/// Single-writer holder of the active [`Policy`].
///
/// Replacement publishes a whole new `Arc<Policy>`; readers take an `Arc`
/// snapshot and evaluate against it without holding any lock, so a
/// decision in progress never sees a mix of old and new rules.
#[derive(Debug)]
pub struct PolicyStore {
    tx: watch::Sender<Option<Arc<Policy>>>,
}

impl PolicyStore {
    /// A store with no policy yet. Readers observe `None` until the first
    /// [`replace`](Self::replace).
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    pub fn with_policy(policy: Policy) -> Self {
        let (tx, _rx) = watch::channel(Some(Arc::new(policy)));
        Self { tx }
    }

    /// Atomically install `policy`, returning the one it replaced.
    pub fn replace(&self, policy: Policy) -> Option<Arc<Policy>> {
        let session = policy.rules(BusKind::Session).len();
        let system = policy.rules(BusKind::System).len();
        let previous = self.tx.send_replace(Some(Arc::new(policy)));
        info!(
            session_rules = session,
            system_rules = system,
            replaced = previous.is_some(),
            "policy installed"
        );
        previous
    }

    pub fn current(&self) -> Option<Arc<Policy>> {
        self.tx.borrow().clone()
    }

    pub fn reader(&self) -> PolicyReader {
        PolicyReader {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for PolicyStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Cloneable read side of a [`PolicyStore`].
#[derive(Debug, Clone)]
pub struct PolicyReader {
    rx: watch::Receiver<Option<Arc<Policy>>>,
}

impl PolicyReader {
    /// The policy in force right now, if any has been installed.
    pub fn snapshot(&self) -> Option<Arc<Policy>> {
        self.rx.borrow().clone()
    }

    /// Wait until a policy is installed. Returns `None` when the store is
    /// dropped before that happens.
    pub async fn wait_for_policy(&mut self) -> Option<Arc<Policy>> {
        match self.rx.wait_for(Option::is_some).await {
            Ok(policy) => policy.clone(),
            Err(_) => None,
        }
    }
}
