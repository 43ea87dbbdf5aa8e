use std::collections::{HashMap, VecDeque};

/// Identifies the call a reply answers.
///
/// Calls made by the inside peer are keyed by serial alone, since it owns
/// that serial space. Calls made by outside peers also carry the caller's
/// unique name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReplyKey {
    pub peer: Option<String>,
    pub serial: u32,
}

impl ReplyKey {
    pub fn inside(serial: u32) -> Self {
        Self { peer: None, serial }
    }

    pub fn outside(peer: impl Into<String>, serial: u32) -> Self {
        Self {
            peer: Some(peer.into()),
            serial,
        }
    }
}

/// Admitted calls still waiting for their reply, bounded in size.
///
/// When full, the oldest entry is forgotten and a late reply to it will be
/// denied.
#[derive(Debug)]
pub struct PendingReplies {
    live: HashMap<ReplyKey, u64>,
    order: VecDeque<(ReplyKey, u64)>,
    next_gen: u64,
    capacity: usize,
}

impl PendingReplies {
    pub fn new(capacity: usize) -> Self {
        Self {
            live: HashMap::new(),
            order: VecDeque::new(),
            next_gen: 0,
            capacity: capacity.max(1),
        }
    }

    pub fn insert(&mut self, key: ReplyKey) {
        let generation = self.next_gen;
        self.next_gen += 1;
        self.live.insert(key.clone(), generation);
        self.order.push_back((key, generation));

        while self.live.len() > self.capacity {
            match self.order.pop_front() {
                Some((old, g)) if self.live.get(&old) == Some(&g) => {
                    self.live.remove(&old);
                    tracing::debug!(peer = ?old.peer, serial = old.serial, "pending reply evicted");
                }
                Some(_) => {}
                None => break,
            }
        }
        // Stale order entries from consumed keys.
        if self.order.len() > self.capacity * 2 {
            let live = &self.live;
            self.order.retain(|(k, g)| live.get(k) == Some(g));
        }
    }

    /// Consume the entry for `key`. Returns whether it was pending.
    pub fn take(&mut self, key: &ReplyKey) -> bool {
        self.live.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}
