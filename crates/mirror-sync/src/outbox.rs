//! Sends held while the gateway is unreachable.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

pub const DEFAULT_OUTBOX_CAPACITY: usize = 100;
pub const DEFAULT_OUTBOX_TTL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_OUTBOX_ATTEMPTS: u32 = 3;
pub const DEFAULT_RECENT_KEYS: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxConfig {
    pub capacity: usize,
    pub ttl: Duration,
    pub max_attempts: u32,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_OUTBOX_CAPACITY,
            ttl: DEFAULT_OUTBOX_TTL,
            max_attempts: DEFAULT_OUTBOX_ATTEMPTS,
        }
    }
}

/// A `chat.send` waiting for the next `Ready`.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedSend {
    pub conversation_id: String,
    pub message_id: String,
    pub idempotency_key: String,
    pub params: Value,
    pub enqueued_at: Instant,
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("outbox is full ({capacity} sends queued)")]
pub struct OutboxFull {
    pub capacity: usize,
}

#[derive(Debug, Default)]
pub struct DrainBatch {
    /// Oldest first.
    pub ready: Vec<QueuedSend>,
    pub expired: Vec<QueuedSend>,
}

#[derive(Debug)]
pub struct Outbox {
    config: OutboxConfig,
    entries: VecDeque<QueuedSend>,
}

impl Outbox {
    pub fn new(config: OutboxConfig) -> Self {
        Self {
            config,
            entries: VecDeque::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &OutboxConfig {
        &self.config
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Queue a send. Returns its 1-based position.
    ///
    /// A full outbox rejects the newcomer; nothing already queued is evicted.
    pub fn push(&mut self, entry: QueuedSend) -> Result<usize, OutboxFull> {
        if self.entries.len() >= self.config.capacity {
            return Err(OutboxFull {
                capacity: self.config.capacity,
            });
        }
        self.entries.push_back(entry);
        Ok(self.entries.len())
    }

    /// Take everything, split into still-valid sends and expired ones.
    pub fn drain(&mut self, now: Instant) -> DrainBatch {
        let mut batch = DrainBatch::default();
        for entry in self.entries.drain(..) {
            if now.saturating_duration_since(entry.enqueued_at) >= self.config.ttl {
                batch.expired.push(entry);
            } else {
                batch.ready.push(entry);
            }
        }
        batch
    }

    /// Count a failed delivery. `Err` carries an entry that has used all of
    /// its attempts.
    pub fn charge_attempt(&self, mut entry: QueuedSend) -> Result<QueuedSend, QueuedSend> {
        entry.attempts += 1;
        if entry.attempts >= self.config.max_attempts {
            Err(entry)
        } else {
            Ok(entry)
        }
    }

    /// Return untried sends to the front without counting an attempt.
    pub fn restore_front(&mut self, entries: impl DoubleEndedIterator<Item = QueuedSend>) {
        for entry in entries.rev() {
            self.entries.push_front(entry);
        }
    }

    /// Remove and return entries older than the expiry window.
    pub fn take_expired(&mut self, now: Instant) -> Vec<QueuedSend> {
        let ttl = self.config.ttl;
        let (expired, kept): (Vec<QueuedSend>, Vec<QueuedSend>) = self
            .entries
            .drain(..)
            .partition(|entry| now.saturating_duration_since(entry.enqueued_at) >= ttl);
        self.entries = kept.into();
        expired
    }
}

/// Bounded memory of idempotency keys already delivered.
#[derive(Debug)]
pub struct RecentKeys {
    capacity: usize,
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl Default for RecentKeys {
    fn default() -> Self {
        Self::new(DEFAULT_RECENT_KEYS)
    }
}

impl RecentKeys {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    /// Returns `false` if the key was already recorded.
    pub fn insert(&mut self, key: &str) -> bool {
        if self.seen.contains(key) {
            return false;
        }
        while self.order.len() >= self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.seen.remove(&oldest);
        }
        self.order.push_back(key.to_string());
        self.seen.insert(key.to_string());
        true
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.seen.contains(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
