//! Fixed-capacity subscription ledger
//!
//! Topics the device wants to stay subscribed to. The ledger outlives every
//! broker session and is replayed after each reconnect. Slots are freed in
//! place, so live entries are not kept in insertion order after churn.

use thiserror::Error;

/// Default number of ledger slots
pub const DEFAULT_SUBSCRIPTION_CAPACITY: usize = 25;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Subscription ledger is full ({capacity} slots)")]
    Full { capacity: usize },
    #[error("Topic not found in subscription ledger: {0}")]
    NotFound(String),
}

#[derive(Debug, Clone, Default)]
struct Slot {
    topic: String,
    in_use: bool,
}

/// Subscription table with `N` slots
#[derive(Debug, Clone)]
pub struct SubscriptionLedger<const N: usize> {
    slots: [Slot; N],
}

impl<const N: usize> Default for SubscriptionLedger<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> SubscriptionLedger<N> {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| Slot::default()),
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.in_use).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.slots.iter().all(|s| s.in_use)
    }

    /// Store `topic` in the first free slot and return the slot index
    pub fn insert(&mut self, topic: &str) -> Result<usize, LedgerError> {
        let (index, slot) = self
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, s)| !s.in_use)
            .ok_or(LedgerError::Full { capacity: N })?;
        slot.topic.clear();
        slot.topic.push_str(topic);
        slot.in_use = true;
        Ok(index)
    }

    /// Free the first live slot holding exactly `topic`
    pub fn remove(&mut self, topic: &str) -> Result<usize, LedgerError> {
        let (index, slot) = self
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, s)| s.in_use && s.topic == topic)
            .ok_or_else(|| LedgerError::NotFound(topic.to_string()))?;
        slot.in_use = false;
        Ok(index)
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.iter().any(|t| t == topic)
    }

    /// Topic held in slot `index`, if that slot is live
    pub fn slot(&self, index: usize) -> Option<&str> {
        self.slots
            .get(index)
            .filter(|s| s.in_use)
            .map(|s| s.topic.as_str())
    }

    /// Live topics in slot order
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.slots
            .iter()
            .filter(|s| s.in_use)
            .map(|s| s.topic.as_str())
    }

    /// Drop every entry
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            slot.in_use = false;
            slot.topic.clear();
        }
    }
}
