//! Audit queue - the per-store record of mutations awaiting acknowledgment.
//!
//! The queue is an ordered set keyed by [`FeatureKey`]. Entries drain in the
//! order their key first entered the queue. Mutating a feature that already
//! has a pending entry replaces that entry in place, following these rules:
//!
//! | pending  | new      | result                                      |
//! |----------|----------|---------------------------------------------|
//! | create   | update   | create carrying the new properties          |
//! | create   | delete   | entry removed, the remote never saw it      |
//! | anything | anything | the new operation replaces the pending one  |
//!
//! While an entry is in flight (handed to the remote system and not yet
//! answered) the first two rules do not apply: the in-flight attempt may land,
//! so the new operation simply replaces it and is sent after it. The answer to
//! the in-flight attempt is then reconciled against the replacement by
//! [`AuditQueue::acknowledge`] and [`AuditQueue::abort`].
//!
//! A failed send is ambiguous: the remote may have applied it before the
//! error surfaced. Once a create has been handed out, a delete for a feature
//! without a remote id no longer cancels it. The create stays queued, is sent
//! again if needed, and turns into a delete when its acknowledgment brings
//! the remote id. An entry only leaves the queue on an acknowledgment, or on
//! a cancellation of a create that never left the device.
//!
//! Every enqueue bumps the queue revision and stamps it into the item's `seq`,
//! so a stale acknowledgment can never remove a newer mutation.

use crate::{
    error::Result, Error, FeatureKey, FeatureRef, RemoteRowId, SyncItem, SyncOperation,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// What [`AuditQueue::enqueue`] did with an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// The key had no pending entry; the item went to the back of the queue
    Appended,
    /// The pending entry for the key was replaced by the new item
    Replaced,
    /// A pending create absorbed an update and stays a create
    Coalesced,
    /// A pending create was cancelled by a delete; nothing is left to send
    Cancelled,
    /// A delete arrived for a create that may already have reached the
    /// remote system; the create stays queued and is deleted once confirmed
    Deferred,
}

/// A queued item plus its bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    /// Drain position; fixed when the key first enters the queue
    pub slot: u64,
    pub item: SyncItem,
    /// A create for this key was handed to the remote system and has not
    /// been confirmed
    #[serde(default)]
    pub attempted: bool,
    /// The feature was deleted locally; the queued create becomes a delete
    /// once the remote id is known
    #[serde(default)]
    pub delete_after_create: bool,
    /// Handed to the remote system and not yet answered. Never persisted.
    #[serde(skip)]
    pub in_flight: bool,
}

impl AuditEntry {
    fn new(slot: u64, item: SyncItem) -> Self {
        Self {
            slot,
            item,
            attempted: false,
            delete_after_create: false,
            in_flight: false,
        }
    }
}

/// Ordered, deduplicated set of pending mutations for one store.
#[derive(Debug, Clone, Default)]
pub struct AuditQueue {
    order: BTreeMap<u64, FeatureKey>,
    entries: HashMap<FeatureKey, AuditEntry>,
    next_seq: u64,
}

impl AuditQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            order: BTreeMap::new(),
            entries: HashMap::new(),
            next_seq: 1,
        }
    }

    /// Rebuild a queue from items in drain order.
    pub fn from_items(items: impl IntoIterator<Item = SyncItem>) -> Result<Self> {
        Self::from_entries(items.into_iter().map(|item| AuditEntry::new(0, item)))
    }

    /// Rebuild a queue from entries in drain order.
    ///
    /// Used when restoring a snapshot: entries are taken as-is, without the
    /// coalescing rules, but two entries for the same key are rejected.
    /// Slots are reassigned and nothing is in flight afterwards.
    pub fn from_entries(entries: impl IntoIterator<Item = AuditEntry>) -> Result<Self> {
        let mut queue = Self::new();
        for mut entry in entries {
            let key = entry.item.key().clone();
            if queue.entries.contains_key(&key) {
                return Err(Error::InvalidSnapshot(format!(
                    "duplicate queue entry for {key}"
                )));
            }
            queue.next_seq = queue.next_seq.max(entry.item.seq + 1);
            entry.slot = queue.bump();
            entry.in_flight = false;
            queue.order.insert(entry.slot, key.clone());
            queue.entries.insert(key, entry);
        }
        Ok(queue)
    }

    /// Entries in drain order, for persisting.
    pub fn entries(&self) -> impl Iterator<Item = &AuditEntry> {
        self.order.values().filter_map(|key| self.entries.get(key))
    }

    fn bump(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Record a mutation.
    pub fn enqueue(&mut self, mut item: SyncItem) -> Enqueued {
        item.seq = self.bump();

        let Some(existing) = self.entries.get_mut(item.key()) else {
            let slot = item.seq;
            self.order.insert(slot, item.key().clone());
            self.entries
                .insert(item.key().clone(), AuditEntry::new(slot, item));
            return Enqueued::Appended;
        };

        if item.feature.remote_row_id.is_none() {
            item.feature.remote_row_id = existing.item.feature.remote_row_id.clone();
        }

        if item.operation == SyncOperation::Delete
            && item.feature.remote_row_id.is_none()
            && existing.attempted
        {
            // Keep the latest properties; a pending update here stands in
            // for a create still in flight.
            existing.item.operation = SyncOperation::Create;
            existing.item.seq = item.seq;
            existing.item.enqueued_at = item.enqueued_at;
            existing.delete_after_create = true;
            existing.in_flight = false;
            return Enqueued::Deferred;
        }

        if existing.in_flight {
            existing.item = item;
            existing.in_flight = false;
            return Enqueued::Replaced;
        }

        match (existing.item.operation, item.operation) {
            (SyncOperation::Create, SyncOperation::Update) => {
                existing.item.properties = item.properties;
                existing.item.seq = item.seq;
                existing.item.enqueued_at = item.enqueued_at;
                Enqueued::Coalesced
            }
            (SyncOperation::Create, SyncOperation::Delete) if !existing.attempted => {
                let key = item.feature.key;
                self.remove(&key);
                Enqueued::Cancelled
            }
            _ => {
                existing.item = item;
                Enqueued::Replaced
            }
        }
    }

    /// Items in drain order, including in-flight ones.
    pub fn iter(&self) -> impl Iterator<Item = &SyncItem> {
        self.order
            .values()
            .filter_map(|key| self.entries.get(key))
            .map(|entry| &entry.item)
    }

    /// Items in drain order that are not currently in flight.
    pub fn ready(&self) -> impl Iterator<Item = &SyncItem> {
        self.order
            .values()
            .filter_map(|key| self.entries.get(key))
            .filter(|entry| !entry.in_flight)
            .map(|entry| &entry.item)
    }

    /// Look up the pending entry for a key.
    pub fn get(&self, key: &FeatureKey) -> Option<&AuditEntry> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &FeatureKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Mark the entry matching `item` as handed to the remote system.
    ///
    /// Returns `false` if the entry is gone, already in flight, or has been
    /// replaced since `item` was read.
    pub fn begin(&mut self, item: &SyncItem) -> bool {
        match self.entries.get_mut(item.key()) {
            Some(entry) if entry.item.seq == item.seq && !entry.in_flight => {
                entry.in_flight = true;
                if item.operation == SyncOperation::Create {
                    entry.attempted = true;
                }
                true
            }
            _ => false,
        }
    }

    /// The remote system acknowledged `sent`.
    ///
    /// Removes the entry if it is still the one that was sent and returns
    /// `true`. If the entry was replaced while `sent` was in flight, the
    /// replacement stays queued; a remote id assigned by the acknowledgment is
    /// copied onto it, and a replacement create becomes an update because the
    /// feature now exists remotely. A create awaiting deletion becomes a
    /// delete addressed by the new remote id.
    pub fn acknowledge(&mut self, sent: &SyncItem, remote_row_id: Option<&RemoteRowId>) -> bool {
        let key = sent.key().clone();
        let Some(entry) = self.entries.get_mut(&key) else {
            return false;
        };
        let current = entry.item.seq == sent.seq;

        if sent.operation == SyncOperation::Create
            && entry.delete_after_create
            && (current || entry.item.operation == SyncOperation::Create)
        {
            return match remote_row_id {
                Some(remote) => {
                    self.delete_created(&key, remote);
                    false
                }
                // Confirmed, but nothing can address it remotely.
                None => {
                    self.remove(&key);
                    true
                }
            };
        }

        if current {
            self.remove(&key);
            return true;
        }

        if let Some(remote) = remote_row_id {
            if entry.item.feature.remote_row_id.is_none() {
                entry.item.feature.remote_row_id = Some(remote.clone());
            }
            entry.attempted = false;
        }
        if sent.operation == SyncOperation::Create && entry.item.operation == SyncOperation::Create
        {
            entry.item.operation = SyncOperation::Update;
        }
        false
    }

    fn delete_created(&mut self, key: &FeatureKey, remote_row_id: &RemoteRowId) {
        let seq = self.bump();
        if let Some(entry) = self.entries.get_mut(key) {
            let mut item = SyncItem::delete(
                FeatureRef::with_remote(key.clone(), remote_row_id.clone()),
                entry.item.enqueued_at,
            );
            item.seq = seq;
            entry.item = item;
            entry.attempted = false;
            entry.delete_after_create = false;
            entry.in_flight = false;
        }
    }

    /// The attempt to send `sent` failed; keep it for the next drain.
    ///
    /// If the entry was replaced while `sent` was in flight and `sent` was a
    /// create, a replacement update is folded back into a create, since the
    /// feature may not exist remotely. Nothing is removed: the failed create
    /// may still have landed.
    pub fn abort(&mut self, sent: &SyncItem) {
        let Some(entry) = self.entries.get_mut(sent.key()) else {
            return;
        };

        if entry.item.seq == sent.seq {
            entry.in_flight = false;
            return;
        }

        if sent.operation == SyncOperation::Create
            && entry.item.feature.remote_row_id.is_none()
            && entry.item.operation == SyncOperation::Update
        {
            entry.item.operation = SyncOperation::Create;
        }
    }

    /// Copy a remote id onto the pending entry for `key`, if any.
    pub fn set_remote_id(&mut self, key: &FeatureKey, remote_row_id: &RemoteRowId) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.item.feature.remote_row_id = Some(remote_row_id.clone());
        }
    }

    /// Drop the entry for `key` regardless of its state.
    pub fn remove(&mut self, key: &FeatureKey) -> Option<SyncItem> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.slot);
        Some(entry.item)
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.order.clear();
        self.entries.clear();
    }
}
