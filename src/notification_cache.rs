//! In-memory, authoritative view of the signed-in user's notifications.

use crate::types::notification::Notification;
use log::{debug, trace};
use std::collections::VecDeque;
use std::sync::{PoisonError, RwLock};
use tokio::sync::watch;

/// What [`NotificationCache::insert_newest`] does when the incoming id is
/// already cached (for example the server echoes an item it just returned
/// from a create call).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicatePolicy {
    /// Drop the older copy and put the incoming one at the front. A cached
    /// item that is already read stays read.
    #[default]
    ReplaceExisting,
    /// Keep both copies.
    KeepBoth,
    /// Leave the cache untouched.
    IgnoreIncoming,
}

/// Result of an insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Replaced,
    Ignored,
}

/// Consistent copy of the cache at one instant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheSnapshot {
    pub notifications: Vec<Notification>,
    pub unread_count: usize,
}

#[derive(Debug, Default)]
struct CacheState {
    // Newest first, by insertion.
    notifications: VecDeque<Notification>,
    unread_count: usize,
}

impl CacheState {
    fn recount(&mut self) {
        self.unread_count = self.notifications.iter().filter(|n| n.is_unread()).count();
    }
}

/// Every mutation holds the write lock for the whole update, so readers never
/// see a list and an unread count that disagree.
#[derive(Debug)]
pub struct NotificationCache {
    state: RwLock<CacheState>,
    policy: DuplicatePolicy,
    revision: watch::Sender<u64>,
}

impl NotificationCache {
    pub fn new() -> Self {
        Self::with_policy(DuplicatePolicy::default())
    }

    pub fn with_policy(policy: DuplicatePolicy) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            state: RwLock::new(CacheState::default()),
            policy,
            revision,
        }
    }

    /// Installs `notifications` verbatim, discarding everything cached.
    pub fn replace_all(&self, notifications: Vec<Notification>) {
        self.mutate(|state| {
            state.notifications = notifications.into();
            debug!(target: "Cache", "Replaced cache with {} notifications", state.notifications.len());
            true
        });
    }

    /// Puts `notification` at the front, applying the duplicate policy.
    pub fn insert_newest(&self, mut notification: Notification) -> InsertOutcome {
        let policy = self.policy;
        let mut outcome = InsertOutcome::Inserted;
        self.mutate(|state| {
            let existing = state
                .notifications
                .iter()
                .position(|n| n.id == notification.id);
            match (policy, existing) {
                (DuplicatePolicy::IgnoreIncoming, Some(_)) => {
                    outcome = InsertOutcome::Ignored;
                    return false;
                }
                (DuplicatePolicy::ReplaceExisting, Some(index)) => {
                    if let Some(previous) = state.notifications.remove(index) {
                        notification.read |= previous.read;
                    }
                    outcome = InsertOutcome::Replaced;
                }
                _ => {}
            }
            trace!(target: "Cache", "Inserting notification {} ({:?})", notification.id, outcome);
            state.notifications.push_front(notification);
            true
        });
        outcome
    }

    /// Flips the matching entry to read. Unknown ids and already-read entries
    /// are left alone. Returns whether anything changed.
    pub fn mark_read(&self, id: &str) -> bool {
        self.mutate(|state| {
            match state
                .notifications
                .iter_mut()
                .find(|n| n.id == id && n.is_unread())
            {
                Some(entry) => {
                    entry.read = true;
                    true
                }
                None => false,
            }
        })
    }

    pub fn clear(&self) {
        self.mutate(|state| {
            state.notifications.clear();
            true
        });
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        CacheSnapshot {
            notifications: state.notifications.iter().cloned().collect(),
            unread_count: state.unread_count,
        }
    }

    pub fn unread_count(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .unread_count
    }

    pub fn len(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .notifications
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: &str) -> Option<Notification> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .notifications
            .iter()
            .find(|n| n.id == id)
            .cloned()
    }

    /// Revision counter bumped after every mutation that changed something.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    fn mutate(&self, f: impl FnOnce(&mut CacheState) -> bool) -> bool {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let changed = f(&mut state);
        if changed {
            state.recount();
            self.revision.send_modify(|revision| *revision += 1);
        }
        changed
    }
}

impl Default for NotificationCache {
    fn default() -> Self {
        Self::new()
    }
}
