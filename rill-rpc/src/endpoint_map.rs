//! Token → receiver routing table.
//!
//! The building block a [`Transport`](crate::Transport) implementation
//! dispatches with. Entries hold the receiver weakly: registration is not
//! ownership, and a receiver whose handles are all gone unregisters itself
//! on drop. Well-known entries are fixed for the life of the map.

use std::collections::HashMap;
use std::rc::{Rc, Weak};

use rill_core::{TaskPriority, UID};

use crate::receiver::MessageReceiver;

struct Registered {
    receiver: Weak<dyn MessageReceiver>,
    #[allow(dead_code)]
    priority: TaskPriority,
    well_known: bool,
}

/// Routing table from endpoint tokens to registered receivers.
#[derive(Default)]
pub struct EndpointMap {
    entries: HashMap<UID, Registered>,
    insertions: u64,
    removals: u64,
}

impl EndpointMap {
    /// An empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a dynamically allocated endpoint.
    ///
    /// # Panics
    ///
    /// Registering a token twice is a protocol violation and panics.
    pub fn insert(&mut self, token: UID, receiver: &Rc<dyn MessageReceiver>, priority: TaskPriority) {
        self.insert_inner(token, receiver, priority, false);
    }

    /// Register a well-known endpoint; it cannot be removed afterwards.
    ///
    /// # Panics
    ///
    /// Panics on an invalid token or a token registered twice.
    pub fn insert_well_known(
        &mut self,
        token: UID,
        receiver: &Rc<dyn MessageReceiver>,
        priority: TaskPriority,
    ) {
        assert!(token.is_valid(), "well-known token must be non-zero");
        self.insert_inner(token, receiver, priority, true);
    }

    fn insert_inner(
        &mut self,
        token: UID,
        receiver: &Rc<dyn MessageReceiver>,
        priority: TaskPriority,
        well_known: bool,
    ) {
        let previous = self.entries.insert(
            token,
            Registered {
                receiver: Rc::downgrade(receiver),
                priority,
                well_known,
            },
        );
        assert!(
            previous.is_none(),
            "endpoint token {token} registered twice"
        );
        self.insertions += 1;
    }

    /// Look up the live receiver for `token`, if any.
    pub fn get(&self, token: &UID) -> Option<Rc<dyn MessageReceiver>> {
        self.entries.get(token).and_then(|e| e.receiver.upgrade())
    }

    /// Remove a dynamic endpoint. Well-known endpoints are left in place
    /// and `false` is returned.
    pub fn remove(&mut self, token: &UID) -> bool {
        match self.entries.get(token) {
            Some(entry) if entry.well_known => {
                tracing::trace!(%token, "ignoring removal of well-known endpoint");
                false
            }
            Some(_) => {
                self.entries.remove(token);
                self.removals += 1;
                true
            }
            None => false,
        }
    }

    /// Number of entries whose receiver is still alive.
    pub fn live_count(&self) -> usize {
        self.entries
            .values()
            .filter(|e| e.receiver.strong_count() > 0)
            .count()
    }

    /// Total registrations over the map's lifetime.
    pub fn insertion_count(&self) -> u64 {
        self.insertions
    }

    /// Total removals over the map's lifetime.
    pub fn removal_count(&self) -> u64 {
        self.removals
    }
}
