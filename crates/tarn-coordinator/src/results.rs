use std::sync::{Arc, Weak};

use tarn_notify::Query;
use tarn_types::{ObjectKey, Version};

use crate::coordinator::{Coordinator, NotifierId};

/// The keys a query matched at one version, in result order.
#[derive(Clone, Debug, PartialEq)]
pub struct Results {
    query: Query,
    version: Version,
    keys: Vec<ObjectKey>,
}

impl Results {
    pub(crate) fn new(query: Query, version: Version, keys: Vec<ObjectKey>) -> Self {
        Self {
            query,
            version,
            keys,
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    /// The version the query was evaluated at.
    pub fn version(&self) -> Version {
        self.version
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<ObjectKey> {
        self.keys.get(index).copied()
    }

    pub fn index_of(&self, key: ObjectKey) -> Option<usize> {
        self.keys.iter().position(|k| *k == key)
    }

    pub fn keys(&self) -> &[ObjectKey] {
        &self.keys
    }

    pub fn iter(&self) -> impl Iterator<Item = ObjectKey> + '_ {
        self.keys.iter().copied()
    }
}

/// Keeps an observer registered. Dropping it unregisters, after which no
/// further callback runs, even for output already computed.
#[must_use = "dropping the token unregisters the observer"]
pub struct NotificationToken {
    id: NotifierId,
    coordinator: Weak<Coordinator>,
}

impl NotificationToken {
    pub(crate) fn new(id: NotifierId, coordinator: &Arc<Coordinator>) -> Self {
        Self {
            id,
            coordinator: Arc::downgrade(coordinator),
        }
    }

    pub fn id(&self) -> NotifierId {
        self.id
    }

    pub fn invalidate(self) {}
}

impl Drop for NotificationToken {
    fn drop(&mut self) {
        if let Some(coordinator) = self.coordinator.upgrade() {
            coordinator.unregister_notifier(self.id);
        }
    }
}

impl std::fmt::Debug for NotificationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("NotificationToken").field(&self.id).finish()
    }
}
