//! Reference counts on versions held by live readers in this process.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tarn_types::Version;

use crate::catalog::Catalog;

struct PinEntry {
    count: usize,
    catalog: Arc<Catalog>,
}

/// Versions pinned by readers, with the catalog each pin keeps reachable.
#[derive(Default)]
pub struct PinRegistry {
    pins: Mutex<BTreeMap<Version, PinEntry>>,
}

impl PinRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin `catalog.version`.
    pub fn pin(self: &Arc<Self>, catalog: Arc<Catalog>) -> VersionPin {
        let version = catalog.version;
        let mut pins = self.pins.lock().expect("lock poisoned");
        pins.entry(version)
            .or_insert_with(|| PinEntry { count: 0, catalog })
            .count += 1;
        VersionPin {
            registry: Arc::clone(self),
            version,
        }
    }

    /// Pin `version` again if it is still pinned by someone.
    pub fn repin(self: &Arc<Self>, version: Version) -> Option<(VersionPin, Arc<Catalog>)> {
        let mut pins = self.pins.lock().expect("lock poisoned");
        let entry = pins.get_mut(&version)?;
        entry.count += 1;
        let catalog = Arc::clone(&entry.catalog);
        Some((
            VersionPin {
                registry: Arc::clone(self),
                version,
            },
            catalog,
        ))
    }

    pub fn oldest(&self) -> Option<Version> {
        self.pins
            .lock()
            .expect("lock poisoned")
            .keys()
            .next()
            .copied()
    }

    pub fn versions(&self) -> Vec<Version> {
        self.pins.lock().expect("lock poisoned").keys().copied().collect()
    }

    fn unpin(&self, version: Version) {
        let mut pins = self.pins.lock().expect("lock poisoned");
        if let Some(entry) = pins.get_mut(&version) {
            entry.count -= 1;
            if entry.count == 0 {
                pins.remove(&version);
            }
        }
    }
}

/// Keeps one version's data from being reclaimed while alive.
pub struct VersionPin {
    registry: Arc<PinRegistry>,
    version: Version,
}

impl VersionPin {
    pub fn version(&self) -> Version {
        self.version
    }
}

impl Drop for VersionPin {
    fn drop(&mut self) {
        self.registry.unpin(self.version);
    }
}

impl std::fmt::Debug for VersionPin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("VersionPin").field(&self.version).finish()
    }
}
