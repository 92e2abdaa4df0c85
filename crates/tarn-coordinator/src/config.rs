use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tarn_fabric::SignalBackend;
use tarn_store::{StoreConfig, StoreResult, WriteTransaction};
use tarn_types::Schema;

/// Called as `(old_schema_version, new_schema_version, txn)` when a file's
/// schema version is older than the requested one.
pub type MigrationFn = Arc<dyn Fn(u64, u64, &mut WriteTransaction) -> StoreResult<()> + Send + Sync>;

/// How to open a realm.
#[derive(Clone)]
pub struct RealmConfig {
    pub path: PathBuf,
    /// Requested schema. `None` opens the file with whatever it has.
    pub schema: Option<Schema>,
    pub schema_version: u64,
    pub migration: Option<MigrationFn>,
    pub store: StoreConfig,
    pub signal: SignalBackend,
    /// Advance to new versions automatically when the coordinator delivers
    /// notifications, even without observers of one's own.
    pub auto_refresh: bool,
    pub read_only: bool,
}

impl RealmConfig {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            schema: None,
            schema_version: 0,
            migration: None,
            store: StoreConfig::default(),
            signal: SignalBackend::default(),
            auto_refresh: true,
            read_only: false,
        }
    }

    pub fn with_schema(mut self, schema: Schema, version: u64) -> Self {
        self.schema = Some(schema);
        self.schema_version = version;
        self
    }

    pub fn with_migration(
        mut self,
        migration: impl Fn(u64, u64, &mut WriteTransaction) -> StoreResult<()> + Send + Sync + 'static,
    ) -> Self {
        self.migration = Some(Arc::new(migration));
        self
    }

    pub fn with_store_config(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    pub fn with_signal(mut self, signal: SignalBackend) -> Self {
        self.signal = signal;
        self
    }

    pub fn with_auto_refresh(mut self, auto_refresh: bool) -> Self {
        self.auto_refresh = auto_refresh;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

impl fmt::Debug for RealmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealmConfig")
            .field("path", &self.path)
            .field("schema_version", &self.schema_version)
            .field("tables", &self.schema.as_ref().map(|s| s.tables.len()))
            .field("migration", &self.migration.is_some())
            .field("signal", &self.signal)
            .field("auto_refresh", &self.auto_refresh)
            .field("read_only", &self.read_only)
            .finish()
    }
}
