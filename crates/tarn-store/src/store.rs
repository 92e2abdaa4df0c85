//! The versioned store: opening, committing and reading versions.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use tarn_changeset::{Changeset, TransactionLog};
use tarn_types::{Schema, Version};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::PageCache;
use crate::catalog::Catalog;
use crate::config::{Durability, StoreConfig};
use crate::error::{StoreError, StoreResult};
use crate::file::StoreFile;
use crate::format::{read_block, BlockRef, EncodedBlock, Header, TopSlot, HEADER_SIZE};
use crate::lock::{Presence, WriterLock};
use crate::page::Page;
use crate::pin::PinRegistry;
use crate::snapshot::{ReadTransaction, Snapshot};
use crate::write::{PendingCommit, WriteTransaction};

/// Attempts at reading a header that a concurrent commit in another process
/// may be rewriting.
const HEADER_READ_ATTEMPTS: usize = 3;

/// State shared by a store handle and every transaction created from it.
pub(crate) struct Shared {
    path: PathBuf,
    config: StoreConfig,
    read_only: bool,
    file: StoreFile,
    header: Mutex<Header>,
    latest: RwLock<Arc<Catalog>>,
    pub(crate) pins: Arc<PinRegistry>,
    cache: PageCache,
    writer: Arc<WriterLock>,
    presence: Presence,
}

/// Summary of a store file, for tooling.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreInfo {
    pub path: PathBuf,
    pub file_id: Uuid,
    pub version: Version,
    pub schema_version: u64,
    pub file_len: u64,
    pub free_bytes: u64,
    pub retained_history: usize,
    pub tables: Vec<(String, u64)>,
}

/// A multi-version object store in a single file.
///
/// Readers pin committed versions and never block; one writer at a time
/// (across threads and processes) builds the next version in an overlay and
/// installs it with a single header flip.
#[derive(Clone)]
pub struct VersionedStore {
    shared: Arc<Shared>,
}

impl VersionedStore {
    /// Open `path`, creating an empty store if the file does not exist.
    pub fn open(path: impl AsRef<Path>, config: StoreConfig) -> StoreResult<Self> {
        Self::open_with_schema(path, config, &Schema::empty(), 0)
    }

    /// Open `path`. A newly created file starts at version 0 with `schema`.
    pub fn open_with_schema(
        path: impl AsRef<Path>,
        config: StoreConfig,
        schema: &Schema,
        schema_version: u64,
    ) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let presence = Presence::join(path)?;
        let writer = Arc::new(WriterLock::open(path)?);
        let file = StoreFile::open(path, false)?;

        if file.len()? == 0 {
            let _guard = writer.acquire(true)?;
            if file.len()? == 0 {
                schema.validate()?;
                initialize(&file, &config, Catalog::initial(schema.clone(), schema_version))?;
                info!(path = %path.display(), "created store");
            }
        }

        Self::from_parts(path, config, false, file, writer, presence)
    }

    /// Open an existing file without write access.
    pub fn open_read_only(path: impl AsRef<Path>, config: StoreConfig) -> StoreResult<Self> {
        let path = path.as_ref();
        let file = StoreFile::open(path, true)?;
        let presence = Presence::join(path)?;
        let writer = Arc::new(WriterLock::open(path)?);
        Self::from_parts(path, config, true, file, writer, presence)
    }

    fn from_parts(
        path: &Path,
        config: StoreConfig,
        read_only: bool,
        file: StoreFile,
        writer: Arc<WriterLock>,
        presence: Presence,
    ) -> StoreResult<Self> {
        let header = read_header(&file, path)?;
        let catalog: Catalog = read_block(&file, header.top.catalog)?;
        if catalog.version != header.top.version {
            return Err(StoreError::Corruption(format!(
                "catalog is for {} but header names {}",
                catalog.version, header.top.version
            )));
        }
        debug!(path = %path.display(), version = %catalog.version, "opened store");

        Ok(Self {
            shared: Arc::new(Shared {
                path: path.to_path_buf(),
                cache: PageCache::new(config.page_cache_capacity),
                config,
                read_only,
                file,
                header: Mutex::new(header),
                latest: RwLock::new(Arc::new(catalog)),
                pins: Arc::new(PinRegistry::new()),
                writer,
                presence,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    pub fn config(&self) -> &StoreConfig {
        &self.shared.config
    }

    pub fn file_id(&self) -> Uuid {
        self.shared.header.lock().expect("lock poisoned").file_id
    }

    /// The newest committed version, including commits by other processes.
    pub fn latest_version(&self) -> StoreResult<Version> {
        Ok(self.shared.refresh()?.version)
    }

    /// Begin the write transaction, waiting for any other writer.
    pub fn begin_write(&self) -> StoreResult<WriteTransaction> {
        self.start_write(true)
    }

    /// Begin the write transaction, or fail with
    /// [`StoreError::WouldBlock`] if another writer holds the file.
    pub fn try_begin_write(&self) -> StoreResult<WriteTransaction> {
        self.start_write(false)
    }

    fn start_write(&self, wait: bool) -> StoreResult<WriteTransaction> {
        if self.shared.read_only {
            return Err(StoreError::ReadOnly);
        }
        let guard = self.shared.writer.acquire(wait)?;
        let base = self.shared.refresh()?;
        debug!(base = %base.version, "write transaction started");
        Ok(WriteTransaction::new(Arc::clone(&self.shared), guard, base))
    }

    /// Pin and read `version`. Only the latest version and versions still
    /// pinned by another reader are available.
    pub fn read(&self, version: Version) -> StoreResult<ReadTransaction> {
        let latest = self.shared.refresh()?;
        if latest.version == version {
            let pin = self.shared.pins.pin(Arc::clone(&latest));
            return Ok(ReadTransaction::new(Arc::clone(&self.shared), latest, pin));
        }
        let (pin, catalog) = self
            .shared
            .pins
            .repin(version)
            .ok_or(StoreError::VersionNotAvailable(version))?;
        Ok(ReadTransaction::new(Arc::clone(&self.shared), catalog, pin))
    }

    /// Pin and read the newest version.
    pub fn read_latest(&self) -> StoreResult<ReadTransaction> {
        let latest = self.shared.refresh()?;
        let pin = self.shared.pins.pin(Arc::clone(&latest));
        Ok(ReadTransaction::new(Arc::clone(&self.shared), latest, pin))
    }

    /// Transaction logs for every version in `(from, to]`.
    pub fn transaction_logs(&self, from: Version, to: Version) -> StoreResult<Vec<TransactionLog>> {
        // Pinning the newest version keeps its history blocks from reuse
        // while they are read.
        let snapshot = self.read_latest()?;
        let catalog = snapshot.catalog();
        if to > catalog.version {
            return Err(StoreError::VersionNotAvailable(to));
        }

        let mut logs = Vec::new();
        let mut v = from.next();
        while v <= to {
            let block = catalog
                .history
                .get(&v)
                .ok_or(StoreError::VersionNotAvailable(v))?;
            logs.push(read_block(&self.shared.file, *block)?);
            v = v.next();
        }
        Ok(logs)
    }

    /// Fold the logs of `(from, to]` into a changeset.
    pub fn changeset(&self, from: Version, to: Version) -> StoreResult<Changeset> {
        if from > to {
            return Err(tarn_changeset::ChangesetError::InvalidRange { from, to }.into());
        }
        let logs = self.transaction_logs(from, to)?;
        Ok(Changeset::from_logs(from, to, &logs)?)
    }

    /// Versions with live readers in this process.
    pub fn pinned_versions(&self) -> Vec<Version> {
        self.shared.pins.versions()
    }

    pub fn info(&self) -> StoreResult<StoreInfo> {
        let snapshot = self.read_latest()?;
        let catalog = snapshot.catalog();
        Ok(StoreInfo {
            path: self.shared.path.clone(),
            file_id: self.file_id(),
            version: catalog.version,
            schema_version: catalog.schema_version,
            file_len: self.shared.file.len()?,
            free_bytes: catalog.free_bytes(),
            retained_history: catalog.history.len(),
            tables: catalog
                .tables
                .iter()
                .map(|(name, root)| (name.clone(), root.row_count))
                .collect(),
        })
    }

    /// Write a compacted copy of the newest version to `dest`.
    ///
    /// The copy keeps the version number and data but drops history and
    /// free space. `dest` must not exist.
    pub fn write_copy(&self, dest: impl AsRef<Path>) -> StoreResult<()> {
        let dest = dest.as_ref();
        if dest.exists() {
            return Err(StoreError::InvalidFile {
                path: dest.to_path_buf(),
                reason: "destination already exists".into(),
            });
        }
        let snapshot = self.read_latest()?;
        let source = snapshot.catalog();
        let file = StoreFile::open(dest, false)?;
        let config = &self.shared.config;

        let mut catalog = Catalog::initial(source.schema.clone(), source.schema_version);
        catalog.version = source.version;
        catalog.committed_at = source.committed_at;
        catalog.retired_keys = source.retired_keys.clone();

        let mut end = HEADER_SIZE;
        for (name, root) in &source.tables {
            let copy = catalog.tables.entry(name.clone()).or_default();
            copy.next_key = root.next_key;
            copy.row_count = root.row_count;
            for n in snapshot.page_numbers(name)? {
                if let Some(page) = snapshot.page(name, n)? {
                    let block = EncodedBlock::encode(&*page, config)?;
                    file.write_at(end, &block.bytes)?;
                    copy.pages.insert(n, block.at(end));
                    end += block.extent();
                }
            }
        }

        let block = EncodedBlock::encode(&catalog, config)?;
        file.write_at(end, &block.bytes)?;
        file.sync()?;
        Header::create(
            &file,
            Uuid::now_v7(),
            TopSlot {
                version: catalog.version,
                catalog: block.at(end),
            },
        )?;
        file.sync()?;
        info!(dest = %dest.display(), version = %catalog.version, "wrote compacted copy");
        Ok(())
    }
}

impl std::fmt::Debug for VersionedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionedStore")
            .field("path", &self.shared.path)
            .finish()
    }
}

/// Write the header and version 0 of a new file.
fn initialize(file: &StoreFile, config: &StoreConfig, catalog: Catalog) -> StoreResult<()> {
    let block = EncodedBlock::encode(&catalog, config)?;
    file.write_at(HEADER_SIZE, &block.bytes)?;
    file.sync()?;
    Header::create(
        file,
        Uuid::now_v7(),
        TopSlot {
            version: catalog.version,
            catalog: block.at(HEADER_SIZE),
        },
    )?;
    file.sync()?;
    Ok(())
}

fn read_header(file: &StoreFile, path: &Path) -> StoreResult<Header> {
    let mut attempt = 1;
    loop {
        match Header::read(file, path) {
            Err(StoreError::Corruption(reason)) if attempt < HEADER_READ_ATTEMPTS => {
                debug!(attempt, %reason, "retrying header read");
                attempt += 1;
                std::thread::yield_now();
            }
            other => return other,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared
// ---------------------------------------------------------------------------

impl Shared {
    pub(crate) fn load_page(&self, block: BlockRef) -> StoreResult<Arc<Page>> {
        self.cache.load(&self.file, block)
    }

    /// Pick up versions committed by other handles.
    fn refresh(&self) -> StoreResult<Arc<Catalog>> {
        let header = read_header(&self.file, &self.path)?;
        let current = self.latest.read().expect("lock poisoned").clone();
        if header.top.version <= current.version {
            return Ok(current);
        }

        let catalog: Arc<Catalog> = Arc::new(read_block(&self.file, header.top.catalog)?);
        let mut latest = self.latest.write().expect("lock poisoned");
        if catalog.version > latest.version {
            debug!(version = %catalog.version, "observed external commit");
            *latest = Arc::clone(&catalog);
            *self.header.lock().expect("lock poisoned") = header;
        }
        Ok(latest.clone())
    }

    /// Oldest version whose freed extents may be reused, or `None` while
    /// another process has the file open.
    fn reclaim_horizon(&self, base: Version) -> Option<Version> {
        if self.presence.others_present() {
            return None;
        }
        Some(self.pins.oldest().map_or(base, |oldest| oldest.min(base)))
    }

    pub(crate) fn commit(&self, pending: PendingCommit) -> StoreResult<Version> {
        let header = *self.header.lock().expect("lock poisoned");
        if header.top.version != pending.base.version {
            return Err(StoreError::Corruption(format!(
                "writer base {} is not the committed version {}",
                pending.base.version, header.top.version
            )));
        }

        let file_len = self.file.len()?;
        let horizon = self.reclaim_horizon(pending.base.version);
        match self.write_version(&header, pending, file_len, horizon) {
            Ok((header, catalog)) => {
                let version = catalog.version;
                *self.latest.write().expect("lock poisoned") = Arc::new(catalog);
                *self.header.lock().expect("lock poisoned") = header;
                info!(%version, "committed");
                Ok(version)
            }
            Err(e) => {
                warn!(error = %e, "commit failed; rolling back");
                self.roll_back(&header, file_len);
                Err(e)
            }
        }
    }

    /// Point the file back at `header`'s version and drop anything written
    /// past `file_len`. Returns `false` if either step failed.
    fn roll_back(&self, header: &Header, file_len: u64) -> bool {
        let mut restored = true;
        if let Err(e) = header.restore(&self.file) {
            warn!(error = %e, version = %header.top.version, "rollback could not restore header");
            restored = false;
        }
        if let Err(e) = self.file.set_len(file_len) {
            warn!(error = %e, file_len, "rollback could not truncate file");
            restored = false;
        }
        restored
    }

    fn write_version(
        &self,
        header: &Header,
        pending: PendingCommit,
        file_len: u64,
        horizon: Option<Version>,
    ) -> StoreResult<(Header, Catalog)> {
        let PendingCommit {
            base,
            working: mut catalog,
            dirty,
            released,
            log,
        } = pending;
        let version = base.version.next();
        catalog.version = version;
        catalog.committed_at = Utc::now();
        let mut end = file_len;

        for ((table, n), page) in dirty {
            let old = catalog
                .tables
                .get_mut(&table)
                .and_then(|root| root.pages.remove(&n));
            if let Some(old) = old {
                catalog.release(old, version);
            }
            if page.is_empty() {
                continue;
            }
            let block = self.place(&mut catalog, &mut end, &*page, horizon)?;
            if let Some(root) = catalog.tables.get_mut(&table) {
                root.pages.insert(n, block);
            }
        }
        for block in released {
            catalog.release(block, version);
        }

        let mut log = log.finish(version);
        log.committed_at = catalog.committed_at;
        let block = self.place(&mut catalog, &mut end, &log, horizon)?;
        catalog.history.insert(version, block);
        self.prune_history(&mut catalog, horizon);
        catalog.release(header.top.catalog, version);

        // The catalog lists the free extents, so it is appended rather than
        // placed into one.
        let block = EncodedBlock::encode(&catalog, &self.config)?;
        self.file.write_at(end, &block.bytes)?;
        let top = TopSlot {
            version,
            catalog: block.at(end),
        };

        self.sync()?;
        header.write_inactive(&self.file, top)?;
        self.sync()?;
        let header = header.flip(&self.file, top)?;
        self.sync()?;
        Ok((header, catalog))
    }

    /// Serialize `value` into a reclaimed extent or at the end of the file.
    fn place<T: serde::Serialize>(
        &self,
        catalog: &mut Catalog,
        end: &mut u64,
        value: &T,
        horizon: Option<Version>,
    ) -> StoreResult<BlockRef> {
        let block = EncodedBlock::encode(value, &self.config)?;
        let offset = match catalog.allocate(block.extent(), horizon) {
            Some(offset) => offset,
            None => {
                let offset = *end;
                *end += block.extent();
                offset
            }
        };
        self.file.write_at(offset, &block.bytes)?;
        Ok(block.at(offset))
    }

    /// Drop logs no reader can ask for, beyond the configured retention.
    fn prune_history(&self, catalog: &mut Catalog, horizon: Option<Version>) {
        let Some(horizon) = horizon else {
            return;
        };
        let retained = self.config.retained_history;
        let newest = catalog.version.value();
        let expired: Vec<Version> = catalog
            .history
            .keys()
            .copied()
            .filter(|v| *v <= horizon && v.value() + retained <= newest)
            .collect();
        for v in expired {
            if let Some(block) = catalog.history.remove(&v) {
                catalog.release(block, catalog.version);
            }
        }
    }

    fn sync(&self) -> StoreResult<()> {
        if self.config.durability == Durability::Full {
            self.file.sync()?;
        }
        Ok(())
    }
}
