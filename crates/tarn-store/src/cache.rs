use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;

use crate::error::StoreResult;
use crate::file::StoreFile;
use crate::format::{read_block, BlockRef};
use crate::page::Page;

/// Decoded pages keyed by their block reference.
///
/// A reference includes the block's CRC, so a reused extent holding different
/// bytes never hits a stale entry.
pub struct PageCache {
    pages: Mutex<LruCache<BlockRef, Arc<Page>>>,
}

impl PageCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            pages: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn load(&self, file: &StoreFile, block: BlockRef) -> StoreResult<Arc<Page>> {
        if let Some(page) = self.pages.lock().expect("lock poisoned").get(&block) {
            return Ok(Arc::clone(page));
        }
        let page: Arc<Page> = Arc::new(read_block(file, block)?);
        self.pages
            .lock()
            .expect("lock poisoned")
            .put(block, Arc::clone(&page));
        Ok(page)
    }

    pub fn len(&self) -> usize {
        self.pages.lock().expect("lock poisoned").len()
    }
}
