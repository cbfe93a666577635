//! # Anonymous Store
//!
//! Pages with no file behind them. Each page lives in a [`PageRef`] shared
//! through an `Arc`; forking a store copies the table of `Arc`s, not the
//! frames, and the strong count of a page's `Arc` says how many stores still
//! see it. A write fault copies a page only while that count is above one.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use hashbrown::HashMap;
use spin::Mutex;

use crate::physical::FrameRef;
use crate::{MemError, MemResult};

/// One anonymous page, shared by every store that has not yet copied it
#[derive(Debug)]
pub struct PageRef {
    frame: FrameRef,
}

impl PageRef {
    /// Wrap a frame as a new, unshared page
    pub fn new(frame: FrameRef) -> Arc<Self> {
        Arc::new(Self { frame })
    }

    /// The frame holding the page contents
    pub fn frame(&self) -> &FrameRef {
        &self.frame
    }
}

/// Result of looking up a page in an [`AnonStore`]
#[derive(Debug)]
pub struct AnonPage {
    /// The page
    pub page: Arc<PageRef>,
    /// Whether another store also references the page
    pub shared: bool,
}

/// Anonymous, copy-on-write capable page store
pub struct AnonStore {
    pages: Mutex<HashMap<u64, Arc<PageRef>>>,
}

impl AnonStore {
    /// Create an empty store
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pages: Mutex::new(HashMap::new()),
        })
    }

    /// Look up the page at `offset`
    pub fn lookup(&self, offset: u64) -> Option<AnonPage> {
        let pages = self.pages.lock();
        let page = pages.get(&offset)?;
        Some(AnonPage {
            shared: Arc::strong_count(page) > 1,
            page: Arc::clone(page),
        })
    }

    /// Install `page` at `offset`, returning the page it replaced
    pub fn insert(&self, offset: u64, page: Arc<PageRef>) -> Option<Arc<PageRef>> {
        self.pages.lock().insert(offset, page)
    }

    /// Drop every page at or beyond `offset`, returning how many went
    pub fn truncate(&self, offset: u64) -> usize {
        let mut pages = self.pages.lock();
        let before = pages.len();
        pages.retain(|&key, _| key < offset);
        before - pages.len()
    }

    /// Number of pages present
    pub fn page_count(&self) -> usize {
        self.pages.lock().len()
    }

    /// Build a new store sharing every page of this one
    ///
    /// This store is left untouched apart from the pages' share counts.
    pub fn share(&self) -> MemResult<Arc<Self>> {
        let pages = self.pages.lock();
        let mut copy = HashMap::new();
        copy.try_reserve(pages.len()).map_err(|_| MemError::OutOfMemory)?;
        for (&offset, page) in pages.iter() {
            copy.insert(offset, Arc::clone(page));
        }
        Ok(Arc::new(Self {
            pages: Mutex::new(copy),
        }))
    }

    /// Offsets of all present pages, in ascending order
    pub fn offsets(&self) -> Vec<u64> {
        let mut offsets: Vec<u64> = self.pages.lock().keys().copied().collect();
        offsets.sort_unstable();
        offsets
    }
}

impl fmt::Debug for AnonStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnonStore")
            .field("pages", &self.page_count())
            .finish()
    }
}
