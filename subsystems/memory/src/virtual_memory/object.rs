//! # File-Backed Store
//!
//! A [`FileObject`] caches one frame per page-aligned file offset. Every
//! region that maps the same file shares one object, so a page is read from
//! the file at most once no matter how many spaces fault on it.

use alloc::sync::Arc;
use alloc::vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use spin::Mutex;
use strata_hal::PAGE_SIZE;

use crate::physical::{FrameAllocator, FrameRef};
use crate::{MemError, MemResult};

/// Error code reported by the file read collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileError(pub i32);

/// Read capability of an open file
pub trait FileReader: Send + Sync {
    /// Identity of the underlying file, equal for every handle on it
    fn id(&self) -> u64;

    /// Read up to `buf.len()` bytes at `offset`, returning the count read
    ///
    /// A short count means end of file.
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, FileError>;
}

/// Page cache of one file
pub struct FileObject {
    file: Arc<dyn FileReader>,
    pages: Mutex<HashMap<u64, FrameRef>>,
    page_ins: AtomicU64,
}

impl FileObject {
    /// Create an empty cache over `file`
    pub fn new(file: Arc<dyn FileReader>) -> Arc<Self> {
        Arc::new(Self {
            file,
            pages: Mutex::new(HashMap::new()),
            page_ins: AtomicU64::new(0),
        })
    }

    /// Identity of the cached file
    pub fn file_id(&self) -> u64 {
        self.file.id()
    }

    /// Frame holding the file page at `offset`, reading it in on first use
    ///
    /// Bytes past end of file read as zero.
    pub fn page(&self, offset: u64, allocator: &FrameAllocator) -> MemResult<FrameRef> {
        if offset % PAGE_SIZE != 0 {
            return Err(MemError::NotAligned);
        }
        let mut pages = self.pages.lock();
        if let Some(frame) = pages.get(&offset) {
            return Ok(frame.clone());
        }

        let frame = allocator.allocate()?;
        let mut buf = vec![0u8; PAGE_SIZE as usize];
        let read = self.file.read(offset, &mut buf).map_err(|e| {
            log::warn!("file {}: page-in at {:#x} failed ({})", self.file.id(), offset, e.0);
            MemError::Io
        })?;
        if read < buf.len() {
            buf[read..].fill(0);
        }
        frame.write(0, &buf)?;
        self.page_ins.fetch_add(1, Ordering::Relaxed);
        log::trace!("file {}: paged in {:#x} -> {}", self.file.id(), offset, frame.address());

        pages.insert(offset, frame.clone());
        Ok(frame)
    }

    /// Cached frame at `offset`, without reading
    pub fn cached(&self, offset: u64) -> Option<FrameRef> {
        self.pages.lock().get(&offset).cloned()
    }

    /// Number of cached pages
    pub fn cached_pages(&self) -> usize {
        self.pages.lock().len()
    }

    /// Number of times the file was read
    pub fn page_ins(&self) -> u64 {
        self.page_ins.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for FileObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileObject")
            .field("file", &self.file.id())
            .field("cached", &self.cached_pages())
            .finish()
    }
}
