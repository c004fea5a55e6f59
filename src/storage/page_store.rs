use std::{
    collections::{BTreeMap, BTreeSet},
    fs::{File, OpenOptions},
    io::{ErrorKind, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use tracing::debug;

use crate::{
    storage::{
        KOUCH_HEADER_SIZE,
        free_list::{FreeList, FreeRun},
        header::KouchHeader,
    },
    types::{
        HEADER_PAGE_INDEX, LogOffset, MAX_PAGE_COUNT, PageIndex,
        error::{DatabaseError, Result},
        page::Page,
    },
};

pub struct DatabaseInfo {
    pub path: PathBuf,
    pub header: KouchHeader,
    pub file_size: u64,
}

/// Page-count and free-list state that decides which indices are live.
///
/// The page store holds the committed copy; each transaction works on a
/// clone and hands it back on commit.
#[derive(Debug, Clone)]
pub struct Allocator {
    page_count: u32,
    free_list: FreeList,
    max_page_count: u32,
    // free pages whose link must be rewritten on commit
    dirty_links: BTreeSet<PageIndex>,
}

impl Allocator {
    pub fn new(page_count: u32, free_list: FreeList, max_page_count: u32) -> Self {
        Self {
            page_count,
            free_list,
            max_page_count,
            dirty_links: BTreeSet::new(),
        }
    }

    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    pub fn free_list(&self) -> &FreeList {
        &self.free_list
    }

    pub fn is_live(&self, page_index: PageIndex) -> bool {
        page_index != HEADER_PAGE_INDEX
            && page_index < self.page_count
            && !self.free_list.contains(page_index)
    }

    pub fn check_live(&self, page_index: PageIndex) -> Result<()> {
        if self.is_live(page_index) {
            Ok(())
        } else {
            Err(self.invalid(page_index))
        }
    }

    fn invalid(&self, page_index: PageIndex) -> DatabaseError {
        DatabaseError::InvalidPageIndex {
            page_index,
            page_count: self.page_count,
        }
    }

    /// Returns a free index, preferring the free-list root over growing the file.
    pub fn allocate(&mut self) -> Result<PageIndex> {
        if let Some((page_index, shortened_run)) = self.free_list.pop() {
            self.dirty_links.remove(&page_index);
            if let Some(start) = shortened_run {
                self.dirty_links.insert(start);
            }
            debug!("allocate(page={}) = reused", page_index);
            return Ok(page_index);
        }
        if self.page_count >= self.max_page_count {
            return Err(DatabaseError::StorageFull {
                reason: format!("page limit of {} reached", self.max_page_count),
            });
        }
        let page_index = self.page_count;
        self.page_count += 1;
        debug!("allocate(page={}) = grown", page_index);
        Ok(page_index)
    }

    pub fn free(&mut self, page_index: PageIndex) -> Result<()> {
        if page_index == HEADER_PAGE_INDEX || page_index >= self.page_count {
            return Err(self.invalid(page_index));
        }
        self.free_list.push(page_index)?;
        self.dirty_links.insert(page_index);
        debug!("free(page={})", page_index);
        Ok(())
    }

    /// Grows the index space so `page_index` is live; skipped indices become
    /// one free run, so the gap costs a single link page however wide it is.
    pub fn extend_to(&mut self, page_index: PageIndex) -> Result<()> {
        if page_index < self.page_count {
            return Ok(());
        }
        if page_index >= self.max_page_count {
            return Err(DatabaseError::StorageFull {
                reason: format!(
                    "page {} is beyond the page limit of {}",
                    page_index, self.max_page_count
                ),
            });
        }
        if page_index > self.page_count {
            let gap_start = self.page_count;
            self.free_list.push_run(gap_start, page_index - gap_start)?;
            self.dirty_links.insert(gap_start);
        }
        self.page_count = page_index + 1;
        Ok(())
    }

    /// Drops free pages sitting at the end of the index space. Returns how many.
    pub fn release_trailing_free(&mut self) -> u32 {
        let mut released = 0;
        while self.page_count > 1 {
            let Some(run) = self.free_list.take_run_ending_at(self.page_count) else {
                break;
            };
            self.dirty_links.remove(&run.start);
            self.page_count = run.start;
            released += run.len;
        }
        if released > 0 {
            // Removal from the middle of the stack changes neighbouring links
            self.dirty_links
                .extend(self.free_list.runs().map(|run| run.start));
        }
        released
    }

    pub fn dirty_links(&self) -> &BTreeSet<PageIndex> {
        &self.dirty_links
    }

    pub fn link_pages(&self, page_size: usize) -> Vec<Page> {
        self.free_list.link_pages(&self.dirty_links, page_size)
    }

    pub fn clear_dirty(&mut self) {
        self.dirty_links.clear();
    }

    pub fn apply_to_header(&self, header: &mut KouchHeader) {
        header.page_count = self.page_count;
        header.freelist_root = self.free_list.root().unwrap_or(0);
        header.freelist_count = self.free_list.len() as u32;
    }
}

pub struct PageStore {
    pub db_info: DatabaseInfo,
    file: File,
    allocator: Allocator,
    // committed but not yet checkpointed page images
    committed: BTreeMap<PageIndex, Vec<u8>>,
    header_dirty: bool,
    #[cfg(test)]
    pub(crate) flush_events: Vec<FlushEvent>,
}

/// Order of durable writes during a flush, recorded for tests.
#[cfg(test)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlushEvent {
    PageWritten(PageIndex),
    PagesSynced,
    HeaderWritten(LogOffset),
}

impl PageStore {
    pub fn create<P: AsRef<Path>>(
        path: P,
        page_size: usize,
        max_page_count: Option<u32>,
    ) -> Result<Self> {
        let path = path.as_ref();
        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .read(true)
            .open(path)?;
        let header = KouchHeader::new(page_size as u32);
        file.write_all(&header.to_bytes())
            .map_err(DatabaseError::from_storage_io)?;
        file.sync_all()?;
        let file_size = file.metadata()?.len();
        debug!("created {} with page size {}", path.display(), page_size);

        let allocator = Allocator::new(
            header.page_count,
            FreeList::new(),
            max_page_count.unwrap_or(MAX_PAGE_COUNT),
        );
        Ok(Self {
            db_info: DatabaseInfo {
                path: path.to_path_buf(),
                header,
                file_size,
            },
            file,
            allocator,
            committed: BTreeMap::new(),
            header_dirty: false,
            #[cfg(test)]
            flush_events: Vec::new(),
        })
    }

    pub fn open<P: AsRef<Path>>(path: P, max_page_count: Option<u32>) -> Result<Self> {
        let path = path.as_ref();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|err| match err.kind() {
                ErrorKind::NotFound => DatabaseError::NotFound {
                    path: path.to_path_buf(),
                },
                _ => DatabaseError::Io(err),
            })?;

        let file_size = file.metadata()?.len();
        if file_size < KOUCH_HEADER_SIZE as u64 {
            return Err(DatabaseError::corrupt(format!(
                "File is {} bytes, smaller than the header",
                file_size
            )));
        }
        let mut header_buffer = vec![0u8; KOUCH_HEADER_SIZE];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut header_buffer)?;
        let header = KouchHeader::from_bytes(&header_buffer)?;
        if file_size < header.page_size as u64 {
            return Err(DatabaseError::corrupt(format!(
                "File is {} bytes, smaller than one {}-byte page",
                file_size, header.page_size
            )));
        }

        let mut page_store = Self {
            allocator: Allocator::new(
                header.page_count,
                FreeList::new(),
                max_page_count.unwrap_or(MAX_PAGE_COUNT),
            ),
            db_info: DatabaseInfo {
                path: path.to_path_buf(),
                header,
                file_size,
            },
            file,
            committed: BTreeMap::new(),
            header_dirty: false,
            #[cfg(test)]
            flush_events: Vec::new(),
        };
        page_store.rebuild_allocator()?;
        Ok(page_store)
    }

    pub fn page_size(&self) -> usize {
        self.db_info.header.page_size as usize
    }

    pub fn header(&self) -> &KouchHeader {
        &self.db_info.header
    }

    pub fn path(&self) -> &Path {
        &self.db_info.path
    }

    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    pub fn page_count(&self) -> u32 {
        self.allocator.page_count()
    }

    pub fn file_size(&self) -> u64 {
        self.db_info.file_size
    }

    /// Number of committed pages waiting for the next checkpoint.
    pub fn pending_pages(&self) -> usize {
        self.committed.len() + usize::from(self.header_dirty)
    }

    fn page_offset(&self, page_index: PageIndex) -> u64 {
        page_index as u64 * self.page_size() as u64
    }

    /// Returns the committed content of a live page.
    pub fn read(&mut self, page_index: PageIndex) -> Result<Vec<u8>> {
        self.allocator.check_live(page_index)?;
        self.read_raw(page_index)
    }

    fn read_raw(&mut self, page_index: PageIndex) -> Result<Vec<u8>> {
        if let Some(data) = self.committed.get(&page_index) {
            debug!("read_page(page={}) = committed view", page_index);
            return Ok(data.clone());
        }

        let mut buffer = vec![0u8; self.page_size()];
        let offset = self.page_offset(page_index);
        if offset >= self.db_info.file_size {
            debug!("read_page(page={}) = past end of file", page_index);
            return Ok(buffer);
        }
        self.file.seek(SeekFrom::Start(offset))?;
        let available = (self.db_info.file_size - offset).min(buffer.len() as u64) as usize;
        self.file.read_exact(&mut buffer[..available])?;
        debug!("read_page(page={}) = file", page_index);
        Ok(buffer)
    }

    /// Stages committed content. Page 0 replaces the in-memory header.
    pub fn write(&mut self, page_index: PageIndex, data: Vec<u8>) -> Result<()> {
        if data.len() != self.page_size() {
            return Err(DatabaseError::InvalidPageSize {
                expected: self.page_size(),
                actual: data.len(),
            });
        }
        if page_index == HEADER_PAGE_INDEX {
            let header = KouchHeader::from_bytes(&data)?;
            if header.page_size != self.db_info.header.page_size {
                return Err(DatabaseError::corrupt(format!(
                    "Logged header page size {} differs from file page size {}",
                    header.page_size, self.db_info.header.page_size
                )));
            }
            self.db_info.header = header;
            self.header_dirty = true;
            return Ok(());
        }
        self.committed.insert(page_index, data);
        Ok(())
    }

    pub fn install_allocator(&mut self, mut allocator: Allocator) {
        allocator.clear_dirty();
        self.allocator = allocator;
    }

    /// Rebuilds the allocator from the header by walking the free-list chain.
    pub fn rebuild_allocator(&mut self) -> Result<()> {
        let header = self.db_info.header.clone();
        let mut chain = Vec::new();
        let mut free_pages: u64 = 0;
        let mut next = header.freelist_root;
        while next != 0 {
            if next >= header.page_count {
                return Err(DatabaseError::corrupt(format!(
                    "Free list links to page {} beyond page count {}",
                    next, header.page_count
                )));
            }
            let link = Page::from_bytes(next, self.read_raw(next)?, self.page_size())?;
            let run = FreeRun {
                start: next,
                len: link.run_length(),
            };
            if run.len == 0 || next as u64 + run.len as u64 > header.page_count as u64 {
                return Err(DatabaseError::corrupt(format!(
                    "Free run at page {} of length {} exceeds page count {}",
                    next, run.len, header.page_count
                )));
            }
            free_pages += run.len as u64;
            if free_pages > header.freelist_count as u64 {
                return Err(DatabaseError::corrupt(format!(
                    "Free list is longer than its recorded count {}",
                    header.freelist_count
                )));
            }
            chain.push(run);
            next = link.next_free().unwrap_or(0);
        }
        if free_pages != header.freelist_count as u64 {
            return Err(DatabaseError::corrupt(format!(
                "Free list has {} pages, header records {}",
                free_pages, header.freelist_count
            )));
        }

        let max_page_count = self.allocator.max_page_count;
        self.allocator = Allocator::new(
            header.page_count,
            FreeList::from_chain(chain)?,
            max_page_count,
        );
        Ok(())
    }

    /// Writes the committed view and the header into the data file and syncs it.
    ///
    /// `wal_start_offset` is recorded in the header; returns the pages written.
    pub fn flush(&mut self, wal_start_offset: LogOffset) -> Result<usize> {
        let pages = std::mem::take(&mut self.committed);
        let written = pages.len();
        for (page_index, data) in pages {
            let offset = self.page_offset(page_index);
            self.file.seek(SeekFrom::Start(offset))?;
            self.file
                .write_all(&data)
                .map_err(DatabaseError::from_storage_io)?;
            self.db_info.file_size = self.db_info.file_size.max(offset + data.len() as u64);
            #[cfg(test)]
            self.flush_events.push(FlushEvent::PageWritten(page_index));
        }
        // Pages must be durable before the header claims the WAL is applied
        self.file.sync_data()?;
        #[cfg(test)]
        self.flush_events.push(FlushEvent::PagesSynced);
        self.db_info.header.wal_start_offset = wal_start_offset;
        self.write_header()?;
        Ok(written)
    }

    /// Records a new WAL start offset in the file header.
    pub fn set_wal_start(&mut self, wal_start_offset: LogOffset) -> Result<()> {
        if self.db_info.header.wal_start_offset == wal_start_offset && !self.header_dirty {
            return Ok(());
        }
        self.db_info.header.wal_start_offset = wal_start_offset;
        self.write_header()
    }

    fn write_header(&mut self) -> Result<()> {
        let header_bytes = self.db_info.header.to_bytes();
        self.file.seek(SeekFrom::Start(0))?;
        self.file
            .write_all(&header_bytes)
            .map_err(DatabaseError::from_storage_io)?;
        self.file.flush()?;
        self.file.sync_all()?;
        self.header_dirty = false;
        #[cfg(test)]
        self.flush_events
            .push(FlushEvent::HeaderWritten(self.db_info.header.wal_start_offset));
        Ok(())
    }

    /// Shrinks the data file to exactly `page_count` pages.
    pub fn truncate_to_page_count(&mut self) -> Result<()> {
        let target = self.page_offset(self.page_count());
        if self.db_info.file_size > target {
            self.file.set_len(target)?;
            self.file.sync_all()?;
            self.db_info.file_size = target;
        }
        Ok(())
    }
}
