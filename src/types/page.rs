use crate::types::{FREE_LINK_SIZE, PageIndex, error::DatabaseError};

/*
 * Data Page Layout
 * ┌─────────────────────────────────────────────────────────────────┐
 * │                   PAYLOAD (page_size bytes)                     │
 * │  opaque to the engine while the page is live                    │
 * └─────────────────────────────────────────────────────────────────┘
 *
 * Free Page Layout
 * ┌─────────────────────────────────────────────────────────────────┐
 * │ next_free(4, 0 = end of chain) | run_length(4) | zero padding   │
 * └─────────────────────────────────────────────────────────────────┘
 *
 * Only the first page of a free run carries the link; the other
 * run_length - 1 pages are never read while free.
 */

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub index: PageIndex,
    pub data: Vec<u8>,
}

impl Page {
    pub fn zeroed(index: PageIndex, page_size: usize) -> Self {
        Self {
            index,
            data: vec![0; page_size],
        }
    }

    pub fn from_bytes(
        index: PageIndex,
        bytes: Vec<u8>,
        page_size: usize,
    ) -> Result<Self, DatabaseError> {
        if bytes.len() != page_size {
            return Err(DatabaseError::InvalidPageSize {
                expected: page_size,
                actual: bytes.len(),
            });
        }
        Ok(Self { index, data: bytes })
    }

    /// Builds the on-disk image of a free-list link page.
    pub fn free_link(
        index: PageIndex,
        next: Option<PageIndex>,
        run_length: u32,
        page_size: usize,
    ) -> Self {
        let mut page = Self::zeroed(index, page_size);
        page.data[..4].copy_from_slice(&next.unwrap_or(0).to_be_bytes());
        page.data[4..FREE_LINK_SIZE].copy_from_slice(&run_length.to_be_bytes());
        page
    }

    /// Reads the next-free pointer of a free-list link page.
    pub fn next_free(&self) -> Option<PageIndex> {
        let next = u32::from_be_bytes([self.data[0], self.data[1], self.data[2], self.data[3]]);
        if next == 0 { None } else { Some(next) }
    }

    /// Reads how many consecutive free pages a link page describes.
    pub fn run_length(&self) -> u32 {
        u32::from_be_bytes([self.data[4], self.data[5], self.data[6], self.data[7]])
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
