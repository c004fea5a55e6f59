use chrono::{DateTime, TimeZone, Utc};

use crate::{
    storage::{KOUCH_FORMAT_VERSION, KOUCH_HEADER_SIZE, KOUCH_MAGIC, WAL_HEADER_SIZE},
    types::{LogOffset, MAX_PAGE_SIZE, MIN_PAGE_SIZE, PageIndex, TransactionId, error::DatabaseError},
    utils::hash::calculate_header_checksum,
};

/*
 * Header Page Layout (page 0, big-endian)
 * ┌─────────────────────────────────────────────────────────────────┐
 * │ magic(4) | format_version(4) | page_size(4) | freelist_root(4)  │
 * │ wal_start_offset(8) | page_count(4) | freelist_count(4)         │
 * │ next_txn_id(8) | change_counter(4) | created_at_millis(8)       │
 * │ checksum(4, CRC32 of the preceding 52 bytes) | zero padding     │
 * └─────────────────────────────────────────────────────────────────┘
 */

const CHECKSUM_OFFSET: usize = KOUCH_HEADER_SIZE - 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KouchHeader {
    pub magic: [u8; 4],
    pub format_version: u32,
    pub page_size: u32,
    pub freelist_root: PageIndex,
    pub wal_start_offset: LogOffset,
    pub page_count: u32,
    pub freelist_count: u32,
    pub next_txn_id: TransactionId,
    pub change_counter: u32,
    pub created_at_millis: i64,
}

impl KouchHeader {
    pub fn new(page_size: u32) -> Self {
        Self {
            magic: *KOUCH_MAGIC,
            format_version: KOUCH_FORMAT_VERSION,
            page_size,
            freelist_root: 0,
            wal_start_offset: WAL_HEADER_SIZE as LogOffset,
            page_count: 1,
            freelist_count: 0,
            next_txn_id: 1,
            change_counter: 0,
            created_at_millis: Utc::now().timestamp_millis(),
        }
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.created_at_millis).single()
    }

    pub fn format_version_string(&self) -> String {
        self.format_version.to_string()
    }

    /// Encodes the header into a full page image of `page_size` bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(self.page_size as usize);

        buffer.extend_from_slice(&self.magic);
        buffer.extend_from_slice(&self.format_version.to_be_bytes());
        buffer.extend_from_slice(&self.page_size.to_be_bytes());
        buffer.extend_from_slice(&self.freelist_root.to_be_bytes());
        buffer.extend_from_slice(&self.wal_start_offset.to_be_bytes());
        buffer.extend_from_slice(&self.page_count.to_be_bytes());
        buffer.extend_from_slice(&self.freelist_count.to_be_bytes());
        buffer.extend_from_slice(&self.next_txn_id.to_be_bytes());
        buffer.extend_from_slice(&self.change_counter.to_be_bytes());
        buffer.extend_from_slice(&self.created_at_millis.to_be_bytes());

        let checksum = calculate_header_checksum(&buffer[..CHECKSUM_OFFSET]);
        buffer.extend_from_slice(&checksum.to_be_bytes());

        buffer.resize(self.page_size as usize, 0);
        buffer
    }

    /// Decodes and validates a header. Only the first `KOUCH_HEADER_SIZE` bytes are read.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DatabaseError> {
        if bytes.len() < KOUCH_HEADER_SIZE {
            return Err(DatabaseError::corrupt("Header too short"));
        }

        let mut offset = 0;

        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[offset..offset + 4]);
        if &magic != KOUCH_MAGIC {
            return Err(DatabaseError::corrupt("Invalid kouch magic number"));
        }
        offset += 4;

        let stored_checksum = read_u32(bytes, CHECKSUM_OFFSET);
        if calculate_header_checksum(&bytes[..CHECKSUM_OFFSET]) != stored_checksum {
            return Err(DatabaseError::corrupt("Header checksum mismatch"));
        }

        let format_version = read_u32(bytes, offset);
        if format_version != KOUCH_FORMAT_VERSION {
            return Err(DatabaseError::corrupt(format!(
                "Unsupported format version: {}",
                format_version
            )));
        }
        offset += 4;

        let page_size = read_u32(bytes, offset);
        validate_page_size(page_size as usize).map_err(|_| {
            DatabaseError::corrupt(format!("Unsupported page size: {}", page_size))
        })?;
        offset += 4;

        let freelist_root = read_u32(bytes, offset);
        offset += 4;
        let wal_start_offset = read_u64(bytes, offset);
        offset += 8;
        let page_count = read_u32(bytes, offset);
        offset += 4;
        let freelist_count = read_u32(bytes, offset);
        offset += 4;
        let next_txn_id = read_u64(bytes, offset);
        offset += 8;
        let change_counter = read_u32(bytes, offset);
        offset += 4;
        let created_at_millis = read_u64(bytes, offset) as i64;

        if page_count == 0 {
            return Err(DatabaseError::corrupt("Page count excludes the header page"));
        }
        if freelist_root >= page_count || freelist_count >= page_count {
            return Err(DatabaseError::corrupt(format!(
                "Free list (root {}, count {}) exceeds page count {}",
                freelist_root, freelist_count, page_count
            )));
        }
        if (freelist_root == 0) != (freelist_count == 0) {
            return Err(DatabaseError::corrupt(
                "Free list root and count disagree",
            ));
        }

        Ok(Self {
            magic,
            format_version,
            page_size,
            freelist_root,
            wal_start_offset,
            page_count,
            freelist_count,
            next_txn_id,
            change_counter,
            created_at_millis,
        })
    }
}

pub fn validate_page_size(page_size: usize) -> Result<(), DatabaseError> {
    if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) || !page_size.is_power_of_two() {
        return Err(DatabaseError::InvalidConfig {
            reason: format!(
                "page size {} must be a power of two between {} and {}",
                page_size, MIN_PAGE_SIZE, MAX_PAGE_SIZE
            ),
        });
    }
    Ok(())
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_be_bytes(raw)
}
