pub mod error;
pub mod page;

// Common type aliases
pub type PageIndex = u32;
pub type TransactionId = u64;
pub type LogOffset = u64;

// Page 0 always holds the file header
pub const HEADER_PAGE_INDEX: PageIndex = 0;

pub const DEFAULT_PAGE_SIZE: usize = 4096;
pub const MIN_PAGE_SIZE: usize = 512;
pub const MAX_PAGE_SIZE: usize = 65536;

// Highest page count representable by a u32 index
pub const MAX_PAGE_COUNT: u32 = u32::MAX;

pub const CHECKSUM_SIZE: usize = 4; // CRC32 checksum size
pub const FREE_LINK_SIZE: usize = 8; // next-free PageIndex and run length at the start of a free page
