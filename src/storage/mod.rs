pub mod free_list;
pub mod handle;
pub mod header;
pub mod page_store;
pub mod transaction;
pub mod wal;

const KOUCH_MAGIC: &[u8; 4] = b"KOUC";
const KOUCH_FORMAT_VERSION: u32 = 1;
// Encoded header fields; the remainder of page 0 is zero padding
const KOUCH_HEADER_SIZE: usize = 56;

const WAL_MAGIC: &[u8; 4] = b"KWAL";
const WAL_VERSION: u32 = 1;
const WAL_HEADER_SIZE: usize = 16;
const WAL_SUFFIX: &str = "-wal";
