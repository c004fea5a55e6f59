use crc32fast::Hasher;

use crate::types::{PageIndex, TransactionId};

pub fn calculate_header_checksum(header_bytes: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(header_bytes);
    hasher.finalize()
}

/// Checksum of one page entry inside a WAL page record.
///
/// Covers the owning transaction and the record's page count so an entry
/// spliced from a different record does not verify.
pub fn calculate_wal_entry_checksum(
    txn_id: TransactionId,
    page_count: u32,
    page_index: PageIndex,
    data: &[u8],
) -> u32 {
    let mut hasher = Hasher::new();

    hasher.update(&txn_id.to_be_bytes());
    hasher.update(&page_count.to_be_bytes());
    hasher.update(&page_index.to_be_bytes());
    hasher.update(data);

    hasher.finalize()
}

pub fn calculate_commit_checksum(record_type: u8, txn_id: TransactionId) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&[record_type]);
    hasher.update(&txn_id.to_be_bytes());
    hasher.finalize()
}

pub fn verify_wal_entry_checksum(
    txn_id: TransactionId,
    page_count: u32,
    page_index: PageIndex,
    data: &[u8],
    expected_checksum: u32,
) -> bool {
    calculate_wal_entry_checksum(txn_id, page_count, page_index, data) == expected_checksum
}
