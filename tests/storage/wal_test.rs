use std::fs::{self, OpenOptions};

use kouch::{
    storage::wal::Wal,
    types::{error::DatabaseError, page::Page},
    utils::mock::TempDatabase,
};

const PAGE_SIZE: usize = 512;
const WAL_HEADER_SIZE: u64 = 16;
const COMMIT_RECORD_SIZE: u64 = 13;

fn page(index: u32, fill: u8) -> Page {
    Page {
        index,
        data: vec![fill; PAGE_SIZE],
    }
}

fn log_committed(wal: &mut Wal, txn_id: u64, pages: &[Page]) -> u64 {
    let offset = wal.append(txn_id, pages).unwrap();
    wal.commit_marker(txn_id).unwrap();
    offset
}

#[test]
fn test_new_wal_has_only_a_header() {
    let temp_db = TempDatabase::with_prefix("wal_new");
    let wal = Wal::open(&temp_db.path, PAGE_SIZE, false).unwrap();
    assert_eq!(wal.path(), temp_db.wal_path());
    assert_eq!(wal.len(), WAL_HEADER_SIZE);
    assert!(wal.is_empty());
    assert_eq!(wal.replay().unwrap().count(), 0);

    let raw = fs::read(temp_db.wal_path()).unwrap();
    assert_eq!(&raw[0..4], b"KWAL");
}

#[test]
fn test_committed_transactions_replay_in_order() {
    let temp_db = TempDatabase::with_prefix("wal_replay");
    let mut wal = Wal::open(&temp_db.path, PAGE_SIZE, true).unwrap();
    let first = log_committed(&mut wal, 1, &[page(1, 0xA1), page(2, 0xA2)]);
    let second = log_committed(&mut wal, 2, &[page(1, 0xB1)]);
    assert_eq!(first, WAL_HEADER_SIZE);
    assert!(second > first);

    let replayed: Vec<_> = wal.replay().unwrap().map(|txn| txn.unwrap()).collect();
    assert_eq!(replayed.len(), 2);
    assert_eq!(replayed[0].txn_id, 1);
    assert_eq!(replayed[0].offset, first);
    assert_eq!(replayed[0].pages, vec![page(1, 0xA1), page(2, 0xA2)]);
    assert_eq!(replayed[1].txn_id, 2);
    assert_eq!(replayed[1].pages, vec![page(1, 0xB1)]);
}

#[test]
fn test_replay_is_restartable() {
    let temp_db = TempDatabase::with_prefix("wal_restart");
    let mut wal = Wal::open(&temp_db.path, PAGE_SIZE, false).unwrap();
    log_committed(&mut wal, 1, &[page(3, 0x33)]);
    log_committed(&mut wal, 2, &[page(4, 0x44)]);

    let first: Vec<_> = wal.replay().unwrap().map(|txn| txn.unwrap()).collect();
    let second: Vec<_> = wal.replay().unwrap().map(|txn| txn.unwrap()).collect();
    assert_eq!(first, second);

    // Reopening the sidecar yields the same transactions
    drop(wal);
    let wal = Wal::open(&temp_db.path, PAGE_SIZE, false).unwrap();
    let reopened: Vec<_> = wal.replay().unwrap().map(|txn| txn.unwrap()).collect();
    assert_eq!(first, reopened);
}

#[test]
fn test_replay_from_offset_skips_earlier_records() {
    let temp_db = TempDatabase::with_prefix("wal_replay_from");
    let mut wal = Wal::open(&temp_db.path, PAGE_SIZE, false).unwrap();
    log_committed(&mut wal, 1, &[page(1, 0x01)]);
    let second = log_committed(&mut wal, 2, &[page(2, 0x02)]);

    let replayed: Vec<_> = wal.replay_from(second).unwrap().map(|txn| txn.unwrap()).collect();
    assert_eq!(replayed.len(), 1);
    assert_eq!(replayed[0].txn_id, 2);
}

#[test]
fn test_record_without_commit_marker_is_discarded() {
    let temp_db = TempDatabase::with_prefix("wal_no_marker");
    let mut wal = Wal::open(&temp_db.path, PAGE_SIZE, false).unwrap();
    log_committed(&mut wal, 1, &[page(1, 0x11)]);
    let valid_end = wal.len();
    wal.append(2, &[page(2, 0x22)]).unwrap();

    let mut replay = wal.replay().unwrap();
    let replayed: Vec<_> = replay.by_ref().map(|txn| txn.unwrap()).collect();
    assert_eq!(replayed.len(), 1);
    assert_eq!(replayed[0].txn_id, 1);
    assert_eq!(replay.valid_end(), valid_end);
    assert_eq!(replay.discarded_bytes(), wal.len() - valid_end);
}

#[test]
fn test_truncated_commit_marker_is_discarded() {
    let temp_db = TempDatabase::with_prefix("wal_torn_marker");
    {
        let mut wal = Wal::open(&temp_db.path, PAGE_SIZE, false).unwrap();
        log_committed(&mut wal, 1, &[page(1, 0x11)]);
        log_committed(&mut wal, 2, &[page(2, 0x22)]);
    }
    let wal_path = temp_db.wal_path();
    let len = fs::metadata(&wal_path).unwrap().len();
    let file = OpenOptions::new().write(true).open(&wal_path).unwrap();
    file.set_len(len - COMMIT_RECORD_SIZE / 2).unwrap();
    drop(file);

    let wal = Wal::open(&temp_db.path, PAGE_SIZE, false).unwrap();
    let replayed: Vec<_> = wal.replay().unwrap().map(|txn| txn.unwrap()).collect();
    assert_eq!(replayed.len(), 1);
    assert_eq!(replayed[0].txn_id, 1);
}

#[test]
fn test_truncated_page_entry_is_discarded() {
    let temp_db = TempDatabase::with_prefix("wal_torn_page");
    {
        let mut wal = Wal::open(&temp_db.path, PAGE_SIZE, false).unwrap();
        log_committed(&mut wal, 1, &[page(1, 0x11)]);
        wal.append(2, &[page(2, 0x22), page(3, 0x33)]).unwrap();
    }
    let wal_path = temp_db.wal_path();
    let len = fs::metadata(&wal_path).unwrap().len();
    let file = OpenOptions::new().write(true).open(&wal_path).unwrap();
    file.set_len(len - (PAGE_SIZE as u64) / 2).unwrap();
    drop(file);

    let wal = Wal::open(&temp_db.path, PAGE_SIZE, false).unwrap();
    let replayed: Vec<_> = wal.replay().unwrap().map(|txn| txn.unwrap()).collect();
    assert_eq!(replayed.len(), 1);
    assert_eq!(replayed[0].txn_id, 1);
}

#[test]
fn test_checksum_mismatch_stops_replay() {
    let temp_db = TempDatabase::with_prefix("wal_checksum");
    let second_offset;
    {
        let mut wal = Wal::open(&temp_db.path, PAGE_SIZE, false).unwrap();
        log_committed(&mut wal, 1, &[page(1, 0x11)]);
        second_offset = log_committed(&mut wal, 2, &[page(2, 0x22)]);
        log_committed(&mut wal, 3, &[page(3, 0x33)]);
    }

    // Flip a payload byte of the second transaction's page
    let wal_path = temp_db.wal_path();
    let mut raw = fs::read(&wal_path).unwrap();
    let payload = second_offset as usize + 13 + 4 + 10;
    raw[payload] ^= 0xFF;
    fs::write(&wal_path, &raw).unwrap();

    let wal = Wal::open(&temp_db.path, PAGE_SIZE, false).unwrap();
    let mut replay = wal.replay().unwrap();
    let replayed: Vec<_> = replay.by_ref().map(|txn| txn.unwrap()).collect();
    assert_eq!(replayed.len(), 1);
    assert_eq!(replayed[0].txn_id, 1);
    assert_eq!(replay.valid_end(), second_offset);
}

#[test]
fn test_truncate_drops_all_records() {
    let temp_db = TempDatabase::with_prefix("wal_truncate");
    let mut wal = Wal::open(&temp_db.path, PAGE_SIZE, false).unwrap();
    log_committed(&mut wal, 1, &[page(1, 0x11)]);
    assert!(!wal.is_empty());

    wal.truncate().unwrap();
    assert!(wal.is_empty());
    assert_eq!(fs::metadata(temp_db.wal_path()).unwrap().len(), WAL_HEADER_SIZE);
    assert_eq!(wal.replay().unwrap().count(), 0);

    // Records appended after a truncate start right after the header
    assert_eq!(log_committed(&mut wal, 2, &[page(1, 0x12)]), WAL_HEADER_SIZE);
}

#[test]
fn test_rollback_to_discards_partial_transaction() {
    let temp_db = TempDatabase::with_prefix("wal_rollback");
    let mut wal = Wal::open(&temp_db.path, PAGE_SIZE, false).unwrap();
    log_committed(&mut wal, 1, &[page(1, 0x11)]);
    let len = wal.len();
    wal.append(2, &[page(2, 0x22)]).unwrap();

    wal.rollback_to(len).unwrap();
    assert_eq!(wal.len(), len);
    let mut replay = wal.replay().unwrap();
    assert_eq!(replay.by_ref().count(), 1);
    assert_eq!(replay.discarded_bytes(), 0);
}

#[test]
fn test_append_rejects_wrong_page_size() {
    let temp_db = TempDatabase::with_prefix("wal_page_size");
    let mut wal = Wal::open(&temp_db.path, PAGE_SIZE, false).unwrap();
    let short = Page {
        index: 1,
        data: vec![0; 100],
    };
    assert!(matches!(
        wal.append(1, &[short]),
        Err(DatabaseError::InvalidPageSize { .. })
    ));
    assert!(wal.is_empty());
}

#[test]
fn test_bad_magic_is_corrupt() {
    let temp_db = TempDatabase::with_prefix("wal_magic");
    fs::write(temp_db.wal_path(), b"NOPE\0\0\0\x01\0\0\x02\0\0\0\0\0").unwrap();
    assert!(matches!(
        Wal::open(&temp_db.path, PAGE_SIZE, false),
        Err(DatabaseError::CorruptFile { .. })
    ));
}

#[test]
fn test_page_size_mismatch_is_corrupt() {
    let temp_db = TempDatabase::with_prefix("wal_mismatch");
    drop(Wal::open(&temp_db.path, PAGE_SIZE, false).unwrap());
    assert!(matches!(
        Wal::open(&temp_db.path, 4096, false),
        Err(DatabaseError::CorruptFile { .. })
    ));
}

#[test]
fn test_torn_header_is_reinitialized() {
    let temp_db = TempDatabase::with_prefix("wal_torn_header");
    fs::write(temp_db.wal_path(), b"KWA").unwrap();
    let wal = Wal::open(&temp_db.path, PAGE_SIZE, false).unwrap();
    assert_eq!(wal.len(), WAL_HEADER_SIZE);
    assert_eq!(wal.replay().unwrap().count(), 0);
}
