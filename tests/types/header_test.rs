use kouch::{storage::header::KouchHeader, types::error::DatabaseError};

#[test]
fn test_header_round_trip() {
    let mut header = KouchHeader::new(4096);
    header.freelist_root = 7;
    header.freelist_count = 2;
    header.page_count = 12;
    header.next_txn_id = 42;
    header.change_counter = 9;

    let bytes = header.to_bytes();
    assert_eq!(bytes.len(), 4096);
    assert_eq!(&bytes[0..4], b"KOUC");
    assert!(bytes[56..].iter().all(|&b| b == 0));

    let decoded = KouchHeader::from_bytes(&bytes).unwrap();
    assert_eq!(decoded, header);
    assert_eq!(decoded.format_version_string(), "1");
    assert!(decoded.created_at().is_some());
}

#[test]
fn test_header_field_offsets() {
    let header = KouchHeader::new(1024);
    let bytes = header.to_bytes();
    assert_eq!(u32::from_be_bytes(bytes[4..8].try_into().unwrap()), 1);
    assert_eq!(u32::from_be_bytes(bytes[8..12].try_into().unwrap()), 1024);
    assert_eq!(u32::from_be_bytes(bytes[12..16].try_into().unwrap()), 0);
    assert_eq!(u64::from_be_bytes(bytes[16..24].try_into().unwrap()), 16);
    assert_eq!(u32::from_be_bytes(bytes[24..28].try_into().unwrap()), 1);
}

#[test]
fn test_bad_magic_is_corrupt() {
    let mut bytes = KouchHeader::new(4096).to_bytes();
    bytes[0..4].copy_from_slice(b"SQLi");
    match KouchHeader::from_bytes(&bytes) {
        Err(DatabaseError::CorruptFile { reason }) => assert!(reason.contains("magic")),
        other => panic!("expected CorruptFile, got {:?}", other),
    }
}

#[test]
fn test_flipped_byte_fails_checksum() {
    let mut bytes = KouchHeader::new(4096).to_bytes();
    bytes[30] ^= 0xFF;
    match KouchHeader::from_bytes(&bytes) {
        Err(DatabaseError::CorruptFile { reason }) => assert!(reason.contains("checksum")),
        other => panic!("expected CorruptFile, got {:?}", other),
    }
}

#[test]
fn test_unsupported_format_version() {
    let mut header = KouchHeader::new(4096);
    header.format_version = 2;
    match KouchHeader::from_bytes(&header.to_bytes()) {
        Err(DatabaseError::CorruptFile { reason }) => assert!(reason.contains("format version")),
        other => panic!("expected CorruptFile, got {:?}", other),
    }
}

#[test]
fn test_unsupported_page_size() {
    let header = KouchHeader::new(1000);
    assert!(matches!(
        KouchHeader::from_bytes(&header.to_bytes()),
        Err(DatabaseError::CorruptFile { .. })
    ));
}

#[test]
fn test_short_header() {
    assert!(matches!(
        KouchHeader::from_bytes(&[0u8; 20]),
        Err(DatabaseError::CorruptFile { .. })
    ));
}

#[test]
fn test_free_list_root_beyond_page_count() {
    let mut header = KouchHeader::new(4096);
    header.freelist_root = 3;
    header.freelist_count = 1;
    header.page_count = 2;
    assert!(matches!(
        KouchHeader::from_bytes(&header.to_bytes()),
        Err(DatabaseError::CorruptFile { .. })
    ));
}
