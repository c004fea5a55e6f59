use kouch::{
    EngineConfig,
    storage::{free_list::FreeList, page_store::{Allocator, PageStore}},
    types::error::DatabaseError,
    utils::mock::TempDatabase,
};

fn fresh_allocator() -> Allocator {
    Allocator::new(1, FreeList::new(), u32::MAX)
}

#[test]
fn test_allocate_prefers_freed_page() {
    let mut allocator = fresh_allocator();
    let first = allocator.allocate().unwrap();
    let second = allocator.allocate().unwrap();
    assert_ne!(first, second);
    assert_ne!(first, 0);
    assert_ne!(second, 0);
    assert_eq!(allocator.page_count(), 3);

    allocator.free(first).unwrap();
    assert_eq!(allocator.allocate().unwrap(), first);
    assert_eq!(allocator.page_count(), 3);

    assert_eq!(allocator.allocate().unwrap(), 3);
    assert_eq!(allocator.page_count(), 4);
}

#[test]
fn test_double_free() {
    let mut allocator = fresh_allocator();
    let page = allocator.allocate().unwrap();
    allocator.free(page).unwrap();
    assert!(matches!(
        allocator.free(page),
        Err(DatabaseError::DoubleFree { page_index }) if page_index == page
    ));
}

#[test]
fn test_free_rejects_header_and_out_of_range() {
    let mut allocator = fresh_allocator();
    allocator.allocate().unwrap();
    assert!(matches!(
        allocator.free(0),
        Err(DatabaseError::InvalidPageIndex { page_index: 0, .. })
    ));
    assert!(matches!(
        allocator.free(10),
        Err(DatabaseError::InvalidPageIndex { page_index: 10, .. })
    ));
}

#[test]
fn test_free_and_live_are_disjoint() {
    let mut allocator = fresh_allocator();
    for _ in 0..6 {
        allocator.allocate().unwrap();
    }
    allocator.free(2).unwrap();
    allocator.free(5).unwrap();
    for page in 1..allocator.page_count() {
        assert_ne!(
            allocator.is_live(page),
            allocator.free_list().contains(page),
            "page {} must be exactly one of live or free",
            page
        );
    }
    assert!(!allocator.is_live(0));
}

#[test]
fn test_page_limit_is_storage_full() {
    let mut allocator = Allocator::new(1, FreeList::new(), 3);
    allocator.allocate().unwrap();
    allocator.allocate().unwrap();
    assert!(matches!(
        allocator.allocate(),
        Err(DatabaseError::StorageFull { .. })
    ));

    // A freed page is still available at the limit
    allocator.free(1).unwrap();
    assert_eq!(allocator.allocate().unwrap(), 1);
}

#[test]
fn test_extend_to_frees_skipped_pages() {
    let mut allocator = fresh_allocator();
    allocator.extend_to(5).unwrap();
    assert_eq!(allocator.page_count(), 6);
    assert!(allocator.is_live(5));
    for gap in 1..5 {
        assert!(allocator.free_list().contains(gap));
    }
    // The gap is a single run described by one link page
    assert_eq!(allocator.dirty_links().len(), 1);
    assert_eq!(allocator.free_list().runs().count(), 1);
}

#[test]
fn test_extend_to_far_past_end_logs_one_link() {
    let mut allocator = fresh_allocator();
    allocator.extend_to(1_000_000).unwrap();
    assert_eq!(allocator.page_count(), 1_000_001);
    assert_eq!(allocator.free_list().len(), 999_999);

    let links = allocator.link_pages(512);
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].index, 1);
    assert_eq!(links[0].run_length(), 999_999);
    assert_eq!(links[0].next_free(), None);

    // Pages come off the end of the run; its link page stays dirty
    allocator.clear_dirty();
    assert_eq!(allocator.allocate().unwrap(), 999_999);
    assert_eq!(allocator.page_count(), 1_000_001);
    let links = allocator.link_pages(512);
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].run_length(), 999_998);
}

#[test]
fn test_release_trailing_free() {
    let mut allocator = fresh_allocator();
    for _ in 0..5 {
        allocator.allocate().unwrap();
    }
    allocator.free(2).unwrap();
    allocator.free(4).unwrap();
    allocator.free(5).unwrap();
    allocator.clear_dirty();

    assert_eq!(allocator.release_trailing_free(), 2);
    assert_eq!(allocator.page_count(), 4);
    assert_eq!(
        allocator.free_list().runs().map(|run| run.start).collect::<Vec<_>>(),
        vec![2]
    );
    let links = allocator.link_pages(512);
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].next_free(), None);
}

#[test]
fn test_page_store_create_and_reopen() {
    let temp_db = TempDatabase::with_prefix("page_store_create");
    {
        let store = PageStore::create(&temp_db.path, 1024, None).unwrap();
        assert_eq!(store.page_size(), 1024);
        assert_eq!(store.page_count(), 1);
        assert_eq!(store.file_size(), 1024);
    }
    let store = PageStore::open(&temp_db.path, None).unwrap();
    assert_eq!(store.page_size(), 1024);
    assert_eq!(store.header().next_txn_id, 1);
}

#[test]
fn test_page_store_create_refuses_existing_file() {
    let temp_db = TempDatabase::with_prefix("page_store_exists");
    PageStore::create(&temp_db.path, 4096, None).unwrap();
    assert!(PageStore::create(&temp_db.path, 4096, None).is_err());
}

#[test]
fn test_page_store_open_missing_is_not_found() {
    let temp_db = TempDatabase::with_prefix("page_store_missing");
    assert!(matches!(
        PageStore::open(&temp_db.path, None),
        Err(DatabaseError::NotFound { .. })
    ));
}

#[test]
fn test_page_store_flush_persists_committed_view() {
    let temp_db = TempDatabase::with_prefix("page_store_flush");
    {
        let mut store = PageStore::create(&temp_db.path, 512, None).unwrap();
        let mut allocator = store.allocator().clone();
        let page = allocator.allocate().unwrap();
        store.install_allocator(allocator.clone());

        let mut header = store.header().clone();
        allocator.apply_to_header(&mut header);
        store.write(0, header.to_bytes()).unwrap();
        store.write(page, vec![0x5A; 512]).unwrap();
        assert_eq!(store.pending_pages(), 2);

        assert_eq!(store.read(page).unwrap(), vec![0x5A; 512]);
        assert_eq!(store.flush(16).unwrap(), 1);
        assert_eq!(store.pending_pages(), 0);
    }

    let mut store = PageStore::open(&temp_db.path, None).unwrap();
    assert_eq!(store.page_count(), 2);
    assert_eq!(store.read(1).unwrap(), vec![0x5A; 512]);
    assert!(matches!(
        store.read(2),
        Err(DatabaseError::InvalidPageIndex { .. })
    ));
}

#[test]
fn test_page_store_write_rejects_wrong_size() {
    let temp_db = TempDatabase::with_prefix("page_store_size");
    let mut store = PageStore::create(&temp_db.path, 512, None).unwrap();
    assert!(matches!(
        store.write(1, vec![0u8; 100]),
        Err(DatabaseError::InvalidPageSize {
            expected: 512,
            actual: 100
        })
    ));
}

#[test]
fn test_read_of_free_page_is_invalid() {
    let mut temp_db = TempDatabase::with_config(
        "page_store_read_free",
        EngineConfig {
            fsync: false,
            ..EngineConfig::default()
        },
    );
    let handle = temp_db.open().unwrap();
    let txn = handle.begin().unwrap();
    let page = handle.allocate(&txn).unwrap();
    handle.commit(txn).unwrap();
    assert!(handle.read(page).is_ok());

    let txn = handle.begin().unwrap();
    handle.free(&txn, page).unwrap();
    handle.commit(txn).unwrap();
    assert!(matches!(
        handle.read(page),
        Err(DatabaseError::InvalidPageIndex { .. })
    ));
}
