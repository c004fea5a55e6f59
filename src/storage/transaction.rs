use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::{
    storage::{page_store::{Allocator, PageStore}, wal::Wal},
    types::{
        HEADER_PAGE_INDEX, LogOffset, PageIndex, TransactionId,
        error::{DatabaseError, Result},
        page::Page,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committing,
    Committed,
    Aborted,
}

impl TransactionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionState::Committed | TransactionState::Aborted)
    }
}

/// Token for the handle's active transaction.
///
/// Consumed by commit and abort, so a finished transaction cannot be reused.
#[derive(Debug, PartialEq, Eq)]
pub struct Transaction {
    id: TransactionId,
}

impl Transaction {
    pub fn id(&self) -> TransactionId {
        self.id
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub txn_id: TransactionId,
    /// Offset of the page record, `None` when the transaction changed nothing.
    pub wal_offset: Option<LogOffset>,
    /// Page images logged, including the header page.
    pub pages_logged: usize,
}

struct WorkingSet {
    id: TransactionId,
    state: TransactionState,
    pages: BTreeMap<PageIndex, Vec<u8>>,
    allocator: Allocator,
    base_page_count: u32,
}

impl WorkingSet {
    fn is_unchanged(&self) -> bool {
        self.pages.is_empty()
            && self.allocator.dirty_links().is_empty()
            && self.allocator.page_count() == self.base_page_count
    }
}

/// Single-writer coordinator between the WAL and the page store.
pub struct TransactionManager {
    active: Option<WorkingSet>,
    next_txn_id: TransactionId,
    last_finished: Option<(TransactionId, TransactionState)>,
}

impl TransactionManager {
    pub fn new(next_txn_id: TransactionId) -> Self {
        Self {
            active: None,
            next_txn_id: next_txn_id.max(1),
            last_finished: None,
        }
    }

    pub fn begin(&mut self, store: &PageStore) -> Result<Transaction> {
        if let Some(active) = &self.active {
            return Err(DatabaseError::AlreadyActive { txn_id: active.id });
        }
        let id = self.next_txn_id;
        self.next_txn_id += 1;
        self.active = Some(WorkingSet {
            id,
            state: TransactionState::Active,
            pages: BTreeMap::new(),
            allocator: store.allocator().clone(),
            base_page_count: store.page_count(),
        });
        debug!("begin(txn={})", id);
        Ok(Transaction { id })
    }

    pub fn active_id(&self) -> Option<TransactionId> {
        self.active.as_ref().map(|ws| ws.id)
    }

    /// State of the active transaction or of the most recently finished one.
    pub fn state_of(&self, txn_id: TransactionId) -> Option<TransactionState> {
        match (&self.active, self.last_finished) {
            (Some(ws), _) if ws.id == txn_id => Some(ws.state),
            (_, Some((id, state))) if id == txn_id => Some(state),
            _ => None,
        }
    }

    fn working_set(&mut self, txn: &Transaction) -> Result<&mut WorkingSet> {
        match self.active.as_mut() {
            Some(ws) if ws.id == txn.id => Ok(ws),
            _ => Err(DatabaseError::UnknownTransaction { txn_id: txn.id }),
        }
    }

    fn take_working_set(&mut self, txn: &Transaction) -> Result<WorkingSet> {
        self.working_set(txn)?;
        self.active
            .take()
            .ok_or(DatabaseError::UnknownTransaction { txn_id: txn.id })
    }

    fn finish(&mut self, ws: WorkingSet, state: TransactionState) {
        self.last_finished = Some((ws.id, state));
    }

    /// Stages a full page image; writing past the end grows the file.
    pub fn put(
        &mut self,
        txn: &Transaction,
        page_index: PageIndex,
        data: Vec<u8>,
        page_size: usize,
    ) -> Result<()> {
        if data.len() != page_size {
            return Err(DatabaseError::InvalidPageSize {
                expected: page_size,
                actual: data.len(),
            });
        }
        let ws = self.working_set(txn)?;
        if page_index == HEADER_PAGE_INDEX || ws.allocator.free_list().contains(page_index) {
            return Err(DatabaseError::InvalidPageIndex {
                page_index,
                page_count: ws.allocator.page_count(),
            });
        }
        ws.allocator.extend_to(page_index)?;
        ws.pages.insert(page_index, data);
        debug!("put(txn={}, page={})", ws.id, page_index);
        Ok(())
    }

    /// Reads a page as the transaction sees it: staged content first, then committed.
    pub fn read(
        &mut self,
        txn: &Transaction,
        page_index: PageIndex,
        store: &mut PageStore,
    ) -> Result<Vec<u8>> {
        let ws = self.working_set(txn)?;
        if let Some(data) = ws.pages.get(&page_index) {
            return Ok(data.clone());
        }
        ws.allocator.check_live(page_index)?;
        store.read(page_index)
    }

    pub fn allocate(&mut self, txn: &Transaction, page_size: usize) -> Result<PageIndex> {
        let ws = self.working_set(txn)?;
        let page_index = ws.allocator.allocate()?;
        ws.pages.insert(page_index, vec![0; page_size]);
        Ok(page_index)
    }

    pub fn free(&mut self, txn: &Transaction, page_index: PageIndex) -> Result<()> {
        let ws = self.working_set(txn)?;
        ws.allocator.free(page_index)?;
        ws.pages.remove(&page_index);
        Ok(())
    }

    /// Drops trailing free pages inside the transaction. Returns how many.
    pub fn release_trailing_free(&mut self, txn: &Transaction) -> Result<u32> {
        let ws = self.working_set(txn)?;
        Ok(ws.allocator.release_trailing_free())
    }

    /// Logs the working set as one record plus a commit marker, then applies it.
    pub fn commit(
        &mut self,
        txn: Transaction,
        store: &mut PageStore,
        wal: &mut Wal,
    ) -> Result<CommitInfo> {
        let mut ws = self.take_working_set(&txn)?;
        ws.state = TransactionState::Committing;

        if ws.is_unchanged() {
            debug!("commit(txn={}) = nothing to log", ws.id);
            let txn_id = ws.id;
            self.finish(ws, TransactionState::Committed);
            return Ok(CommitInfo {
                txn_id,
                wal_offset: None,
                pages_logged: 0,
            });
        }

        let page_size = store.page_size();
        let mut header = store.header().clone();
        ws.allocator.apply_to_header(&mut header);
        header.next_txn_id = header.next_txn_id.max(ws.id + 1);
        header.change_counter = header.change_counter.wrapping_add(1);

        let mut entries = Vec::with_capacity(1 + ws.pages.len());
        entries.push(Page {
            index: HEADER_PAGE_INDEX,
            data: header.to_bytes(),
        });
        entries.extend(ws.allocator.link_pages(page_size));
        entries.extend(
            std::mem::take(&mut ws.pages)
                .into_iter()
                .map(|(index, data)| Page { index, data }),
        );

        let wal_len = wal.len();
        let logged = wal
            .append(ws.id, &entries)
            .and_then(|offset| wal.commit_marker(ws.id).map(|_| offset));
        let wal_offset = match logged {
            Ok(offset) => offset,
            Err(err) => {
                if let Err(rollback_err) = wal.rollback_to(wal_len) {
                    warn!("failed to roll back WAL after txn {}: {}", ws.id, rollback_err);
                }
                warn!("commit(txn={}) aborted: {}", ws.id, err);
                self.finish(ws, TransactionState::Aborted);
                return Err(err);
            }
        };

        for page in entries.iter() {
            store.write(page.index, page.data.clone())?;
        }
        let txn_id = ws.id;
        let pages_logged = entries.len();
        store.install_allocator(ws.allocator.clone());
        self.finish(ws, TransactionState::Committed);
        debug!("commit(txn={}) = {} pages at offset {}", txn_id, pages_logged, wal_offset);

        Ok(CommitInfo {
            txn_id,
            wal_offset: Some(wal_offset),
            pages_logged,
        })
    }

    pub fn abort(&mut self, txn: Transaction) -> Result<()> {
        let ws = self.take_working_set(&txn)?;
        debug!("abort(txn={}) discarding {} staged pages", ws.id, ws.pages.len());
        self.finish(ws, TransactionState::Aborted);
        Ok(())
    }

    /// Aborts whatever transaction is open, returning its id.
    pub fn abort_active(&mut self) -> Option<TransactionId> {
        let ws = self.active.take()?;
        let id = ws.id;
        self.finish(ws, TransactionState::Aborted);
        Some(id)
    }
}
