use std::collections::{BTreeMap, BTreeSet};

use crate::types::{PageIndex, error::DatabaseError, page::Page};

/// A contiguous range of free pages, described by one link page at `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeRun {
    pub start: PageIndex,
    pub len: u32,
}

impl FreeRun {
    pub fn end(&self) -> PageIndex {
        self.start.saturating_add(self.len)
    }

    fn contains(&self, page_index: PageIndex) -> bool {
        page_index >= self.start && page_index < self.end()
    }
}

/// Reusable page indices, kept as a LIFO stack of runs.
///
/// The top of the stack is the chain root stored in the header; each run's
/// link page points at the run below it, and the bottom run terminates the
/// chain. Pages are handed out from the end of the top run, so the link page
/// at a run's start is the last of its pages to be reused.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FreeList {
    stack: Vec<FreeRun>,
    // run start -> run length, for membership lookups
    runs: BTreeMap<PageIndex, u32>,
    free_pages: usize,
}

impl FreeList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds the list from a chain walked root first.
    pub fn from_chain(chain: Vec<FreeRun>) -> Result<Self, DatabaseError> {
        let mut free_list = Self::new();
        for run in chain.into_iter().rev() {
            if run.len == 0 || free_list.first_overlap(run).is_some() {
                return Err(DatabaseError::corrupt(format!(
                    "Free list chain has an invalid run at page {} (length {})",
                    run.start, run.len
                )));
            }
            free_list.insert_run(run);
        }
        Ok(free_list)
    }

    fn run_containing(&self, page_index: PageIndex) -> Option<FreeRun> {
        self.runs
            .range(..=page_index)
            .next_back()
            .map(|(&start, &len)| FreeRun { start, len })
            .filter(|run| run.contains(page_index))
    }

    fn first_overlap(&self, run: FreeRun) -> Option<PageIndex> {
        if self.contains(run.start) {
            return Some(run.start);
        }
        self.runs.range(run.start..run.end()).next().map(|(&start, _)| start)
    }

    fn insert_run(&mut self, run: FreeRun) {
        self.runs.insert(run.start, run.len);
        self.stack.push(run);
        self.free_pages += run.len as usize;
    }

    pub fn push(&mut self, page_index: PageIndex) -> Result<(), DatabaseError> {
        self.push_run(page_index, 1)
    }

    /// Frees `len` pages starting at `start` as a single run.
    pub fn push_run(&mut self, start: PageIndex, len: u32) -> Result<(), DatabaseError> {
        if len == 0 {
            return Ok(());
        }
        let run = FreeRun { start, len };
        if let Some(page_index) = self.first_overlap(run) {
            return Err(DatabaseError::DoubleFree { page_index });
        }
        self.insert_run(run);
        Ok(())
    }

    /// Pops the last page of the top run.
    ///
    /// Returns the page and, when the run still holds pages, the run start
    /// whose link page now records a shorter length.
    pub fn pop(&mut self) -> Option<(PageIndex, Option<PageIndex>)> {
        let top = self.stack.last_mut()?;
        let page_index = top.end() - 1;
        self.free_pages -= 1;
        if top.len == 1 {
            let start = top.start;
            self.stack.pop();
            self.runs.remove(&start);
            return Some((page_index, None));
        }
        top.len -= 1;
        let start = top.start;
        self.runs.insert(start, top.len);
        Some((page_index, Some(start)))
    }

    /// Removes the run that ends exactly at `end`, if any.
    pub fn take_run_ending_at(&mut self, end: PageIndex) -> Option<FreeRun> {
        let run = self.run_containing(end.checked_sub(1)?)?;
        if run.end() != end {
            return None;
        }
        self.runs.remove(&run.start);
        self.stack.retain(|r| r.start != run.start);
        self.free_pages -= run.len as usize;
        Some(run)
    }

    pub fn contains(&self, page_index: PageIndex) -> bool {
        self.run_containing(page_index).is_some()
    }

    pub fn root(&self) -> Option<PageIndex> {
        self.stack.last().map(|run| run.start)
    }

    /// Number of free pages across all runs.
    pub fn len(&self) -> usize {
        self.free_pages
    }

    pub fn is_empty(&self) -> bool {
        self.free_pages == 0
    }

    /// Iterates runs root first, in chain order.
    pub fn runs(&self) -> impl Iterator<Item = FreeRun> + '_ {
        self.stack.iter().rev().copied()
    }

    /// Link page images for the runs whose start is in `dirty`, in stack order.
    pub fn link_pages(&self, dirty: &BTreeSet<PageIndex>, page_size: usize) -> Vec<Page> {
        self.stack
            .iter()
            .enumerate()
            .filter(|(_, run)| dirty.contains(&run.start))
            .map(|(position, run)| {
                let next = position.checked_sub(1).map(|below| self.stack[below].start);
                Page::free_link(run.start, next, run.len, page_size)
            })
            .collect()
    }
}
