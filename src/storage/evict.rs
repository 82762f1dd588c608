//! Eviction, split publication, and reconciliation result handling.
//!
//! Eviction races readers through the reference state word and the hazard
//! table: the evictor takes the reference out of the resident state first,
//! then scans for hazards. A reader that published its hazard before the
//! scan keeps the page; a reader that arrives after the state change spins
//! and retries. An aborted eviction restores the resident state and leaves
//! the page exactly as it was.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use crate::storage::hazard::HazardTable;
use crate::storage::modify::{
    BlockDesc, MultiBody, MultiBlock, MultiKey, RecOutcome, ReplaceBlocks, SplitChildren,
};
use crate::storage::page::{InstKey, PageBody, PageIndex, PageNode};
use crate::storage::pageref::{PageRef, RefAddr, RefKey, RefState};
use crate::storage::source::{BlockAddr, PageSource, TxnSource};
use crate::types::{Result, ShadeError, TxnId};

/// Read generation meaning "never read".
pub const READ_GEN_NOTSET: u64 = 0;
/// Floor value; pages at it are the first eviction candidates.
pub const READ_GEN_OLDEST: u64 = 1;
/// Headroom granted to a page on every access.
pub const READ_GEN_STEP: u64 = 100;

/// The cache's eviction clock.
///
/// Accessing a page stamps it with the clock plus a fixed step; the clock
/// itself advances once per eviction pass, so untouched pages age toward
/// the oldest generation.
pub struct ReadGen {
    current: AtomicU64,
}

impl ReadGen {
    /// Creates a clock at the oldest generation.
    pub fn new() -> Self {
        Self {
            current: AtomicU64::new(READ_GEN_OLDEST),
        }
    }

    /// Current generation.
    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Relaxed)
    }

    /// Advances the clock; called once per eviction pass.
    pub fn tick(&self) {
        self.current.fetch_add(1, Ordering::Relaxed);
    }

    /// Stamps `page` as recently used.
    pub fn touch(&self, page: &PageNode) {
        page.set_read_gen(self.current() + READ_GEN_STEP);
    }
}

impl Default for ReadGen {
    fn default() -> Self {
        Self::new()
    }
}

/// How an eviction attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictOutcome {
    /// The page was busy: pinned, dirty, or contended. Nothing changed.
    Busy,
    /// The page left memory; the reference points back at disk.
    Evicted,
    /// The page reconciled to nothing; the reference is now deleted.
    Emptied,
    /// The page's last reconciliation split it; the reference retired.
    Split,
}

/// Tries to evict the resident page behind `r`.
///
/// Only clean pages leave memory; a dirty page must be reconciled and its
/// result published through [`publish_modify_result`] first. A split
/// outcome needs `parent` to publish the replacement references into.
pub fn try_evict(
    r: &Arc<PageRef>,
    parent: Option<&Arc<PageNode>>,
    hazards: &HazardTable,
) -> Result<EvictOutcome> {
    if !r.transition(RefState::Mem, RefState::Locked) {
        return Ok(EvictOutcome::Busy);
    }
    let Some(page) = r.page_snapshot() else {
        restore(r);
        return Ok(EvictOutcome::Busy);
    };
    if hazards.is_pinned(page.serial()) {
        restore(r);
        return Ok(EvictOutcome::Busy);
    }

    let Some(modify) = page.modify() else {
        // Never modified; the image on disk is current.
        return if r.addr().is_some() {
            discard_to_disk(r, &page)
        } else {
            restore(r);
            Ok(EvictOutcome::Busy)
        };
    };
    if modify.is_dirty() {
        restore(r);
        return Ok(EvictOutcome::Busy);
    }

    let (rec_result, replace) = {
        let state = modify.lock();
        (state.rec_result, state.replace.clone())
    };
    match rec_result {
        None => {
            // Clean since load, nothing was ever reconciled.
            if r.addr().is_some() {
                discard_to_disk(r, &page)
            } else {
                restore(r);
                Ok(EvictOutcome::Busy)
            }
        }
        Some(RecOutcome::Replaced) => {
            let Some(ReplaceBlocks::Single(desc)) = replace else {
                restore(r);
                return Err(ShadeError::Corruption(
                    "replaced page without a single block",
                ));
            };
            r.set_addr(Some(RefAddr::Alloc(desc.addr)));
            discard_to_disk(r, &page)
        }
        Some(RecOutcome::Empty) => {
            r.set_delete_txn(modify.rec_max_txn());
            r.set_page(None);
            r.set_addr(None);
            if !r.transition(RefState::Locked, RefState::Deleted) {
                return Err(ShadeError::Corruption("lost a locked reference"));
            }
            debug!(serial = page.serial(), "empty page deleted on eviction");
            Ok(EvictOutcome::Emptied)
        }
        Some(RecOutcome::Split) => {
            let Some(parent) = parent else {
                restore(r);
                return Ok(EvictOutcome::Busy);
            };
            let Some(ReplaceBlocks::Multi(blocks)) = replace else {
                restore(r);
                return Err(ShadeError::Corruption("split page without multi blocks"));
            };
            let children = match split_children(&blocks) {
                Some(children) => children,
                None => {
                    // A block with skipped updates cannot leave memory yet.
                    restore(r);
                    return Ok(EvictOutcome::Busy);
                }
            };
            publish_split(parent, r, children)?;
            r.set_page(None);
            debug!(serial = page.serial(), blocks = blocks.len(), "page split on eviction");
            Ok(EvictOutcome::Split)
        }
    }
}

fn restore(r: &PageRef) {
    r.transition(RefState::Locked, RefState::Mem);
}

fn discard_to_disk(r: &PageRef, page: &Arc<PageNode>) -> Result<EvictOutcome> {
    r.set_page(None);
    if !r.transition(RefState::Locked, RefState::Disk) {
        return Err(ShadeError::Corruption("lost a locked reference"));
    }
    debug!(serial = page.serial(), "page evicted to disk");
    Ok(EvictOutcome::Evicted)
}

fn split_children(blocks: &[MultiBlock]) -> Option<Vec<Arc<PageRef>>> {
    let mut children = Vec::with_capacity(blocks.len());
    for block in blocks {
        let MultiBody::Addr { desc, .. } = &block.body else {
            return None;
        };
        let key = match &block.key {
            MultiKey::Recno(recno) => RefKey::Recno(*recno),
            MultiKey::Key(bytes) => RefKey::Key(Arc::new(InstKey::new(bytes, None))),
        };
        children.push(Arc::new(PageRef::new_disk(
            RefAddr::Alloc(desc.addr.clone()),
            key,
        )));
    }
    Some(children)
}

/// Replaces `old_ref` in `parent`'s index with `children`, retiring it.
///
/// The caller holds `old_ref` locked. Readers holding the previous index
/// snapshot still see the retired reference and will restart when they
/// find it split; new traversals see the children.
pub fn publish_split(
    parent: &Arc<PageNode>,
    old_ref: &Arc<PageRef>,
    children: Vec<Arc<PageRef>>,
) -> Result<()> {
    let PageBody::Internal(internal) = parent.body() else {
        return Err(ShadeError::Invalid("split parent is not an internal page"));
    };
    let snapshot = internal.index();
    let slot = snapshot
        .position_of(old_ref)
        .ok_or(ShadeError::Invalid("split child not in parent index"))?;
    let mut entries: Vec<Arc<PageRef>> = snapshot.iter().cloned().collect();
    entries.splice(slot..=slot, children.iter().cloned());
    internal.replace_index(PageIndex::new(entries));

    let modify = parent.modify_or_init();
    modify.lock().splits.push(SplitChildren {
        retired: Arc::clone(old_ref),
        children,
    });
    if !old_ref.transition(RefState::Locked, RefState::Split) {
        return Err(ShadeError::Corruption("lost a locked reference"));
    }
    Ok(())
}

/// Publishes the blocks written by a reconciliation of `page` and derives
/// the outcome: no blocks means the page emptied, one block replaces it,
/// several mean a split.
///
/// `pass_gen` is the page's write generation observed when the pass
/// started. An update that landed after that point keeps the page dirty,
/// so eviction holds off until a later pass has written it.
pub fn publish_modify_result(
    page: &PageNode,
    replace: Option<ReplaceBlocks>,
    rec_max_txn: TxnId,
    pass_gen: u32,
) -> RecOutcome {
    let modify = page.modify_or_init();
    let outcome = match &replace {
        None => RecOutcome::Empty,
        Some(ReplaceBlocks::Single(_)) => RecOutcome::Replaced,
        Some(ReplaceBlocks::Multi(_)) => RecOutcome::Split,
    };
    {
        let mut state = modify.lock();
        state.replace = replace;
        state.rec_result = Some(outcome);
    }
    modify.set_rec_max_txn(rec_max_txn);
    if !modify.mark_clean_if(pass_gen) {
        debug!("page modified during reconciliation, stays dirty");
    }
    outcome
}

/// Picks the coldest resident child of `index` as an eviction candidate.
///
/// Each resident reference is parked in the walk-cursor state while its
/// read generation is inspected, then released; references claimed by a
/// racing reader or evictor are skipped. Every visited reference is back
/// in the resident state when the scan returns.
pub fn evict_candidate(index: &PageIndex) -> Option<Arc<PageRef>> {
    let mut best: Option<(Arc<PageRef>, u64)> = None;
    for r in index.iter() {
        if !r.transition(RefState::Mem, RefState::EvictWalk) {
            continue;
        }
        let gen = match r.page() {
            Ok(page) => page.read_gen(),
            Err(_) => {
                r.transition(RefState::EvictWalk, RefState::Mem);
                continue;
            }
        };
        r.transition(RefState::EvictWalk, RefState::Mem);
        if best.as_ref().map_or(true, |(_, b)| gen < *b) {
            best = Some((Arc::clone(r), gen));
        }
    }
    best.map(|(r, _)| r)
}

/// Records that `page`'s next image stops referencing the overflow block
/// at `addr`.
pub fn track_onpage_reference(page: &PageNode, addr: BlockAddr) {
    let modify = page.modify_or_init();
    modify.lock().ovfl_or_init().track_onpage(addr);
}

/// Overflow blocks matched or written by one reconciliation pass.
#[derive(Debug, Default)]
pub struct OverflowPass {
    /// Values written to fresh blocks this pass.
    pub written: Vec<(Bytes, BlockDesc)>,
    /// Values matched to blocks written by an earlier pass.
    pub reused: Vec<(Bytes, BlockAddr)>,
}

/// Runs the overflow side of a reconciliation pass: each value is matched
/// against a previously written block or written to a new one.
pub fn overflow_pass(
    page: &PageNode,
    source: &dyn PageSource,
    values: &[Bytes],
) -> Result<OverflowPass> {
    let modify = page.modify_or_init();
    let mut state = modify.lock();
    let tracker = state.ovfl_or_init();
    tracker.pass_begin();
    let mut pass = OverflowPass::default();
    for value in values {
        if let Some(addr) = tracker.reuse_search(value) {
            pass.reused.push((value.clone(), addr));
        } else {
            let addr = source.write_page(value)?;
            let desc = BlockDesc::describe(addr.clone(), value);
            tracker.reuse_add(value.clone(), addr);
            pass.written.push((value.clone(), desc));
        }
    }
    debug!(
        written = pass.written.len(),
        reused = pass.reused.len(),
        "overflow pass resolved"
    );
    Ok(pass)
}

/// Commits the current overflow pass, returning the blocks to free.
pub fn overflow_pass_complete(page: &PageNode) -> Result<Vec<BlockAddr>> {
    let Some(modify) = page.modify() else {
        return Ok(Vec::new());
    };
    let mut state = modify.lock();
    match state.ovfl.as_mut() {
        Some(tracker) => tracker.pass_complete(),
        None => Ok(Vec::new()),
    }
}

/// Rolls back the current overflow pass, returning the blocks to free.
pub fn overflow_pass_abort(page: &PageNode) -> Result<Vec<BlockAddr>> {
    let Some(modify) = page.modify() else {
        return Ok(Vec::new());
    };
    let mut state = modify.lock();
    match state.ovfl.as_mut() {
        Some(tracker) => tracker.pass_abort(),
        None => Ok(Vec::new()),
    }
}

/// Caches the value of an overflow block being freed while transactions
/// that could still read it remain active.
pub fn cache_superseded_value(
    page: &PageNode,
    addr: BlockAddr,
    value: Bytes,
    txns: &dyn TxnSource,
) {
    let modify = page.modify_or_init();
    modify
        .lock()
        .ovfl_or_init()
        .txnc_cache(addr, value, txns.current_txn_id());
}

/// Drops cached overflow values no active transaction can still read.
pub fn overflow_sweep(page: &PageNode, txns: &dyn TxnSource) -> usize {
    let Some(modify) = page.modify() else {
        return 0;
    };
    let mut state = modify.lock();
    match state.ovfl.as_mut() {
        Some(tracker) => tracker.txnc_sweep(txns.oldest_active_txn_id()),
        None => 0,
    }
}
