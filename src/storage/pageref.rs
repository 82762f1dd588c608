//! Page references and the resident-page acquisition protocol.
//!
//! A reference is the single entry in its parent's index naming a child
//! page, whether or not that child is in memory. All coordination between
//! readers, page faults, and eviction goes through the reference's state
//! word; the page pointer behind it is only dereferenced while the state
//! says it may be.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tracing::{error, trace};

use crate::storage::evict::ReadGen;
use crate::storage::hazard::{HazardGuard, HazardTable};
use crate::storage::page::{CellRef, DiskImage, InstKey, PageNode};
use crate::storage::source::{BlockAddr, CellCodec, PageSource};
use crate::types::page::PageKind;
use crate::types::{RecNo, Result, ShadeError, TxnId, TXN_NONE};

/// Lifecycle state of a page reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RefState {
    /// Page is on disk; faulting it in is required before use.
    Disk = 0,
    /// Page was deleted; a reader must instantiate an empty page to
    /// proceed through it.
    Deleted = 1,
    /// Held by an eviction walk cursor; ordinary readers wait.
    EvictWalk = 2,
    /// Exclusively locked, page pointer unstable.
    Locked = 3,
    /// Resident; the page pointer may be dereferenced under a hazard.
    Mem = 4,
    /// A fault is in flight; the winner will publish the page.
    Reading = 5,
    /// The page was split and this reference retired. Terminal.
    Split = 6,
}

impl RefState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => RefState::Disk,
            1 => RefState::Deleted,
            2 => RefState::EvictWalk,
            3 => RefState::Locked,
            4 => RefState::Mem,
            5 => RefState::Reading,
            _ => RefState::Split,
        }
    }
}

/// Where a referenced page lives on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefAddr {
    /// Address cell on the parent's disk image.
    OnPage(CellRef),
    /// Address allocated after reconciliation, off the parent image.
    Alloc(BlockAddr),
}

/// The key separating this child from its siblings.
#[derive(Debug, Clone)]
pub enum RefKey {
    /// Column stores: the child's starting record number.
    Recno(RecNo),
    /// Row stores: key cell on the parent's disk image.
    OnPage(CellRef),
    /// Row stores: instantiated key, off the parent image.
    Key(Arc<InstKey>),
}

/// One child reference in an internal page's index.
pub struct PageRef {
    state: AtomicU8,
    page: RwLock<Option<Arc<PageNode>>>,
    addr: RwLock<Option<RefAddr>>,
    key: RwLock<RefKey>,
    /// Transaction that deleted the page, meaningful in `Deleted`.
    del_txn: AtomicU64,
}

impl PageRef {
    /// Builds a reference to an on-disk page.
    pub fn new_disk(addr: RefAddr, key: RefKey) -> Self {
        Self {
            state: AtomicU8::new(RefState::Disk as u8),
            page: RwLock::new(None),
            addr: RwLock::new(Some(addr)),
            key: RwLock::new(key),
            del_txn: AtomicU64::new(TXN_NONE),
        }
    }

    /// Builds a reference to an already resident page, used for pages
    /// created in memory by splits.
    pub fn new_mem(page: Arc<PageNode>, key: RefKey) -> Self {
        Self {
            state: AtomicU8::new(RefState::Mem as u8),
            page: RwLock::new(Some(page)),
            addr: RwLock::new(None),
            key: RwLock::new(key),
            del_txn: AtomicU64::new(TXN_NONE),
        }
    }

    /// Current state.
    pub fn state(&self) -> RefState {
        RefState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Atomically moves `from` to `to`; false if another thread got there
    /// first.
    pub fn transition(&self, from: RefState, to: RefState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// The resident page. Refused outside the states in which the pointer
    /// is stable.
    pub fn page(&self) -> Result<Arc<PageNode>> {
        match self.state() {
            RefState::Mem | RefState::EvictWalk => {}
            state => {
                error!(?state, "page dereference outside resident state");
                return Err(ShadeError::Corruption(
                    "page dereference outside resident state",
                ));
            }
        }
        self.page
            .read()
            .clone()
            .ok_or(ShadeError::Corruption("resident reference has no page"))
    }

    /// The page pointer regardless of state, for callers that already hold
    /// the reference exclusively.
    pub fn page_snapshot(&self) -> Option<Arc<PageNode>> {
        self.page.read().clone()
    }

    /// Installs or clears the page pointer. Caller must hold the reference
    /// in an exclusive state.
    pub fn set_page(&self, page: Option<Arc<PageNode>>) {
        *self.page.write() = page;
    }

    /// The on-disk address, absent for pages never reconciled.
    pub fn addr(&self) -> Option<RefAddr> {
        self.addr.read().clone()
    }

    /// Replaces the on-disk address.
    pub fn set_addr(&self, addr: Option<RefAddr>) {
        *self.addr.write() = addr;
    }

    /// The child's separator key.
    pub fn key(&self) -> RefKey {
        self.key.read().clone()
    }

    /// Replaces the separator key, used when a split moves it off a
    /// discarded parent image.
    pub fn set_key(&self, key: RefKey) {
        *self.key.write() = key;
    }

    /// Transaction id recorded when the page was deleted.
    pub fn delete_txn(&self) -> TxnId {
        self.del_txn.load(Ordering::SeqCst)
    }

    /// Records the deleting transaction.
    pub fn set_delete_txn(&self, txn: TxnId) {
        self.del_txn.store(txn, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for PageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageRef")
            .field("state", &self.state())
            .field("addr", &*self.addr.read())
            .finish()
    }
}

/// Everything a reader needs to bring pages into memory.
pub struct PageReadContext<'a> {
    /// Hazard table shared by readers and evictors.
    pub hazards: &'a HazardTable,
    /// Block-level reader.
    pub source: &'a dyn PageSource,
    /// Cell decoder for the on-disk format.
    pub codec: &'a dyn CellCodec,
    /// Eviction clock, ticked on every successful acquisition.
    pub gen: &'a ReadGen,
    /// When to give up waiting on a busy reference; wait forever if unset.
    pub deadline: Option<Instant>,
}

/// A resident page held under a hazard. The page cannot be evicted while
/// the guard lives.
pub struct PageGuard {
    page: Arc<PageNode>,
    _hazard: HazardGuard,
}

impl PageGuard {
    /// The protected page.
    pub fn page(&self) -> &Arc<PageNode> {
        &self.page
    }
}

impl std::ops::Deref for PageGuard {
    type Target = PageNode;

    fn deref(&self) -> &PageNode {
        &self.page
    }
}

/// Acquires the page behind `r`, faulting it in or instantiating it as the
/// state requires.
///
/// Returns `Ok(None)` when the reference was retired by a split; the caller
/// restarts its traversal from the parent. Busy states are waited out until
/// the context's deadline.
pub fn acquire(
    r: &PageRef,
    parent: Option<&Arc<PageNode>>,
    cx: &PageReadContext<'_>,
) -> Result<Option<PageGuard>> {
    let mut spins: u32 = 0;
    loop {
        match r.state() {
            RefState::Mem => {
                let Some(page) = r.page_snapshot() else {
                    backoff(&mut spins, cx.deadline)?;
                    continue;
                };
                let hazard = cx.hazards.pin(page.serial());
                let still_same = r.state() == RefState::Mem
                    && r.page_snapshot()
                        .is_some_and(|cur| Arc::ptr_eq(&cur, &page));
                if still_same {
                    cx.gen.touch(&page);
                    return Ok(Some(PageGuard {
                        page,
                        _hazard: hazard,
                    }));
                }
                // Eviction won the race; the guard drops and we retry.
                drop(hazard);
            }
            RefState::Disk => {
                if !r.transition(RefState::Disk, RefState::Reading) {
                    continue;
                }
                match fault_in(r, parent, cx) {
                    Ok(page) => {
                        trace!(serial = page.serial(), "page read into memory");
                        r.set_page(Some(page));
                        promote(r, RefState::Reading)?;
                    }
                    Err(err) => {
                        r.transition(RefState::Reading, RefState::Disk);
                        return Err(err);
                    }
                }
            }
            RefState::Deleted => {
                if !r.transition(RefState::Deleted, RefState::Locked) {
                    continue;
                }
                let page = instantiate_deleted(r, parent)?;
                trace!(serial = page.serial(), "deleted page instantiated");
                r.set_page(Some(page));
                promote(r, RefState::Locked)?;
            }
            RefState::Reading | RefState::Locked | RefState::EvictWalk => {
                backoff(&mut spins, cx.deadline)?;
            }
            RefState::Split => return Ok(None),
        }
    }
}

/// Publishes a freshly installed page from an exclusive state.
fn promote(r: &PageRef, from: RefState) -> Result<()> {
    if r.transition(from, RefState::Mem) {
        Ok(())
    } else {
        Err(ShadeError::Corruption("lost an exclusively held reference"))
    }
}

fn fault_in(
    r: &PageRef,
    parent: Option<&Arc<PageNode>>,
    cx: &PageReadContext<'_>,
) -> Result<Arc<PageNode>> {
    let addr = r
        .addr()
        .ok_or(ShadeError::Corruption("on-disk reference has no address"))?;
    let block = match addr {
        RefAddr::Alloc(block) => block,
        RefAddr::OnPage(cell) => {
            let parent =
                parent.ok_or(ShadeError::Invalid("on-page address requires a parent"))?;
            let image = parent
                .disk()
                .ok_or(ShadeError::Corruption("parent image discarded"))?;
            cx.codec.addr(image, cell)?
        }
    };
    let data = cx.source.read_page(&block)?;
    let image = DiskImage::decode(data)?;
    let page = PageNode::materialize(image, cx.codec)?;
    if let Some(parent) = parent {
        page.set_parent(parent);
    }
    Ok(page)
}

/// Builds the empty leaf standing in for a deleted page.
fn instantiate_deleted(
    r: &PageRef,
    parent: Option<&Arc<PageNode>>,
) -> Result<Arc<PageNode>> {
    let kind = match parent.map(|p| p.body().kind()) {
        Some(PageKind::ColInt) => PageKind::ColVar,
        _ => PageKind::RowLeaf,
    };
    let recno = match r.key() {
        RefKey::Recno(recno) => recno,
        _ => 0,
    };
    let page = PageNode::empty_leaf(kind, recno)?;
    if let Some(parent) = parent {
        page.set_parent(parent);
    }
    Ok(page)
}

fn backoff(spins: &mut u32, deadline: Option<Instant>) -> Result<()> {
    if let Some(deadline) = deadline {
        if Instant::now() >= deadline {
            return Err(ShadeError::Busy("timed out waiting for a busy page"));
        }
    }
    *spins += 1;
    if *spins < 64 {
        std::hint::spin_loop();
    } else {
        std::thread::yield_now();
    }
    Ok(())
}
