//! Per-page modification state.
//!
//! Allocated lazily on a page's first write and published once, the modify
//! block carries everything reconciliation and eviction need to know about
//! a dirty page: transaction watermarks, dirty byte accounting, the blocks
//! written by the last reconciliation, and split bookkeeping. Hot counters
//! are atomics; the structured reconciliation results live behind one
//! mutex taken only by reconciliation and eviction.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};

use crate::storage::ovfl::OverflowTracker;
use crate::storage::pageref::PageRef;
use crate::storage::skiplist::SkipList;
use crate::storage::source::BlockAddr;
use crate::storage::version::{UpdatePayload, VersionChain};
use crate::types::{RecNo, TxnId, TXN_NONE};

/// A single block written by reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDesc {
    /// Where the block landed.
    pub addr: BlockAddr,
    /// Image size in bytes.
    pub size: u32,
    /// CRC of the image, checked when the block is read back.
    pub checksum: u32,
}

impl BlockDesc {
    /// Describes a freshly written image.
    pub fn describe(addr: BlockAddr, image: &[u8]) -> Self {
        Self {
            addr,
            size: image.len() as u32,
            checksum: crc32fast::hash(image),
        }
    }
}

/// Key identifying one output block of a multi-block reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MultiKey {
    /// Column stores: starting record number of the block.
    Recno(RecNo),
    /// Row stores: smallest key on the block.
    Key(Box<[u8]>),
}

/// An update reconciliation could not write because its transaction was
/// still volatile; replayed when the block is read back.
#[derive(Debug, Clone)]
pub struct SkippedUpdate {
    /// Producing transaction.
    pub txnid: TxnId,
    /// The update's value.
    pub payload: UpdatePayload,
    /// Which entry the update belongs to.
    pub key: SkippedKey,
}

/// Position of a skipped update on its source page.
#[derive(Debug, Clone)]
pub enum SkippedKey {
    /// Row inserted in memory, identified by its full key.
    Insert(Bytes),
    /// On-page entry, identified by slot.
    Slot(u32),
}

/// What one output block of a multi-block reconciliation holds.
#[derive(Debug, Clone)]
pub enum MultiBody {
    /// Block written to disk.
    Addr {
        /// The written block.
        desc: BlockDesc,
        /// Whether a previously written block was reused verbatim.
        reuse: bool,
    },
    /// Block not written because updates had to be skipped; the image and
    /// the skipped updates are kept to rebuild the page in memory.
    Skipped {
        /// Updates that could not be written.
        updates: Vec<SkippedUpdate>,
        /// The block image as it would have been written.
        disk_image: Bytes,
    },
}

/// One output block of a multi-block reconciliation.
#[derive(Debug, Clone)]
pub struct MultiBlock {
    /// The block's identifying key.
    pub key: MultiKey,
    /// The block's contents or deferred state.
    pub body: MultiBody,
}

/// Blocks produced by the last reconciliation of a page.
#[derive(Debug, Clone)]
pub enum ReplaceBlocks {
    /// Page fit in one block.
    Single(BlockDesc),
    /// Page was split into multiple blocks.
    Multi(Vec<MultiBlock>),
}

/// Outcome of the last completed reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecOutcome {
    /// Page reconciled to nothing; it can be deleted from its parent.
    Empty,
    /// Page replaced by a single new block.
    Replaced,
    /// Page must be split into the recorded blocks.
    Split,
}

/// Children created when one reference was split, kept until old readers
/// have drained.
#[derive(Debug)]
pub struct SplitChildren {
    /// The retired reference.
    pub retired: Arc<PageRef>,
    /// The references that replaced it.
    pub children: Vec<Arc<PageRef>>,
}

/// Structured modification state guarded by the modify lock.
#[derive(Debug, Default)]
pub struct ModifyState {
    /// Blocks written by the last reconciliation.
    pub replace: Option<ReplaceBlocks>,
    /// How the last reconciliation left the page.
    pub rec_result: Option<RecOutcome>,
    /// Completed splits of this page's children.
    pub splits: Vec<SplitChildren>,
    /// New root pages created by root splits, oldest first.
    pub root_split: Vec<Arc<crate::storage::page::PageNode>>,
    /// Overflow bookkeeping, allocated on first overflow item.
    pub ovfl: Option<Box<OverflowTracker>>,
}

impl ModifyState {
    /// The overflow tracker, allocating it on first use.
    pub fn ovfl_or_init(&mut self) -> &mut OverflowTracker {
        self.ovfl.get_or_insert_with(Default::default)
    }
}

/// Modification block of one page.
pub struct PageModify {
    /// Oldest transaction unwritten when the page image was created.
    disk_txn: AtomicU64,
    /// Newest transaction written by the last reconciliation.
    rec_max_txn: AtomicU64,
    /// Newest transaction to modify the page.
    update_txn: AtomicU64,
    /// In-memory bytes of unreconciled updates.
    bytes_dirty: AtomicU64,
    /// Bumped on every modification; zero means clean.
    write_gen: AtomicU32,
    state: Mutex<ModifyState>,
    /// Column-store append list: records past the last on-page record.
    append: OnceLock<Box<SkipList<RecNo, VersionChain>>>,
    /// Column-store update list: changes to existing records.
    update: OnceLock<Box<SkipList<RecNo, VersionChain>>>,
}

impl PageModify {
    /// Creates a clean modify block.
    pub fn new() -> Self {
        Self {
            disk_txn: AtomicU64::new(TXN_NONE),
            rec_max_txn: AtomicU64::new(TXN_NONE),
            update_txn: AtomicU64::new(TXN_NONE),
            bytes_dirty: AtomicU64::new(0),
            write_gen: AtomicU32::new(0),
            state: Mutex::new(ModifyState::default()),
            append: OnceLock::new(),
            update: OnceLock::new(),
        }
    }

    /// Marks the page dirty on behalf of `txn`.
    pub fn mark_dirty(&self, txn: TxnId) {
        self.write_gen.fetch_add(1, Ordering::SeqCst);
        self.update_txn.fetch_max(txn, Ordering::SeqCst);
    }

    /// Marks the page clean, but only if no modification landed after
    /// `pass_gen`, the write generation observed when reconciliation
    /// started. Returns whether the page is clean; a late update keeps it
    /// dirty for the next pass.
    pub fn mark_clean_if(&self, pass_gen: u32) -> bool {
        if self
            .write_gen
            .compare_exchange(pass_gen, 0, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.bytes_dirty.store(0, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    /// Whether unreconciled modifications exist.
    pub fn is_dirty(&self) -> bool {
        self.write_gen.load(Ordering::SeqCst) != 0
    }

    /// Modification counter; zero means clean.
    pub fn write_gen(&self) -> u32 {
        self.write_gen.load(Ordering::SeqCst)
    }

    /// Accounts bytes of newly created update structures.
    pub fn add_dirty_bytes(&self, bytes: u64) {
        self.bytes_dirty.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Unreconciled update bytes on the page.
    pub fn bytes_dirty(&self) -> u64 {
        self.bytes_dirty.load(Ordering::Relaxed)
    }

    /// Records the oldest transaction not included in the page's image.
    pub fn set_disk_txn(&self, txn: TxnId) {
        self.disk_txn.store(txn, Ordering::SeqCst);
    }

    /// Oldest transaction not included in the page's image.
    pub fn disk_txn(&self) -> TxnId {
        self.disk_txn.load(Ordering::SeqCst)
    }

    /// Raises the newest-reconciled-transaction watermark.
    pub fn set_rec_max_txn(&self, txn: TxnId) {
        self.rec_max_txn.fetch_max(txn, Ordering::SeqCst);
    }

    /// Newest transaction included in the last reconciliation.
    pub fn rec_max_txn(&self) -> TxnId {
        self.rec_max_txn.load(Ordering::SeqCst)
    }

    /// Newest transaction to modify the page.
    pub fn update_txn(&self) -> TxnId {
        self.update_txn.load(Ordering::SeqCst)
    }

    /// Locks the structured state for reconciliation or eviction.
    pub fn lock(&self) -> MutexGuard<'_, ModifyState> {
        self.state.lock()
    }

    /// Append list for records past the end of a column-store page,
    /// allocated on first use.
    pub fn append_list(&self) -> &SkipList<RecNo, VersionChain> {
        self.append.get_or_init(|| Box::new(SkipList::new()))
    }

    /// Update list for existing column-store records, allocated on first
    /// use.
    pub fn update_list(&self) -> &SkipList<RecNo, VersionChain> {
        self.update.get_or_init(|| Box::new(SkipList::new()))
    }
}

impl Default for PageModify {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PageModify {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageModify")
            .field("write_gen", &self.write_gen())
            .field("bytes_dirty", &self.bytes_dirty())
            .field("update_txn", &self.update_txn())
            .finish()
    }
}
