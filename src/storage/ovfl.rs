//! Overflow block tracking across reconciliation passes.
//!
//! Values too large to live on a page are written to their own blocks.
//! Three lists, all owned by the page's modify block and driven under its
//! lock, keep those blocks honest across reconciliation:
//!
//! * `onpage` records overflow blocks the page image no longer needs, so
//!   a completed pass can free them exactly once.
//! * `reuse` matches values being written against blocks already written
//!   for the same value, so rewriting a page does not duplicate its
//!   overflow blocks.
//! * `txnc` caches the value of a freed overflow block while transactions
//!   that could still read it remain active.
//!
//! Every block passes through the released set on its way back to the
//! block manager; freeing the same block twice is reported as corruption
//! rather than forwarded.

use bytes::Bytes;
use rustc_hash::FxHashSet;
use tracing::debug;

use crate::storage::skiplist::SkipList;
use crate::storage::source::BlockAddr;
use crate::types::{Result, ShadeError, TxnId};

#[derive(Debug)]
struct OnPageEntry {
    just_added: bool,
}

#[derive(Debug)]
struct ReuseEntry {
    addr: BlockAddr,
    in_use: bool,
    just_added: bool,
}

#[derive(Debug)]
struct TxnCacheEntry {
    value: Bytes,
    pinned_txn: TxnId,
}

/// Overflow bookkeeping for one page.
#[derive(Debug, Default)]
pub struct OverflowTracker {
    onpage: SkipList<BlockAddr, OnPageEntry>,
    reuse: SkipList<Bytes, ReuseEntry>,
    txnc: SkipList<BlockAddr, TxnCacheEntry>,
    released: FxHashSet<BlockAddr>,
}

impl OverflowTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that the page image references an overflow block that the
    /// next written image will not. Idempotent per address.
    pub fn track_onpage(&mut self, addr: BlockAddr) {
        if self.onpage.contains_key(&addr) {
            return;
        }
        self.onpage
            .insert(addr, OnPageEntry { just_added: true });
    }

    /// Whether `addr` is tracked as a discarded on-page overflow block.
    pub fn onpage_contains(&self, addr: &BlockAddr) -> bool {
        self.onpage.contains_key(addr)
    }

    /// Looks for an already written block holding `value` that this pass
    /// has not yet claimed, and claims it. Only the duplicate run for
    /// `value` is visited.
    pub fn reuse_search(&mut self, value: &Bytes) -> Option<BlockAddr> {
        for (key, entry) in self.reuse.range_from_mut(value) {
            if key != value {
                break;
            }
            if !entry.in_use {
                entry.in_use = true;
                return Some(entry.addr.clone());
            }
        }
        None
    }

    /// Records a freshly written overflow block for `value`, claimed by
    /// the current pass.
    pub fn reuse_add(&mut self, value: Bytes, addr: BlockAddr) {
        self.reuse.insert(
            value,
            ReuseEntry {
                addr,
                in_use: true,
                just_added: true,
            },
        );
    }

    /// Starts a reconciliation pass: no block is claimed yet.
    pub fn pass_begin(&mut self) {
        for (_, entry) in self.reuse.iter_mut() {
            entry.in_use = false;
        }
    }

    /// Completes a pass. Blocks the new image stopped referencing are
    /// freed: discarded on-page blocks recorded since the last pass, and
    /// reuse blocks no writer claimed. Returns the freed addresses.
    pub fn pass_complete(&mut self) -> Result<Vec<BlockAddr>> {
        let mut freed = Vec::new();
        for (addr, entry) in self.onpage.iter_mut() {
            if entry.just_added {
                entry.just_added = false;
                freed.push(addr.clone());
            }
        }
        for (_, entry) in self.reuse.remove_where(|_, e| !e.in_use) {
            freed.push(entry.addr);
        }
        for (_, entry) in self.reuse.iter_mut() {
            entry.just_added = false;
        }
        self.release_all(&freed)?;
        debug!(blocks = freed.len(), "overflow pass complete");
        Ok(freed)
    }

    /// Aborts a pass. On-page entries recorded by the failed pass are
    /// forgotten without freeing anything, since the old image still
    /// references those blocks; blocks the failed pass wrote are freed.
    /// Returns the freed addresses.
    pub fn pass_abort(&mut self) -> Result<Vec<BlockAddr>> {
        self.onpage.remove_where(|_, e| e.just_added);
        let freed: Vec<BlockAddr> = self
            .reuse
            .remove_where(|_, e| e.just_added)
            .into_iter()
            .map(|(_, e)| e.addr)
            .collect();
        for (_, entry) in self.reuse.iter_mut() {
            entry.in_use = false;
        }
        self.release_all(&freed)?;
        debug!(blocks = freed.len(), "overflow pass aborted");
        Ok(freed)
    }

    /// Caches the value of a freed overflow block until transactions older
    /// than the deleting one have drained.
    pub fn txnc_cache(&mut self, addr: BlockAddr, value: Bytes, pinned_txn: TxnId) {
        self.txnc.insert(addr, TxnCacheEntry { value, pinned_txn });
    }

    /// The cached value of a freed overflow block, with the transaction
    /// pinning it.
    pub fn cached(&self, addr: &BlockAddr) -> Option<(&Bytes, TxnId)> {
        self.txnc
            .get(addr)
            .map(|entry| (&entry.value, entry.pinned_txn))
    }

    /// Drops cached values no active transaction can still read. Returns
    /// how many were dropped.
    pub fn txnc_sweep(&mut self, oldest_active: TxnId) -> usize {
        let swept = self
            .txnc
            .remove_where(|_, entry| entry.pinned_txn < oldest_active);
        swept.len()
    }

    /// Number of values pinned in the transaction cache.
    pub fn txnc_len(&self) -> usize {
        self.txnc.len()
    }

    fn release_all(&mut self, addrs: &[BlockAddr]) -> Result<()> {
        for addr in addrs {
            if !self.released.insert(addr.clone()) {
                return Err(ShadeError::Corruption("overflow block released twice"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::source::AddrKind;

    fn addr(byte: u8) -> BlockAddr {
        BlockAddr::new(&[byte], AddrKind::Leaf)
    }

    #[test]
    fn reuse_matches_only_unclaimed_blocks() {
        let mut t = OverflowTracker::new();
        let value = Bytes::from_static(b"big value");
        t.reuse_add(value.clone(), addr(1));
        // Claimed by the pass that wrote it.
        assert_eq!(t.reuse_search(&value), None);
        t.pass_begin();
        assert_eq!(t.reuse_search(&value), Some(addr(1)));
        // A second writer of the same value in the same pass gets nothing.
        assert_eq!(t.reuse_search(&value), None);
    }

    #[test]
    fn reuse_duplicates_hand_out_distinct_blocks() {
        let mut t = OverflowTracker::new();
        let value = Bytes::from_static(b"dup");
        t.reuse_add(Bytes::from_static(b"before"), addr(7));
        t.reuse_add(value.clone(), addr(1));
        t.reuse_add(value.clone(), addr(2));
        t.reuse_add(Bytes::from_static(b"later"), addr(8));
        t.pass_begin();
        let first = t.reuse_search(&value).unwrap();
        let second = t.reuse_search(&value).unwrap();
        assert_ne!(first, second);
        assert!([addr(1), addr(2)].contains(&first));
        assert!([addr(1), addr(2)].contains(&second));
        // The run is exhausted; neighbors are untouched.
        assert_eq!(t.reuse_search(&value), None);
        assert_eq!(t.reuse_search(&Bytes::from_static(b"later")), Some(addr(8)));
    }

    #[test]
    fn complete_frees_unclaimed_reuse_blocks() {
        let mut t = OverflowTracker::new();
        t.reuse_add(Bytes::from_static(b"kept"), addr(1));
        t.reuse_add(Bytes::from_static(b"dropped"), addr(2));
        t.pass_complete().unwrap();

        t.pass_begin();
        assert_eq!(t.reuse_search(&Bytes::from_static(b"kept")), Some(addr(1)));
        let freed = t.pass_complete().unwrap();
        assert_eq!(freed, vec![addr(2)]);
        assert_eq!(t.reuse_search(&Bytes::from_static(b"dropped")), None);
    }

    #[test]
    fn abort_frees_only_new_blocks() {
        let mut t = OverflowTracker::new();
        t.reuse_add(Bytes::from_static(b"old"), addr(1));
        t.pass_complete().unwrap();

        t.pass_begin();
        t.reuse_add(Bytes::from_static(b"new"), addr(2));
        let freed = t.pass_abort().unwrap();
        assert_eq!(freed, vec![addr(2)]);
        // The surviving block is claimable again.
        t.pass_begin();
        assert_eq!(t.reuse_search(&Bytes::from_static(b"old")), Some(addr(1)));
    }

    #[test]
    fn onpage_blocks_freed_once_on_complete() {
        let mut t = OverflowTracker::new();
        t.track_onpage(addr(9));
        t.track_onpage(addr(9));
        let freed = t.pass_complete().unwrap();
        assert_eq!(freed, vec![addr(9)]);
        // The entry persists so a later pass cannot free it again.
        assert!(t.onpage_contains(&addr(9)));
        assert!(t.pass_complete().unwrap().is_empty());
    }

    #[test]
    fn onpage_abort_forgets_without_freeing() {
        let mut t = OverflowTracker::new();
        t.track_onpage(addr(5));
        assert!(t.pass_abort().unwrap().is_empty());
        assert!(!t.onpage_contains(&addr(5)));
        // Recorded again by the retry and freed normally.
        t.track_onpage(addr(5));
        assert_eq!(t.pass_complete().unwrap(), vec![addr(5)]);
    }

    #[test]
    fn double_release_is_corruption() {
        let mut t = OverflowTracker::new();
        t.reuse_add(Bytes::from_static(b"v"), addr(3));
        t.pass_begin();
        t.pass_complete().unwrap();
        t.track_onpage(addr(3));
        assert!(matches!(
            t.pass_complete(),
            Err(ShadeError::Corruption(_))
        ));
    }

    #[test]
    fn txn_cache_sweeps_by_oldest_active() {
        let mut t = OverflowTracker::new();
        t.txnc_cache(addr(1), Bytes::from_static(b"a"), 10);
        t.txnc_cache(addr(2), Bytes::from_static(b"b"), 30);
        assert_eq!(t.cached(&addr(1)).map(|(v, _)| &v[..]), Some(&b"a"[..]));
        assert_eq!(t.txnc_sweep(20), 1);
        assert!(t.cached(&addr(1)).is_none());
        assert_eq!(t.cached(&addr(2)), Some((&Bytes::from_static(b"b"), 30)));
        assert_eq!(t.txnc_len(), 1);
    }
}
