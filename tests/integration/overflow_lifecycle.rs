//! Overflow block lifecycle across successful and failed reconciliations.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use shadetree::storage::{
    cache_superseded_value, overflow_pass, overflow_pass_abort, overflow_pass_complete,
    overflow_sweep, track_onpage_reference, AddrKind, BlockAddr, PageNode, PageSource,
    TxnSource,
};
use shadetree::types::page::PageKind;
use shadetree::types::Result;

/// Allocates sequential addresses; never reads.
struct Allocator {
    next: AtomicU64,
    writes: AtomicU64,
}

impl Allocator {
    fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
            writes: AtomicU64::new(0),
        }
    }

    fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

impl PageSource for Allocator {
    fn read_page(&self, _addr: &BlockAddr) -> Result<Bytes> {
        unreachable!("overflow tests never read blocks back")
    }

    fn write_page(&self, _image: &[u8]) -> Result<BlockAddr> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        Ok(BlockAddr::new(&n.to_be_bytes(), AddrKind::Leaf))
    }
}

struct Txns {
    current: AtomicU64,
    oldest: AtomicU64,
}

impl Txns {
    fn new(current: u64, oldest: u64) -> Self {
        Self {
            current: AtomicU64::new(current),
            oldest: AtomicU64::new(oldest),
        }
    }
}

impl TxnSource for Txns {
    fn current_txn_id(&self) -> u64 {
        self.current.load(Ordering::Relaxed)
    }

    fn oldest_active_txn_id(&self) -> u64 {
        self.oldest.load(Ordering::Relaxed)
    }
}

fn page() -> Arc<PageNode> {
    PageNode::empty_leaf(PageKind::RowLeaf, 0).unwrap()
}

#[test]
fn failed_pass_retries_without_duplicating_blocks() {
    let source = Allocator::new();
    let page = page();
    let values = vec![Bytes::from_static(b"abc"), Bytes::from_static(b"def")];

    // First attempt writes both values, then reconciliation fails.
    let first = overflow_pass(&page, &source, &values).unwrap();
    assert_eq!(first.written.len(), 2);
    let freed = overflow_pass_abort(&page).unwrap();
    assert_eq!(freed.len(), 2);

    // The retry writes both again at fresh addresses.
    let second = overflow_pass(&page, &source, &values).unwrap();
    assert_eq!(second.written.len(), 2);
    assert!(second.reused.is_empty());
    assert_eq!(source.writes(), 4);
    assert!(overflow_pass_complete(&page).unwrap().is_empty());

    // A later pass of the same values reuses every block.
    let third = overflow_pass(&page, &source, &values).unwrap();
    assert!(third.written.is_empty());
    assert_eq!(third.reused.len(), 2);
    assert_eq!(source.writes(), 4);
}

#[test]
fn dropped_value_frees_its_block_exactly_once() {
    let source = Allocator::new();
    let page = page();

    let both = vec![Bytes::from_static(b"keep"), Bytes::from_static(b"drop")];
    let first = overflow_pass(&page, &source, &both).unwrap();
    overflow_pass_complete(&page).unwrap();
    let dropped_addr = first
        .written
        .iter()
        .find(|(v, _)| v == "drop")
        .map(|(_, desc)| desc.addr.clone())
        .unwrap();

    // The next image only keeps one value; the other's block comes back.
    let kept = vec![Bytes::from_static(b"keep")];
    let pass = overflow_pass(&page, &source, &kept).unwrap();
    assert!(pass.written.is_empty());
    let freed = overflow_pass_complete(&page).unwrap();
    assert_eq!(freed, vec![dropped_addr]);

    // Nothing further to free on a no-change pass.
    let pass = overflow_pass(&page, &source, &kept).unwrap();
    assert_eq!(pass.reused.len(), 1);
    assert!(overflow_pass_complete(&page).unwrap().is_empty());
}

#[test]
fn discarded_onpage_reference_freed_on_commit_only() {
    let source = Allocator::new();
    let page = page();
    let addr = source.write_page(b"old overflow value").unwrap();

    // A failed pass forgets the discard without freeing the block, since
    // the surviving image still references it.
    track_onpage_reference(&page, addr.clone());
    assert!(overflow_pass_abort(&page).unwrap().is_empty());

    // The successful retry frees it, exactly once.
    track_onpage_reference(&page, addr.clone());
    assert_eq!(overflow_pass_complete(&page).unwrap(), vec![addr]);
    assert!(overflow_pass_complete(&page).unwrap().is_empty());
}

#[test]
fn superseded_values_stay_readable_until_transactions_drain() {
    let source = Allocator::new();
    let page = page();
    let txns = Txns::new(100, 40);
    let addr = source.write_page(b"overflow value").unwrap();

    cache_superseded_value(&page, addr, Bytes::from_static(b"overflow value"), &txns);

    // Readers at txn 40 may still need the value.
    assert_eq!(overflow_sweep(&page, &txns), 0);

    // Once every transaction older than the deleting one is gone, the
    // cached value goes too.
    txns.oldest.store(101, Ordering::Relaxed);
    assert_eq!(overflow_sweep(&page, &txns), 1);
    assert_eq!(overflow_sweep(&page, &txns), 0);
}
