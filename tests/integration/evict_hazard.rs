//! Readers and evictors racing over a small two-level tree.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use shadetree::storage::{
    acquire, publish_modify_result, try_evict, AddrKind, BlockAddr, BlockDesc, CellCodec,
    CellRef, DiskImage, EvictOutcome, HazardTable, MultiBlock, MultiBody, MultiKey, PageBody,
    PageNode, PageReadContext, PageRef, PageSource, ReadGen, RefAddr, RefKey, RefState,
    ReplaceBlocks, SkipList,
};
use shadetree::storage::page::{InternalPage, PageIndex};
use shadetree::types::page::{DiskPageHeader, PageKind, PAGE_HEADER_SIZE};
use shadetree::types::{Result, ShadeError};

/// Block store backed by a map, addresses handed out sequentially.
struct MemorySource {
    blocks: Mutex<HashMap<Vec<u8>, Bytes>>,
    next: AtomicU64,
}

impl MemorySource {
    fn new() -> Self {
        Self {
            blocks: Mutex::new(HashMap::new()),
            next: AtomicU64::new(1),
        }
    }

    fn put_empty_leaf(&self) -> Result<BlockAddr> {
        let header =
            DiskPageHeader::new(0, 1, PAGE_HEADER_SIZE as u32, 0, PageKind::RowLeaf, 0)?;
        let mut image = vec![0u8; PAGE_HEADER_SIZE];
        header.encode(&mut image)?;
        self.write_page(&image)
    }
}

impl PageSource for MemorySource {
    fn read_page(&self, addr: &BlockAddr) -> Result<Bytes> {
        self.blocks
            .lock()
            .get(addr.cookie.as_slice())
            .cloned()
            .ok_or(ShadeError::NotFound)
    }

    fn write_page(&self, image: &[u8]) -> Result<BlockAddr> {
        let cookie = self
            .next
            .fetch_add(1, Ordering::Relaxed)
            .to_be_bytes()
            .to_vec();
        self.blocks
            .lock()
            .insert(cookie.clone(), Bytes::copy_from_slice(image));
        Ok(BlockAddr::new(&cookie, AddrKind::Leaf))
    }
}

/// The test pages carry no cells; nothing ever needs decoding.
struct NoCells;

impl CellCodec for NoCells {
    fn index(&self, _image: &DiskImage) -> Result<Vec<CellRef>> {
        Ok(Vec::new())
    }

    fn addr(&self, _image: &DiskImage, _cell: CellRef) -> Result<BlockAddr> {
        Err(ShadeError::Invalid("no on-page addresses in tests"))
    }

    fn child_key(&self, _image: &DiskImage, _cell: CellRef) -> Result<RefKey> {
        Err(ShadeError::Invalid("no child keys in tests"))
    }
}

struct Fixture {
    source: MemorySource,
    hazards: HazardTable,
    codec: NoCells,
    gen: ReadGen,
}

impl Fixture {
    fn new() -> Self {
        Self {
            source: MemorySource::new(),
            hazards: HazardTable::new(),
            codec: NoCells,
            gen: ReadGen::new(),
        }
    }

    fn context(&self, deadline: Option<Instant>) -> PageReadContext<'_> {
        PageReadContext {
            hazards: &self.hazards,
            source: &self.source,
            codec: &self.codec,
            gen: &self.gen,
            deadline,
        }
    }

    fn leaf_ref(&self) -> Arc<PageRef> {
        let addr = self.source.put_empty_leaf().unwrap();
        Arc::new(PageRef::new_disk(RefAddr::Alloc(addr), RefKey::Recno(0)))
    }
}

#[test]
fn hazard_holds_off_eviction_until_dropped() {
    let fx = Fixture::new();
    let cx = fx.context(None);
    let r = fx.leaf_ref();

    let guard = acquire(&r, None, &cx).unwrap().unwrap();
    let serial = guard.serial();
    assert_eq!(try_evict(&r, None, &fx.hazards).unwrap(), EvictOutcome::Busy);
    assert_eq!(r.state(), RefState::Mem);

    drop(guard);
    assert_eq!(
        try_evict(&r, None, &fx.hazards).unwrap(),
        EvictOutcome::Evicted
    );
    assert_eq!(r.state(), RefState::Disk);

    // Faulting back in builds a fresh page.
    let guard = acquire(&r, None, &cx).unwrap().unwrap();
    assert_ne!(guard.serial(), serial);
    assert_eq!(guard.body().entries(), 0);
}

#[test]
fn aborted_eviction_is_invisible_to_readers() {
    let fx = Fixture::new();
    let cx = fx.context(None);
    let r = fx.leaf_ref();

    let first = acquire(&r, None, &cx).unwrap().unwrap();
    let serial = first.serial();
    // Eviction aborts on the hazard; the same page stays resident.
    assert_eq!(try_evict(&r, None, &fx.hazards).unwrap(), EvictOutcome::Busy);
    let second = acquire(&r, None, &cx).unwrap().unwrap();
    assert_eq!(second.serial(), serial);
    assert!(Arc::ptr_eq(first.page(), second.page()));
}

#[test]
fn racing_evictors_have_one_winner() {
    let fx = Fixture::new();
    let cx = fx.context(None);
    let r = fx.leaf_ref();
    drop(acquire(&r, None, &cx).unwrap().unwrap());

    let evictions = AtomicUsize::new(0);
    thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                for _ in 0..100 {
                    if try_evict(&r, None, &fx.hazards).unwrap() == EvictOutcome::Evicted {
                        evictions.fetch_add(1, Ordering::Relaxed);
                    }
                }
            });
        }
    });
    assert_eq!(evictions.load(Ordering::Relaxed), 1);
    assert_eq!(r.state(), RefState::Disk);
}

#[test]
fn racing_evictors_all_lose_to_a_hazard() {
    let fx = Fixture::new();
    let cx = fx.context(None);
    let r = fx.leaf_ref();
    let guard = acquire(&r, None, &cx).unwrap().unwrap();
    let serial = guard.serial();

    thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                for _ in 0..200 {
                    // At most one evictor holds the lock at a time; every
                    // attempt sees the hazard and backs out.
                    assert_eq!(
                        try_evict(&r, None, &fx.hazards).unwrap(),
                        EvictOutcome::Busy
                    );
                }
            });
        }
    });

    assert_eq!(r.state(), RefState::Mem);
    assert_eq!(guard.serial(), serial);
    assert!(Arc::ptr_eq(guard.page(), &r.page().unwrap()));
}

#[test]
fn split_reference_turns_readers_back() {
    let fx = Fixture::new();
    let cx = fx.context(None);
    let r = fx.leaf_ref();
    let parent = PageNode::new(
        PageBody::Internal(InternalPage::new(0, PageIndex::new(vec![Arc::clone(&r)]))),
        None,
    );

    let guard = acquire(&r, Some(&parent), &cx).unwrap().unwrap();
    guard.modify_or_init().mark_dirty(9);

    let left = fx.source.put_empty_leaf().unwrap();
    let right = fx.source.put_empty_leaf().unwrap();
    let blocks = vec![
        MultiBlock {
            key: MultiKey::Key(b"e".to_vec().into_boxed_slice()),
            body: MultiBody::Addr {
                desc: BlockDesc::describe(left, b"left"),
                reuse: false,
            },
        },
        MultiBlock {
            key: MultiKey::Key(b"p".to_vec().into_boxed_slice()),
            body: MultiBody::Addr {
                desc: BlockDesc::describe(right, b"right"),
                reuse: false,
            },
        },
    ];
    let pass_gen = guard.modify_or_init().write_gen();
    publish_modify_result(&guard, Some(ReplaceBlocks::Multi(blocks)), 9, pass_gen);
    drop(guard);

    assert_eq!(
        try_evict(&r, Some(&parent), &fx.hazards).unwrap(),
        EvictOutcome::Split
    );

    // The retired reference sends readers back to the parent, where the
    // children are now visible and readable.
    assert!(acquire(&r, Some(&parent), &cx).unwrap().is_none());
    let PageBody::Internal(internal) = parent.body() else {
        panic!("expected internal parent");
    };
    let index = internal.index();
    assert_eq!(index.len(), 2);
    for child in index.iter() {
        let guard = acquire(child, Some(&parent), &cx).unwrap().unwrap();
        assert_eq!(guard.body().entries(), 0);
    }
}

#[test]
fn readers_and_evictor_stress() {
    let fx = Fixture::new();
    let r = fx.leaf_ref();
    let done = AtomicUsize::new(0);

    thread::scope(|scope| {
        for _ in 0..3 {
            scope.spawn(|| {
                let mut acquired = 0u32;
                while acquired < 500 {
                    let cx = fx.context(Some(Instant::now() + Duration::from_secs(5)));
                    let guard = acquire(&r, None, &cx)
                        .expect("acquire never fails in this scenario")
                        .expect("reference is never split in this scenario");
                    // The hazard keeps the page alive even while an
                    // evictor transiently locks the reference.
                    assert_eq!(guard.body().entries(), 0);
                    acquired += 1;
                }
                done.fetch_add(1, Ordering::Relaxed);
            });
        }
        scope.spawn(|| {
            while done.load(Ordering::Relaxed) < 3 {
                fx.gen.tick();
                let _ = try_evict(&r, None, &fx.hazards).unwrap();
                thread::yield_now();
            }
        });
    });
}

#[test]
fn insert_lists_survive_while_pinned() {
    let fx = Fixture::new();
    let cx = fx.context(None);
    let r = fx.leaf_ref();

    let guard = acquire(&r, None, &cx).unwrap().unwrap();
    let PageBody::RowLeaf(leaf) = guard.body() else {
        panic!("expected row leaf");
    };
    let list: &SkipList<Bytes, _> = leaf.smallest_insert_list();
    list.insert(Bytes::from_static(b"k"), Default::default());
    guard.modify_or_init().mark_dirty(3);

    // Dirty pages never leave memory.
    drop(guard);
    assert_eq!(try_evict(&r, None, &fx.hazards).unwrap(), EvictOutcome::Busy);
    let guard = acquire(&r, None, &cx).unwrap().unwrap();
    let PageBody::RowLeaf(leaf) = guard.body() else {
        panic!("expected row leaf");
    };
    assert_eq!(leaf.smallest_insert_list().len(), 1);
}
