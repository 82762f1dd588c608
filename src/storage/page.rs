//! In-memory page representation.
//!
//! A page is materialized from a disk image into a kind-specific body plus
//! lazily built auxiliary structures. The disk image stays mapped for the
//! page's lifetime, so keys and values can keep pointing into it; anything
//! built after materialization (instantiated keys, insert lists, the modify
//! block) is published exactly once and then shared.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use bytes::Bytes;
use parking_lot::RwLock;

use crate::storage::modify::PageModify;
use crate::storage::pageref::{PageRef, RefAddr};
use crate::storage::skiplist::SkipList;
use crate::storage::source::CellCodec;
use crate::storage::version::VersionChain;
use crate::types::page::{DiskPageHeader, PageKind, PAGE_HEADER_SIZE};
use crate::types::{RecNo, Result, ShadeError};

/// Offset into a page image, compact enough to store per cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageOffset(pub u32);

impl PageOffset {
    /// Offset as a usize index into the image.
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// Location of one cell within a page image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellRef {
    /// Byte offset from the start of the image.
    pub offset: PageOffset,
    /// Cell length in bytes.
    pub size: u32,
}

impl CellRef {
    /// Builds a cell reference, rejecting offsets inside the header.
    pub fn new(offset: u32, size: u32) -> Result<Self> {
        if (offset as usize) < PAGE_HEADER_SIZE {
            return Err(ShadeError::Invalid("cell offset inside page header"));
        }
        Ok(Self {
            offset: PageOffset(offset),
            size,
        })
    }
}

/// A page image as read from the block layer: decoded header plus the full
/// raw bytes (header included, so cell offsets are absolute).
#[derive(Debug, Clone)]
pub struct DiskImage {
    /// Decoded fixed header.
    pub header: DiskPageHeader,
    /// The complete image bytes.
    pub data: Bytes,
}

impl DiskImage {
    /// Decodes the header and wraps the image.
    pub fn decode(data: Bytes) -> Result<Self> {
        let header = DiskPageHeader::decode(&data)?;
        if header.mem_size as usize > data.len() {
            return Err(ShadeError::Corruption("page image shorter than header size"));
        }
        Ok(Self { header, data })
    }

    /// The bytes of one cell, range checked against the image.
    pub fn bytes_at(&self, cell: CellRef) -> Result<&[u8]> {
        let start = cell.offset.as_usize();
        let end = start
            .checked_add(cell.size as usize)
            .ok_or(ShadeError::Corruption("cell extent overflows"))?;
        self.data
            .get(start..end)
            .ok_or(ShadeError::Corruption("cell extent outside page image"))
    }

    /// The payload bytes after the fixed header.
    pub fn payload(&self) -> &[u8] {
        &self.data[PAGE_HEADER_SIZE..]
    }
}

/// A key copied out of its page image, remembering the cell it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstKey {
    data: Box<[u8]>,
    /// Offset of the originating cell, absent for keys born in memory.
    /// Kept so reconciliation can tell on-page keys apart.
    pub cell_offset: Option<PageOffset>,
}

impl InstKey {
    /// Builds an instantiated key from raw bytes and its source cell.
    pub fn new(data: &[u8], cell_offset: Option<PageOffset>) -> Self {
        Self {
            data: data.into(),
            cell_offset,
        }
    }

    /// The key bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }
}

/// Per-row key handle on a row-store leaf page.
///
/// Starts as a bare cell reference; the first reader that needs the key in
/// contiguous form instantiates it. Publication is once-only, so concurrent
/// instantiators converge on a single allocation and a reference obtained
/// before a racing instantiation stays valid.
#[derive(Debug)]
pub struct RowKey {
    cell: CellRef,
    ikey: OnceLock<Arc<InstKey>>,
}

impl RowKey {
    /// Wraps an on-page key cell.
    pub fn new(cell: CellRef) -> Self {
        Self {
            cell,
            ikey: OnceLock::new(),
        }
    }

    /// The on-page cell holding the key.
    pub fn cell(&self) -> CellRef {
        self.cell
    }

    /// The instantiated form, if some reader already built it.
    pub fn instantiated(&self) -> Option<&Arc<InstKey>> {
        self.ikey.get()
    }

    /// Instantiates the key from its cell, or returns the copy an earlier
    /// caller published. Losing a race leaks nothing but the local copy.
    pub fn instantiate(&self, image: &DiskImage) -> Result<&Arc<InstKey>> {
        if let Some(ikey) = self.ikey.get() {
            return Ok(ikey);
        }
        let bytes = image.bytes_at(self.cell)?;
        let fresh = Arc::new(InstKey::new(bytes, Some(self.cell.offset)));
        Ok(self.ikey.get_or_init(|| fresh))
    }

    /// The key bytes, from the instantiated copy when present, otherwise
    /// straight from the image.
    pub fn bytes<'a>(&'a self, image: &'a DiskImage) -> Result<&'a [u8]> {
        if let Some(ikey) = self.ikey.get() {
            return Ok(ikey.bytes());
        }
        image.bytes_at(self.cell)
    }
}

/// One internal page's array of child references.
#[derive(Debug)]
pub struct PageIndex {
    entries: Box<[Arc<PageRef>]>,
}

impl PageIndex {
    /// Builds an index from child references.
    pub fn new(entries: Vec<Arc<PageRef>>) -> Self {
        Self {
            entries: entries.into_boxed_slice(),
        }
    }

    /// Number of children.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the index has no children.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The child at `slot`.
    pub fn get(&self, slot: usize) -> Option<&Arc<PageRef>> {
        self.entries.get(slot)
    }

    /// All children in order.
    pub fn iter(&self) -> std::slice::Iter<'_, Arc<PageRef>> {
        self.entries.iter()
    }

    /// Slot of `child` by identity, if it is in this index.
    pub fn position_of(&self, child: &Arc<PageRef>) -> Option<usize> {
        self.entries.iter().position(|e| Arc::ptr_eq(e, child))
    }
}

/// Internal page body: an atomically swappable child index.
#[derive(Debug)]
pub struct InternalPage {
    /// Starting record number for column stores, zero for row stores.
    pub recno: RecNo,
    index: RwLock<Arc<PageIndex>>,
    /// The index as materialized from disk, before any splits. Needed to
    /// relate current children back to on-page cells at reconciliation.
    orig: Arc<PageIndex>,
}

impl InternalPage {
    /// Builds an internal body around an initial index.
    pub fn new(recno: RecNo, index: PageIndex) -> Self {
        let index = Arc::new(index);
        Self {
            recno,
            index: RwLock::new(Arc::clone(&index)),
            orig: index,
        }
    }

    /// The index as it was at materialization, untouched by splits.
    pub fn load_index(&self) -> &Arc<PageIndex> {
        &self.orig
    }

    /// Snapshots the current index. Callers take the snapshot once per
    /// traversal and must not cache it across restarts, since a split
    /// replaces the whole array.
    pub fn index(&self) -> Arc<PageIndex> {
        Arc::clone(&self.index.read())
    }

    /// Publishes a replacement index. Readers holding the old snapshot keep
    /// a valid array; new traversals see the new one.
    pub fn replace_index(&self, index: PageIndex) -> Arc<PageIndex> {
        let new = Arc::new(index);
        *self.index.write() = Arc::clone(&new);
        new
    }
}

/// Run-length entry for a variable-length column page, enabling binary
/// search by record number.
#[derive(Debug, Clone, Copy)]
pub struct RleEntry {
    /// First record number covered by the run.
    pub recno: RecNo,
    /// Cell slot holding the run's value.
    pub slot: u32,
    /// Number of records in the run.
    pub rle: u64,
}

/// Row-store leaf body.
#[derive(Debug)]
pub struct RowLeafPage {
    rows: Box<[RowKey]>,
    inserts: OnceLock<Box<[SkipList<Bytes, VersionChain>]>>,
    updates: OnceLock<Box<[VersionChain]>>,
}

impl RowLeafPage {
    /// Builds a leaf body over its on-page rows.
    pub fn new(rows: Vec<RowKey>) -> Self {
        Self {
            rows: rows.into_boxed_slice(),
            inserts: OnceLock::new(),
            updates: OnceLock::new(),
        }
    }

    /// The on-page rows in key order.
    pub fn rows(&self) -> &[RowKey] {
        &self.rows
    }

    /// Insert list for keys sorting after the row at `slot`.
    ///
    /// The whole array of lists is allocated on first use and published
    /// once; individual lists grow lock-free from there.
    pub fn insert_list(&self, slot: usize) -> &SkipList<Bytes, VersionChain> {
        &self.insert_arrays()[slot]
    }

    /// Insert list for keys sorting before every on-page row.
    pub fn smallest_insert_list(&self) -> &SkipList<Bytes, VersionChain> {
        let arrays = self.insert_arrays();
        &arrays[arrays.len() - 1]
    }

    /// Version chain for the on-page row at `slot`.
    pub fn update_chain(&self, slot: usize) -> &VersionChain {
        let chains = self.updates.get_or_init(|| {
            (0..self.rows.len())
                .map(|_| VersionChain::new())
                .collect::<Vec<_>>()
                .into_boxed_slice()
        });
        &chains[slot]
    }

    /// Whether any auxiliary structure has been populated.
    pub fn has_entries(&self) -> bool {
        let inserted = self
            .inserts
            .get()
            .is_some_and(|lists| lists.iter().any(|l| !l.is_empty()));
        let updated = self
            .updates
            .get()
            .is_some_and(|chains| chains.iter().any(|c| !c.is_empty()));
        inserted || updated
    }

    fn insert_arrays(&self) -> &[SkipList<Bytes, VersionChain>] {
        self.inserts.get_or_init(|| {
            (0..self.rows.len() + 1)
                .map(|_| SkipList::new())
                .collect::<Vec<_>>()
                .into_boxed_slice()
        })
    }
}

/// Kind-specific page body.
#[derive(Debug)]
pub enum PageBody {
    /// Row- or column-store internal page.
    Internal(InternalPage),
    /// Fixed-length column-store leaf: a packed bit field.
    ColFix {
        /// Starting record number.
        recno: RecNo,
        /// The packed value bits.
        bitf: Bytes,
        /// Number of records on the page.
        entries: u32,
    },
    /// Variable-length column-store leaf.
    ColVar {
        /// Starting record number.
        recno: RecNo,
        /// Value cells in record order.
        cells: Box<[CellRef]>,
        /// Run-length index over the cells.
        repeats: Box<[RleEntry]>,
    },
    /// Row-store leaf.
    RowLeaf(RowLeafPage),
}

impl PageBody {
    /// The page kind this body realizes.
    pub fn kind(&self) -> PageKind {
        match self {
            PageBody::Internal(page) => {
                if page.recno == 0 {
                    PageKind::RowInt
                } else {
                    PageKind::ColInt
                }
            }
            PageBody::ColFix { .. } => PageKind::ColFix,
            PageBody::ColVar { .. } => PageKind::ColVar,
            PageBody::RowLeaf(_) => PageKind::RowLeaf,
        }
    }

    /// Uniform entry count across kinds: children, records, or rows.
    pub fn entries(&self) -> u64 {
        match self {
            PageBody::Internal(page) => page.index().len() as u64,
            PageBody::ColFix { entries, .. } => u64::from(*entries),
            PageBody::ColVar { repeats, .. } => {
                repeats.iter().map(|r| r.rle).sum()
            }
            PageBody::RowLeaf(page) => page.rows().len() as u64,
        }
    }
}

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// One in-memory page.
pub struct PageNode {
    serial: u64,
    body: PageBody,
    disk: Option<DiskImage>,
    modify: OnceLock<Box<PageModify>>,
    read_gen: AtomicU64,
    footprint: AtomicU64,
    parent: RwLock<Weak<PageNode>>,
}

impl PageNode {
    /// Wraps a body and optional backing image in a fresh node.
    pub fn new(body: PageBody, disk: Option<DiskImage>) -> Arc<Self> {
        let base = std::mem::size_of::<PageNode>() as u64
            + disk.as_ref().map_or(0, |d| d.data.len() as u64);
        Arc::new(Self {
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
            body,
            disk,
            modify: OnceLock::new(),
            read_gen: AtomicU64::new(0),
            footprint: AtomicU64::new(base),
            parent: RwLock::new(Weak::new()),
        })
    }

    /// Builds the in-memory form of a disk image.
    pub fn materialize(image: DiskImage, codec: &dyn CellCodec) -> Result<Arc<Self>> {
        let header = image.header.clone();
        let body = match header.kind {
            PageKind::RowInt | PageKind::ColInt => {
                let cells = codec.index(&image)?;
                let mut children = Vec::with_capacity(cells.len());
                for cell in cells {
                    let key = codec.child_key(&image, cell)?;
                    children.push(Arc::new(PageRef::new_disk(
                        RefAddr::OnPage(cell),
                        key,
                    )));
                }
                PageBody::Internal(InternalPage::new(
                    header.recno,
                    PageIndex::new(children),
                ))
            }
            PageKind::ColFix => PageBody::ColFix {
                recno: header.recno,
                bitf: image.data.slice(PAGE_HEADER_SIZE..),
                entries: header.count,
            },
            PageKind::ColVar => {
                let cells = codec.index(&image)?;
                let mut repeats = Vec::with_capacity(cells.len());
                let mut recno = header.recno;
                for (slot, cell) in cells.iter().enumerate() {
                    let rle = codec.repeat_count(&image, *cell)?;
                    repeats.push(RleEntry {
                        recno,
                        slot: slot as u32,
                        rle,
                    });
                    recno += rle;
                }
                PageBody::ColVar {
                    recno: header.recno,
                    cells: cells.into_boxed_slice(),
                    repeats: repeats.into_boxed_slice(),
                }
            }
            PageKind::RowLeaf => {
                let cells = codec.index(&image)?;
                let rows = cells.into_iter().map(RowKey::new).collect();
                PageBody::RowLeaf(RowLeafPage::new(rows))
            }
            PageKind::BlockManager | PageKind::Overflow => {
                return Err(ShadeError::Invalid("not a tree page kind"))
            }
        };
        Ok(Self::new(body, Some(image)))
    }

    /// Fabricates an empty leaf, used when a reader steps on a reference
    /// whose page was deleted without ever being read back.
    pub fn empty_leaf(kind: PageKind, recno: RecNo) -> Result<Arc<Self>> {
        let body = match kind {
            PageKind::RowLeaf => PageBody::RowLeaf(RowLeafPage::new(Vec::new())),
            PageKind::ColVar => PageBody::ColVar {
                recno,
                cells: Box::new([]),
                repeats: Box::new([]),
            },
            PageKind::ColFix => PageBody::ColFix {
                recno,
                bitf: Bytes::new(),
                entries: 0,
            },
            _ => return Err(ShadeError::Invalid("cannot fabricate an internal page")),
        };
        Ok(Self::new(body, None))
    }

    /// Identity of this node, unique for the process lifetime and never
    /// zero. Zero is reserved to mean "no page" in the hazard table.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// The kind-specific body.
    pub fn body(&self) -> &PageBody {
        &self.body
    }

    /// The backing disk image, absent for pages created in memory.
    pub fn disk(&self) -> Option<&DiskImage> {
        self.disk.as_ref()
    }

    /// The modification block, if the page has ever been written to.
    pub fn modify(&self) -> Option<&PageModify> {
        self.modify.get().map(|m| &**m)
    }

    /// The modification block, allocating it on first write. Concurrent
    /// first writers converge on one block.
    pub fn modify_or_init(&self) -> &PageModify {
        self.modify.get_or_init(|| Box::new(PageModify::new()))
    }

    /// Whether the page has modifications not yet reconciled.
    pub fn is_dirty(&self) -> bool {
        self.modify().is_some_and(PageModify::is_dirty)
    }

    /// Current eviction read generation.
    pub fn read_gen(&self) -> u64 {
        self.read_gen.load(Ordering::Relaxed)
    }

    /// Sets the read generation; forward-only, so a racing stale store
    /// cannot roll a hot page back.
    pub fn set_read_gen(&self, gen: u64) {
        self.read_gen.fetch_max(gen, Ordering::Relaxed);
    }

    /// The page's memory footprint in bytes.
    pub fn footprint(&self) -> u64 {
        self.footprint.load(Ordering::Relaxed)
    }

    /// Accounts additional in-memory bytes to the page.
    pub fn grow_footprint(&self, bytes: u64) {
        self.footprint.fetch_add(bytes, Ordering::Relaxed);
    }

    /// The parent page, while it is still alive.
    pub fn parent(&self) -> Option<Arc<PageNode>> {
        self.parent.read().upgrade()
    }

    /// Links the page under its parent.
    pub fn set_parent(&self, parent: &Arc<PageNode>) {
        *self.parent.write() = Arc::downgrade(parent);
    }
}

impl std::fmt::Debug for PageNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageNode")
            .field("serial", &self.serial)
            .field("kind", &self.body.kind())
            .field("entries", &self.body.entries())
            .field("dirty", &self.is_dirty())
            .finish()
    }
}
