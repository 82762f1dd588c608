//! Seams between the in-memory tree and its surroundings.
//!
//! The page cache never talks to a file or a transaction table directly; it
//! goes through the traits here, so tests can drive the full fault and
//! eviction machinery against in-memory fakes.

use bytes::Bytes;
use smallvec::SmallVec;

use crate::storage::page::{CellRef, DiskImage};
use crate::storage::pageref::RefKey;
use crate::types::{Result, TxnId};

/// What a block address refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AddrKind {
    /// An internal page.
    Internal,
    /// A leaf page that may reference overflow blocks.
    Leaf,
    /// A leaf page known to reference no overflow blocks.
    LeafNoOverflow,
}

/// An opaque block-manager address cookie plus its kind.
///
/// Cookies are compared bytewise; the cache never interprets them.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockAddr {
    /// Block-manager cookie naming the block.
    pub cookie: SmallVec<[u8; 24]>,
    /// What the block holds.
    pub kind: AddrKind,
}

impl BlockAddr {
    /// Builds an address from a raw cookie.
    pub fn new(cookie: &[u8], kind: AddrKind) -> Self {
        Self {
            cookie: SmallVec::from_slice(cookie),
            kind,
        }
    }
}

/// Block-level read and write access.
pub trait PageSource: Send + Sync {
    /// Reads the block named by `addr` and returns its raw page image.
    fn read_page(&self, addr: &BlockAddr) -> Result<Bytes>;

    /// Writes a page image and returns the address it landed at.
    fn write_page(&self, image: &[u8]) -> Result<BlockAddr>;
}

/// Transaction-state visibility for sweeps and caching decisions.
pub trait TxnSource: Send + Sync {
    /// Id the next write would run under.
    fn current_txn_id(&self) -> TxnId;

    /// Oldest id any active transaction could still read at.
    fn oldest_active_txn_id(&self) -> TxnId;
}

/// Decodes the cell layer of a disk image.
///
/// Cell formats belong to the on-disk layer; the cache only needs to locate
/// cells and, for internal pages, resolve each child's address and key.
pub trait CellCodec: Send + Sync {
    /// Locates every cell on the page, in page order.
    fn index(&self, image: &DiskImage) -> Result<Vec<CellRef>>;

    /// Decodes the child address held by an internal-page cell.
    fn addr(&self, image: &DiskImage, cell: CellRef) -> Result<BlockAddr>;

    /// Decodes the child's boundary key held by an internal-page cell.
    fn child_key(&self, image: &DiskImage, cell: CellRef) -> Result<RefKey>;

    /// Run length of a column-store cell. Formats without run-length
    /// encoding leave the default.
    fn repeat_count(&self, _image: &DiskImage, _cell: CellRef) -> Result<u64> {
        Ok(1)
    }
}
