//! Shared identifier types, the crate error enum, and on-disk page metadata.

use thiserror::Error;

/// Transaction identifier used as a visibility stamp.
///
/// Allocation and snapshot management live outside this crate; callers
/// obtain ids through [`crate::storage::source::TxnSource`].
pub type TxnId = u64;

/// Sentinel transaction id meaning "no transaction".
pub const TXN_NONE: TxnId = 0;

/// Column-store record number.
pub type RecNo = u64;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, ShadeError>;

/// Errors surfaced by the page layer.
///
/// Contention is never an error: locked or read-in-flight refs are retried
/// locally. `Corruption` marks programming-contract violations that risk
/// tree corruption (dereferencing a non-resident ref, double block release)
/// and aborts the operation loudly.
#[derive(Debug, Error)]
pub enum ShadeError {
    /// Underlying I/O failure reported by an external collaborator.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// Corrupt data or a violated structural invariant.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Caller misuse that left all state untouched.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Retryable resource condition; prior state is preserved.
    #[error("busy: {0}")]
    Busy(&'static str),
    /// Lookup target does not exist.
    #[error("not found")]
    NotFound,
}

pub mod page {
    //! On-disk page header shared with the block manager.
    //!
    //! The header is a fixed 28-byte layout and must round-trip byte-exact;
    //! salvage uses the starting record number and write generation to order
    //! overlapping pages without transactional context.

    use core::convert::TryFrom;
    use core::convert::TryInto;

    use super::{RecNo, Result, ShadeError};

    /// Number of bytes occupied by the on-disk page header.
    pub const PAGE_HEADER_SIZE: usize = 28;

    pub mod header {
        //! Byte offsets for the fixed header fields.
        use core::ops::Range;

        /// Starting record number of the page (column stores).
        pub const RECNO: Range<usize> = 0..8;
        /// Page write generation.
        pub const WRITE_GEN: Range<usize> = 8..16;
        /// In-memory size of the instantiated page.
        pub const MEM_SIZE: Range<usize> = 16..20;
        /// Entry count, or overflow data length for overflow pages.
        pub const COUNT: Range<usize> = 20..24;
        /// Page kind byte.
        pub const KIND: usize = 24;
        /// Flags byte.
        pub const FLAGS: usize = 25;
        /// Reserved padding, must be zero.
        pub const RESERVED: Range<usize> = 26..28;
    }

    pub mod flags {
        //! Header flag bits.

        /// Page is compressed on disk.
        pub const COMPRESSED: u8 = 0x01;
        /// Every value on the page is zero-length.
        pub const EMPTY_VALUES_ALL: u8 = 0x02;
        /// No value on the page is zero-length.
        pub const EMPTY_VALUES_NONE: u8 = 0x04;

        /// Union of the defined flag bits.
        pub const ALL: u8 = COMPRESSED | EMPTY_VALUES_ALL | EMPTY_VALUES_NONE;
    }

    /// On-disk page kind.
    #[repr(u8)]
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
    pub enum PageKind {
        /// Block-manager bookkeeping page.
        BlockManager = 1,
        /// Fixed-length column-store leaf.
        ColFix = 2,
        /// Column-store internal page.
        ColInt = 3,
        /// Variable-length column-store leaf.
        ColVar = 4,
        /// Overflow data page.
        Overflow = 5,
        /// Row-store internal page.
        RowInt = 6,
        /// Row-store leaf page.
        RowLeaf = 7,
    }

    impl PageKind {
        /// Returns the wire representation of the kind.
        pub const fn as_u8(self) -> u8 {
            self as u8
        }

        /// Whether the header count slot holds overflow data length
        /// instead of an entry count.
        pub const fn counts_overflow_bytes(self) -> bool {
            matches!(self, PageKind::Overflow)
        }
    }

    impl TryFrom<u8> for PageKind {
        type Error = ShadeError;

        fn try_from(value: u8) -> Result<Self> {
            match value {
                1 => Ok(PageKind::BlockManager),
                2 => Ok(PageKind::ColFix),
                3 => Ok(PageKind::ColInt),
                4 => Ok(PageKind::ColVar),
                5 => Ok(PageKind::Overflow),
                6 => Ok(PageKind::RowInt),
                7 => Ok(PageKind::RowLeaf),
                _ => Err(ShadeError::Corruption("unknown page kind")),
            }
        }
    }

    /// Decoded form of the 28-byte on-disk page header.
    #[derive(Clone, Debug, Eq, PartialEq)]
    pub struct DiskPageHeader {
        /// Starting record number (column stores; zero elsewhere).
        pub recno: RecNo,
        /// Write generation, used to order overlapping pages in salvage.
        pub write_gen: u64,
        /// In-memory size of the page when instantiated.
        pub mem_size: u32,
        /// Entry count, or overflow data length for overflow pages.
        pub count: u32,
        /// Page kind.
        pub kind: PageKind,
        /// Flag bits, see [`flags`].
        pub flags: u8,
    }

    impl DiskPageHeader {
        /// Builds a header, rejecting undefined flag bits.
        pub fn new(
            recno: RecNo,
            write_gen: u64,
            mem_size: u32,
            count: u32,
            kind: PageKind,
            flags: u8,
        ) -> Result<Self> {
            if flags & !flags::ALL != 0 {
                return Err(ShadeError::Invalid("undefined page header flag"));
            }
            Ok(Self {
                recno,
                write_gen,
                mem_size,
                count,
                kind,
                flags,
            })
        }

        /// Entry count for non-overflow pages.
        pub fn entries(&self) -> Option<u32> {
            if self.kind.counts_overflow_bytes() {
                None
            } else {
                Some(self.count)
            }
        }

        /// Overflow data length for overflow pages.
        pub fn overflow_data_len(&self) -> Option<u32> {
            if self.kind.counts_overflow_bytes() {
                Some(self.count)
            } else {
                None
            }
        }

        /// Whether the page is compressed on disk.
        pub fn is_compressed(&self) -> bool {
            self.flags & flags::COMPRESSED != 0
        }

        /// Encodes the header into the first [`PAGE_HEADER_SIZE`] bytes of
        /// `dst`.
        pub fn encode(&self, dst: &mut [u8]) -> Result<()> {
            if dst.len() < PAGE_HEADER_SIZE {
                return Err(ShadeError::Invalid("page header buffer too small"));
            }
            let hdr = &mut dst[..PAGE_HEADER_SIZE];
            hdr[header::RECNO].copy_from_slice(&self.recno.to_be_bytes());
            hdr[header::WRITE_GEN].copy_from_slice(&self.write_gen.to_be_bytes());
            hdr[header::MEM_SIZE].copy_from_slice(&self.mem_size.to_be_bytes());
            hdr[header::COUNT].copy_from_slice(&self.count.to_be_bytes());
            hdr[header::KIND] = self.kind.as_u8();
            hdr[header::FLAGS] = self.flags;
            hdr[header::RESERVED].fill(0);
            Ok(())
        }

        /// Decodes a header from the first [`PAGE_HEADER_SIZE`] bytes of
        /// `src`.
        pub fn decode(src: &[u8]) -> Result<Self> {
            if src.len() < PAGE_HEADER_SIZE {
                return Err(ShadeError::Corruption("page header truncated"));
            }
            let hdr = &src[..PAGE_HEADER_SIZE];
            let recno = u64::from_be_bytes(hdr[header::RECNO].try_into().unwrap());
            let write_gen = u64::from_be_bytes(hdr[header::WRITE_GEN].try_into().unwrap());
            let mem_size = u32::from_be_bytes(hdr[header::MEM_SIZE].try_into().unwrap());
            let count = u32::from_be_bytes(hdr[header::COUNT].try_into().unwrap());
            let kind = PageKind::try_from(hdr[header::KIND])?;
            let flags = hdr[header::FLAGS];
            if flags & !flags::ALL != 0 {
                return Err(ShadeError::Corruption("undefined page header flag"));
            }
            if hdr[header::RESERVED] != [0, 0] {
                return Err(ShadeError::Corruption(
                    "page header reserved bytes not zero",
                ));
            }
            Ok(Self {
                recno,
                write_gen,
                mem_size,
                count,
                kind,
                flags,
            })
        }
    }
}
