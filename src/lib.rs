//! Shadetree: the in-memory page layer of a B-tree storage engine's buffer
//! pool.
//!
//! The crate models how an on-disk page is materialized in memory, how
//! concurrent readers safely dereference pages that an eviction thread may
//! reclaim at any moment, how per-key update history is kept for
//! multi-version reads, and how overflow blocks are tracked across repeated
//! page rewrites so they are neither leaked nor freed twice.
//!
//! Block allocation, the write-ahead log, checkpoints, and transaction-id
//! assignment are external collaborators, reachable only through the traits
//! in [`storage::source`].

#![warn(missing_docs)]

pub mod storage;
pub mod types;
