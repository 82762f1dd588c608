//! In-memory page structures and the buffer-pool concurrency protocol.
//!
//! Module map, leaf first: [`skiplist`] is the ordered chain primitive,
//! [`version`] the per-key update history, [`page`] the materialized page
//! bodies, [`pageref`] the parent-to-child edge and its state machine,
//! [`hazard`] the reader registration the evictor honors, [`modify`] the
//! dirty-page bookkeeping, [`ovfl`] the overflow-block lifecycle, and
//! [`evict`] the eviction/reconciliation entry points. [`source`] holds the
//! traits external collaborators implement.

pub mod evict;
pub mod hazard;
pub mod modify;
pub mod ovfl;
pub mod page;
pub mod pageref;
pub mod skiplist;
pub mod source;
pub mod version;

pub use evict::{
    cache_superseded_value, evict_candidate, overflow_pass, overflow_pass_abort,
    overflow_pass_complete, overflow_sweep, publish_modify_result, publish_split,
    track_onpage_reference, try_evict, EvictOutcome, OverflowPass, ReadGen,
};
pub use hazard::{HazardGuard, HazardTable};
pub use modify::{
    BlockDesc, ModifyState, MultiBlock, MultiBody, MultiKey, PageModify, RecOutcome,
    ReplaceBlocks, SkippedKey, SkippedUpdate, SplitChildren,
};
pub use ovfl::OverflowTracker;
pub use page::{
    CellRef, DiskImage, InstKey, PageBody, PageIndex, PageNode, PageOffset, RowKey,
};
pub use pageref::{acquire, PageGuard, PageReadContext, PageRef, RefAddr, RefKey, RefState};
pub use skiplist::{SkipList, SKIP_MAXDEPTH};
pub use source::{AddrKind, BlockAddr, CellCodec, PageSource, TxnSource};
pub use version::{Update, UpdatePayload, VersionChain};
