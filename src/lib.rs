//! An incrementally-concurrent, generational-adjacent mark-sweep garbage
//! collector and object allocator for managed-object runtimes.
//!
//! The crate provides, bottom up:
//! * [Page allocators](heap/page_allocator/struct.PageAllocator.html): segment-based
//!   reserve/commit suppliers with bounded free pools and idle-time decommit.
//! * [Heap blocks](heap/block/struct.SmallHeapBlock.html): page-aligned bitmap arenas
//!   with per-slot mark/free bits and per-object info bytes.
//! * [Buckets](heap/bucket/struct.HeapBucket.html): per size-class, per info-class
//!   bump/free-list allocators that own the blocks through the collection cycle.
//! * [The valid-pointers map](heap/valid_pointers/index.html): O(1) validation and
//!   rounding of conservative pointer candidates.
//! * [The recycler](collect/recycler/struct.Recycler.html): the collection state
//!   machine with in-thread, concurrent, parallel-mark and partial variants,
//!   finalization/dispose, weak references and telemetry.
//!
//! The embedding runtime talks to the collector through the
//! [`CollectionHost`](host/trait.CollectionHost.html) trait: it reports roots, receives
//! finalize/dispose callbacks and traces its own visited objects.

#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;
#[macro_use]
extern crate static_assertions;

#[macro_use]
pub mod util;
pub mod collect;
pub mod heap;
pub mod host;
pub mod telemetry;

pub use crate::collect::collection_flags::{self, CollectionFlags};
pub use crate::collect::collection_state::CollectionState;
pub use crate::collect::recycler::{ExternalAllocationScope, Recycler};
pub use crate::collect::weak_ref::WeakReferenceHandle;
pub use crate::heap::heap_info::RecyclerHeapObjectInfo;
pub use crate::heap::object_info;
pub use crate::heap::stats::BucketStatsReport;
pub use crate::heap::valid_pointers::generate_valid_pointers_map_header;
pub use crate::host::{CollectionHost, DefaultCollectionHost, RootScanner};
pub use crate::util::address::Address;
pub use crate::util::options::{Options, PageHeapMode};
