//! xtree_store: the persistent storage engine behind an X-tree spatial
//! index.
//!
//! The tree logic itself (splits, reinserts, queries) lives above this
//! crate; what lives here is the machinery that makes the tree durable and
//! cheap to reach: a segmented mmap-backed allocator, a sharded object
//! table of stable node handles, a framed write-ahead delta log, a binary
//! checkpoint, a seqlock superblock, and the recovery path that stitches
//! them back together after a crash.

pub mod persist;

pub use persist::checkpoint::{CheckpointInfo, CheckpointView, OtCheckpoint};
pub use persist::checksums::{crc32c, select_checksum, Adler32, ChecksumKind, Crc32c, Crc64, XxHash64};
pub use persist::config::{size_class, StorageConfig};
pub use persist::coordinator::{CacheMetricsSource, MemoryCoordinator, MemoryMetrics, WorkloadHint};
pub use persist::delta_log::{
    replay_file, replay_file_with_payloads, DeltaLog, DeltaWithPayload, ReplayEnd, ReplayReport,
};
pub use persist::file_registry::{FileHandle, FileHandleRegistry};
pub use persist::index_registry::{
    FieldIndex, IndexConfig, IndexLoadState, IndexLoader, IndexRegistry,
};
pub use persist::manifest::{
    CheckpointEntry, DataFileInfo, DeltaLogInfo, Manifest, RootEntry,
};
pub use persist::mapping::{MappingManager, MappingStats, Pin};
pub use persist::node_id::{
    NodeId, NodeKind, OtAddr, OtDeltaRec, OtEntry, PersistentEntry, INVALID_EPOCH,
};
pub use persist::object_table::ObjectTable;
pub use persist::recovery::{Recovery, RecoveryReport};
pub use persist::segment::{Allocation, SegmentAllocator};
pub use persist::store::DurableStore;
pub use persist::superblock::{Snapshot, Superblock};
pub use persist::utils::init_logs;
