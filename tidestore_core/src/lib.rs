pub mod commit;
pub mod context;
pub mod epoch;
pub mod exclusive_lock;
pub mod record;
pub mod scope;
pub mod shared_lock;
pub mod version;

pub use commit::{
    MovedRecordTracker, PrecommitAbort, Transaction, MOVED_TRACK_CAPACITY, READ_SET_CAPACITY,
    WRITE_SET_CAPACITY,
};
pub use context::{
    QueueNode, RegistryConfig, RegistryError, SlotIndex, ThreadContext, ThreadId, ThreadRegistry,
    WaiterSlot, MAX_SLOTS_PER_THREAD, NO_SLOT,
};
pub use epoch::{Epoch, GlobalEpoch, EPOCH_BITS, EPOCH_INT_OVERFLOW, EPOCH_INVALID};
pub use exclusive_lock::{ExclusiveQueueLock, GUEST_ID};
pub use record::{
    optimistic_read, OptimisticReadError, Record, RecordHeader, SharedRecordHeader,
    TrackMovedRecordResult,
};
pub use scope::{ExclusiveLockScope, OwnerlessLockScope, PageVersionScope, SharedLockScope};
pub use shared_lock::{SharedQueueLock, NEXT_WRITER_NONE};
pub use version::{
    AtomicVersionWord, VersionWord, MAX_ORDINAL, VERSION_BEING_WRITTEN_BIT, VERSION_DELETED_BIT,
    VERSION_EPOCH_MASK, VERSION_MOVED_BIT, VERSION_NEXT_LAYER_BIT, VERSION_ORDINAL_MASK,
    VERSION_SERIAL_MASK,
};
