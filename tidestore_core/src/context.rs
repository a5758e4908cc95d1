use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};

use crossbeam::utils::CachePadded;

pub type ThreadId = u16;
pub type SlotIndex = u16;

/// Slot index meaning "no slot / not waiting".
pub const NO_SLOT: SlotIndex = 0;

// Ceiling imposed by the 16-bit slot half of a lock's tail word.
pub const MAX_SLOTS_PER_THREAD: usize = 1 << 16;

// Shared-mode slot state, packed into one 16-bit word so the blocked bit and
// the successor class can be updated in a single atomic operation.
// High byte: bits 0-1 own class, bit 7 blocked. Low byte: successor class.
const RW_CLASS_MASK: u8 = 0x03;
const RW_CLASS_READER: u8 = 0x01;
const RW_CLASS_WRITER: u8 = 0x02;
const RW_BLOCKED: u8 = 0x80;

pub(crate) const RW_SUCCESSOR_READER: u8 = 0x01;
pub(crate) const RW_SUCCESSOR_WRITER: u8 = 0x02;
pub(crate) const RW_SUCCESSOR_NONE: u8 = 0x03;

#[inline]
const fn rw_pack(state: u8, successor_class: u8) -> u16 {
    ((state as u16) << 8) | successor_class as u16
}

// A queue position packed as (thread_id:16 | slot_index:16). Doubles as the
// value stored in a lock's 32-bit tail word. Zero slot index means "none".
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct QueueNode(u32);

impl QueueNode {
    pub const NONE: QueueNode = QueueNode(0);

    #[inline]
    pub fn new(thread_id: ThreadId, slot_index: SlotIndex) -> Self {
        debug_assert!(slot_index != NO_SLOT);
        Self((u32::from(thread_id) << 16) | u32::from(slot_index))
    }

    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn thread_id(self) -> ThreadId {
        (self.0 >> 16) as ThreadId
    }

    #[inline]
    pub const fn slot_index(self) -> SlotIndex {
        (self.0 & 0xFFFF) as SlotIndex
    }

    #[inline]
    pub const fn is_none(self) -> bool {
        self.slot_index() == NO_SLOT
    }
}

// Pre-allocated waiter record. A slot represents one thread's position in
// exactly one queue at a time, so the exclusive-mode and shared-mode fields
// are never live simultaneously. The owning thread writes every field except
// `successor*` and the blocked state, which the successor respectively the
// predecessor publishes with release ordering.
#[repr(C)]
#[derive(Debug)]
pub struct WaiterSlot {
    // Exclusive mode.
    successor: AtomicU32,
    blocked: AtomicBool,
    // Shared mode.
    rw_state: AtomicU16,
    rw_successor_thread: AtomicU16,
    rw_successor_slot: AtomicU16,
}

impl WaiterSlot {
    fn new() -> Self {
        Self {
            successor: AtomicU32::new(0),
            blocked: AtomicBool::new(false),
            rw_state: AtomicU16::new(0),
            rw_successor_thread: AtomicU16::new(0),
            rw_successor_slot: AtomicU16::new(0),
        }
    }

    // ---- exclusive mode ----

    #[inline]
    pub(crate) fn reset_for_exclusive(&self) {
        self.successor.store(0, Ordering::Relaxed);
        self.blocked.store(false, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn mark_blocked(&self) {
        self.blocked.store(true, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn unblock(&self) {
        debug_assert!(self.blocked.load(Ordering::Relaxed));
        self.blocked.store(false, Ordering::Release);
    }

    #[inline]
    pub fn successor(&self) -> QueueNode {
        QueueNode::from_raw(self.successor.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_successor(&self, node: QueueNode) {
        debug_assert!(!node.is_none());
        self.successor.store(node.raw(), Ordering::Release);
    }

    // ---- shared mode ----

    #[inline]
    pub(crate) fn init_reader(&self) {
        self.rw_successor_thread.store(0, Ordering::Relaxed);
        self.rw_successor_slot.store(0, Ordering::Relaxed);
        self.rw_state.store(
            rw_pack(RW_CLASS_READER | RW_BLOCKED, RW_SUCCESSOR_NONE),
            Ordering::Release,
        );
    }

    #[inline]
    pub(crate) fn init_writer(&self) {
        self.rw_successor_thread.store(0, Ordering::Relaxed);
        self.rw_successor_slot.store(0, Ordering::Relaxed);
        self.rw_state.store(
            rw_pack(RW_CLASS_WRITER | RW_BLOCKED, RW_SUCCESSOR_NONE),
            Ordering::Release,
        );
    }

    #[inline]
    pub fn rw_is_reader(&self) -> bool {
        let state = (self.rw_state.load(Ordering::Acquire) >> 8) as u8;
        (state & RW_CLASS_MASK) == RW_CLASS_READER
    }

    #[inline]
    pub fn rw_is_blocked(&self) -> bool {
        let state = (self.rw_state.load(Ordering::Acquire) >> 8) as u8;
        (state & RW_BLOCKED) != 0
    }

    #[inline]
    pub(crate) fn rw_unblock(&self) {
        debug_assert!(self.rw_is_blocked());
        self.rw_state
            .fetch_and(!rw_pack(RW_BLOCKED, 0), Ordering::AcqRel);
    }

    // Registers a reader successor only while the slot is still blocked with
    // no successor. The blocked bit and the successor class share one atomic
    // word so this decision cannot race with the owner getting unblocked
    // (the Fraser fix to the classical queue-based reader-writer lock).
    #[inline]
    pub(crate) fn rw_try_mark_reader_successor(&self) -> bool {
        let own_class = (self.rw_state.load(Ordering::Relaxed) >> 8) as u8 & RW_CLASS_MASK;
        let expected = rw_pack(own_class | RW_BLOCKED, RW_SUCCESSOR_NONE);
        let desired = rw_pack(own_class | RW_BLOCKED, RW_SUCCESSOR_READER);
        self.rw_state
            .compare_exchange(expected, desired, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    // NONE (0b11) becomes WRITER (0b10) by clearing bit zero, which leaves
    // the blocked bit untouched.
    #[inline]
    pub(crate) fn rw_set_successor_class_writer(&self) {
        debug_assert_eq!(self.rw_successor_class(), RW_SUCCESSOR_NONE);
        self.rw_state.fetch_and(!0x0001_u16, Ordering::AcqRel);
    }

    #[inline]
    pub(crate) fn rw_successor_class(&self) -> u8 {
        (self.rw_state.load(Ordering::Acquire) & 0xFF) as u8
    }

    #[inline]
    pub fn rw_has_successor(&self) -> bool {
        self.rw_successor_class() != RW_SUCCESSOR_NONE
    }

    #[inline]
    pub fn rw_has_reader_successor(&self) -> bool {
        self.rw_successor_class() == RW_SUCCESSOR_READER
    }

    #[inline]
    pub fn rw_has_writer_successor(&self) -> bool {
        self.rw_successor_class() == RW_SUCCESSOR_WRITER
    }

    #[inline]
    pub(crate) fn rw_set_successor(&self, thread_id: ThreadId, slot_index: SlotIndex) {
        debug_assert!(slot_index != NO_SLOT);
        debug_assert_eq!(self.rw_successor_slot.load(Ordering::Relaxed), 0);
        self.rw_successor_thread.store(thread_id, Ordering::Relaxed);
        // The slot index is the readiness signal; thread id only becomes
        // visible through this release store.
        self.rw_successor_slot.store(slot_index, Ordering::Release);
    }

    #[inline]
    pub(crate) fn rw_successor_ready(&self) -> bool {
        self.rw_successor_slot.load(Ordering::Acquire) != 0
    }

    #[inline]
    pub fn rw_successor(&self) -> (ThreadId, SlotIndex) {
        let slot = self.rw_successor_slot.load(Ordering::Acquire);
        let thread = self.rw_successor_thread.load(Ordering::Relaxed);
        (thread, slot)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RegistryConfig {
    pub max_threads: u16,
    pub slots_per_thread: u16,
}

impl RegistryConfig {
    pub const MAX_THREADS: u16 = 256;
    pub const SLOTS_PER_THREAD: u16 = 256;
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_threads: Self::MAX_THREADS,
            slots_per_thread: Self::SLOTS_PER_THREAD,
        }
    }
}

#[derive(Debug)]
struct ThreadPool {
    slots: Box<[WaiterSlot]>,
    // Index of the most recently issued slot. Doubles as the thread's
    // "current waiting slot": a thread waits on at most one lock at a time.
    cursor: AtomicU16,
    registered: AtomicBool,
}

impl ThreadPool {
    fn new(slots_per_thread: u16) -> Self {
        let mut slots = Vec::with_capacity(usize::from(slots_per_thread));
        for _ in 0..slots_per_thread {
            slots.push(WaiterSlot::new());
        }
        Self {
            slots: slots.into_boxed_slice(),
            cursor: AtomicU16::new(0),
            registered: AtomicBool::new(false),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    NoFreeThread { max_threads: u16 },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::NoFreeThread { max_threads } => write!(
                f,
                "no free execution context; max {} concurrent threads reached",
                max_threads
            ),
        }
    }
}

impl std::error::Error for RegistryError {}

// Fixed table of per-thread waiter slot pools, allocated once at
// construction. Registration hands out a context bound to one pool.
#[derive(Debug)]
pub struct ThreadRegistry {
    pools: Box<[CachePadded<ThreadPool>]>,
}

impl ThreadRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        debug_assert!(config.slots_per_thread >= 2);
        debug_assert!(usize::from(config.slots_per_thread) <= MAX_SLOTS_PER_THREAD);
        let mut pools = Vec::with_capacity(usize::from(config.max_threads));
        for _ in 0..config.max_threads {
            pools.push(CachePadded::new(ThreadPool::new(config.slots_per_thread)));
        }
        Self {
            pools: pools.into_boxed_slice(),
        }
    }

    pub fn register(&self) -> Result<ThreadContext<'_>, RegistryError> {
        for (thread_id, pool) in self.pools.iter().enumerate() {
            if pool
                .registered
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                pool.cursor.store(0, Ordering::Relaxed);
                return Ok(ThreadContext {
                    registry: self,
                    thread_id: thread_id as ThreadId,
                });
            }
        }
        Err(RegistryError::NoFreeThread {
            max_threads: self.pools.len() as u16,
        })
    }

    #[inline]
    pub fn peer_slot(&self, thread_id: ThreadId, slot_index: SlotIndex) -> &WaiterSlot {
        debug_assert!(slot_index != NO_SLOT);
        let pool = &self.pools[usize::from(thread_id)];
        &pool.slots[usize::from(slot_index)]
    }

    // The slot `thread_id` is currently waiting on. Meaningful only while
    // that thread is blocked on a lock, which is the only time callers
    // consult it.
    #[inline]
    pub(crate) fn current_slot_of(&self, thread_id: ThreadId) -> SlotIndex {
        self.pools[usize::from(thread_id)]
            .cursor
            .load(Ordering::Acquire)
    }

    #[inline]
    pub fn max_threads(&self) -> usize {
        self.pools.len()
    }
}

// Execution context of one registered worker thread: its identity plus its
// waiter slot pool. Unregisters on drop.
#[derive(Debug)]
pub struct ThreadContext<'r> {
    registry: &'r ThreadRegistry,
    thread_id: ThreadId,
}

impl<'r> ThreadContext<'r> {
    #[inline]
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    #[inline]
    pub fn registry(&self) -> &'r ThreadRegistry {
        self.registry
    }

    fn pool(&self) -> &'r ThreadPool {
        &self.registry.pools[usize::from(self.thread_id)]
    }

    // Slots are handed out monotonically and recycled in bulk via
    // reset_slot_cursor once every acquisition has been released. Running
    // past the pool end is a caller bug.
    #[inline]
    pub fn acquire_local_slot(&self) -> SlotIndex {
        let pool = self.pool();
        let next = pool.cursor.load(Ordering::Relaxed) + 1;
        debug_assert!(usize::from(next) < pool.slots.len());
        pool.cursor.store(next, Ordering::Release);
        next
    }

    #[inline]
    pub fn slot(&self, slot_index: SlotIndex) -> &'r WaiterSlot {
        debug_assert!(slot_index != NO_SLOT);
        &self.pool().slots[usize::from(slot_index)]
    }

    #[inline]
    pub fn peer_slot(&self, thread_id: ThreadId, slot_index: SlotIndex) -> &'r WaiterSlot {
        self.registry.peer_slot(thread_id, slot_index)
    }

    // Permitted only while this thread holds no lock; the commit protocol
    // calls it between transactions.
    #[inline]
    pub fn reset_slot_cursor(&self) {
        self.pool().cursor.store(0, Ordering::Release);
    }

    #[inline]
    pub fn issued_slots(&self) -> u16 {
        self.pool().cursor.load(Ordering::Relaxed)
    }
}

impl Drop for ThreadContext<'_> {
    fn drop(&mut self) {
        self.pool().registered.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::{QueueNode, RegistryConfig, RegistryError, ThreadRegistry, NO_SLOT};

    #[test]
    fn queue_node_packs_thread_and_slot() {
        let node = QueueNode::new(7, 3);
        assert_eq!(node.raw(), 0x0007_0003);
        assert_eq!(node.thread_id(), 7);
        assert_eq!(node.slot_index(), 3);
        assert!(!node.is_none());
        assert!(QueueNode::NONE.is_none());
    }

    #[test]
    fn register_exhausts_pools_and_reports_error() {
        let registry = ThreadRegistry::new(RegistryConfig {
            max_threads: 2,
            slots_per_thread: 8,
        });
        let a = registry.register().expect("first context");
        let b = registry.register().expect("second context");
        let err = registry.register().expect_err("pools exhausted");
        assert_eq!(err, RegistryError::NoFreeThread { max_threads: 2 });
        assert_ne!(a.thread_id(), b.thread_id());
    }

    #[test]
    fn dropping_a_context_frees_its_pool() {
        let registry = ThreadRegistry::new(RegistryConfig {
            max_threads: 1,
            slots_per_thread: 8,
        });
        let first = registry.register().expect("context");
        let id = first.thread_id();
        drop(first);
        let second = registry.register().expect("pool reusable after drop");
        assert_eq!(second.thread_id(), id);
    }

    #[test]
    fn slot_issuing_starts_at_one_and_resets() {
        let registry = ThreadRegistry::new(RegistryConfig::default());
        let ctx = registry.register().expect("context");
        assert_eq!(ctx.issued_slots(), NO_SLOT);
        assert_eq!(ctx.acquire_local_slot(), 1);
        assert_eq!(ctx.acquire_local_slot(), 2);
        ctx.reset_slot_cursor();
        assert_eq!(ctx.acquire_local_slot(), 1);
    }

    #[test]
    fn rw_state_pair_updates_preserve_the_other_byte() {
        let registry = ThreadRegistry::new(RegistryConfig::default());
        let ctx = registry.register().expect("context");
        let slot = ctx.slot(1);

        slot.init_reader();
        assert!(slot.rw_is_reader());
        assert!(slot.rw_is_blocked());
        assert!(!slot.rw_has_successor());

        assert!(slot.rw_try_mark_reader_successor());
        assert!(slot.rw_has_reader_successor());
        assert!(slot.rw_is_blocked());

        slot.rw_unblock();
        assert!(!slot.rw_is_blocked());
        assert!(slot.rw_has_reader_successor());

        // Unblocked slots no longer accept the blocked-successor transition.
        slot.init_writer();
        slot.rw_set_successor_class_writer();
        assert!(slot.rw_has_writer_successor());
        assert!(slot.rw_is_blocked());
        assert!(!slot.rw_is_reader());
    }
}
