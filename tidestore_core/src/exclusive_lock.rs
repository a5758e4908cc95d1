use std::fmt;
use std::hint::spin_loop;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::context::{QueueNode, SlotIndex, ThreadContext};

/// Tail value meaning the lock is held by an ownerless guest without a
/// waiter slot pool. Occupies the whole 32-bit word.
pub const GUEST_ID: u32 = 0xFFFF_FFFF;

// Queue-based exclusive lock. The 32-bit tail packs the last waiter as
// (thread_id:16 | slot_index:16); zero means unlocked. Waiters append their
// own slot and spin on that slot's blocked flag, which the predecessor
// clears on release. The high 32 bits are reserved and always zero so the
// lock occupies the first half of a 16-byte record header.
#[repr(C, align(8))]
pub struct ExclusiveQueueLock {
    tail: AtomicU32,
    reserved: u32,
}

impl ExclusiveQueueLock {
    #[inline]
    pub fn new() -> Self {
        Self {
            tail: AtomicU32::new(0),
            reserved: 0,
        }
    }

    pub(crate) fn from_tail_word(tail: u32) -> Self {
        Self {
            tail: AtomicU32::new(tail),
            reserved: 0,
        }
    }

    // Page-initialization path only.
    #[inline]
    pub fn reset(&self) {
        self.tail.store(0, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        (self.tail.load(Ordering::Acquire) & 0xFFFF) != 0
    }

    #[inline]
    pub fn tail_word(&self) -> u32 {
        self.tail.load(Ordering::Acquire)
    }

    // Appends this thread's next free slot and spins until the predecessor
    // hands the lock over. The returned slot index must be passed back to
    // release(). Cannot fail and cannot be cancelled.
    pub fn acquire(&self, context: &ThreadContext<'_>) -> SlotIndex {
        let slot_index = context.acquire_local_slot();
        let slot = context.slot(slot_index);
        slot.reset_for_exclusive();
        let me = QueueNode::new(context.thread_id(), slot_index);

        let prev = self.enqueue(me);
        if prev.is_none() {
            return slot_index;
        }

        // The blocked flag must be raised before our identity becomes
        // visible through the predecessor's successor field.
        slot.mark_blocked();
        context
            .peer_slot(prev.thread_id(), prev.slot_index())
            .set_successor(me);
        while slot.is_blocked() {
            spin_loop();
        }
        slot_index
    }

    // Same contract as acquire() but with plain stores. Permitted only when
    // the lock is provably uncontended, e.g. while a page is initialized
    // before publication.
    pub fn initial_acquire(&self, context: &ThreadContext<'_>) -> SlotIndex {
        debug_assert!(self.tail.load(Ordering::Relaxed) == 0);
        let slot_index = context.acquire_local_slot();
        context.slot(slot_index).reset_for_exclusive();
        let me = QueueNode::new(context.thread_id(), slot_index);
        self.tail.store(me.raw(), Ordering::Relaxed);
        slot_index
    }

    // If a successor is racing to link itself, waits for its identity to
    // appear and then clears its blocked flag.
    pub fn release(&self, context: &ThreadContext<'_>, slot_index: SlotIndex) {
        let slot = context.slot(slot_index);
        let me = QueueNode::new(context.thread_id(), slot_index);

        if slot.successor().is_none() {
            if self
                .tail
                .compare_exchange(me.raw(), 0, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
            while slot.successor().is_none() {
                spin_loop();
            }
        }

        let successor = slot.successor();
        context
            .peer_slot(successor.thread_id(), successor.slot_index())
            .unblock();
    }

    // Locks with the reserved guest id for threads without a slot pool. A
    // guest holder cannot coexist with queued waiters: queued acquires stall
    // while the guest sentinel occupies the tail.
    pub fn ownerless_acquire(&self) {
        loop {
            if self
                .tail
                .compare_exchange_weak(0, GUEST_ID, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
            spin_loop();
        }
    }

    pub fn ownerless_release(&self) {
        let released = self
            .tail
            .compare_exchange(GUEST_ID, 0, Ordering::Release, Ordering::Relaxed)
            .is_ok();
        debug_assert!(released, "ownerless release without a guest holder");
        let _ = released;
    }

    pub fn ownerless_initial_acquire(&self) {
        debug_assert!(self.tail.load(Ordering::Relaxed) == 0);
        self.tail.store(GUEST_ID, Ordering::Relaxed);
    }

    // Appends `me` to the queue. A plain exchange would displace a guest
    // holder, so the swap is expressed as a CAS from the observed tail that
    // retries while the guest sentinel is present. Among queued threads the
    // successful CAS is equivalent to the exchange.
    fn enqueue(&self, me: QueueNode) -> QueueNode {
        let mut observed = self.tail.load(Ordering::Relaxed);
        loop {
            if observed == GUEST_ID {
                spin_loop();
                observed = self.tail.load(Ordering::Relaxed);
                continue;
            }
            match self.tail.compare_exchange_weak(
                observed,
                me.raw(),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(prev) => return QueueNode::from_raw(prev),
                Err(current) => observed = current,
            }
        }
    }
}

impl Default for ExclusiveQueueLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ExclusiveQueueLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tail = self.tail.load(Ordering::Acquire);
        if tail == GUEST_ID {
            write!(f, "ExclusiveQueueLock(guest)")
        } else {
            write!(
                f,
                "ExclusiveQueueLock(thread={}, slot={})",
                tail >> 16,
                tail & 0xFFFF
            )
        }
    }
}
