use std::fmt;
use std::hint::spin_loop;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};

use crate::context::{QueueNode, SlotIndex, ThreadContext, ThreadId};

/// Sentinel in `next_writer` meaning no writer is staged for handoff.
pub const NEXT_WRITER_NONE: ThreadId = 0xFFFF;

// Queue-based reader-writer lock. Readers batch with adjacent readers;
// writers wait for all prior readers and writers and then run exclusively.
// Layout is part of the record header ABI: 32-bit tail, 16-bit staged
// writer, 16-bit reader count.
//
// The writer handoff hinges on a store-load edge between next_writer and
// readers_count: a writer publishes itself and then checks for readers, the
// last reader decrements and then checks for a writer. Both sides use
// sequentially consistent operations so neither can miss the other.
#[repr(C, align(8))]
pub struct SharedQueueLock {
    tail: AtomicU32,
    next_writer: AtomicU16,
    readers_count: AtomicU16,
}

impl SharedQueueLock {
    #[inline]
    pub fn new() -> Self {
        Self {
            tail: AtomicU32::new(0),
            next_writer: AtomicU16::new(NEXT_WRITER_NONE),
            readers_count: AtomicU16::new(0),
        }
    }

    pub(crate) fn from_parts(tail: u32, next_writer: u16, readers_count: u16) -> Self {
        Self {
            tail: AtomicU32::new(tail),
            next_writer: AtomicU16::new(next_writer),
            readers_count: AtomicU16::new(readers_count),
        }
    }

    // Page-initialization path only.
    #[inline]
    pub fn reset(&self) {
        self.tail.store(0, Ordering::Relaxed);
        self.next_writer.store(NEXT_WRITER_NONE, Ordering::Relaxed);
        self.readers_count.store(0, Ordering::Relaxed);
    }

    // True while any waiter occupies the queue. A reader that acquired and
    // already detached from the tail is not visible here; callers that need
    // reader visibility check readers_count().
    #[inline]
    pub fn is_locked(&self) -> bool {
        (self.tail.load(Ordering::Acquire) & 0xFFFF) != 0
    }

    #[inline]
    pub fn readers_count(&self) -> u16 {
        self.readers_count.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn tail_word(&self) -> u32 {
        self.tail.load(Ordering::Acquire)
    }

    #[inline]
    pub fn next_writer(&self) -> ThreadId {
        self.next_writer.load(Ordering::SeqCst)
    }

    // A reader whose predecessor is an active reader inherits the lock
    // immediately; one behind a blocked reader or a writer chains and is
    // woken with the reader count already adjusted on its behalf.
    pub fn reader_acquire(&self, context: &ThreadContext<'_>) -> SlotIndex {
        let slot_index = context.acquire_local_slot();
        let slot = context.slot(slot_index);
        slot.init_reader();
        let me = QueueNode::new(context.thread_id(), slot_index);

        let prev = QueueNode::from_raw(self.tail.swap(me.raw(), Ordering::AcqRel));
        if prev.is_none() {
            self.increment_readers_count();
            slot.rw_unblock();
        } else {
            let pred = context.peer_slot(prev.thread_id(), prev.slot_index());
            if !pred.rw_is_reader() || pred.rw_try_mark_reader_successor() {
                // Writer ahead, or a reader that is still waiting and now
                // carries our class; it will pass the lock on.
                pred.rw_set_successor(context.thread_id(), slot_index);
                while slot.rw_is_blocked() {
                    spin_loop();
                }
            } else {
                // The predecessor reader already holds the lock; join it.
                self.increment_readers_count();
                pred.rw_set_successor(context.thread_id(), slot_index);
                slot.rw_unblock();
            }
        }

        // Grant the lock to a reader that chained behind us while we were
        // blocked.
        if slot.rw_has_reader_successor() {
            while !slot.rw_successor_ready() {
                spin_loop();
            }
            let (succ_thread, succ_slot) = slot.rw_successor();
            self.increment_readers_count();
            context.peer_slot(succ_thread, succ_slot).rw_unblock();
        }

        slot_index
    }

    // The last reader out of the critical section wakes the staged writer,
    // if any.
    pub fn reader_release(&self, context: &ThreadContext<'_>, slot_index: SlotIndex) {
        let slot = context.slot(slot_index);
        let me = QueueNode::new(context.thread_id(), slot_index);

        if slot.rw_has_successor()
            || self
                .tail
                .compare_exchange(me.raw(), 0, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
        {
            // Somebody queued behind us. Reader successors were already
            // granted the lock during acquire; a writer successor must be
            // staged for the last reader to wake.
            while !slot.rw_successor_ready() {
                spin_loop();
            }
            if slot.rw_has_writer_successor() {
                let (succ_thread, _) = slot.rw_successor();
                self.next_writer.store(succ_thread, Ordering::SeqCst);
            }
        }

        if self.decrement_readers_count() == 1 {
            let staged = self.next_writer.load(Ordering::SeqCst);
            if staged != NEXT_WRITER_NONE
                && self.readers_count.load(Ordering::SeqCst) == 0
                && self
                    .next_writer
                    .compare_exchange(staged, NEXT_WRITER_NONE, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
            {
                // The staged writer is blocked, so its current slot is the
                // one it waits on.
                let writer_slot = context.registry().current_slot_of(staged);
                context.peer_slot(staged, writer_slot).rw_unblock();
            }
        }
    }

    pub fn writer_acquire(&self, context: &ThreadContext<'_>) -> SlotIndex {
        let slot_index = context.acquire_local_slot();
        let slot = context.slot(slot_index);
        slot.init_writer();
        let me = QueueNode::new(context.thread_id(), slot_index);

        let prev = QueueNode::from_raw(self.tail.swap(me.raw(), Ordering::AcqRel));
        if prev.is_none() {
            debug_assert_eq!(self.next_writer.load(Ordering::SeqCst), NEXT_WRITER_NONE);
            self.next_writer.store(context.thread_id(), Ordering::SeqCst);
            if self.readers_count.load(Ordering::SeqCst) == 0
                && self.next_writer.swap(NEXT_WRITER_NONE, Ordering::SeqCst)
                    == context.thread_id()
            {
                // No reader left to inherit from; the lock is ours.
                slot.rw_unblock();
            }
        } else {
            let pred = context.peer_slot(prev.thread_id(), prev.slot_index());
            pred.rw_set_successor_class_writer();
            pred.rw_set_successor(context.thread_id(), slot_index);
        }

        while slot.rw_is_blocked() {
            spin_loop();
        }
        slot_index
    }

    // Hands off to the successor: another writer directly, or the first of
    // a reader batch which then propagates along its chain.
    pub fn writer_release(&self, context: &ThreadContext<'_>, slot_index: SlotIndex) {
        let slot = context.slot(slot_index);
        let me = QueueNode::new(context.thread_id(), slot_index);

        if slot.rw_has_successor()
            || self
                .tail
                .compare_exchange(me.raw(), 0, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
        {
            while !slot.rw_successor_ready() {
                spin_loop();
            }
            let (succ_thread, succ_slot) = slot.rw_successor();
            let successor = context.peer_slot(succ_thread, succ_slot);
            if successor.rw_is_reader() {
                self.increment_readers_count();
            }
            successor.rw_unblock();
        }
    }

    #[inline]
    fn increment_readers_count(&self) {
        self.readers_count.fetch_add(1, Ordering::SeqCst);
    }

    // Returns the pre-decrement count.
    #[inline]
    fn decrement_readers_count(&self) -> u16 {
        let before = self.readers_count.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(before > 0);
        before
    }
}

impl Default for SharedQueueLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SharedQueueLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SharedQueueLock(tail={:#x}, next_writer={:#x}, readers={})",
            self.tail.load(Ordering::Acquire),
            self.next_writer.load(Ordering::Relaxed),
            self.readers_count.load(Ordering::Relaxed),
        )
    }
}
