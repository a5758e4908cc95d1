use crate::context::{SlotIndex, ThreadContext, NO_SLOT};
use crate::exclusive_lock::ExclusiveQueueLock;
use crate::shared_lock::SharedQueueLock;

// Owning handle for one exclusive acquisition. Drop releases on every exit
// path of the enclosing operation, panics included. Transferring ownership
// empties the source so exactly one holder can release.
pub struct ExclusiveLockScope<'a, 'r> {
    context: Option<&'a ThreadContext<'r>>,
    lock: Option<&'a ExclusiveQueueLock>,
    slot: SlotIndex,
    non_racy: bool,
}

impl<'a, 'r> ExclusiveLockScope<'a, 'r> {
    pub fn empty() -> Self {
        Self {
            context: None,
            lock: None,
            slot: NO_SLOT,
            non_racy: false,
        }
    }

    // `non_racy` selects the plain-store initial-acquire path for provably
    // uncontended locks.
    pub fn new(
        context: &'a ThreadContext<'r>,
        lock: &'a ExclusiveQueueLock,
        acquire_now: bool,
        non_racy: bool,
    ) -> Self {
        let mut scope = Self {
            context: Some(context),
            lock: Some(lock),
            slot: NO_SLOT,
            non_racy,
        };
        if acquire_now {
            scope.acquire();
        }
        scope
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.lock.is_some()
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.slot != NO_SLOT
    }

    // Does nothing when already holding or empty.
    pub fn acquire(&mut self) {
        let (Some(context), Some(lock)) = (self.context, self.lock) else {
            return;
        };
        if self.is_locked() {
            return;
        }
        self.slot = if self.non_racy {
            lock.initial_acquire(context)
        } else {
            lock.acquire(context)
        };
    }

    // Does nothing when not holding.
    pub fn release(&mut self) {
        let (Some(context), Some(lock)) = (self.context, self.lock) else {
            return;
        };
        if self.slot != NO_SLOT {
            lock.release(context, self.slot);
            self.slot = NO_SLOT;
        }
    }

    // Hands the acquisition to a structural-page-version scope, the only
    // collaborator allowed to adopt an in-flight acquisition. The source is
    // emptied so it can no longer release.
    pub fn move_to(&mut self, target: &mut PageVersionScope<'a, 'r>) {
        debug_assert!(!target.is_locked());
        target.context = self.context.take();
        target.kind = self.lock.take().map(PageLockKind::Exclusive);
        target.slot = self.slot;
        self.slot = NO_SLOT;
    }
}

impl Drop for ExclusiveLockScope<'_, '_> {
    fn drop(&mut self) {
        self.release();
    }
}

impl Default for ExclusiveLockScope<'_, '_> {
    fn default() -> Self {
        Self::empty()
    }
}

// Reader- or writer-mode counterpart of ExclusiveLockScope.
pub struct SharedLockScope<'a, 'r> {
    context: Option<&'a ThreadContext<'r>>,
    lock: Option<&'a SharedQueueLock>,
    slot: SlotIndex,
    as_reader: bool,
}

impl<'a, 'r> SharedLockScope<'a, 'r> {
    pub fn empty(as_reader: bool) -> Self {
        Self {
            context: None,
            lock: None,
            slot: NO_SLOT,
            as_reader,
        }
    }

    pub fn new(
        context: &'a ThreadContext<'r>,
        lock: &'a SharedQueueLock,
        as_reader: bool,
        acquire_now: bool,
    ) -> Self {
        let mut scope = Self {
            context: Some(context),
            lock: Some(lock),
            slot: NO_SLOT,
            as_reader,
        };
        if acquire_now {
            scope.acquire();
        }
        scope
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.lock.is_some()
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.slot != NO_SLOT
    }

    #[inline]
    pub fn is_reader(&self) -> bool {
        self.as_reader
    }

    pub fn acquire(&mut self) {
        let (Some(context), Some(lock)) = (self.context, self.lock) else {
            return;
        };
        if self.is_locked() {
            return;
        }
        self.slot = if self.as_reader {
            lock.reader_acquire(context)
        } else {
            lock.writer_acquire(context)
        };
    }

    pub fn release(&mut self) {
        let (Some(context), Some(lock)) = (self.context, self.lock) else {
            return;
        };
        if self.slot != NO_SLOT {
            if self.as_reader {
                lock.reader_release(context, self.slot);
            } else {
                lock.writer_release(context, self.slot);
            }
            self.slot = NO_SLOT;
        }
    }

    // Structural modifications always hold the write side.
    pub fn move_to(&mut self, target: &mut PageVersionScope<'a, 'r>) {
        debug_assert!(!self.as_reader);
        debug_assert!(!target.is_locked());
        target.context = self.context.take();
        target.kind = self.lock.take().map(PageLockKind::SharedAsWriter);
        target.slot = self.slot;
        self.slot = NO_SLOT;
    }
}

impl Drop for SharedLockScope<'_, '_> {
    fn drop(&mut self) {
        self.release();
    }
}

enum PageLockKind<'a> {
    Exclusive(&'a ExclusiveQueueLock),
    SharedAsWriter(&'a SharedQueueLock),
}

// Scope held across a structural page modification. Normally it acquires a
// page lock itself; it can also adopt an in-flight acquisition via move_to
// on the record scopes.
pub struct PageVersionScope<'a, 'r> {
    context: Option<&'a ThreadContext<'r>>,
    kind: Option<PageLockKind<'a>>,
    slot: SlotIndex,
}

impl<'a, 'r> PageVersionScope<'a, 'r> {
    pub fn empty() -> Self {
        Self {
            context: None,
            kind: None,
            slot: NO_SLOT,
        }
    }

    pub fn acquire_page(context: &'a ThreadContext<'r>, lock: &'a ExclusiveQueueLock) -> Self {
        let slot = lock.acquire(context);
        Self {
            context: Some(context),
            kind: Some(PageLockKind::Exclusive(lock)),
            slot,
        }
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.slot != NO_SLOT
    }

    pub fn release(&mut self) {
        let (Some(context), Some(kind)) = (self.context, self.kind.as_ref()) else {
            return;
        };
        if self.slot != NO_SLOT {
            match kind {
                PageLockKind::Exclusive(lock) => lock.release(context, self.slot),
                PageLockKind::SharedAsWriter(lock) => lock.writer_release(context, self.slot),
            }
            self.slot = NO_SLOT;
        }
    }
}

impl Drop for PageVersionScope<'_, '_> {
    fn drop(&mut self) {
        self.release();
    }
}

impl Default for PageVersionScope<'_, '_> {
    fn default() -> Self {
        Self::empty()
    }
}

// For background threads without a slot pool: acquires through the reserved
// guest id and remembers only whether this scope took the lock.
pub struct OwnerlessLockScope<'a> {
    lock: Option<&'a ExclusiveQueueLock>,
    locked_by_me: bool,
    non_racy: bool,
}

impl<'a> OwnerlessLockScope<'a> {
    pub fn empty() -> Self {
        Self {
            lock: None,
            locked_by_me: false,
            non_racy: false,
        }
    }

    pub fn new(lock: &'a ExclusiveQueueLock, acquire_now: bool, non_racy: bool) -> Self {
        let mut scope = Self {
            lock: Some(lock),
            locked_by_me: false,
            non_racy,
        };
        if acquire_now {
            scope.acquire();
        }
        scope
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.lock.is_some()
    }

    #[inline]
    pub fn is_locked_by_me(&self) -> bool {
        self.locked_by_me
    }

    pub fn acquire(&mut self) {
        let Some(lock) = self.lock else {
            return;
        };
        if self.locked_by_me {
            return;
        }
        if self.non_racy {
            lock.ownerless_initial_acquire();
        } else {
            lock.ownerless_acquire();
        }
        self.locked_by_me = true;
    }

    pub fn release(&mut self) {
        let Some(lock) = self.lock else {
            return;
        };
        if self.locked_by_me {
            lock.ownerless_release();
            self.locked_by_me = false;
        }
    }
}

impl Drop for OwnerlessLockScope<'_> {
    fn drop(&mut self) {
        self.release();
    }
}
