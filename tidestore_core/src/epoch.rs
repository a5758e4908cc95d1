use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

pub const EPOCH_BITS: u32 = 28;
pub const EPOCH_INT_OVERFLOW: u32 = 1 << EPOCH_BITS;
pub const EPOCH_INVALID: u32 = 0;

const EPOCH_INT_MASK: u32 = EPOCH_INT_OVERFLOW - 1;
const EPOCH_INT_HALF: u32 = 1 << (EPOCH_BITS - 1);

// Engine-wide coarse counter used as the high part of a serialization key.
// Wraps within EPOCH_BITS bits, skipping the invalid value.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Epoch(u32);

impl Epoch {
    #[inline]
    pub const fn new(value: u32) -> Self {
        debug_assert!(value < EPOCH_INT_OVERFLOW);
        Self(value)
    }

    #[inline]
    pub const fn invalid() -> Self {
        Self(EPOCH_INVALID)
    }

    #[inline]
    pub const fn value(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 != EPOCH_INVALID
    }

    #[inline]
    pub fn next(self) -> Epoch {
        debug_assert!(self.is_valid());
        if self.0 == EPOCH_INT_OVERFLOW - 1 {
            Epoch(EPOCH_INVALID + 1)
        } else {
            Epoch(self.0 + 1)
        }
    }

    // An invalid epoch is before every valid one; otherwise `self` is
    // before `other` when their modular difference lies in the first half
    // of the epoch space.
    #[inline]
    pub fn before(self, other: Epoch) -> bool {
        debug_assert!(other.is_valid());
        if !self.is_valid() {
            return true;
        }
        let diff = other.0.wrapping_sub(self.0) & EPOCH_INT_MASK;
        diff != 0 && diff < EPOCH_INT_HALF
    }
}

impl fmt::Debug for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "Epoch({:#x})", self.0)
        } else {
            write!(f, "Epoch(invalid)")
        }
    }
}

// Advanced periodically by the engine; the commit protocol samples it when
// stamping fresh versions.
pub struct GlobalEpoch {
    current: AtomicU32,
}

impl GlobalEpoch {
    #[inline]
    pub fn new(initial: Epoch) -> Self {
        debug_assert!(initial.is_valid());
        Self {
            current: AtomicU32::new(initial.value()),
        }
    }

    #[inline]
    pub fn current(&self) -> Epoch {
        Epoch(self.current.load(Ordering::Acquire))
    }

    pub fn advance(&self) -> Epoch {
        let mut observed = self.current.load(Ordering::Relaxed);
        loop {
            let next = Epoch(observed).next();
            match self.current.compare_exchange_weak(
                observed,
                next.value(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return next,
                Err(current) => observed = current,
            }
        }
    }
}

impl Default for GlobalEpoch {
    fn default() -> Self {
        Self::new(Epoch::new(1))
    }
}
