use std::cell::UnsafeCell;
use std::fmt;
use std::ptr::NonNull;

use crossbeam::utils::Backoff;

use crate::exclusive_lock::ExclusiveQueueLock;
use crate::shared_lock::SharedQueueLock;
use crate::version::{AtomicVersionWord, VersionWord};

// Per-record transaction identifier: an exclusive queue lock in the first
// eight bytes and the version word in the second eight. The layout is ABI;
// higher layers place the payload directly after the header.
#[repr(C, align(8))]
pub struct RecordHeader {
    lock: ExclusiveQueueLock,
    version: AtomicVersionWord,
}

const _: () = assert!(std::mem::size_of::<RecordHeader>() == 16);
const _: () = assert!(std::mem::align_of::<RecordHeader>() == 8);

impl RecordHeader {
    #[inline]
    pub fn new() -> Self {
        Self {
            lock: ExclusiveQueueLock::new(),
            version: AtomicVersionWord::default(),
        }
    }

    #[inline]
    pub fn lock(&self) -> &ExclusiveQueueLock {
        &self.lock
    }

    #[inline]
    pub fn version(&self) -> &AtomicVersionWord {
        &self.version
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    #[inline]
    pub fn is_deleted(&self) -> bool {
        self.version.load().is_deleted()
    }

    #[inline]
    pub fn is_moved(&self) -> bool {
        self.version.load().is_moved()
    }

    #[inline]
    pub fn is_next_layer(&self) -> bool {
        self.version.load().is_next_layer()
    }

    #[inline]
    pub fn is_being_written(&self) -> bool {
        self.version.load().is_being_written()
    }

    #[inline]
    pub fn needs_track_moved(&self) -> bool {
        self.version.load().needs_track_moved()
    }

    // Page-initialization path only.
    #[inline]
    pub fn reset(&self) {
        self.lock.reset();
        self.version.reset();
    }

    // Little-endian: lock word, then version word.
    pub fn to_bytes(&self) -> [u8; 16] {
        let mut bytes = [0_u8; 16];
        bytes[..4].copy_from_slice(&self.lock.tail_word().to_le_bytes());
        bytes[8..].copy_from_slice(&self.version.load().as_raw().to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        let tail = u32::from_le_bytes(bytes[..4].try_into().expect("4-byte slice"));
        let version = u64::from_le_bytes(bytes[8..].try_into().expect("8-byte slice"));
        Self {
            lock: ExclusiveQueueLock::from_tail_word(tail),
            version: AtomicVersionWord::new(VersionWord::from_raw(version)),
        }
    }
}

impl Default for RecordHeader {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RecordHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordHeader({:?}, {:?})", self.lock, self.version.load())
    }
}

// Reader-writer flavor of RecordHeader. Same 16-byte ABI.
#[repr(C, align(8))]
pub struct SharedRecordHeader {
    lock: SharedQueueLock,
    version: AtomicVersionWord,
}

const _: () = assert!(std::mem::size_of::<SharedRecordHeader>() == 16);
const _: () = assert!(std::mem::align_of::<SharedRecordHeader>() == 8);

impl SharedRecordHeader {
    #[inline]
    pub fn new() -> Self {
        Self {
            lock: SharedQueueLock::new(),
            version: AtomicVersionWord::default(),
        }
    }

    #[inline]
    pub fn lock(&self) -> &SharedQueueLock {
        &self.lock
    }

    #[inline]
    pub fn version(&self) -> &AtomicVersionWord {
        &self.version
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    #[inline]
    pub fn needs_track_moved(&self) -> bool {
        self.version.load().needs_track_moved()
    }

    // Page-initialization path only.
    #[inline]
    pub fn reset(&self) {
        self.lock.reset();
        self.version.reset();
    }

    pub fn to_bytes(&self) -> [u8; 16] {
        let mut bytes = [0_u8; 16];
        bytes[..4].copy_from_slice(&self.lock.tail_word().to_le_bytes());
        bytes[4..6].copy_from_slice(&self.lock.next_writer().to_le_bytes());
        bytes[6..8].copy_from_slice(&self.lock.readers_count().to_le_bytes());
        bytes[8..].copy_from_slice(&self.version.load().as_raw().to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        let tail = u32::from_le_bytes(bytes[..4].try_into().expect("4-byte slice"));
        let next_writer = u16::from_le_bytes(bytes[4..6].try_into().expect("2-byte slice"));
        let readers_count = u16::from_le_bytes(bytes[6..8].try_into().expect("2-byte slice"));
        let version = u64::from_le_bytes(bytes[8..].try_into().expect("8-byte slice"));
        Self {
            lock: SharedQueueLock::from_parts(tail, next_writer, readers_count),
            version: AtomicVersionWord::new(VersionWord::from_raw(version)),
        }
    }
}

impl Default for SharedRecordHeader {
    fn default() -> Self {
        Self::new()
    }
}

// Result of re-resolving a displaced record. Both addresses are present or
// both absent; a missing pair means tracking failed and the caller must
// abort and retry from the top.
#[derive(Clone, Copy, Debug)]
pub struct TrackMovedRecordResult {
    found: Option<(NonNull<RecordHeader>, NonNull<u8>)>,
}

impl TrackMovedRecordResult {
    #[inline]
    pub fn found(new_header: NonNull<RecordHeader>, new_payload: NonNull<u8>) -> Self {
        Self {
            found: Some((new_header, new_payload)),
        }
    }

    #[inline]
    pub fn not_found() -> Self {
        Self { found: None }
    }

    #[inline]
    pub fn is_found(&self) -> bool {
        self.found.is_some()
    }

    #[inline]
    pub fn new_header_address(&self) -> Option<NonNull<RecordHeader>> {
        self.found.map(|(header, _)| header)
    }

    #[inline]
    pub fn new_payload_address(&self) -> Option<NonNull<u8>> {
        self.found.map(|(_, payload)| payload)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimisticReadError {
    // The version carries moved or next-layer; re-resolve the address.
    Displaced,
    // A writer kept the record in flux past the retry budget.
    Contended,
}

impl fmt::Display for OptimisticReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimisticReadError::Displaced => {
                write!(f, "record was displaced by a structural modification")
            }
            OptimisticReadError::Contended => {
                write!(f, "record stayed write-locked past the optimistic retry budget")
            }
        }
    }
}

impl std::error::Error for OptimisticReadError {}

// Samples the version word, runs `read`, and resamples. The copy is only
// returned when no writer was observed mid-flight and the two samples
// match, so a torn copy is discarded, never exposed.
pub fn optimistic_read<T, F: FnMut() -> T>(
    header: &RecordHeader,
    mut read: F,
) -> Result<(VersionWord, T), OptimisticReadError> {
    let backoff = Backoff::new();
    loop {
        let observed = header.version().load();
        if observed.needs_track_moved() {
            return Err(OptimisticReadError::Displaced);
        }
        if observed.is_being_written() {
            if backoff.is_completed() {
                return Err(OptimisticReadError::Contended);
            }
            backoff.snooze();
            continue;
        }

        let value = read();
        if header.version().load() == observed {
            return Ok((observed, value));
        }
        if backoff.is_completed() {
            return Err(OptimisticReadError::Contended);
        }
        backoff.snooze();
    }
}

// A record as the commit protocol sees it: the 16-byte header immediately
// followed by a fixed-size payload. repr(C) keeps the header first so a
// header address is also the record address.
#[repr(C)]
pub struct Record<T: Copy> {
    header: RecordHeader,
    payload: UnsafeCell<T>,
}

// SAFETY: concurrent payload access follows the optimistic-read discipline
// (volatile copy validated against the version word) or happens under the
// record's exclusive lock.
unsafe impl<T: Copy + Send> Send for Record<T> {}
unsafe impl<T: Copy + Send + Sync> Sync for Record<T> {}

impl<T: Copy> Record<T> {
    #[inline]
    pub fn new(payload: T) -> Self {
        Self {
            header: RecordHeader::new(),
            payload: UnsafeCell::new(payload),
        }
    }

    #[inline]
    pub fn header(&self) -> &RecordHeader {
        &self.header
    }

    pub fn optimistic_read(&self) -> Result<(VersionWord, T), OptimisticReadError> {
        // SAFETY: a concurrent writer may be mutating the payload; the
        // volatile copy is discarded unless the pre/post version samples
        // match, so a torn value never escapes.
        optimistic_read(&self.header, || unsafe {
            std::ptr::read_volatile(self.payload.get())
        })
    }

    // Caller must hold the record's exclusive lock and have set
    // being-written so optimistic readers retry.
    #[inline]
    pub(crate) fn write_locked(&self, value: T) {
        debug_assert!(self.header.is_locked());
        debug_assert!(self.header.is_being_written());
        // SAFETY: the exclusive lock shuts out every other writer; readers
        // race but reject the copy via the version protocol.
        unsafe { std::ptr::write_volatile(self.payload.get(), value) };
    }
}
