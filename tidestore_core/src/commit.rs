use std::fmt;

use crossbeam::utils::Backoff;

use crate::context::ThreadContext;
use crate::epoch::GlobalEpoch;
use crate::record::{OptimisticReadError, Record, TrackMovedRecordResult};
use crate::scope::ExclusiveLockScope;
use crate::version::{VersionWord, MAX_ORDINAL};

pub const READ_SET_CAPACITY: usize = 1024;
pub const WRITE_SET_CAPACITY: usize = 256;
// Displaced-record re-resolutions allowed within one precommit attempt.
pub const MOVED_TRACK_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrecommitAbort {
    // A read-set version changed, or a read record is locked by another
    // transaction. Retry from the top.
    WriteConflict,
    // A record carries moved or next-layer and could not be resolved here;
    // the caller must re-resolve its address and retry.
    RecordDisplaced,
    // A read-set, write-set, or moved-tracking ceiling was hit.
    TrackBufferFull,
}

impl fmt::Display for PrecommitAbort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrecommitAbort::WriteConflict => write!(f, "write conflict observed at commit"),
            PrecommitAbort::RecordDisplaced => {
                write!(f, "record displaced by a structural modification")
            }
            PrecommitAbort::TrackBufferFull => write!(f, "transaction tracking buffer overflow"),
        }
    }
}

impl std::error::Error for PrecommitAbort {}

// Re-resolves a displaced record to its new location. Supplied by the
// storage layer that performed the structural modification.
pub trait MovedRecordTracker<T: Copy> {
    fn track_moved(&self, record: &Record<T>) -> TrackMovedRecordResult;
}

struct ReadEntry<'a, T: Copy> {
    record: &'a Record<T>,
    observed: VersionWord,
}

enum WriteOp<T: Copy> {
    Update(T),
    Delete,
}

struct WriteEntry<'a, T: Copy> {
    record: &'a Record<T>,
    op: WriteOp<T>,
}

// One serializable transaction over a set of records. Reads are optimistic:
// the observed version is remembered and re-verified at precommit. Writes
// are buffered and published under exclusive locks taken in ascending
// record-address order, the engine-wide deadlock-avoidance discipline. A
// fresh (epoch, ordinal) is stamped into every written version while
// being-written shuts out optimistic readers.
pub struct Transaction<'a, 'r, T: Copy> {
    context: &'a ThreadContext<'r>,
    global_epoch: &'a GlobalEpoch,
    tracker: Option<&'a dyn MovedRecordTracker<T>>,
    read_set: Vec<ReadEntry<'a, T>>,
    write_set: Vec<WriteEntry<'a, T>>,
    max_observed: VersionWord,
}

impl<'a, 'r, T: Copy> Transaction<'a, 'r, T> {
    pub fn begin(context: &'a ThreadContext<'r>, global_epoch: &'a GlobalEpoch) -> Self {
        Self {
            context,
            global_epoch,
            tracker: None,
            read_set: Vec::new(),
            write_set: Vec::new(),
            max_observed: VersionWord::zero(),
        }
    }

    pub fn with_tracker(
        context: &'a ThreadContext<'r>,
        global_epoch: &'a GlobalEpoch,
        tracker: &'a dyn MovedRecordTracker<T>,
    ) -> Self {
        let mut tx = Self::begin(context, global_epoch);
        tx.tracker = Some(tracker);
        tx
    }

    #[inline]
    pub fn read_set_len(&self) -> usize {
        self.read_set.len()
    }

    #[inline]
    pub fn write_set_len(&self) -> usize {
        self.write_set.len()
    }

    // A buffered write by this transaction wins over the shared state.
    pub fn read(&mut self, record: &'a Record<T>) -> Result<Option<T>, PrecommitAbort> {
        if let Some(entry) = self
            .write_set
            .iter()
            .rev()
            .find(|entry| std::ptr::eq(entry.record, record))
        {
            return Ok(match &entry.op {
                WriteOp::Update(value) => Some(*value),
                WriteOp::Delete => None,
            });
        }

        let backoff = Backoff::new();
        let (observed, value) = loop {
            match record.optimistic_read() {
                Ok(sample) => break sample,
                Err(OptimisticReadError::Displaced) => {
                    return Err(PrecommitAbort::RecordDisplaced);
                }
                Err(OptimisticReadError::Contended) => backoff.snooze(),
            }
        };

        self.record_read(record, observed)?;
        if observed.is_deleted() {
            return Ok(None);
        }
        Ok(Some(value))
    }

    pub fn write(&mut self, record: &'a Record<T>, value: T) -> Result<(), PrecommitAbort> {
        self.push_write(record, WriteOp::Update(value))
    }

    pub fn delete(&mut self, record: &'a Record<T>) -> Result<(), PrecommitAbort> {
        self.push_write(record, WriteOp::Delete)
    }

    // Drops all buffered work. The transaction can be reused afterwards.
    pub fn abort(&mut self) {
        self.clear();
    }

    // Verify-then-publish: lock the write set in address order, validate
    // the read set, generate the commit version, publish, release.
    pub fn precommit(&mut self) -> Result<VersionWord, PrecommitAbort> {
        let mut tracked = 0_usize;
        let mut scopes: Vec<ExclusiveLockScope<'a, 'r>> = Vec::with_capacity(self.write_set.len());

        // Lock phase. A record can be displaced between buffering and
        // locking; re-resolve it (bounded) and restart the phase, since a
        // substitution changes the address order. Clearing the scope vector
        // releases every lock taken by the failed round.
        let outcome = 'lock_phase: loop {
            scopes.clear();
            let plan = self.lock_order();
            for &idx in &plan {
                if self.write_set[idx].record.header().needs_track_moved() {
                    match self.resolve_moved(idx, &mut tracked) {
                        Ok(()) => continue 'lock_phase,
                        Err(abort) => break 'lock_phase Err(abort),
                    }
                }
                let record = self.write_set[idx].record;
                scopes.push(ExclusiveLockScope::new(
                    self.context,
                    record.header().lock(),
                    true,
                    false,
                ));
                if record.header().needs_track_moved() {
                    // Displaced while we were queueing.
                    match self.resolve_moved(idx, &mut tracked) {
                        Ok(()) => continue 'lock_phase,
                        Err(abort) => break 'lock_phase Err(abort),
                    }
                }
            }
            break Ok(plan);
        };
        let plan = match outcome {
            Ok(plan) => plan,
            Err(abort) => {
                drop(scopes);
                self.clear();
                return Err(abort);
            }
        };

        if let Err(abort) = self.validate_read_set(&plan) {
            drop(scopes);
            self.clear();
            return Err(abort);
        }

        let commit_version = self.generate_commit_version(&plan);

        for &idx in &plan {
            let entry = &self.write_set[idx];
            let header = entry.record.header();

            let mut in_flight = header.version().load();
            in_flight.set_being_written();
            header.version().store(in_flight);

            let mut stamped = commit_version;
            match &entry.op {
                WriteOp::Update(value) => entry.record.write_locked(*value),
                WriteOp::Delete => stamped.set_deleted(),
            }
            header.version().store(stamped);
        }

        drop(scopes);
        self.clear();
        Ok(commit_version)
    }

    fn record_read(
        &mut self,
        record: &'a Record<T>,
        observed: VersionWord,
    ) -> Result<(), PrecommitAbort> {
        self.max_observed.store_max(observed);
        if self
            .read_set
            .iter()
            .any(|entry| std::ptr::eq(entry.record, record))
        {
            return Ok(());
        }
        if self.read_set.len() >= READ_SET_CAPACITY {
            self.clear();
            return Err(PrecommitAbort::TrackBufferFull);
        }
        self.read_set.push(ReadEntry { record, observed });
        Ok(())
    }

    fn push_write(&mut self, record: &'a Record<T>, op: WriteOp<T>) -> Result<(), PrecommitAbort> {
        if self.write_set.len() >= WRITE_SET_CAPACITY {
            self.clear();
            return Err(PrecommitAbort::TrackBufferFull);
        }
        self.write_set.push(WriteEntry { record, op });
        Ok(())
    }

    // Indices of the effective writes (last buffered operation per record),
    // ascending by record address.
    fn lock_order(&self) -> Vec<usize> {
        let mut by_address = std::collections::BTreeMap::<usize, usize>::new();
        for (idx, entry) in self.write_set.iter().enumerate() {
            by_address.insert(entry.record as *const Record<T> as usize, idx);
        }
        by_address.into_values().collect()
    }

    fn resolve_moved(&mut self, idx: usize, tracked: &mut usize) -> Result<(), PrecommitAbort> {
        let Some(tracker) = self.tracker else {
            return Err(PrecommitAbort::RecordDisplaced);
        };
        *tracked += 1;
        if *tracked > MOVED_TRACK_CAPACITY {
            return Err(PrecommitAbort::TrackBufferFull);
        }
        let result = tracker.track_moved(self.write_set[idx].record);
        let Some(new_header) = result.new_header_address() else {
            return Err(PrecommitAbort::RecordDisplaced);
        };
        // SAFETY: the header is the first field of the repr(C) record, so
        // the tracked header address is the new record's address. The
        // tracker guarantees the record outlives this transaction.
        let record = unsafe { &*(new_header.as_ptr() as *const Record<T>) };
        self.write_set[idx].record = record;
        Ok(())
    }

    fn validate_read_set(&self, plan: &[usize]) -> Result<(), PrecommitAbort> {
        for entry in &self.read_set {
            let current = entry.record.header().version().load();
            if current.needs_track_moved() {
                return Err(PrecommitAbort::RecordDisplaced);
            }
            if current != entry.observed {
                return Err(PrecommitAbort::WriteConflict);
            }
            let in_write_set = plan
                .iter()
                .any(|&idx| std::ptr::eq(self.write_set[idx].record, entry.record));
            if !in_write_set && entry.record.header().is_locked() {
                // Another transaction is about to change it.
                return Err(PrecommitAbort::WriteConflict);
            }
        }
        Ok(())
    }

    // The commit version serializes after everything this transaction
    // observed: the maximum of the read-set versions and the locked
    // write-set versions, bumped by one ordinal, floored at
    // (current epoch, 1).
    fn generate_commit_version(&self, plan: &[usize]) -> VersionWord {
        let mut version = self.max_observed;
        for &idx in plan {
            version.store_max(self.write_set[idx].record.header().version().load());
        }

        let commit_epoch = self.global_epoch.current();
        if !version.is_valid() || version.epoch().before(commit_epoch) {
            version.set(commit_epoch, 1);
        } else {
            version.clear_status_bits();
            debug_assert!(version.ordinal() < MAX_ORDINAL);
            version.increment_ordinal();
        }
        version
    }

    fn clear(&mut self) {
        self.read_set.clear();
        self.write_set.clear();
        self.max_observed = VersionWord::zero();
        self.context.reset_slot_cursor();
    }
}

#[cfg(test)]
mod tests {
    use super::{
        MovedRecordTracker, PrecommitAbort, Transaction, MOVED_TRACK_CAPACITY, WRITE_SET_CAPACITY,
    };
    use crate::context::{RegistryConfig, ThreadRegistry};
    use crate::epoch::{Epoch, GlobalEpoch};
    use crate::record::{Record, TrackMovedRecordResult};
    use crate::version::VersionWord;

    #[test]
    fn read_then_commit_stamps_a_fresh_version() {
        let registry = ThreadRegistry::new(RegistryConfig::default());
        let ctx = registry.register().expect("context");
        let global_epoch = GlobalEpoch::default();
        let record = Record::new(10_i64);

        let mut tx = Transaction::begin(&ctx, &global_epoch);
        assert_eq!(tx.read(&record).expect("read"), Some(10));
        tx.write(&record, 11).expect("write");
        let committed = tx.precommit().expect("commit");

        assert_eq!(committed.epoch(), global_epoch.current());
        assert_eq!(committed.ordinal(), 1);
        assert_eq!(record.header().version().load(), committed);
        assert!(!record.header().is_locked());

        let (_, value) = record.optimistic_read().expect("reread");
        assert_eq!(value, 11);
    }

    #[test]
    fn buffered_writes_are_read_back_before_commit() {
        let registry = ThreadRegistry::new(RegistryConfig::default());
        let ctx = registry.register().expect("context");
        let global_epoch = GlobalEpoch::default();
        let record = Record::new(1_i64);

        let mut tx = Transaction::begin(&ctx, &global_epoch);
        tx.write(&record, 2).expect("write");
        assert_eq!(tx.read(&record).expect("own write"), Some(2));
        tx.delete(&record).expect("delete");
        assert_eq!(tx.read(&record).expect("own delete"), None);
        tx.abort();
        assert_eq!(tx.read(&record).expect("after abort"), Some(1));
    }

    #[test]
    fn commit_version_advances_past_prior_commits() {
        let registry = ThreadRegistry::new(RegistryConfig::default());
        let ctx = registry.register().expect("context");
        let global_epoch = GlobalEpoch::default();
        let record = Record::new(0_u32);

        let mut first = Transaction::begin(&ctx, &global_epoch);
        first.read(&record).expect("read");
        first.write(&record, 1).expect("write");
        let v1 = first.precommit().expect("first commit");

        let mut second = Transaction::begin(&ctx, &global_epoch);
        second.read(&record).expect("read");
        second.write(&record, 2).expect("write");
        let v2 = second.precommit().expect("second commit");

        assert!(v1.before(v2));
        assert_eq!(v2.epoch(), v1.epoch());
        assert_eq!(v2.ordinal(), v1.ordinal() + 1);

        global_epoch.advance();
        let mut third = Transaction::begin(&ctx, &global_epoch);
        third.write(&record, 3).expect("write");
        let v3 = third.precommit().expect("third commit");
        assert!(v2.before(v3));
        assert_eq!(v3.epoch(), global_epoch.current());
        assert_eq!(v3.ordinal(), 1);
    }

    #[test]
    fn stale_read_set_aborts_with_write_conflict() {
        let registry = ThreadRegistry::new(RegistryConfig::default());
        let ctx = registry.register().expect("context");
        let global_epoch = GlobalEpoch::default();
        let record = Record::new(5_u64);

        let mut reader = Transaction::begin(&ctx, &global_epoch);
        assert_eq!(reader.read(&record).expect("read"), Some(5));

        // A competing commit lands between read and precommit.
        let mut writer = Transaction::begin(&ctx, &global_epoch);
        writer.write(&record, 6).expect("write");
        writer.precommit().expect("competing commit");

        reader.write(&record, 7).expect("write");
        assert_eq!(
            reader.precommit().expect_err("stale read set"),
            PrecommitAbort::WriteConflict
        );
        // The failed precommit released everything.
        assert!(!record.header().is_locked());
        let (_, value) = record.optimistic_read().expect("reread");
        assert_eq!(value, 6);
    }

    #[test]
    fn delete_stamps_the_deleted_flag() {
        let registry = ThreadRegistry::new(RegistryConfig::default());
        let ctx = registry.register().expect("context");
        let global_epoch = GlobalEpoch::default();
        let record = Record::new(5_u64);

        let mut tx = Transaction::begin(&ctx, &global_epoch);
        tx.delete(&record).expect("delete");
        tx.precommit().expect("commit");

        let version = record.header().version().load();
        assert!(version.is_deleted());
        assert!(version.is_valid());

        let mut observer = Transaction::begin(&ctx, &global_epoch);
        assert_eq!(observer.read(&record).expect("deleted read"), None);
    }

    #[test]
    fn displaced_read_aborts_for_re_resolution() {
        let registry = ThreadRegistry::new(RegistryConfig::default());
        let ctx = registry.register().expect("context");
        let global_epoch = GlobalEpoch::default();
        let record = Record::new(5_u64);

        let mut moved = VersionWord::zero();
        moved.set(Epoch::new(1), 1);
        moved.set_moved();
        record.header().version().store(moved);

        let mut tx = Transaction::begin(&ctx, &global_epoch);
        assert_eq!(
            tx.read(&record).expect_err("moved record"),
            PrecommitAbort::RecordDisplaced
        );
    }

    struct Relocation<'x> {
        target: &'x Record<u64>,
    }

    impl MovedRecordTracker<u64> for Relocation<'_> {
        fn track_moved(&self, _old: &Record<u64>) -> TrackMovedRecordResult {
            TrackMovedRecordResult::found(
                std::ptr::NonNull::from(self.target.header()),
                std::ptr::NonNull::new(self.target as *const _ as *mut u8).expect("non-null"),
            )
        }
    }

    #[test]
    fn precommit_follows_a_moved_record_to_its_new_home() {
        let registry = ThreadRegistry::new(RegistryConfig::default());
        let ctx = registry.register().expect("context");
        let global_epoch = GlobalEpoch::default();

        let old = Record::new(5_u64);
        let new = Record::new(5_u64);
        let mut displaced = VersionWord::zero();
        displaced.set(Epoch::new(1), 1);
        displaced.set_moved();
        old.header().version().store(displaced);

        let relocation = Relocation { target: &new };
        let mut tx = Transaction::with_tracker(&ctx, &global_epoch, &relocation);
        tx.write(&old, 9).expect("write");
        let committed = tx.precommit().expect("tracked commit");

        // The write landed at the new address; the old record is untouched.
        assert_eq!(new.header().version().load(), committed);
        let (_, value) = new.optimistic_read().expect("reread");
        assert_eq!(value, 9);
        assert!(old.header().version().load().is_moved());
    }

    struct NeverFound;

    impl MovedRecordTracker<u64> for NeverFound {
        fn track_moved(&self, _old: &Record<u64>) -> TrackMovedRecordResult {
            TrackMovedRecordResult::not_found()
        }
    }

    #[test]
    fn failed_tracking_aborts_as_displaced() {
        let registry = ThreadRegistry::new(RegistryConfig::default());
        let ctx = registry.register().expect("context");
        let global_epoch = GlobalEpoch::default();

        let record = Record::new(5_u64);
        let mut displaced = VersionWord::zero();
        displaced.set(Epoch::new(1), 1);
        displaced.set_next_layer();
        record.header().version().store(displaced);

        let tracker = NeverFound;
        let mut tx = Transaction::with_tracker(&ctx, &global_epoch, &tracker);
        tx.write(&record, 9).expect("write");
        assert_eq!(
            tx.precommit().expect_err("tracking failed"),
            PrecommitAbort::RecordDisplaced
        );
        assert!(!record.header().is_locked());
    }

    struct Carousel<'x> {
        records: &'x [Record<u64>],
        cursor: std::cell::Cell<usize>,
    }

    impl MovedRecordTracker<u64> for Carousel<'_> {
        fn track_moved(&self, _old: &Record<u64>) -> TrackMovedRecordResult {
            // Every resolution lands on yet another moved record.
            let calls = self.cursor.get();
            self.cursor.set(calls + 1);
            let target = &self.records[(calls + 1) % self.records.len()];
            TrackMovedRecordResult::found(
                std::ptr::NonNull::from(target.header()),
                std::ptr::NonNull::new(target as *const _ as *mut u8).expect("non-null"),
            )
        }
    }

    #[test]
    fn runaway_tracking_aborts_with_buffer_overflow() {
        let registry = ThreadRegistry::new(RegistryConfig::default());
        let ctx = registry.register().expect("context");
        let global_epoch = GlobalEpoch::default();

        let mut displaced = VersionWord::zero();
        displaced.set(Epoch::new(1), 1);
        displaced.set_moved();

        let records: Vec<Record<u64>> = (0..4).map(|_| Record::new(0)).collect();
        for record in &records {
            record.header().version().store(displaced);
        }

        let carousel = Carousel {
            records: &records,
            cursor: std::cell::Cell::new(0),
        };
        let mut tx = Transaction::with_tracker(&ctx, &global_epoch, &carousel);
        tx.write(&records[0], 9).expect("write");
        assert_eq!(
            tx.precommit().expect_err("tracking never settles"),
            PrecommitAbort::TrackBufferFull
        );
        assert_eq!(carousel.cursor.get(), MOVED_TRACK_CAPACITY);
    }

    #[test]
    fn write_set_overflow_is_a_distinct_abort() {
        let registry = ThreadRegistry::new(RegistryConfig::default());
        let ctx = registry.register().expect("context");
        let global_epoch = GlobalEpoch::default();
        let record = Record::new(0_u64);

        let mut tx = Transaction::begin(&ctx, &global_epoch);
        for i in 0..WRITE_SET_CAPACITY {
            tx.write(&record, i as u64).expect("buffered write");
        }
        assert_eq!(
            tx.write(&record, 0).expect_err("write set full"),
            PrecommitAbort::TrackBufferFull
        );
    }
}
