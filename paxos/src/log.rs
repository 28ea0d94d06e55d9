//! CAS-protected access to the Paxos state of individual log slots.

use std::hash::{BuildHasher, RandomState};
use std::sync::{Mutex, MutexGuard, PoisonError};

use error_stack::{Report, ResultExt};
use meridian_core::{EntityGroup, EntryStatus, Slot, SlotContext, WalEntry};
use tracing::{debug, instrument, trace, warn};

use crate::error::LogError;
use crate::store::{CasStore, StoredRow};

/// Conditional-write attempts made by [`LocalLog::prepare_local`] before giving up.
pub const MAX_PREPARE_TRIES: usize = 5;
/// Conditional-write attempts made by [`LocalLog::accept_local`] before giving up.
pub const MAX_ACCEPT_TRIES: usize = 5;

const STRIPES: usize = 64;

/// The local replica's write-ahead log.
///
/// Read-modify-write sequences on one slot are serialized in-process by a
/// striped lock; the store's conditional write guards against writers in
/// other processes.
pub struct LocalLog<S> {
    store: S,
    stripes: Box<[Mutex<()>]>,
    hasher: RandomState,
}

impl<S: CasStore> LocalLog<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            stripes: (0..STRIPES).map(|_| Mutex::new(())).collect(),
            hasher: RandomState::new(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn lock_row(&self, row: &[u8]) -> MutexGuard<'_, ()> {
        #[expect(clippy::cast_possible_truncation, reason = "only used to pick a stripe")]
        let stripe = self.hasher.hash_one(row) as usize % self.stripes.len();
        self.stripes[stripe]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn read_row(
        &self,
        slot: &Slot,
        row: &[u8],
    ) -> Result<Option<(WalEntry, u64)>, Report<LogError>> {
        let Some(stored) = self
            .store
            .get(row)
            .change_context(LogError::StorageUnavailable)
            .attach_with(|| SlotContext::new(slot))?
        else {
            return Ok(None);
        };
        let entry = WalEntry::from_bytes(&stored.entry)
            .change_context(LogError::CorruptEntry)
            .attach_with(|| SlotContext::new(slot))?;
        Ok(Some((entry, stored.n)))
    }

    fn write_row(
        &self,
        slot: &Slot,
        row: &[u8],
        expected_n: Option<u64>,
        entry: &WalEntry,
    ) -> Result<bool, Report<LogError>> {
        let new = StoredRow {
            entry: entry.to_bytes(),
            n: entry.n,
        };
        self.store
            .check_and_put(row, expected_n, new)
            .change_context(LogError::StorageUnavailable)
            .attach_with(|| SlotContext::new(slot))
    }

    /// Single linearizable read of a slot.
    ///
    /// # Errors
    /// [`LogError::StorageUnavailable`] or [`LogError::CorruptEntry`].
    pub fn read(&self, slot: &Slot) -> Result<Option<WalEntry>, Report<LogError>> {
        let row = slot.row_key();
        Ok(self.read_row(slot, &row)?.map(|(entry, _)| entry))
    }

    /// Records a promise for proposal `n`.
    ///
    /// Returns `None` when the promise was written. Returns the existing entry
    /// unchanged, writing nothing, when it is accepted or already promised to
    /// a proposal at least as high.
    ///
    /// # Errors
    /// [`LogError::TooConcurrent`] once [`MAX_PREPARE_TRIES`] conditional
    /// writes have lost, or a storage error.
    #[instrument(skip_all, fields(slot = %slot, n = n))]
    pub fn prepare_local(&self, slot: &Slot, n: u64) -> Result<Option<WalEntry>, Report<LogError>> {
        let row = slot.row_key();
        let _guard = self.lock_row(&row);
        let promise = WalEntry::promise(n);

        for attempt in 1..=MAX_PREPARE_TRIES {
            let existing = self.read_row(slot, &row)?;
            let expected_n = match existing {
                Some((entry, _)) if entry.status != EntryStatus::Prepared || entry.n >= n => {
                    debug!(existing_n = entry.n, status = ?entry.status, "prepare finds existing entry");
                    return Ok(Some(entry));
                }
                Some((_, token)) => Some(token),
                None => None,
            };

            if self.write_row(slot, &row, expected_n, &promise)? {
                trace!(attempt, "promise written");
                return Ok(None);
            }
            trace!(attempt, "prepare lost conditional write");
        }

        warn!("prepare exhausted retries");
        Err(Report::new(LogError::TooConcurrent)
            .attach(SlotContext::new(slot))
            .attach(format!("{MAX_PREPARE_TRIES} conditional writes lost")))
    }

    /// Writes `entry` unless the slot holds a strictly higher proposal.
    ///
    /// # Errors
    /// [`LogError::TooConcurrent`] once [`MAX_ACCEPT_TRIES`] conditional
    /// writes have lost, or a storage error.
    #[instrument(skip_all, fields(slot = %slot, n = entry.n))]
    pub fn accept_local(&self, slot: &Slot, entry: &WalEntry) -> Result<bool, Report<LogError>> {
        let row = slot.row_key();
        let _guard = self.lock_row(&row);

        for attempt in 1..=MAX_ACCEPT_TRIES {
            let existing = self.read_row(slot, &row)?;
            if let Some((current, _)) = &existing
                && current.n > entry.n
            {
                debug!(existing_n = current.n, "accept rejected by higher proposal");
                return Ok(false);
            }

            let expected_n = existing.map(|(_, token)| token);
            if self.write_row(slot, &row, expected_n, entry)? {
                trace!(attempt, "entry written");
                return Ok(true);
            }
            trace!(attempt, "accept lost conditional write");
        }

        warn!("accept exhausted retries");
        Err(Report::new(LogError::TooConcurrent)
            .attach(SlotContext::new(slot))
            .attach(format!("{MAX_ACCEPT_TRIES} conditional writes lost")))
    }

    /// First index at or after `from` whose slot holds no accepted entry.
    ///
    /// # Errors
    /// Any read error.
    pub fn first_unaccepted_index(
        &self,
        entity_group: &EntityGroup,
        from: u64,
    ) -> Result<u64, Report<LogError>> {
        let mut slot = Slot {
            entity_group: entity_group.clone(),
            wal_index: from,
        };
        while let Some(entry) = self.read(&slot)?
            && entry.is_accepted()
        {
            slot = slot.next();
        }
        Ok(slot.wal_index)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bytes::Bytes;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::error::StorageError;
    use crate::store::MemoryCasStore;

    fn value(s: &'static str) -> Option<Bytes> {
        Some(Bytes::from_static(s.as_bytes()))
    }

    fn seed(store: &MemoryCasStore, slot: &Slot, entry: &WalEntry) {
        let row = StoredRow {
            entry: entry.to_bytes(),
            n: entry.n,
        };
        assert!(store.check_and_put(&slot.row_key(), None, row).unwrap());
    }

    #[test]
    fn prepare_on_empty_slot_writes_promise() {
        let log = LocalLog::new(MemoryCasStore::new());
        let slot = Slot::new("eg", 0);

        assert_eq!(log.prepare_local(&slot, 3).unwrap(), None);
        assert_eq!(log.read(&slot).unwrap(), Some(WalEntry::promise(3)));
    }

    #[test]
    fn prepare_replaces_lower_promise() {
        let log = LocalLog::new(MemoryCasStore::new());
        let slot = Slot::new("eg", 0);

        assert_eq!(log.prepare_local(&slot, 1).unwrap(), None);
        assert_eq!(log.prepare_local(&slot, 2).unwrap(), None);
        assert_eq!(log.read(&slot).unwrap().unwrap().n, 2);
    }

    #[test]
    fn prepare_returns_accepted_entry_without_writing() {
        let store = MemoryCasStore::new();
        let slot = Slot::new("eg", 4);
        let accepted = WalEntry::accepted(7, value("chosen"));
        seed(&store, &slot, &accepted);
        let log = LocalLog::new(store.clone());

        assert_eq!(log.prepare_local(&slot, 9).unwrap(), Some(accepted.clone()));
        assert_eq!(log.prepare_local(&slot, 2).unwrap(), Some(accepted));
        assert_eq!(store.writes(), 1);
    }

    #[test]
    fn prepare_nacks_equal_or_higher_promise() {
        let store = MemoryCasStore::new();
        let slot = Slot::new("eg", 0);
        seed(&store, &slot, &WalEntry::promise(5));
        let log = LocalLog::new(store.clone());

        assert_eq!(log.prepare_local(&slot, 5).unwrap(), Some(WalEntry::promise(5)));
        assert_eq!(log.prepare_local(&slot, 4).unwrap(), Some(WalEntry::promise(5)));
        assert_eq!(store.writes(), 1);
    }

    #[test]
    fn accept_respects_higher_proposal() {
        let log = LocalLog::new(MemoryCasStore::new());
        let slot = Slot::new("eg", 0);
        log.prepare_local(&slot, 6).unwrap();

        assert!(!log.accept_local(&slot, &WalEntry::accepted(5, value("old"))).unwrap());
        assert!(log.accept_local(&slot, &WalEntry::accepted(6, value("new"))).unwrap());
        assert_eq!(log.read(&slot).unwrap(), Some(WalEntry::accepted(6, value("new"))));
    }

    #[test]
    fn accept_on_empty_slot() {
        let log = LocalLog::new(MemoryCasStore::new());
        let slot = Slot::new("eg", 0);
        assert!(log.accept_local(&slot, &WalEntry::accepted(1, None)).unwrap());
    }

    /// A store whose conditional writes always lose.
    #[derive(Default)]
    struct AlwaysConflicts {
        writes: AtomicUsize,
    }

    impl CasStore for AlwaysConflicts {
        fn get(&self, _row: &[u8]) -> Result<Option<StoredRow>, Report<StorageError>> {
            Ok(None)
        }

        fn check_and_put(
            &self,
            _row: &[u8],
            _expected_n: Option<u64>,
            _new: StoredRow,
        ) -> Result<bool, Report<StorageError>> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(false)
        }
    }

    #[test]
    fn prepare_gives_up_after_bounded_retries() {
        let store = Arc::new(AlwaysConflicts::default());
        let log = LocalLog::new(store.clone());

        let err = log.prepare_local(&Slot::new("eg", 0), 1).unwrap_err();
        assert_eq!(*err.current_context(), LogError::TooConcurrent);
        assert_eq!(store.writes.load(Ordering::SeqCst), MAX_PREPARE_TRIES);
    }

    #[test]
    fn accept_gives_up_after_bounded_retries() {
        let store = Arc::new(AlwaysConflicts::default());
        let log = LocalLog::new(store.clone());

        let err = log
            .accept_local(&Slot::new("eg", 0), &WalEntry::accepted(1, None))
            .unwrap_err();
        assert_eq!(*err.current_context(), LogError::TooConcurrent);
        assert_eq!(store.writes.load(Ordering::SeqCst), MAX_ACCEPT_TRIES);
    }

    #[test]
    fn unavailable_store_reports_storage_error() {
        let store = MemoryCasStore::new();
        store.set_available(false);
        let log = LocalLog::new(store);

        let err = log.prepare_local(&Slot::new("eg", 0), 1).unwrap_err();
        assert_eq!(*err.current_context(), LogError::StorageUnavailable);
    }

    #[test]
    fn corrupt_row_is_reported() {
        let store = MemoryCasStore::new();
        let slot = Slot::new("eg", 0);
        let junk = StoredRow {
            entry: Bytes::from_static(&[0xff, 0xff, 0xff]),
            n: 1,
        };
        store.check_and_put(&slot.row_key(), None, junk).unwrap();
        let log = LocalLog::new(store);

        let err = log.read(&slot).unwrap_err();
        assert_eq!(*err.current_context(), LogError::CorruptEntry);
    }

    #[test]
    fn first_unaccepted_index_skips_accepted_prefix() {
        let log = LocalLog::new(MemoryCasStore::new());
        let eg = EntityGroup::from("eg");
        for i in 0..3 {
            log.accept_local(&Slot::new(eg.clone(), i), &WalEntry::accepted(1, None))
                .unwrap();
        }
        log.prepare_local(&Slot::new(eg.clone(), 3), 1).unwrap();

        assert_eq!(log.first_unaccepted_index(&eg, 0).unwrap(), 3);
        assert_eq!(log.first_unaccepted_index(&eg, 5).unwrap(), 5);
    }

    /// Records every successful write so the per-row history can be checked.
    #[derive(Default)]
    struct Recording {
        inner: MemoryCasStore,
        history: Mutex<HashMap<Vec<u8>, Vec<StoredRow>>>,
    }

    impl CasStore for Recording {
        fn get(&self, row: &[u8]) -> Result<Option<StoredRow>, Report<StorageError>> {
            self.inner.get(row)
        }

        fn check_and_put(
            &self,
            row: &[u8],
            expected_n: Option<u64>,
            new: StoredRow,
        ) -> Result<bool, Report<StorageError>> {
            let mut history = self.history.lock().unwrap();
            let written = self.inner.check_and_put(row, expected_n, new.clone())?;
            if written {
                history.entry(row.to_vec()).or_default().push(new);
            }
            Ok(written)
        }
    }

    #[test]
    fn concurrent_proposers_never_regress_a_slot() {
        let store = Arc::new(Recording::default());
        let log = Arc::new(LocalLog::new(store.clone()));

        let handles: Vec<_> = (0..8u64)
            .map(|t| {
                let log = log.clone();
                std::thread::spawn(move || {
                    let mut rng = StdRng::seed_from_u64(t);
                    for _ in 0..200 {
                        let slot = Slot::new("eg", rng.random_range(0..4));
                        let n = rng.random_range(1..20);
                        if rng.random_bool(0.5) {
                            let _ = log.prepare_local(&slot, n);
                        } else {
                            let _ = log.accept_local(&slot, &WalEntry::accepted(n, None));
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let history = store.history.lock().unwrap();
        for writes in history.values() {
            let entries: Vec<WalEntry> = writes
                .iter()
                .map(|row| WalEntry::from_bytes(&row.entry).unwrap())
                .collect();
            for pair in entries.windows(2) {
                assert!(pair[1].n >= pair[0].n, "n regressed: {pair:?}");
                if pair[0].is_accepted() {
                    assert!(pair[1].n >= pair[0].n, "accepted overwritten by lower n");
                    assert!(pair[1].is_accepted(), "accepted entry replaced by promise");
                }
            }
        }
    }
}
