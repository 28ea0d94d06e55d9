//! The compare-and-swap row store underneath the local log.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use error_stack::Report;

use crate::error::StorageError;

/// Contents of one row: the serialized entry and its CAS token.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredRow {
    pub entry: Bytes,
    pub n: u64,
}

/// Synchronous key/value store with a conditional write.
///
/// Implementations may block; callers on an async runtime should go through
/// `spawn_blocking`.
pub trait CasStore: Send + Sync + 'static {
    /// # Errors
    /// Returns [`StorageError`] if the store cannot be read.
    fn get(&self, row: &[u8]) -> Result<Option<StoredRow>, Report<StorageError>>;

    /// Writes `new` only if the row's current token equals `expected_n`
    /// (`None` meaning the row must be absent). Returns whether the write
    /// happened.
    ///
    /// # Errors
    /// Returns [`StorageError`] if the store cannot be read or written.
    fn check_and_put(
        &self,
        row: &[u8],
        expected_n: Option<u64>,
        new: StoredRow,
    ) -> Result<bool, Report<StorageError>>;
}

impl<S: CasStore + ?Sized> CasStore for Arc<S> {
    fn get(&self, row: &[u8]) -> Result<Option<StoredRow>, Report<StorageError>> {
        (**self).get(row)
    }

    fn check_and_put(
        &self,
        row: &[u8],
        expected_n: Option<u64>,
        new: StoredRow,
    ) -> Result<bool, Report<StorageError>> {
        (**self).check_and_put(row, expected_n, new)
    }
}

#[derive(Default)]
struct MemoryInner {
    rows: Mutex<HashMap<Vec<u8>, StoredRow>>,
    unavailable: AtomicBool,
    writes: AtomicUsize,
}

/// In-memory [`CasStore`] for tests and single-process deployments.
///
/// Clones share the same rows. Can be switched into an unavailable mode
/// where every call fails.
#[derive(Clone, Default)]
pub struct MemoryCasStore {
    inner: Arc<MemoryInner>,
}

impl MemoryCasStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.inner.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Number of successful conditional writes so far.
    #[must_use]
    pub fn writes(&self) -> usize {
        self.inner.writes.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Vec<u8>, StoredRow>> {
        self.inner
            .rows
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn check_available(&self) -> Result<(), Report<StorageError>> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(Report::new(StorageError).attach("store marked unavailable"));
        }
        Ok(())
    }
}

impl CasStore for MemoryCasStore {
    fn get(&self, row: &[u8]) -> Result<Option<StoredRow>, Report<StorageError>> {
        self.check_available()?;
        Ok(self.lock().get(row).cloned())
    }

    fn check_and_put(
        &self,
        row: &[u8],
        expected_n: Option<u64>,
        new: StoredRow,
    ) -> Result<bool, Report<StorageError>> {
        self.check_available()?;
        let mut rows = self.lock();
        if rows.get(row).map(|r| r.n) != expected_n {
            return Ok(false);
        }
        rows.insert(row.to_vec(), new);
        self.inner.writes.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(n: u64) -> StoredRow {
        StoredRow {
            entry: Bytes::from_static(b"e"),
            n,
        }
    }

    #[test]
    fn absent_row_requires_none_token() {
        let store = MemoryCasStore::new();
        assert!(!store.check_and_put(b"k", Some(0), row(1)).unwrap());
        assert!(store.check_and_put(b"k", None, row(1)).unwrap());
        assert!(!store.check_and_put(b"k", None, row(2)).unwrap());
        assert!(store.check_and_put(b"k", Some(1), row(2)).unwrap());
        assert_eq!(store.get(b"k").unwrap(), Some(row(2)));
        assert_eq!(store.writes(), 2);
    }

    #[test]
    fn unavailable_store_errors() {
        let store = MemoryCasStore::new();
        store.set_available(false);
        assert!(store.get(b"k").is_err());
        assert!(store.check_and_put(b"k", None, row(1)).is_err());
        store.set_available(true);
        assert!(store.get(b"k").unwrap().is_none());
    }
}
