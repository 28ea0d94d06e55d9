//! Durable CAS store using fjall.

use std::path::Path;
use std::sync::{Mutex, PoisonError};

use bytes::Bytes;
use error_stack::{Report, ResultExt};
use fjall::{Database, Keyspace, KeyspaceCreateOptions, PersistMode};
use meridian_paxos::{CasStore, StorageError, StoredRow};

/// Slot rows in one fjall keyspace.
///
/// Each value is the 8-byte big-endian proposal number followed by the
/// serialized entry. Conditional writes are serialized by a store-wide lock
/// and fsynced before returning.
pub struct FjallCasStore {
    db: Database,
    rows: Keyspace,
    write_lock: Mutex<()>,
}

impl FjallCasStore {
    /// # Errors
    /// Fails if the database cannot be opened at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, Report<StorageError>> {
        let path = path.as_ref().to_owned();
        tokio::task::spawn_blocking(move || Self::open_sync(&path))
            .await
            .change_context(StorageError)
            .attach("open task failed")?
    }

    /// # Errors
    /// Fails if the database cannot be opened at `path`.
    pub fn open_sync(path: &Path) -> Result<Self, Report<StorageError>> {
        let db = Database::builder(path)
            .open()
            .change_context(StorageError)
            .attach_with(|| format!("opening {}", path.display()))?;
        let rows = db
            .keyspace("wal", KeyspaceCreateOptions::default)
            .change_context(StorageError)?;
        Ok(Self {
            db,
            rows,
            write_lock: Mutex::new(()),
        })
    }

    fn pack(row: &StoredRow) -> Vec<u8> {
        let mut value = Vec::with_capacity(8 + row.entry.len());
        value.extend_from_slice(&row.n.to_be_bytes());
        value.extend_from_slice(&row.entry);
        value
    }

    fn unpack(value: &[u8]) -> Result<StoredRow, Report<StorageError>> {
        let Some((n, entry)) = value.split_first_chunk::<8>() else {
            return Err(Report::new(StorageError).attach("row shorter than its token"));
        };
        Ok(StoredRow {
            n: u64::from_be_bytes(*n),
            entry: Bytes::copy_from_slice(entry),
        })
    }
}

impl CasStore for FjallCasStore {
    fn get(&self, row: &[u8]) -> Result<Option<StoredRow>, Report<StorageError>> {
        self.rows
            .get(row)
            .change_context(StorageError)?
            .map(|value| Self::unpack(&value))
            .transpose()
    }

    fn check_and_put(
        &self,
        row: &[u8],
        expected_n: Option<u64>,
        new: StoredRow,
    ) -> Result<bool, Report<StorageError>> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.get(row)?.map(|r| r.n);
        if current != expected_n {
            return Ok(false);
        }
        let value = Self::pack(&new);
        self.rows.insert(row, &value).change_context(StorageError)?;
        self.db
            .persist(PersistMode::SyncAll)
            .change_context(StorageError)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use meridian_core::{Slot, WalEntry};
    use meridian_paxos::LocalLog;

    use super::*;

    fn row(n: u64) -> StoredRow {
        StoredRow {
            entry: Bytes::from_static(b"entry"),
            n,
        }
    }

    #[test]
    fn conditional_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = FjallCasStore::open_sync(dir.path()).unwrap();

        assert!(store.check_and_put(b"k", None, row(1)).unwrap());
        assert!(!store.check_and_put(b"k", None, row(2)).unwrap());
        assert!(!store.check_and_put(b"k", Some(7), row(2)).unwrap());
        assert!(store.check_and_put(b"k", Some(1), row(2)).unwrap());
        assert_eq!(store.get(b"k").unwrap(), Some(row(2)));
        assert_eq!(store.get(b"missing").unwrap(), None);
    }

    #[tokio::test]
    async fn entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let slot = Slot::new("users", 3);
        let entry = WalEntry::accepted(2, Some(Bytes::from_static(b"durable")));

        {
            let log = LocalLog::new(FjallCasStore::open(dir.path()).await.unwrap());
            assert!(log.accept_local(&slot, &entry).unwrap());
        }

        let log = LocalLog::new(FjallCasStore::open(dir.path()).await.unwrap());
        assert_eq!(log.read(&slot).unwrap(), Some(entry));
    }

    #[test]
    fn short_row_is_an_error() {
        assert!(FjallCasStore::unpack(&[1, 2, 3]).is_err());
    }
}
