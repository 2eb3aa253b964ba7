//! Engine environment: atomic write batches and snapshot reads.

use std::path::Path;
use std::sync::Arc;

use redb::backends::InMemoryBackend;
use redb::{Database, ReadTransaction, ReadableTable};
use tracing::{debug, trace};

use crate::error::{StorageError, StorageResult};
use crate::range::KeyRange;
use crate::tables::SubDb;
use crate::MAX_KEY_LEN;

/// Name of the engine environment file inside the database directory.
const ENV_FILE: &str = "data.redb";

/// One operation inside a write batch.
#[derive(Debug, Clone)]
pub enum WriteOp {
    /// Insert or overwrite `key` in `sub`.
    Put {
        /// Target sub-database.
        sub: SubDb,
        /// Key bytes.
        key: Vec<u8>,
        /// Value bytes.
        value: Vec<u8>,
    },
    /// Delete `key` from `sub` if present.
    Del {
        /// Target sub-database.
        sub: SubDb,
        /// Key bytes.
        key: Vec<u8>,
    },
}

/// Handle to one engine environment.
///
/// Cheap to clone; all clones share the underlying environment. Writes
/// are serialized by the engine, reads are MVCC snapshots.
#[derive(Clone)]
pub struct Engine {
    db: Arc<Database>,
}

impl Engine {
    /// Opens or creates the environment under `dir`, creating the
    /// directory if absent. All sub-databases are pre-created so that
    /// snapshot reads never race table creation.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the
    /// environment cannot be opened (including when another process
    /// holds it).
    pub fn open(dir: &Path) -> StorageResult<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(ENV_FILE);
        let db = Database::create(&path)?;
        debug!(path = %path.display(), "opened engine environment");
        Self::ensure_tables(Self {
            db: Arc::new(db),
        })
    }

    /// Creates a fresh in-memory environment, used for dir-less
    /// databases and tests.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine rejects the backend.
    pub fn in_memory() -> StorageResult<Self> {
        let db = Database::builder().create_with_backend(InMemoryBackend::new())?;
        debug!("opened in-memory engine environment");
        Self::ensure_tables(Self {
            db: Arc::new(db),
        })
    }

    fn ensure_tables(engine: Engine) -> StorageResult<Engine> {
        let txn = engine.db.begin_write()?;
        for sub in SubDb::ALL {
            txn.open_table(sub.def())?;
        }
        txn.commit()?;
        Ok(engine)
    }

    /// Applies a batch of put/del operations in one write transaction
    /// and commits atomically. On error nothing reaches disk.
    ///
    /// # Errors
    ///
    /// Returns an error if any key exceeds [`MAX_KEY_LEN`] or the engine
    /// fails to apply or commit.
    pub fn write(&self, batch: &[WriteOp]) -> StorageResult<()> {
        for op in batch {
            let key = match op {
                WriteOp::Put { key, .. } | WriteOp::Del { key, .. } => key,
            };
            if key.len() > MAX_KEY_LEN {
                return Err(StorageError::KeyTooLarge {
                    len: key.len(),
                    max: MAX_KEY_LEN,
                });
            }
        }

        let txn = self.db.begin_write()?;
        {
            let mut tables = [
                txn.open_table(SubDb::Eav.def())?,
                txn.open_table(SubDb::Aev.def())?,
                txn.open_table(SubDb::Ave.def())?,
                txn.open_table(SubDb::Vae.def())?,
                txn.open_table(SubDb::Schema.def())?,
                txn.open_table(SubDb::Meta.def())?,
            ];
            for op in batch {
                match op {
                    WriteOp::Put { sub, key, value } => {
                        tables[sub.slot()].insert(key.as_slice(), value.as_slice())?;
                    }
                    WriteOp::Del { sub, key } => {
                        tables[sub.slot()].remove(key.as_slice())?;
                    }
                }
            }
        }
        txn.commit()?;
        trace!(ops = batch.len(), "committed write batch");
        Ok(())
    }

    /// Begins an MVCC read snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot begin a read transaction.
    pub fn snapshot(&self) -> StorageResult<Snapshot> {
        Ok(Snapshot {
            txn: self.db.begin_read()?,
        })
    }
}

/// A consistent read-only view of the environment.
pub struct Snapshot {
    txn: ReadTransaction,
}

impl Snapshot {
    /// Point lookup.
    ///
    /// # Errors
    ///
    /// Returns an error on engine failure.
    pub fn get(&self, sub: SubDb, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        let table = self.txn.open_table(sub.def())?;
        Ok(table.get(key)?.map(|guard| guard.value().to_vec()))
    }

    /// Lazy cursor over `range` in `sub`, ascending by key, or
    /// descending when `backward` is set.
    ///
    /// # Errors
    ///
    /// Returns an error if the range cannot be positioned.
    pub fn scan(&self, sub: SubDb, range: &KeyRange, backward: bool) -> StorageResult<ScanIter> {
        let table = self.txn.open_table(sub.def())?;
        let inner = table.range::<&[u8]>(range.bounds())?;
        Ok(ScanIter { inner, backward })
    }

    /// First entry of `range` in scan order, or `None` if empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the range cannot be positioned or read.
    pub fn first(
        &self,
        sub: SubDb,
        range: &KeyRange,
        backward: bool,
    ) -> StorageResult<Option<(Vec<u8>, Vec<u8>)>> {
        self.scan(sub, range, backward)?.next().transpose()
    }
}

/// Cursor-backed iterator over one range scan.
///
/// Yields owned `(key, value)` byte pairs; the underlying pages stay
/// pinned by the snapshot for the iterator's lifetime.
pub struct ScanIter {
    inner: redb::Range<'static, &'static [u8], &'static [u8]>,
    backward: bool,
}

impl Iterator for ScanIter {
    type Item = StorageResult<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        let step = if self.backward {
            self.inner.next_back()
        } else {
            self.inner.next()
        };
        step.map(|res| {
            res.map(|(k, v)| (k.value().to_vec(), v.value().to_vec()))
                .map_err(StorageError::from)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(sub: SubDb, key: &[u8], value: &[u8]) -> WriteOp {
        WriteOp::Put {
            sub,
            key: key.to_vec(),
            value: value.to_vec(),
        }
    }

    #[test]
    fn write_then_read_back() {
        let engine = Engine::in_memory().unwrap();
        engine
            .write(&[put(SubDb::Eav, b"k1", b"v1"), put(SubDb::Meta, b"k1", b"m1")])
            .unwrap();

        let snap = engine.snapshot().unwrap();
        assert_eq!(snap.get(SubDb::Eav, b"k1").unwrap(), Some(b"v1".to_vec()));
        assert_eq!(snap.get(SubDb::Meta, b"k1").unwrap(), Some(b"m1".to_vec()));
        assert_eq!(snap.get(SubDb::Aev, b"k1").unwrap(), None);
    }

    #[test]
    fn delete_removes_entry() {
        let engine = Engine::in_memory().unwrap();
        engine.write(&[put(SubDb::Eav, b"k", b"v")]).unwrap();
        engine
            .write(&[WriteOp::Del {
                sub: SubDb::Eav,
                key: b"k".to_vec(),
            }])
            .unwrap();
        let snap = engine.snapshot().unwrap();
        assert_eq!(snap.get(SubDb::Eav, b"k").unwrap(), None);
    }

    #[test]
    fn scan_orders_and_reverses() {
        let engine = Engine::in_memory().unwrap();
        engine
            .write(&[
                put(SubDb::Ave, b"b", b"2"),
                put(SubDb::Ave, b"a", b"1"),
                put(SubDb::Ave, b"c", b"3"),
            ])
            .unwrap();

        let snap = engine.snapshot().unwrap();
        let forward: Vec<_> = snap
            .scan(SubDb::Ave, &KeyRange::All, false)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(
            forward.iter().map(|(k, _)| k.clone()).collect::<Vec<_>>(),
            vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]
        );

        let backward: Vec<_> = snap
            .scan(SubDb::Ave, &KeyRange::All, true)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(
            backward.iter().map(|(k, _)| k.clone()).collect::<Vec<_>>(),
            vec![b"c".to_vec(), b"b".to_vec(), b"a".to_vec()]
        );
    }

    #[test]
    fn range_kinds_bound_correctly() {
        let engine = Engine::in_memory().unwrap();
        let keys: Vec<Vec<u8>> = (1u8..=5).map(|b| vec![b]).collect();
        let batch: Vec<WriteOp> = keys.iter().map(|k| put(SubDb::Eav, k, b"")).collect();
        engine.write(&batch).unwrap();

        let snap = engine.snapshot().unwrap();
        let collect = |range: KeyRange| -> Vec<Vec<u8>> {
            snap.scan(SubDb::Eav, &range, false)
                .unwrap()
                .map(|r| r.unwrap().0)
                .collect()
        };

        assert_eq!(collect(KeyRange::AtLeast(vec![3])), vec![vec![3], vec![4], vec![5]]);
        assert_eq!(collect(KeyRange::GreaterThan(vec![3])), vec![vec![4], vec![5]]);
        assert_eq!(collect(KeyRange::AtMost(vec![2])), vec![vec![1], vec![2]]);
        assert_eq!(collect(KeyRange::LessThan(vec![2])), vec![vec![1]]);
        assert_eq!(collect(KeyRange::Closed(vec![2], vec![4])), vec![vec![2], vec![3], vec![4]]);
        assert_eq!(collect(KeyRange::ClosedOpen(vec![2], vec![4])), vec![vec![2], vec![3]]);
        assert_eq!(collect(KeyRange::Open(vec![2], vec![4])), vec![vec![3]]);
        assert_eq!(collect(KeyRange::OpenClosed(vec![2], vec![4])), vec![vec![3], vec![4]]);
    }

    #[test]
    fn oversized_key_rejected() {
        let engine = Engine::in_memory().unwrap();
        let err = engine
            .write(&[put(SubDb::Eav, &vec![0u8; MAX_KEY_LEN + 1], b"")])
            .unwrap_err();
        assert!(matches!(err, StorageError::KeyTooLarge { .. }));
    }

    #[test]
    fn snapshot_is_isolated_from_later_writes() {
        let engine = Engine::in_memory().unwrap();
        engine.write(&[put(SubDb::Eav, b"k", b"old")]).unwrap();

        let snap = engine.snapshot().unwrap();
        engine.write(&[put(SubDb::Eav, b"k", b"new")]).unwrap();

        assert_eq!(snap.get(SubDb::Eav, b"k").unwrap(), Some(b"old".to_vec()));
        let fresh = engine.snapshot().unwrap();
        assert_eq!(fresh.get(SubDb::Eav, b"k").unwrap(), Some(b"new".to_vec()));
    }

    #[test]
    fn reopen_preserves_data() {
        let dir = tempfile::tempdir().unwrap();
        {
            let engine = Engine::open(dir.path()).unwrap();
            engine.write(&[put(SubDb::Meta, b"version", b"1")]).unwrap();
        }
        let engine = Engine::open(dir.path()).unwrap();
        let snap = engine.snapshot().unwrap();
        assert_eq!(
            snap.get(SubDb::Meta, b"version").unwrap(),
            Some(b"1".to_vec())
        );
    }
}
