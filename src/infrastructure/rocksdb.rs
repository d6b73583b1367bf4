use crate::domain::ports::{LedgerStore, StoredRecord, WriteBatch};
use crate::domain::record::EntityKind;
use crate::error::{LedgerError, Result};
use async_trait::async_trait;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, Direction, IteratorMode, Options};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Width of the big-endian version prefix on every stored value.
const VERSION_PREFIX: usize = 8;

/// A persistent ledger store implementation using RocksDB.
///
/// Each entity kind lives in its own column family named after the kind. Values are
/// the record's version as 8 big-endian bytes followed by its JSON.
///
/// Commits are serialized through a mutex so expectation checks and the atomic
/// `WriteBatch` write cannot interleave with another commit.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<DB>`).
#[derive(Clone)]
pub struct RocksDBStore {
    db: Arc<DB>,
    commit_lock: Arc<Mutex<()>>,
}

impl RocksDBStore {
    /// Opens or creates a RocksDB instance at the specified path.
    ///
    /// Ensures that one column family per entity kind exists.
    ///
    /// # Arguments
    ///
    /// * `path` - The filesystem path where the database will be stored.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let descriptors = EntityKind::ALL
            .iter()
            .map(|kind| ColumnFamilyDescriptor::new(kind.as_str(), Options::default()))
            .collect::<Vec<_>>();

        let db = DB::open_cf_descriptors(&opts, path, descriptors)?;

        Ok(Self {
            db: Arc::new(db),
            commit_lock: Arc::new(Mutex::new(())),
        })
    }

    fn cf(&self, kind: EntityKind) -> Result<&ColumnFamily> {
        self.db.cf_handle(kind.as_str()).ok_or_else(|| {
            LedgerError::InternalError(Box::new(std::io::Error::other(format!(
                "{} column family not found",
                kind
            ))))
        })
    }

    fn current_version(&self, kind: EntityKind, key: &str) -> Result<Option<u64>> {
        let cf = self.cf(kind)?;
        match self.db.get_cf(cf, key.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?.version)),
            None => Ok(None),
        }
    }
}

fn encode(version: u64, bytes: &[u8]) -> Vec<u8> {
    let mut value = Vec::with_capacity(VERSION_PREFIX + bytes.len());
    value.extend_from_slice(&version.to_be_bytes());
    value.extend_from_slice(bytes);
    value
}

fn decode(value: &[u8]) -> Result<StoredRecord> {
    if value.len() < VERSION_PREFIX {
        return Err(LedgerError::InternalError(Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "stored value is shorter than its version prefix",
        ))));
    }
    let (prefix, bytes) = value.split_at(VERSION_PREFIX);
    let mut version = [0u8; VERSION_PREFIX];
    version.copy_from_slice(prefix);
    Ok(StoredRecord {
        version: u64::from_be_bytes(version),
        bytes: bytes.to_vec(),
    })
}

#[async_trait]
impl LedgerStore for RocksDBStore {
    async fn get(&self, kind: EntityKind, key: &str) -> Result<Option<StoredRecord>> {
        let cf = self.cf(kind)?;
        match self.db.get_cf(cf, key.as_bytes())? {
            Some(value) => Ok(Some(decode(&value)?)),
            None => Ok(None),
        }
    }

    async fn scan(&self, kind: EntityKind, prefix: &str) -> Result<Vec<StoredRecord>> {
        let cf = self.cf(kind)?;
        let iter = self.db.iterator_cf(
            cf,
            IteratorMode::From(prefix.as_bytes(), Direction::Forward),
        );

        let mut records = Vec::new();
        for item in iter {
            let (key, value) = item.map_err(|e| {
                LedgerError::InternalError(Box::new(std::io::Error::other(format!(
                    "RocksDB iteration error: {}",
                    e
                ))))
            })?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            records.push(decode(&value)?);
        }
        Ok(records)
    }

    async fn commit(&self, batch: WriteBatch) -> Result<()> {
        let _guard = self.commit_lock.lock().await;

        for op in batch.ops() {
            let current = self.current_version(op.kind, &op.key)?;
            if !op.expect.holds(current) {
                return Err(LedgerError::VersionConflict {
                    entity: op.kind.as_str(),
                    key: op.key.clone(),
                });
            }
        }

        let mut write = rocksdb::WriteBatch::default();
        for op in batch.ops() {
            let cf = self.cf(op.kind)?;
            write.put_cf(cf, op.key.as_bytes(), encode(op.version, &op.bytes));
        }
        self.db.write(write)?;
        Ok(())
    }
}
