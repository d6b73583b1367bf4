use crate::domain::ports::{LedgerStore, StoredRecord, WriteBatch};
use crate::domain::record::EntityKind;
use crate::error::{LedgerError, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

type Keyspace = BTreeMap<String, StoredRecord>;

/// A thread-safe in-memory ledger store.
///
/// One ordered map per entity kind behind a single `RwLock`, so a batch commit checks
/// and applies every put under one write guard. Ideal for tests and one-shot CLI runs.
#[derive(Default, Clone)]
pub struct InMemoryLedgerStore {
    keyspaces: Arc<RwLock<HashMap<EntityKind, Keyspace>>>,
}

impl InMemoryLedgerStore {
    /// Creates a new, empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn get(&self, kind: EntityKind, key: &str) -> Result<Option<StoredRecord>> {
        let keyspaces = self.keyspaces.read().await;
        Ok(keyspaces.get(&kind).and_then(|ks| ks.get(key)).cloned())
    }

    async fn scan(&self, kind: EntityKind, prefix: &str) -> Result<Vec<StoredRecord>> {
        let keyspaces = self.keyspaces.read().await;
        Ok(keyspaces
            .get(&kind)
            .map(|ks| {
                ks.range(prefix.to_string()..)
                    .take_while(|(key, _)| key.starts_with(prefix))
                    .map(|(_, record)| record.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn commit(&self, batch: WriteBatch) -> Result<()> {
        let mut keyspaces = self.keyspaces.write().await;

        for op in batch.ops() {
            let current = keyspaces
                .get(&op.kind)
                .and_then(|ks| ks.get(&op.key))
                .map(|r| r.version);
            if !op.expect.holds(current) {
                return Err(LedgerError::VersionConflict {
                    entity: op.kind.as_str(),
                    key: op.key.clone(),
                });
            }
        }

        for op in batch.into_ops() {
            keyspaces.entry(op.kind).or_default().insert(
                op.key,
                StoredRecord {
                    version: op.version,
                    bytes: op.bytes,
                },
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{Expect, WriteOp};

    fn put(kind: EntityKind, key: &str, version: u64, expect: Expect) -> WriteOp {
        WriteOp {
            kind,
            key: key.to_string(),
            version,
            bytes: format!("{{\"v\":{}}}", version).into_bytes(),
            expect,
        }
    }

    #[tokio::test]
    async fn test_commit_and_get() {
        let store = InMemoryLedgerStore::new();
        let mut batch = WriteBatch::new();
        batch.push(put(EntityKind::Payment, "p1", 1, Expect::Absent));
        store.commit(batch).await.unwrap();

        let record = store.get(EntityKind::Payment, "p1").await.unwrap().unwrap();
        assert_eq!(record.version, 1);
        assert!(store.get(EntityKind::Refund, "p1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_expectation_applies_nothing() {
        let store = InMemoryLedgerStore::new();
        let mut batch = WriteBatch::new();
        batch.push(put(EntityKind::Payment, "p1", 1, Expect::Absent));
        store.commit(batch).await.unwrap();

        let mut batch = WriteBatch::new();
        batch.push(put(EntityKind::Refund, "r1", 1, Expect::Absent));
        batch.push(put(EntityKind::Payment, "p1", 1, Expect::Absent));
        let err = store.commit(batch).await.unwrap_err();

        assert!(matches!(err, LedgerError::VersionConflict { .. }));
        assert!(store.get(EntityKind::Refund, "r1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_scan_by_prefix_is_ordered() {
        let store = InMemoryLedgerStore::new();
        let mut batch = WriteBatch::new();
        for key in ["card-b/002", "card-a/002", "card-a/001", "card-c/001"] {
            batch.push(put(EntityKind::GiftCardTransaction, key, 1, Expect::Absent));
        }
        store.commit(batch).await.unwrap();

        let found = store
            .scan(EntityKind::GiftCardTransaction, "card-a/")
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
        let all = store
            .scan(EntityKind::GiftCardTransaction, "")
            .await
            .unwrap();
        assert_eq!(all.len(), 4);
    }
}
