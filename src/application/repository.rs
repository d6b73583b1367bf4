use crate::domain::ports::{Expect, LedgerStoreRef, WriteBatch, WriteOp};
use crate::domain::record::Record;
use crate::error::{LedgerError, Result};
use chrono::{DateTime, Utc};

/// Typed access to the ledger store.
///
/// Reads decode JSON into records and stamp them with the version the store holds;
/// writes are staged into a [`WriteBatch`] guarded by that version.
#[derive(Clone)]
pub struct Repository {
    store: LedgerStoreRef,
}

impl Repository {
    pub fn new(store: LedgerStoreRef) -> Self {
        Self { store }
    }

    pub async fn load<R: Record>(&self, key: &str) -> Result<Option<R>> {
        match self.store.get(R::KIND, key).await? {
            Some(stored) => {
                let mut record: R = serde_json::from_slice(&stored.bytes)?;
                record.meta_mut().version = stored.version;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    pub async fn require<R: Record>(&self, key: &str) -> Result<R> {
        self.load(key)
            .await?
            .ok_or_else(|| LedgerError::not_found(R::KIND.as_str(), key))
    }

    pub async fn exists<R: Record>(&self, key: &str) -> Result<bool> {
        Ok(self.store.get(R::KIND, key).await?.is_some())
    }

    /// All records of `R` whose key starts with `prefix`, in key order.
    pub async fn scan<R: Record>(&self, prefix: &str) -> Result<Vec<R>> {
        self.store
            .scan(R::KIND, prefix)
            .await?
            .into_iter()
            .map(|stored| {
                let mut record: R = serde_json::from_slice(&stored.bytes)?;
                record.meta_mut().version = stored.version;
                Ok(record)
            })
            .collect()
    }

    /// Bumps the record's version and adds its put to `batch`.
    ///
    /// A record that was never stored (version 0) must still be absent at commit time;
    /// any other record must still be at the version it was loaded with.
    pub fn stage<R: Record>(
        batch: &mut WriteBatch,
        record: &mut R,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let previous = record.meta().version;
        let expect = match previous {
            0 => Expect::Absent,
            v => Expect::Version(v),
        };
        let meta = record.meta_mut();
        meta.version = previous + 1;
        meta.updated_at = Some(now);

        batch.push(WriteOp {
            kind: R::KIND,
            key: record.key(),
            version: previous + 1,
            bytes: serde_json::to_vec(record)?,
            expect,
        });
        Ok(())
    }

    pub async fn commit(&self, batch: WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.store.commit(batch).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::money::Money;
    use crate::domain::payment::{NewPayment, Payment};
    use crate::infrastructure::in_memory::InMemoryLedgerStore;
    use std::sync::Arc;

    fn payment() -> Payment {
        Payment::authorize(
            NewPayment {
                order_id: 1,
                customer_id: 1,
                provider_id: 1,
                provider_tx_id: None,
                currency: "CLP".to_string(),
                amount_gross: Money::new(1000),
                fee: Money::new(10),
            },
            Utc::now(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_stage_and_reload() {
        let repo = Repository::new(Arc::new(InMemoryLedgerStore::new()));
        let mut p = payment();
        let mut batch = WriteBatch::new();
        Repository::stage(&mut batch, &mut p, Utc::now()).unwrap();
        repo.commit(batch).await.unwrap();

        let loaded: Payment = repo.require(&p.id.to_string()).await.unwrap();
        assert_eq!(loaded.meta.version, 1);
        assert_eq!(loaded.amount_net, Money::new(990));
    }

    #[tokio::test]
    async fn test_stale_write_is_rejected() {
        let repo = Repository::new(Arc::new(InMemoryLedgerStore::new()));
        let mut p = payment();
        let mut batch = WriteBatch::new();
        Repository::stage(&mut batch, &mut p, Utc::now()).unwrap();
        repo.commit(batch).await.unwrap();

        let mut first: Payment = repo.require(&p.id.to_string()).await.unwrap();
        let mut second = first.clone();

        let mut batch = WriteBatch::new();
        Repository::stage(&mut batch, &mut first, Utc::now()).unwrap();
        repo.commit(batch).await.unwrap();

        let mut batch = WriteBatch::new();
        Repository::stage(&mut batch, &mut second, Utc::now()).unwrap();
        let err = repo.commit(batch).await.unwrap_err();
        assert!(matches!(err, LedgerError::VersionConflict { .. }));
    }

    #[tokio::test]
    async fn test_require_missing() {
        let repo = Repository::new(Arc::new(InMemoryLedgerStore::new()));
        let err = repo.require::<Payment>("nope").await.unwrap_err();
        assert!(matches!(err, LedgerError::NotFound { .. }));
    }
}
