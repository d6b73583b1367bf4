use super::context::LedgerContext;
use super::repository::Repository;
use crate::domain::event::{EventType, LedgerEvent, ResourceRef, ResourceType};
use crate::domain::gift_card::{
    GiftCard, GiftCardAudit, GiftCardCode, GiftCardStatus, GiftCardTransaction,
    TransactionRequest, generate_code, transaction_prefix,
};
use crate::domain::money::Amount;
use crate::domain::ports::WriteBatch;
use crate::domain::record::{EntityKind, RecordMeta};
use crate::error::{LedgerError, Result};
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

/// Attempts at drawing an unused code before giving up.
const CODE_ATTEMPTS: usize = 8;

/// Stored-value cards and their append-only transaction log.
#[derive(Clone)]
pub struct GiftCardService {
    ctx: LedgerContext,
}

impl GiftCardService {
    pub fn new(ctx: LedgerContext) -> Self {
        Self { ctx }
    }

    /// Issues a card under a freshly drawn unique code.
    pub async fn issue(
        &self,
        initial_balance: Amount,
        expires_at: Option<DateTime<Utc>>,
        issued_to_customer_id: Option<u64>,
    ) -> Result<GiftCard> {
        for _ in 0..CODE_ATTEMPTS {
            let now = self.ctx.clock.now();
            let code = generate_code(&mut rand::thread_rng());
            let mut card = GiftCard::issue(
                code.clone(),
                initial_balance,
                expires_at,
                issued_to_customer_id,
                now,
            )?;
            let mut index = GiftCardCode {
                code,
                gift_card_id: card.id,
                meta: RecordMeta::default(),
            };

            let mut batch = WriteBatch::new();
            Repository::stage(&mut batch, &mut card, now)?;
            Repository::stage(&mut batch, &mut index, now)?;
            match self.ctx.repo.commit(batch).await {
                Ok(()) => {
                    info!(gift_card_id = %card.id, balance = %card.balance, "gift card issued");
                    return Ok(card);
                }
                Err(LedgerError::VersionConflict { .. }) => {
                    warn!("gift card code collision, drawing another");
                }
                Err(e) => return Err(e),
            }
        }
        Err(LedgerError::InternalError(Box::new(std::io::Error::other(
            "could not draw an unused gift card code",
        ))))
    }

    /// Applies one transaction: validate, append the entry, update the cached balance.
    /// The entry and the card are written in one atomic batch.
    pub async fn apply(
        &self,
        card_id: Uuid,
        request: TransactionRequest,
    ) -> Result<GiftCardTransaction> {
        let _guard = self.ctx.locks.lock(EntityKind::GiftCard, card_id).await;
        let now = self.ctx.clock.now();
        let mut card: GiftCard = self.ctx.repo.require(&card_id.to_string()).await?;
        let mut tx = card.apply(&request, now)?;

        let mut batch = WriteBatch::new();
        Repository::stage(&mut batch, &mut card, now)?;
        Repository::stage(&mut batch, &mut tx, now)?;
        let event = LedgerEvent::new(
            EventType::GiftCardTransaction,
            ResourceRef::new(ResourceType::GiftCard, card.id),
            now,
            json!({
                "transaction_id": tx.id,
                "sequence": tx.sequence,
                "transaction_type": tx.transaction_type,
                "amount": tx.amount,
                "balance_after": tx.balance_after,
                "order_id": tx.order_id,
                "status": card.status,
            }),
        );
        self.ctx.outbox.stage(&mut batch, &[event], now).await?;
        self.ctx.repo.commit(batch).await?;

        info!(
            gift_card_id = %card.id,
            sequence = tx.sequence,
            kind = ?tx.transaction_type,
            amount = %tx.amount,
            balance = %tx.balance_after,
            "gift card transaction applied"
        );
        Ok(tx)
    }

    pub async fn activate(&self, card_id: Uuid) -> Result<GiftCard> {
        self.update(card_id, |card, now| card.activate(now)).await
    }

    pub async fn deactivate(&self, card_id: Uuid) -> Result<GiftCard> {
        self.update(card_id, |card, _| card.deactivate()).await
    }

    /// Moves every card past its expiry to `expired`. Returns the ids that changed.
    pub async fn expire_due(&self) -> Result<Vec<Uuid>> {
        let now = self.ctx.clock.now();
        let cards: Vec<GiftCard> = self.ctx.repo.scan("").await?;
        let mut expired = Vec::new();
        for candidate in cards
            .into_iter()
            .filter(|c| c.status != GiftCardStatus::Expired && c.is_past_expiry(now))
        {
            let _guard = self.ctx.locks.lock(EntityKind::GiftCard, candidate.id).await;
            let mut card: GiftCard = self.ctx.repo.require(&candidate.id.to_string()).await?;
            if card.expire(now) {
                let mut batch = WriteBatch::new();
                Repository::stage(&mut batch, &mut card, now)?;
                self.ctx.repo.commit(batch).await?;
                expired.push(card.id);
            }
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "gift cards expired");
        }
        Ok(expired)
    }

    async fn update<F>(&self, card_id: Uuid, apply: F) -> Result<GiftCard>
    where
        F: FnOnce(&mut GiftCard, DateTime<Utc>) -> Result<()>,
    {
        let _guard = self.ctx.locks.lock(EntityKind::GiftCard, card_id).await;
        let now = self.ctx.clock.now();
        let mut card: GiftCard = self.ctx.repo.require(&card_id.to_string()).await?;
        let from = card.status;
        apply(&mut card, now)?;

        let mut batch = WriteBatch::new();
        Repository::stage(&mut batch, &mut card, now)?;
        self.ctx.repo.commit(batch).await?;
        info!(gift_card_id = %card.id, %from, to = %card.status, "gift card status changed");
        Ok(card)
    }

    pub async fn get(&self, card_id: Uuid) -> Result<Option<GiftCard>> {
        self.ctx.repo.load(&card_id.to_string()).await
    }

    pub async fn find_by_code(&self, code: &str) -> Result<Option<GiftCard>> {
        let normalized = code.trim().to_ascii_uppercase();
        match self.ctx.repo.load::<GiftCardCode>(&normalized).await? {
            Some(index) => self.get(index.gift_card_id).await,
            None => Ok(None),
        }
    }

    pub async fn list(&self) -> Result<Vec<GiftCard>> {
        self.ctx.repo.scan("").await
    }

    pub async fn transactions(&self, card_id: Uuid) -> Result<Vec<GiftCardTransaction>> {
        self.ctx.repo.scan(&transaction_prefix(card_id)).await
    }

    /// Replays the card's log from its initial balance and compares with the cache.
    pub async fn audit(&self, card_id: Uuid) -> Result<GiftCardAudit> {
        let card: GiftCard = self.ctx.repo.require(&card_id.to_string()).await?;
        let transactions = self.transactions(card_id).await?;
        Ok(GiftCardAudit::replay(&card, &transactions))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::money::Money;
    use crate::domain::ports::Clock;
    use crate::infrastructure::clock::ManualClock;
    use crate::infrastructure::in_memory::InMemoryLedgerStore;
    use chrono::Duration;
    use std::sync::Arc;

    fn service(clock: ManualClock) -> GiftCardService {
        GiftCardService::new(LedgerContext::new(
            Arc::new(InMemoryLedgerStore::new()),
            Arc::new(clock),
        ))
    }

    #[tokio::test]
    async fn test_rejected_spend_leaves_card_untouched() {
        let cards = service(ManualClock::new(Utc::now()));
        let card = cards.issue(Amount::new(20000).unwrap(), None, None).await.unwrap();

        let tx = cards
            .apply(card.id, TransactionRequest::spend(Money::new(15000)))
            .await
            .unwrap();
        assert_eq!(tx.balance_after, Money::new(5000));

        let err = cards
            .apply(card.id, TransactionRequest::spend(Money::new(6000)))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientBalance { .. }));

        let stored = cards.get(card.id).await.unwrap().unwrap();
        assert_eq!(stored.balance, Money::new(5000));
        assert_eq!(cards.transactions(card.id).await.unwrap().len(), 1);
        assert!(cards.audit(card.id).await.unwrap().consistent);
    }

    #[tokio::test]
    async fn test_find_by_code() {
        let cards = service(ManualClock::new(Utc::now()));
        let card = cards.issue(Amount::new(500).unwrap(), None, Some(9)).await.unwrap();
        let found = cards
            .find_by_code(&card.code.to_lowercase())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, card.id);
        assert!(cards.find_by_code("NOPE").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expire_due_sweep() {
        let clock = ManualClock::new(Utc::now());
        let cards = service(clock.clone());
        let short = cards
            .issue(Amount::new(500).unwrap(), Some(clock.now() + Duration::days(1)), None)
            .await
            .unwrap();
        let long = cards
            .issue(Amount::new(500).unwrap(), Some(clock.now() + Duration::days(30)), None)
            .await
            .unwrap();

        clock.advance(Duration::days(2));
        let expired = cards.expire_due().await.unwrap();
        assert_eq!(expired, vec![short.id]);

        let err = cards
            .apply(short.id, TransactionRequest::spend(Money::new(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::CardNotUsable { .. }));
        assert!(cards
            .apply(long.id, TransactionRequest::spend(Money::new(1)))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_deactivate_blocks_spend() {
        let cards = service(ManualClock::new(Utc::now()));
        let card = cards.issue(Amount::new(500).unwrap(), None, None).await.unwrap();
        cards.deactivate(card.id).await.unwrap();
        assert!(cards
            .apply(card.id, TransactionRequest::spend(Money::new(1)))
            .await
            .is_err());
        cards.activate(card.id).await.unwrap();
        assert!(cards
            .apply(card.id, TransactionRequest::spend(Money::new(1)))
            .await
            .is_ok());
    }
}
