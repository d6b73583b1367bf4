use super::context::LedgerContext;
use super::repository::Repository;
use crate::domain::chargeback::{Chargeback, ChargebackStage};
use crate::domain::event::{EventType, LedgerEvent, ResourceRef, ResourceType};
use crate::domain::money::{Amount, Money};
use crate::domain::payment::{DebitSource, Payment, PaymentEntry, PaymentStatus, entry_key};
use crate::domain::ports::WriteBatch;
use crate::domain::record::EntityKind;
use crate::error::{LedgerError, Result};
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

/// Details supplied when a provider notifies us of a dispute.
#[derive(Debug, Clone)]
pub struct OpenChargeback {
    pub payment_id: Uuid,
    pub case_id: String,
    pub amount: Amount,
    pub deadline_at: Option<DateTime<Utc>>,
    pub evidence_links: Vec<String>,
    pub notes: Option<String>,
}

/// Dispute tracking. A lost case debits the payment through its ledger.
#[derive(Clone)]
pub struct ChargebackService {
    ctx: LedgerContext,
}

impl ChargebackService {
    pub fn new(ctx: LedgerContext) -> Self {
        Self { ctx }
    }

    pub async fn open(&self, request: OpenChargeback) -> Result<Chargeback> {
        let _guard = self
            .ctx
            .locks
            .lock_many(vec![
                (EntityKind::Payment, request.payment_id.to_string()),
                (EntityKind::Chargeback, format!("case:{}", request.case_id)),
            ])
            .await;
        let now = self.ctx.clock.now();
        let payment: Payment = self
            .ctx
            .repo
            .require(&request.payment_id.to_string())
            .await?;

        let existing: Vec<Chargeback> = self.ctx.repo.scan("").await?;
        if existing.iter().any(|c| c.case_id == request.case_id) {
            return Err(LedgerError::ValidationError(format!(
                "chargeback case '{}' already recorded",
                request.case_id
            )));
        }
        if existing
            .iter()
            .any(|c| c.payment_id == payment.id && c.is_open())
        {
            return Err(LedgerError::ActiveChargebackExists);
        }

        let mut chargeback = Chargeback::open(
            &payment,
            request.case_id,
            request.amount,
            request.deadline_at,
            now,
        )?;
        chargeback.evidence_links = request.evidence_links;
        chargeback.notes = request.notes;

        let mut batch = WriteBatch::new();
        Repository::stage(&mut batch, &mut chargeback, now)?;
        self.ctx.repo.commit(batch).await?;

        info!(chargeback_id = %chargeback.id, case_id = %chargeback.case_id, payment_id = %payment.id, amount = %chargeback.amount, "chargeback opened");
        Ok(chargeback)
    }

    /// Moves the case forward, or straight to `won`/`lost`.
    ///
    /// Losing records a compensating debit on the payment, capped at what is left of
    /// it, in the same batch as the stage change.
    pub async fn advance(
        &self,
        chargeback_id: Uuid,
        to: ChargebackStage,
        operator: &str,
        new_deadline: Option<DateTime<Utc>>,
    ) -> Result<Chargeback> {
        let probe: Chargeback = self.ctx.repo.require(&chargeback_id.to_string()).await?;
        let _guard = self
            .ctx
            .locks
            .lock_many(vec![
                (EntityKind::Payment, probe.payment_id.to_string()),
                (EntityKind::Chargeback, chargeback_id.to_string()),
            ])
            .await;
        let now = self.ctx.clock.now();
        let mut chargeback: Chargeback =
            self.ctx.repo.require(&chargeback_id.to_string()).await?;
        let from = chargeback.stage;
        chargeback.advance(to, operator, new_deadline, now)?;

        let mut batch = WriteBatch::new();
        let mut events = vec![self.event(&chargeback, EventType::ChargebackStageChanged, from, Money::ZERO, now)];

        if to == ChargebackStage::Lost {
            let debited = self.stage_loss(&mut batch, &chargeback, now).await?;
            events.push(self.event(&chargeback, EventType::ChargebackLost, from, debited, now));
        }

        Repository::stage(&mut batch, &mut chargeback, now)?;
        self.ctx.outbox.stage(&mut batch, &events, now).await?;
        self.ctx.repo.commit(batch).await?;

        info!(chargeback_id = %chargeback.id, %from, to = %chargeback.stage, operator, "chargeback stage changed");
        Ok(chargeback)
    }

    async fn stage_loss(
        &self,
        batch: &mut WriteBatch,
        chargeback: &Chargeback,
        now: DateTime<Utc>,
    ) -> Result<Money> {
        let mut payment: Payment = self
            .ctx
            .repo
            .require(&chargeback.payment_id.to_string())
            .await?;
        if payment.status != PaymentStatus::Captured {
            warn!(chargeback_id = %chargeback.id, payment_status = %payment.status, "lost chargeback on non-captured payment, no debit recorded");
            return Ok(Money::ZERO);
        }
        if self
            .ctx
            .repo
            .exists::<PaymentEntry>(&entry_key(payment.id, chargeback.id))
            .await?
        {
            return Ok(Money::ZERO);
        }

        let remaining = payment.refundable_remainder();
        let amount = chargeback.amount.min(remaining);
        if amount < chargeback.amount {
            warn!(chargeback_id = %chargeback.id, disputed = %chargeback.amount, debited = %amount, "chargeback loss capped at payment remainder");
        }
        if !amount.is_positive() {
            return Ok(Money::ZERO);
        }

        let mut entry = PaymentEntry::new(
            payment.id,
            DebitSource::ChargebackLoss {
                chargeback_id: chargeback.id,
                case_id: chargeback.case_id.clone(),
            },
            amount,
            now,
        );
        payment.record_debit(&entry)?;
        Repository::stage(batch, &mut payment, now)?;
        Repository::stage(batch, &mut entry, now)?;
        Ok(amount)
    }

    /// Appends evidence and optionally replaces the case notes.
    pub async fn attach_evidence(
        &self,
        chargeback_id: Uuid,
        links: Vec<String>,
        notes: Option<String>,
    ) -> Result<Chargeback> {
        let _guard = self
            .ctx
            .locks
            .lock(EntityKind::Chargeback, chargeback_id)
            .await;
        let now = self.ctx.clock.now();
        let mut chargeback: Chargeback =
            self.ctx.repo.require(&chargeback_id.to_string()).await?;
        chargeback.evidence_links.extend(links);
        if notes.is_some() {
            chargeback.notes = notes;
        }

        let mut batch = WriteBatch::new();
        Repository::stage(&mut batch, &mut chargeback, now)?;
        self.ctx.repo.commit(batch).await?;
        Ok(chargeback)
    }

    pub async fn get(&self, chargeback_id: Uuid) -> Result<Option<Chargeback>> {
        self.ctx.repo.load(&chargeback_id.to_string()).await
    }

    pub async fn for_payment(&self, payment_id: Uuid) -> Result<Vec<Chargeback>> {
        let all: Vec<Chargeback> = self.ctx.repo.scan("").await?;
        Ok(all.into_iter().filter(|c| c.payment_id == payment_id).collect())
    }

    /// Open cases past their deadline. Nothing is transitioned.
    pub async fn overdue(&self) -> Result<Vec<Chargeback>> {
        let now = self.ctx.clock.now();
        let mut all: Vec<Chargeback> = self.ctx.repo.scan("").await?;
        all.retain(|c| c.is_overdue(now));
        all.sort_by_key(|c| c.deadline_at);
        Ok(all)
    }

    fn event(
        &self,
        chargeback: &Chargeback,
        event_type: EventType,
        from: ChargebackStage,
        debited: Money,
        now: DateTime<Utc>,
    ) -> LedgerEvent {
        LedgerEvent::new(
            event_type,
            ResourceRef::new(ResourceType::Chargeback, chargeback.id),
            now,
            json!({
                "payment_id": chargeback.payment_id,
                "case_id": chargeback.case_id,
                "amount": chargeback.amount,
                "from": from,
                "stage": chargeback.stage,
                "outcome": chargeback.outcome,
                "debited": debited,
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::payments::PaymentService;
    use crate::domain::payment::NewPayment;
    use crate::infrastructure::clock::ManualClock;
    use crate::infrastructure::in_memory::InMemoryLedgerStore;
    use chrono::Duration;
    use std::sync::Arc;

    async fn setup(clock: ManualClock) -> (PaymentService, ChargebackService, Payment) {
        let ctx = LedgerContext::new(Arc::new(InMemoryLedgerStore::new()), Arc::new(clock));
        let payments = PaymentService::new(ctx.clone());
        let p = payments
            .authorize(NewPayment {
                order_id: 1,
                customer_id: 1,
                provider_id: 1,
                provider_tx_id: None,
                currency: "CLP".to_string(),
                amount_gross: Money::new(10000),
                fee: Money::new(300),
            })
            .await
            .unwrap();
        let p = payments.capture(p.id, None).await.unwrap();
        (payments, ChargebackService::new(ctx), p)
    }

    fn request(payment: &Payment, case_id: &str, amount: i64) -> OpenChargeback {
        OpenChargeback {
            payment_id: payment.id,
            case_id: case_id.to_string(),
            amount: Amount::new(amount).unwrap(),
            deadline_at: None,
            evidence_links: vec![],
            notes: None,
        }
    }

    #[tokio::test]
    async fn test_lost_debits_payment() {
        let (payments, chargebacks, p) = setup(ManualClock::new(Utc::now())).await;
        let cb = chargebacks.open(request(&p, "CB-100", 4000)).await.unwrap();
        chargebacks
            .advance(cb.id, ChargebackStage::Chargeback, "ops", None)
            .await
            .unwrap();
        chargebacks
            .advance(cb.id, ChargebackStage::Lost, "ops", None)
            .await
            .unwrap();

        let p = payments.get(p.id).await.unwrap().unwrap();
        assert_eq!(p.charged_back_total, Money::new(4000));
        assert_eq!(p.refunded_total, Money::ZERO);
        assert!(payments.audit(p.id).await.unwrap().consistent);
    }

    #[tokio::test]
    async fn test_won_leaves_payment_alone() {
        let (payments, chargebacks, p) = setup(ManualClock::new(Utc::now())).await;
        let cb = chargebacks.open(request(&p, "CB-1", 4000)).await.unwrap();
        chargebacks
            .advance(cb.id, ChargebackStage::Won, "ops", None)
            .await
            .unwrap();
        let p = payments.get(p.id).await.unwrap().unwrap();
        assert_eq!(p.charged_back_total, Money::ZERO);
        assert!(payments.entries(p.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_one_open_case_per_payment() {
        let (_, chargebacks, p) = setup(ManualClock::new(Utc::now())).await;
        let cb = chargebacks.open(request(&p, "CB-1", 100)).await.unwrap();
        let err = chargebacks.open(request(&p, "CB-2", 100)).await.unwrap_err();
        assert!(matches!(err, LedgerError::ActiveChargebackExists));

        chargebacks
            .advance(cb.id, ChargebackStage::Won, "ops", None)
            .await
            .unwrap();
        assert!(chargebacks.open(request(&p, "CB-2", 100)).await.is_ok());
        assert!(chargebacks.open(request(&p, "CB-2", 100)).await.is_err());
    }

    #[tokio::test]
    async fn test_overdue_projection() {
        let clock = ManualClock::new(Utc::now());
        let (_, chargebacks, p) = setup(clock.clone()).await;
        let mut req = request(&p, "CB-7", 100);
        req.deadline_at = Some(Utc::now() + Duration::days(2));
        let cb = chargebacks.open(req).await.unwrap();

        assert!(chargebacks.overdue().await.unwrap().is_empty());
        clock.advance(Duration::days(3));
        let overdue = chargebacks.overdue().await.unwrap();
        assert_eq!(overdue.len(), 1);
        assert_eq!(overdue[0].id, cb.id);
        assert_eq!(overdue[0].stage, ChargebackStage::Notification);
    }

    #[tokio::test]
    async fn test_invalid_stage_move_writes_nothing() {
        let (_, chargebacks, p) = setup(ManualClock::new(Utc::now())).await;
        let cb = chargebacks.open(request(&p, "CB-9", 100)).await.unwrap();
        chargebacks
            .advance(cb.id, ChargebackStage::Arbitration, "ops", None)
            .await
            .unwrap();
        let err = chargebacks
            .advance(cb.id, ChargebackStage::Chargeback, "ops", None)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidStageTransition { .. }));
        let stored = chargebacks.get(cb.id).await.unwrap().unwrap();
        assert_eq!(stored.history.len(), 1);
    }
}
