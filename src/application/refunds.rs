use super::context::LedgerContext;
use super::repository::Repository;
use crate::domain::event::{EventType, LedgerEvent, ResourceRef, ResourceType};
use crate::domain::money::Amount;
use crate::domain::payment::{DebitSource, Payment, PaymentEntry, entry_key};
use crate::domain::ports::WriteBatch;
use crate::domain::record::{EntityKind, Record};
use crate::domain::refund::{OperatorId, Refund, RefundStatus, refundable_remainder};
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

/// Refund workflow: request, submit, approve, process, fail.
///
/// Approval and processing hold both the payment and refund locks, so the remainder
/// guard is computed against a payment nobody else is changing.
#[derive(Clone)]
pub struct RefundService {
    ctx: LedgerContext,
}

impl RefundService {
    pub fn new(ctx: LedgerContext) -> Self {
        Self { ctx }
    }

    pub async fn request(
        &self,
        payment_id: Uuid,
        amount: Amount,
        reason: Option<String>,
        requested_by: OperatorId,
    ) -> Result<Refund> {
        let _guard = self.ctx.locks.lock(EntityKind::Payment, payment_id).await;
        let now = self.ctx.clock.now();
        let payment: Payment = self.ctx.repo.require(&payment_id.to_string()).await?;
        let refunds = self.for_payment(payment_id).await?;
        let remaining = refundable_remainder(&payment, &refunds, None);

        let mut refund = Refund::request(&payment, amount, remaining, reason, requested_by, now)?;
        let mut batch = WriteBatch::new();
        Repository::stage(&mut batch, &mut refund, now)?;
        self.ctx.repo.commit(batch).await?;

        info!(refund_id = %refund.id, payment_id = %payment_id, amount = %refund.amount, requested_by = %refund.requested_by, "refund requested");
        Ok(refund)
    }

    pub async fn submit(&self, refund_id: Uuid) -> Result<Refund> {
        let _guard = self.ctx.locks.lock(EntityKind::Refund, refund_id).await;
        let now = self.ctx.clock.now();
        let mut refund: Refund = self.ctx.repo.require(&refund_id.to_string()).await?;
        refund.submit()?;

        let mut batch = WriteBatch::new();
        Repository::stage(&mut batch, &mut refund, now)?;
        self.ctx.repo.commit(batch).await?;
        info!(refund_id = %refund.id, "refund submitted");
        Ok(refund)
    }

    /// Approves a pending refund; `approver` must not be the requester.
    pub async fn approve(&self, refund_id: Uuid, approver: &str) -> Result<Refund> {
        let _guard = self.lock_pair(refund_id).await?;
        let now = self.ctx.clock.now();
        let mut refund: Refund = self.ctx.repo.require(&refund_id.to_string()).await?;
        let payment: Payment = self
            .ctx
            .repo
            .require(&refund.payment_id.to_string())
            .await?;
        let refunds = self.for_payment(payment.id).await?;
        let remaining = refundable_remainder(&payment, &refunds, Some(refund.id));

        payment.ensure_debitable("refund")?;
        refund.approve(approver, remaining)?;

        let mut batch = WriteBatch::new();
        Repository::stage(&mut batch, &mut refund, now)?;
        let event = refund_event(&refund, EventType::RefundApproved, now);
        self.ctx.outbox.stage(&mut batch, &[event], now).await?;
        self.ctx.repo.commit(batch).await?;

        info!(refund_id = %refund.id, approved_by = approver, remaining = %(remaining - refund.amount), "refund approved");
        Ok(refund)
    }

    /// Debits the payment for an approved refund.
    ///
    /// Processing an already processed refund returns it unchanged; the ledger entry is
    /// keyed by refund, so the payment can never be debited twice for it.
    pub async fn process(&self, refund_id: Uuid) -> Result<Refund> {
        let _guard = self.lock_pair(refund_id).await?;
        let now = self.ctx.clock.now();
        let mut refund: Refund = self.ctx.repo.require(&refund_id.to_string()).await?;
        if refund.status == RefundStatus::Processed {
            info!(refund_id = %refund.id, "refund already processed");
            return Ok(refund);
        }
        let mut payment: Payment = self
            .ctx
            .repo
            .require(&refund.payment_id.to_string())
            .await?;

        refund.mark_processed(now)?;

        let mut batch = WriteBatch::new();
        let key = entry_key(payment.id, refund.id);
        if self.ctx.repo.exists::<PaymentEntry>(&key).await? {
            warn!(refund_id = %refund.id, "payment entry already present, skipping debit");
        } else {
            let mut entry = PaymentEntry::new(
                payment.id,
                DebitSource::Refund {
                    refund_id: refund.id,
                },
                refund.amount,
                now,
            );
            payment.record_debit(&entry)?;
            Repository::stage(&mut batch, &mut payment, now)?;
            Repository::stage(&mut batch, &mut entry, now)?;
        }
        Repository::stage(&mut batch, &mut refund, now)?;
        let event = refund_event(&refund, EventType::RefundProcessed, now);
        self.ctx.outbox.stage(&mut batch, &[event], now).await?;
        self.ctx.repo.commit(batch).await?;

        info!(refund_id = %refund.id, payment_id = %payment.id, refunded_total = %payment.refunded_total, "refund processed");
        Ok(refund)
    }

    pub async fn fail(&self, refund_id: Uuid, reason: String) -> Result<Refund> {
        let _guard = self.ctx.locks.lock(EntityKind::Refund, refund_id).await;
        let now = self.ctx.clock.now();
        let mut refund: Refund = self.ctx.repo.require(&refund_id.to_string()).await?;
        refund.fail(reason)?;

        let mut batch = WriteBatch::new();
        Repository::stage(&mut batch, &mut refund, now)?;
        let event = refund_event(&refund, EventType::RefundFailed, now);
        self.ctx.outbox.stage(&mut batch, &[event], now).await?;
        self.ctx.repo.commit(batch).await?;

        warn!(refund_id = %refund.id, reason = refund.failure_reason.as_deref().unwrap_or_default(), "refund failed");
        Ok(refund)
    }

    pub async fn get(&self, refund_id: Uuid) -> Result<Option<Refund>> {
        self.ctx.repo.load(&refund_id.to_string()).await
    }

    pub async fn for_payment(&self, payment_id: Uuid) -> Result<Vec<Refund>> {
        let refunds: Vec<Refund> = self.ctx.repo.scan("").await?;
        Ok(refunds
            .into_iter()
            .filter(|r| r.payment_id == payment_id)
            .collect())
    }

    /// Refunds waiting on an operator: pending approval or approved but not processed.
    pub async fn queue(&self) -> Result<Vec<Refund>> {
        let mut refunds: Vec<Refund> = self.ctx.repo.scan("").await?;
        refunds.retain(|r| matches!(r.status, RefundStatus::Pending | RefundStatus::Approved));
        refunds.sort_by_key(|r| (r.created_at, r.id));
        Ok(refunds)
    }

    async fn lock_pair(&self, refund_id: Uuid) -> Result<super::locks::EntityGuard> {
        let refund: Refund = self.ctx.repo.require(&refund_id.to_string()).await?;
        Ok(self
            .ctx
            .locks
            .lock_many(vec![
                (EntityKind::Payment, refund.payment_id.to_string()),
                (Refund::KIND, refund.key()),
            ])
            .await)
    }
}

fn refund_event(refund: &Refund, event_type: EventType, now: DateTime<Utc>) -> LedgerEvent {
    LedgerEvent::new(
        event_type,
        ResourceRef::new(ResourceType::Refund, refund.id),
        now,
        json!({
            "payment_id": refund.payment_id,
            "order_id": refund.order_id,
            "amount": refund.amount,
            "status": refund.status,
            "requested_by": refund.requested_by,
            "approved_by": refund.approved_by,
            "failure_reason": refund.failure_reason,
        }),
    )
}
