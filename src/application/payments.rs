use super::context::LedgerContext;
use super::repository::Repository;
use crate::domain::event::{EventType, LedgerEvent, ResourceRef, ResourceType};
use crate::domain::money::Money;
use crate::domain::payment::{
    NewPayment, Payment, PaymentAudit, PaymentEntry, PaymentStats, RefundState, entry_prefix,
};
use crate::domain::ports::WriteBatch;
use crate::domain::record::EntityKind;
use crate::domain::refund::{Refund, RefundStatus};
use crate::error::{LedgerError, Result};
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

/// Payment lifecycle: authorize, capture, void, fail.
#[derive(Clone)]
pub struct PaymentService {
    ctx: LedgerContext,
}

impl PaymentService {
    pub fn new(ctx: LedgerContext) -> Self {
        Self { ctx }
    }

    /// Records a new authorization handed over by the order subsystem.
    pub async fn authorize(&self, new: NewPayment) -> Result<Payment> {
        let now = self.ctx.clock.now();
        let mut payment = Payment::authorize(new, now)?;
        let mut batch = WriteBatch::new();
        Repository::stage(&mut batch, &mut payment, now)?;
        self.ctx.repo.commit(batch).await?;

        info!(payment_id = %payment.id, order_id = payment.order_id, gross = %payment.amount_gross, "payment authorized");
        Ok(payment)
    }

    pub async fn capture(&self, payment_id: Uuid, final_fee: Option<Money>) -> Result<Payment> {
        self.transition(payment_id, EventType::PaymentCaptured, |payment, now| {
            payment.capture(final_fee, now)
        })
        .await
    }

    /// Voids the payment. Approved refunds still waiting to be processed block it the
    /// same way processed ones do; fail them first.
    pub async fn void(&self, payment_id: Uuid) -> Result<Payment> {
        let _guard = self.ctx.locks.lock(EntityKind::Payment, payment_id).await;
        let refunds: Vec<Refund> = self.ctx.repo.scan("").await?;
        if refunds
            .iter()
            .any(|r| r.payment_id == payment_id && r.status == RefundStatus::Approved)
        {
            return Err(LedgerError::RefundsExist);
        }
        self.apply_transition(payment_id, EventType::PaymentVoided, |payment, now| {
            payment.void(now)
        })
        .await
    }

    pub async fn fail(
        &self,
        payment_id: Uuid,
        code: Option<String>,
        message: Option<String>,
    ) -> Result<Payment> {
        self.transition(payment_id, EventType::PaymentFailed, move |payment, _| {
            payment.fail(code, message)
        })
        .await
    }

    /// Imports a payment that the provider already captured at `captured_at`.
    pub async fn record_captured(
        &self,
        new: NewPayment,
        captured_at: DateTime<Utc>,
    ) -> Result<Payment> {
        let now = self.ctx.clock.now();
        let mut payment = Payment::authorize(new, captured_at)?;
        payment.capture(None, captured_at)?;

        let mut batch = WriteBatch::new();
        Repository::stage(&mut batch, &mut payment, now)?;
        let event = payment_event(&payment, EventType::PaymentCaptured, now);
        self.ctx.outbox.stage(&mut batch, &[event], now).await?;
        self.ctx.repo.commit(batch).await?;
        Ok(payment)
    }

    async fn transition<F>(&self, payment_id: Uuid, event_type: EventType, apply: F) -> Result<Payment>
    where
        F: FnOnce(&mut Payment, DateTime<Utc>) -> Result<()>,
    {
        let _guard = self.ctx.locks.lock(EntityKind::Payment, payment_id).await;
        self.apply_transition(payment_id, event_type, apply).await
    }

    /// Caller holds the payment lock.
    async fn apply_transition<F>(&self, payment_id: Uuid, event_type: EventType, apply: F) -> Result<Payment>
    where
        F: FnOnce(&mut Payment, DateTime<Utc>) -> Result<()>,
    {
        let now = self.ctx.clock.now();
        let mut payment: Payment = self.ctx.repo.require(&payment_id.to_string()).await?;
        let from = payment.status;
        apply(&mut payment, now)?;

        let mut batch = WriteBatch::new();
        Repository::stage(&mut batch, &mut payment, now)?;
        let event = payment_event(&payment, event_type, now);
        self.ctx.outbox.stage(&mut batch, &[event], now).await?;
        self.ctx.repo.commit(batch).await?;

        info!(payment_id = %payment.id, %from, to = %payment.status, "payment transitioned");
        Ok(payment)
    }

    pub async fn get(&self, payment_id: Uuid) -> Result<Option<Payment>> {
        self.ctx.repo.load(&payment_id.to_string()).await
    }

    pub async fn list(&self) -> Result<Vec<Payment>> {
        self.ctx.repo.scan("").await
    }

    pub async fn stats(&self) -> Result<PaymentStats> {
        let payments = self.list().await?;
        Ok(PaymentStats::collect(&payments))
    }

    pub async fn refund_state(&self, payment_id: Uuid) -> Result<RefundState> {
        let payment: Payment = self.ctx.repo.require(&payment_id.to_string()).await?;
        Ok(payment.refund_state())
    }

    pub async fn entries(&self, payment_id: Uuid) -> Result<Vec<PaymentEntry>> {
        self.ctx.repo.scan(&entry_prefix(payment_id)).await
    }

    /// Rebuilds the payment's refunded and charged-back totals from its entries.
    pub async fn audit(&self, payment_id: Uuid) -> Result<PaymentAudit> {
        let payment: Payment = self.ctx.repo.require(&payment_id.to_string()).await?;
        let entries = self.entries(payment_id).await?;
        Ok(PaymentAudit::replay(&payment, &entries))
    }
}

pub(crate) fn payment_event(payment: &Payment, event_type: EventType, now: DateTime<Utc>) -> LedgerEvent {
    LedgerEvent::new(
        event_type,
        ResourceRef::new(ResourceType::Payment, payment.id),
        now,
        json!({
            "order_id": payment.order_id,
            "status": payment.status,
            "amount_gross": payment.amount_gross,
            "fee": payment.fee,
            "amount_net": payment.amount_net,
            "currency": payment.currency,
            "failure_code": payment.failure_code,
        }),
    )
}
