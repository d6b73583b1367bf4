use super::money::{Amount, Money};
use super::payment::Payment;
use super::record::{EntityKind, RecordMeta, impl_record};
use crate::error::{LedgerError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Authenticated identity of a back-office operator.
pub type OperatorId = String;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RefundStatus {
    Draft,
    Pending,
    Approved,
    Processed,
    Failed,
}

impl RefundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefundStatus::Draft => "draft",
            RefundStatus::Pending => "pending",
            RefundStatus::Approved => "approved",
            RefundStatus::Processed => "processed",
            RefundStatus::Failed => "failed",
        }
    }

    pub fn can_transition_to(&self, next: RefundStatus) -> bool {
        use RefundStatus::*;
        matches!(
            (self, next),
            (Draft, Pending)
                | (Pending, Approved)
                | (Approved, Processed)
                | (Pending, Failed)
                | (Approved, Failed)
        )
    }

    /// Whether a refund in this status counts against the payment's refundable remainder.
    pub fn reserves_funds(&self) -> bool {
        matches!(self, RefundStatus::Approved | RefundStatus::Processed)
    }
}

impl fmt::Display for RefundStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct Refund {
    pub id: Uuid,
    pub payment_id: Uuid,
    pub order_id: u64,
    pub amount: Money,
    pub reason: Option<String>,
    pub status: RefundStatus,
    pub requested_by: OperatorId,
    pub approved_by: Option<OperatorId>,
    pub processed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub meta: RecordMeta,
}

impl_record!(Refund, EntityKind::Refund, |r| r.id.to_string());

impl Refund {
    /// Drafts a refund against a captured payment.
    ///
    /// `remaining` is the payment's remainder after approved and processed refunds and
    /// chargeback debits; the authoritative check happens again at approval.
    pub fn request(
        payment: &Payment,
        amount: Amount,
        remaining: Money,
        reason: Option<String>,
        requested_by: OperatorId,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        payment.ensure_debitable("refund")?;
        if requested_by.trim().is_empty() {
            return Err(LedgerError::MissingOperator);
        }
        if amount.money() > remaining {
            return Err(LedgerError::OverRefund {
                requested: amount.money(),
                remaining,
            });
        }

        Ok(Self {
            id: Uuid::new_v4(),
            payment_id: payment.id,
            order_id: payment.order_id,
            amount: amount.money(),
            reason,
            status: RefundStatus::Draft,
            requested_by,
            approved_by: None,
            processed_at: None,
            failure_reason: None,
            created_at: now,
            meta: RecordMeta::default(),
        })
    }

    pub fn submit(&mut self) -> Result<()> {
        self.transition(RefundStatus::Pending, "submit")
    }

    /// Approves the refund under the four-eyes rule.
    ///
    /// `remaining` must exclude this refund itself.
    pub fn approve(&mut self, approver: &str, remaining: Money) -> Result<()> {
        if !self.status.can_transition_to(RefundStatus::Approved) {
            return Err(self.invalid("approve"));
        }
        if approver.trim().is_empty() {
            return Err(LedgerError::MissingOperator);
        }
        if approver == self.requested_by {
            return Err(LedgerError::SelfApproval);
        }
        if self.amount > remaining {
            return Err(LedgerError::OverRefund {
                requested: self.amount,
                remaining,
            });
        }
        self.status = RefundStatus::Approved;
        self.approved_by = Some(approver.to_string());
        Ok(())
    }

    pub fn mark_processed(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(RefundStatus::Processed, "process")?;
        self.processed_at = Some(now);
        Ok(())
    }

    pub fn fail(&mut self, reason: String) -> Result<()> {
        self.transition(RefundStatus::Failed, "fail")?;
        self.failure_reason = Some(reason);
        Ok(())
    }

    fn transition(&mut self, next: RefundStatus, action: &'static str) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(self.invalid(action));
        }
        self.status = next;
        Ok(())
    }

    fn invalid(&self, action: &'static str) -> LedgerError {
        LedgerError::InvalidTransition {
            entity: "refund",
            from: self.status.to_string(),
            action,
        }
    }
}

/// Remainder of `payment` still open to refunds, ignoring the refund `excluding`.
pub fn refundable_remainder(payment: &Payment, refunds: &[Refund], excluding: Option<Uuid>) -> Money {
    let reserved: Money = refunds
        .iter()
        .filter(|r| r.payment_id == payment.id)
        .filter(|r| Some(r.id) != excluding)
        .filter(|r| r.status.reserves_funds())
        .map(|r| r.amount)
        .sum();
    payment.amount_gross - reserved - payment.charged_back_total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::payment::NewPayment;

    fn captured_payment(gross: i64) -> Payment {
        let mut payment = Payment::authorize(
            NewPayment {
                order_id: 42,
                customer_id: 1,
                provider_id: 1,
                provider_tx_id: None,
                currency: "CLP".to_string(),
                amount_gross: Money::new(gross),
                fee: Money::ZERO,
            },
            Utc::now(),
        )
        .unwrap();
        payment.capture(None, Utc::now()).unwrap();
        payment
    }

    fn draft(payment: &Payment, amount: i64) -> Refund {
        Refund::request(
            payment,
            Amount::new(amount).unwrap(),
            payment.amount_gross,
            None,
            "alice".to_string(),
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn test_happy_path() {
        let payment = captured_payment(1000);
        let mut refund = draft(&payment, 400);
        assert_eq!(refund.order_id, 42);
        refund.submit().unwrap();
        refund.approve("bob", Money::new(1000)).unwrap();
        refund.mark_processed(Utc::now()).unwrap();
        assert_eq!(refund.status, RefundStatus::Processed);
        assert_eq!(refund.approved_by.as_deref(), Some("bob"));
        assert!(refund.processed_at.is_some());
    }

    #[test]
    fn test_self_approval_rejected() {
        let payment = captured_payment(1000);
        let mut refund = draft(&payment, 400);
        refund.submit().unwrap();
        assert!(matches!(
            refund.approve("alice", Money::new(1000)),
            Err(LedgerError::SelfApproval)
        ));
        assert_eq!(refund.status, RefundStatus::Pending);
    }

    #[test]
    fn test_approve_requires_pending() {
        let payment = captured_payment(1000);
        let mut refund = draft(&payment, 400);
        assert!(matches!(
            refund.approve("bob", Money::new(1000)),
            Err(LedgerError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_approve_over_remainder() {
        let payment = captured_payment(1000);
        let mut refund = draft(&payment, 400);
        refund.submit().unwrap();
        assert!(matches!(
            refund.approve("bob", Money::new(399)),
            Err(LedgerError::OverRefund { .. })
        ));
    }

    #[test]
    fn test_request_against_uncaptured_payment() {
        let payment = Payment::authorize(
            NewPayment {
                order_id: 1,
                customer_id: 1,
                provider_id: 1,
                provider_tx_id: None,
                currency: "CLP".to_string(),
                amount_gross: Money::new(1000),
                fee: Money::ZERO,
            },
            Utc::now(),
        )
        .unwrap();
        let result = Refund::request(
            &payment,
            Amount::new(1).unwrap(),
            Money::new(1000),
            None,
            "alice".to_string(),
            Utc::now(),
        );
        assert!(matches!(result, Err(LedgerError::InvalidTransition { .. })));
    }

    #[test]
    fn test_fail_from_pending_and_approved_only() {
        let payment = captured_payment(1000);
        let mut refund = draft(&payment, 100);
        assert!(refund.fail("gateway".to_string()).is_err());
        refund.submit().unwrap();
        refund.fail("gateway".to_string()).unwrap();
        assert_eq!(refund.status, RefundStatus::Failed);
        assert_eq!(refund.failure_reason.as_deref(), Some("gateway"));
    }

    #[test]
    fn test_remainder_counts_approved_and_processed() {
        let payment = captured_payment(100000);
        let mut approved = draft(&payment, 30000);
        approved.status = RefundStatus::Approved;
        let mut processed = draft(&payment, 20000);
        processed.status = RefundStatus::Processed;
        let pending = draft(&payment, 45000);
        let mut failed = draft(&payment, 10000);
        failed.status = RefundStatus::Failed;

        let refunds = vec![approved.clone(), processed, pending, failed];
        assert_eq!(
            refundable_remainder(&payment, &refunds, None),
            Money::new(50000)
        );
        assert_eq!(
            refundable_remainder(&payment, &refunds, Some(approved.id)),
            Money::new(80000)
        );
    }
}
