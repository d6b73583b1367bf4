use super::money::Money;
use super::record::{EntityKind, RecordMeta, impl_record};
use crate::error::{LedgerError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Authorized,
    Captured,
    Voided,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Authorized => "authorized",
            PaymentStatus::Captured => "captured",
            PaymentStatus::Voided => "voided",
            PaymentStatus::Failed => "failed",
        }
    }

    /// The complete transition table of the payment lifecycle.
    pub fn can_transition_to(&self, next: PaymentStatus) -> bool {
        use PaymentStatus::*;
        matches!(
            (self, next),
            (Authorized, Captured) | (Authorized, Voided) | (Authorized, Failed) | (Captured, Voided)
        )
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How much of a captured payment has flowed back out.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum RefundState {
    None,
    PartiallyRefunded,
    FullyRefunded,
}

/// Data the order subsystem hands over when a payment attempt is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPayment {
    pub order_id: u64,
    pub customer_id: u64,
    pub provider_id: u64,
    pub provider_tx_id: Option<String>,
    pub currency: String,
    pub amount_gross: Money,
    pub fee: Money,
}

/// One authorization/capture attempt against one order via one provider.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct Payment {
    pub id: Uuid,
    pub order_id: u64,
    pub customer_id: u64,
    pub provider_id: u64,
    pub provider_tx_id: Option<String>,
    pub currency: String,
    pub amount_gross: Money,
    pub fee: Money,
    /// Always `amount_gross - fee`.
    pub amount_net: Money,
    pub status: PaymentStatus,
    /// Cache of the processed-refund entries in this payment's ledger.
    pub refunded_total: Money,
    /// Cache of the lost-chargeback entries in this payment's ledger.
    pub charged_back_total: Money,
    pub failure_code: Option<String>,
    pub failure_message: Option<String>,
    pub authorized_at: DateTime<Utc>,
    pub captured_at: Option<DateTime<Utc>>,
    pub voided_at: Option<DateTime<Utc>>,
    pub settled_in: Option<Uuid>,
    #[serde(flatten)]
    pub meta: RecordMeta,
}

impl_record!(Payment, EntityKind::Payment, |p| p.id.to_string());

impl Payment {
    pub fn authorize(new: NewPayment, now: DateTime<Utc>) -> Result<Self> {
        if !new.amount_gross.is_positive() {
            return Err(LedgerError::ValidationError(
                "amount_gross must be positive".to_string(),
            ));
        }
        validate_fee(new.amount_gross, new.fee)?;

        Ok(Self {
            id: Uuid::new_v4(),
            order_id: new.order_id,
            customer_id: new.customer_id,
            provider_id: new.provider_id,
            provider_tx_id: new.provider_tx_id,
            currency: new.currency,
            amount_gross: new.amount_gross,
            fee: new.fee,
            amount_net: new.amount_gross - new.fee,
            status: PaymentStatus::Authorized,
            refunded_total: Money::ZERO,
            charged_back_total: Money::ZERO,
            failure_code: None,
            failure_message: None,
            authorized_at: now,
            captured_at: None,
            voided_at: None,
            settled_in: None,
            meta: RecordMeta::default(),
        })
    }

    /// Captures the authorization, optionally with the fee the provider finally charged.
    pub fn capture(&mut self, final_fee: Option<Money>, now: DateTime<Utc>) -> Result<()> {
        self.ensure_transition(PaymentStatus::Captured, "capture")?;
        if let Some(fee) = final_fee {
            validate_fee(self.amount_gross, fee)?;
            self.fee = fee;
        }
        self.amount_net = self.amount_gross - self.fee;
        self.status = PaymentStatus::Captured;
        self.captured_at = Some(now);
        Ok(())
    }

    pub fn void(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.status == PaymentStatus::Captured && self.debited_total().is_positive() {
            return Err(LedgerError::RefundsExist);
        }
        self.ensure_transition(PaymentStatus::Voided, "void")?;
        self.status = PaymentStatus::Voided;
        self.voided_at = Some(now);
        Ok(())
    }

    pub fn fail(&mut self, code: Option<String>, message: Option<String>) -> Result<()> {
        self.ensure_transition(PaymentStatus::Failed, "fail")?;
        self.status = PaymentStatus::Failed;
        self.failure_code = code;
        self.failure_message = message;
        Ok(())
    }

    /// Binds the payment to a completed settlement. Re-binding to the same one is a no-op.
    pub fn mark_settled(&mut self, settlement_id: Uuid) -> Result<bool> {
        match self.settled_in {
            Some(existing) if existing == settlement_id => Ok(false),
            Some(_) => Err(self.invalid("settle")),
            None if self.status == PaymentStatus::Captured => {
                self.settled_in = Some(settlement_id);
                Ok(true)
            }
            None => Err(self.invalid("settle")),
        }
    }

    /// Applies a ledger entry to the cached totals.
    ///
    /// This is the only place the effective refunded amount changes.
    pub fn record_debit(&mut self, entry: &PaymentEntry) -> Result<()> {
        if entry.payment_id != self.id {
            return Err(LedgerError::ValidationError(format!(
                "entry belongs to payment {}",
                entry.payment_id
            )));
        }
        self.ensure_debitable("debit")?;
        let remaining = self.refundable_remainder();
        if entry.amount > remaining {
            return Err(LedgerError::OverRefund {
                requested: entry.amount,
                remaining,
            });
        }
        match entry.source {
            DebitSource::Refund { .. } => self.refunded_total += entry.amount,
            DebitSource::ChargebackLoss { .. } => self.charged_back_total += entry.amount,
        }
        Ok(())
    }

    /// Only a captured payment takes refunds or chargeback debits; a voided one is frozen.
    pub fn ensure_debitable(&self, action: &'static str) -> Result<()> {
        if self.status != PaymentStatus::Captured {
            return Err(self.invalid(action));
        }
        Ok(())
    }

    pub fn debited_total(&self) -> Money {
        self.refunded_total + self.charged_back_total
    }

    pub fn refundable_remainder(&self) -> Money {
        self.amount_gross - self.debited_total()
    }

    pub fn refund_state(&self) -> RefundState {
        let debited = self.debited_total();
        if debited == Money::ZERO {
            RefundState::None
        } else if debited < self.amount_gross {
            RefundState::PartiallyRefunded
        } else {
            RefundState::FullyRefunded
        }
    }

    fn ensure_transition(&self, next: PaymentStatus, action: &'static str) -> Result<()> {
        if self.settled_in.is_some() || !self.status.can_transition_to(next) {
            return Err(self.invalid(action));
        }
        Ok(())
    }

    fn invalid(&self, action: &'static str) -> LedgerError {
        let from = match self.settled_in {
            Some(_) => format!("{} (settled)", self.status),
            None => self.status.to_string(),
        };
        LedgerError::InvalidTransition {
            entity: "payment",
            from,
            action,
        }
    }
}

fn validate_fee(gross: Money, fee: Money) -> Result<()> {
    if fee.is_negative() || fee > gross {
        return Err(LedgerError::ValidationError(format!(
            "fee {} must be between 0 and amount_gross {}",
            fee, gross
        )));
    }
    Ok(())
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DebitSource {
    Refund { refund_id: Uuid },
    ChargebackLoss { chargeback_id: Uuid, case_id: String },
}

impl DebitSource {
    pub fn source_id(&self) -> Uuid {
        match self {
            DebitSource::Refund { refund_id } => *refund_id,
            DebitSource::ChargebackLoss { chargeback_id, .. } => *chargeback_id,
        }
    }
}

/// Append-only debit against a payment; the payment's totals are a cache of these.
///
/// Keyed by payment and source, so a source can debit a payment at most once.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct PaymentEntry {
    pub payment_id: Uuid,
    pub source: DebitSource,
    pub amount: Money,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub meta: RecordMeta,
}

impl_record!(PaymentEntry, EntityKind::PaymentEntry, |e| entry_key(
    e.payment_id,
    e.source.source_id()
));

pub fn entry_key(payment_id: Uuid, source_id: Uuid) -> String {
    format!("{}/{}", payment_id, source_id)
}

pub fn entry_prefix(payment_id: Uuid) -> String {
    format!("{}/", payment_id)
}

impl PaymentEntry {
    pub fn new(payment_id: Uuid, source: DebitSource, amount: Money, now: DateTime<Utc>) -> Self {
        Self {
            payment_id,
            source,
            amount,
            created_at: now,
            meta: RecordMeta::default(),
        }
    }
}

/// Result of rebuilding a payment's totals from its entries.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct PaymentAudit {
    pub payment_id: Uuid,
    pub stored_refunded: Money,
    pub replayed_refunded: Money,
    pub stored_charged_back: Money,
    pub replayed_charged_back: Money,
    pub consistent: bool,
}

impl PaymentAudit {
    pub fn replay(payment: &Payment, entries: &[PaymentEntry]) -> Self {
        let mut refunded = Money::ZERO;
        let mut charged_back = Money::ZERO;
        for entry in entries.iter().filter(|e| e.payment_id == payment.id) {
            match entry.source {
                DebitSource::Refund { .. } => refunded += entry.amount,
                DebitSource::ChargebackLoss { .. } => charged_back += entry.amount,
            }
        }
        let consistent = refunded == payment.refunded_total
            && charged_back == payment.charged_back_total
            && payment.amount_net == payment.amount_gross - payment.fee
            && refunded + charged_back <= payment.amount_gross;
        Self {
            payment_id: payment.id,
            stored_refunded: payment.refunded_total,
            replayed_refunded: refunded,
            stored_charged_back: payment.charged_back_total,
            replayed_charged_back: charged_back,
            consistent,
        }
    }
}

/// Aggregate numbers for the payments list in the back office.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Default)]
pub struct PaymentStats {
    pub total: u64,
    pub authorized: u64,
    pub captured: u64,
    pub failed: u64,
    pub voided: u64,
    pub total_captured: Money,
    pub total_net: Money,
    pub total_fees: Money,
    pub total_refunded: Money,
}

impl PaymentStats {
    pub fn collect<'a>(payments: impl IntoIterator<Item = &'a Payment>) -> Self {
        let mut stats = Self::default();
        for payment in payments {
            stats.total += 1;
            stats.total_fees += payment.fee;
            match payment.status {
                PaymentStatus::Authorized => stats.authorized += 1,
                PaymentStatus::Captured => {
                    stats.captured += 1;
                    stats.total_captured += payment.amount_gross;
                    stats.total_net += payment.amount_net;
                    stats.total_refunded += payment.debited_total();
                }
                PaymentStatus::Failed => stats.failed += 1,
                PaymentStatus::Voided => stats.voided += 1,
            }
        }
        stats
    }
}
