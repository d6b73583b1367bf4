use super::money::{Amount, Money};
use super::payment::{Payment, PaymentStatus};
use super::record::{EntityKind, RecordMeta, impl_record};
use super::refund::OperatorId;
use crate::error::{LedgerError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Dispute stages. The first four are ordered; `Won`/`Lost` are terminal and reachable
/// from any open stage.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ChargebackStage {
    Notification,
    Chargeback,
    PreArbitration,
    Arbitration,
    Won,
    Lost,
}

impl ChargebackStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChargebackStage::Notification => "notification",
            ChargebackStage::Chargeback => "chargeback",
            ChargebackStage::PreArbitration => "pre-arbitration",
            ChargebackStage::Arbitration => "arbitration",
            ChargebackStage::Won => "won",
            ChargebackStage::Lost => "lost",
        }
    }

    fn rank(&self) -> Option<u8> {
        match self {
            ChargebackStage::Notification => Some(0),
            ChargebackStage::Chargeback => Some(1),
            ChargebackStage::PreArbitration => Some(2),
            ChargebackStage::Arbitration => Some(3),
            ChargebackStage::Won | ChargebackStage::Lost => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank().is_none()
    }

    pub fn can_advance_to(&self, next: ChargebackStage) -> bool {
        match (self.rank(), next.rank()) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(from), Some(to)) => to > from,
        }
    }
}

impl fmt::Display for ChargebackStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ChargebackStage {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "notification" => Ok(ChargebackStage::Notification),
            "chargeback" => Ok(ChargebackStage::Chargeback),
            "pre-arbitration" => Ok(ChargebackStage::PreArbitration),
            "arbitration" => Ok(ChargebackStage::Arbitration),
            "won" => Ok(ChargebackStage::Won),
            "lost" => Ok(ChargebackStage::Lost),
            other => Err(LedgerError::ValidationError(format!(
                "unknown chargeback stage '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum ChargebackOutcome {
    Won,
    Lost,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct StageChange {
    pub from: ChargebackStage,
    pub to: ChargebackStage,
    pub operator: OperatorId,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct Chargeback {
    pub id: Uuid,
    pub payment_id: Uuid,
    pub case_id: String,
    pub amount: Money,
    pub stage: ChargebackStage,
    pub deadline_at: Option<DateTime<Utc>>,
    pub outcome: Option<ChargebackOutcome>,
    pub history: Vec<StageChange>,
    pub evidence_links: Vec<String>,
    pub notes: Option<String>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub meta: RecordMeta,
}

impl_record!(Chargeback, EntityKind::Chargeback, |c| c.id.to_string());

impl Chargeback {
    pub fn open(
        payment: &Payment,
        case_id: String,
        amount: Amount,
        deadline_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        if payment.status != PaymentStatus::Captured {
            return Err(LedgerError::InvalidTransition {
                entity: "payment",
                from: payment.status.to_string(),
                action: "dispute",
            });
        }
        if case_id.trim().is_empty() {
            return Err(LedgerError::ValidationError(
                "case_id is required".to_string(),
            ));
        }
        if amount.money() > payment.amount_gross {
            return Err(LedgerError::ValidationError(format!(
                "disputed amount {} exceeds payment gross {}",
                amount.money(),
                payment.amount_gross
            )));
        }
        Ok(Self {
            id: Uuid::new_v4(),
            payment_id: payment.id,
            case_id,
            amount: amount.money(),
            stage: ChargebackStage::Notification,
            deadline_at,
            outcome: None,
            history: Vec::new(),
            evidence_links: Vec::new(),
            notes: None,
            opened_at: now,
            closed_at: None,
            meta: RecordMeta::default(),
        })
    }

    pub fn is_open(&self) -> bool {
        !self.stage.is_terminal()
    }

    /// Read-only projection: an open case whose deadline has passed.
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.is_open() && self.deadline_at.is_some_and(|deadline| deadline < now)
    }

    pub fn advance(
        &mut self,
        to: ChargebackStage,
        operator: &str,
        new_deadline: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if !self.stage.can_advance_to(to) {
            return Err(LedgerError::InvalidStageTransition {
                from: self.stage.to_string(),
                to: to.to_string(),
            });
        }
        if operator.trim().is_empty() {
            return Err(LedgerError::MissingOperator);
        }
        self.history.push(StageChange {
            from: self.stage,
            to,
            operator: operator.to_string(),
            at: now,
        });
        self.stage = to;
        match to {
            ChargebackStage::Won => self.close(ChargebackOutcome::Won, now),
            ChargebackStage::Lost => self.close(ChargebackOutcome::Lost, now),
            _ => {
                if new_deadline.is_some() {
                    self.deadline_at = new_deadline;
                }
            }
        }
        Ok(())
    }

    fn close(&mut self, outcome: ChargebackOutcome, now: DateTime<Utc>) {
        self.outcome = Some(outcome);
        self.closed_at = Some(now);
    }
}
