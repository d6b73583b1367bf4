use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "payment.captured")]
    PaymentCaptured,
    #[serde(rename = "payment.voided")]
    PaymentVoided,
    #[serde(rename = "payment.failed")]
    PaymentFailed,
    #[serde(rename = "refund.approved")]
    RefundApproved,
    #[serde(rename = "refund.processed")]
    RefundProcessed,
    #[serde(rename = "refund.failed")]
    RefundFailed,
    #[serde(rename = "gift_card.transaction")]
    GiftCardTransaction,
    #[serde(rename = "chargeback.stage_changed")]
    ChargebackStageChanged,
    #[serde(rename = "chargeback.lost")]
    ChargebackLost,
    #[serde(rename = "settlement.completed")]
    SettlementCompleted,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::PaymentCaptured => "payment.captured",
            EventType::PaymentVoided => "payment.voided",
            EventType::PaymentFailed => "payment.failed",
            EventType::RefundApproved => "refund.approved",
            EventType::RefundProcessed => "refund.processed",
            EventType::RefundFailed => "refund.failed",
            EventType::GiftCardTransaction => "gift_card.transaction",
            EventType::ChargebackStageChanged => "chargeback.stage_changed",
            EventType::ChargebackLost => "chargeback.lost",
            EventType::SettlementCompleted => "settlement.completed",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Payment,
    Refund,
    GiftCard,
    Chargeback,
    Settlement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceRef {
    pub resource_type: ResourceType,
    pub id: Uuid,
}

impl ResourceRef {
    pub fn new(resource_type: ResourceType, id: Uuid) -> Self {
        Self { resource_type, id }
    }
}

/// A ledger fact worth telling subscribers about.
///
/// `event_id` is what consumers deduplicate on; delivery order is not guaranteed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub resource: ResourceRef,
    pub occurred_at: DateTime<Utc>,
    pub data: serde_json::Value,
}

impl LedgerEvent {
    pub fn new(
        event_type: EventType,
        resource: ResourceRef,
        occurred_at: DateTime<Utc>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            resource,
            occurred_at,
            data,
        }
    }

    /// The JSON body POSTed to subscribers.
    pub fn envelope(&self) -> serde_json::Value {
        serde_json::json!({
            "event_id": self.event_id,
            "event": self.event_type,
            "resource_type": self.resource.resource_type,
            "resource_id": self.resource.id,
            "timestamp": self.occurred_at,
            "data": self.data,
        })
    }
}
