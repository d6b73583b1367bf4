use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Every durable record type the ledger persists.
///
/// Each kind maps to its own keyspace (a column family in RocksDB).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Payment,
    PaymentEntry,
    Refund,
    GiftCard,
    GiftCardCode,
    GiftCardTransaction,
    Chargeback,
    Settlement,
    SettlementLine,
    WebhookSubscriber,
    WebhookDelivery,
}

impl EntityKind {
    pub const ALL: [EntityKind; 11] = [
        EntityKind::Payment,
        EntityKind::PaymentEntry,
        EntityKind::Refund,
        EntityKind::GiftCard,
        EntityKind::GiftCardCode,
        EntityKind::GiftCardTransaction,
        EntityKind::Chargeback,
        EntityKind::Settlement,
        EntityKind::SettlementLine,
        EntityKind::WebhookSubscriber,
        EntityKind::WebhookDelivery,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Payment => "payment",
            EntityKind::PaymentEntry => "payment_entry",
            EntityKind::Refund => "refund",
            EntityKind::GiftCard => "gift_card",
            EntityKind::GiftCardCode => "gift_card_code",
            EntityKind::GiftCardTransaction => "gift_card_transaction",
            EntityKind::Chargeback => "chargeback",
            EntityKind::Settlement => "settlement",
            EntityKind::SettlementLine => "settlement_line",
            EntityKind::WebhookSubscriber => "webhook_subscriber",
            EntityKind::WebhookDelivery => "webhook_delivery",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Version marker carried by every record.
///
/// `version` starts at 1 on the first write and increases by one per write; a write
/// staged against a stale version is rejected by the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMeta {
    pub version: u64,
    pub updated_at: Option<DateTime<Utc>>,
}

pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: EntityKind;

    fn key(&self) -> String;
    fn meta(&self) -> &RecordMeta;
    fn meta_mut(&mut self) -> &mut RecordMeta;
}

/// Implements [`Record`] for a struct with a `meta: RecordMeta` field.
macro_rules! impl_record {
    ($ty:ty, $kind:expr, |$this:ident| $key:expr) => {
        impl $crate::domain::record::Record for $ty {
            const KIND: $crate::domain::record::EntityKind = $kind;

            fn key(&self) -> String {
                let $this = self;
                $key
            }

            fn meta(&self) -> &$crate::domain::record::RecordMeta {
                &self.meta
            }

            fn meta_mut(&mut self) -> &mut $crate::domain::record::RecordMeta {
                &mut self.meta
            }
        }
    };
}

pub(crate) use impl_record;
