use super::record::EntityKind;
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use url::Url;
use uuid::Uuid;

/// Raw bytes of a record as held by a store, plus the version it was written at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub version: u64,
    pub bytes: Vec<u8>,
}

/// Precondition a put must satisfy for its batch to commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    /// The key must not exist yet.
    Absent,
    /// The key must currently be at exactly this version.
    Version(u64),
}

impl Expect {
    /// Whether a key currently at `current` (or missing) satisfies the expectation.
    pub fn holds(&self, current: Option<u64>) -> bool {
        match (self, current) {
            (Expect::Absent, None) => true,
            (Expect::Version(expected), Some(actual)) => *expected == actual,
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WriteOp {
    pub kind: EntityKind,
    pub key: String,
    pub version: u64,
    pub bytes: Vec<u8>,
    pub expect: Expect,
}

/// A set of puts applied all-or-nothing.
#[derive(Debug, Default, Clone)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: WriteOp) {
        self.ops.push(op);
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn get(&self, kind: EntityKind, key: &str) -> Result<Option<StoredRecord>>;
    /// Returns every record of `kind` whose key starts with `prefix`, in key order.
    async fn scan(&self, kind: EntityKind, prefix: &str) -> Result<Vec<StoredRecord>>;
    /// Checks every expectation in the batch, then applies all of its puts atomically.
    async fn commit(&self, batch: WriteBatch) -> Result<()>;
}

pub type LedgerStoreRef = Arc<dyn LedgerStore>;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub type ClockRef = Arc<dyn Clock>;

/// One outbound webhook call.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    pub delivery_id: Uuid,
    pub event_id: Uuid,
    pub event_type: String,
    pub url: Url,
    pub body: serde_json::Value,
}

#[async_trait]
pub trait WebhookTransport: Send + Sync {
    /// Sends the request and returns the endpoint's HTTP status code.
    ///
    /// Connection-level problems are reported as `LedgerError::DeliveryFailure`.
    async fn send(&self, request: &DeliveryRequest) -> Result<u16>;
}

pub type WebhookTransportRef = Arc<dyn WebhookTransport>;
