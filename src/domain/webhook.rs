use super::event::{EventType, LedgerEvent, ResourceRef};
use super::ports::DeliveryRequest;
use super::record::{EntityKind, RecordMeta, impl_record};
use crate::error::{LedgerError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use url::Url;
use uuid::Uuid;

/// A registered endpoint. An empty `events` list subscribes to everything.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct WebhookSubscriber {
    pub id: Uuid,
    pub url: Url,
    pub events: Vec<EventType>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub meta: RecordMeta,
}

impl_record!(WebhookSubscriber, EntityKind::WebhookSubscriber, |s| s
    .id
    .to_string());

impl WebhookSubscriber {
    pub fn new(url: Url, events: Vec<EventType>, now: DateTime<Utc>) -> Result<Self> {
        if !matches!(url.scheme(), "http" | "https") {
            return Err(LedgerError::ValidationError(format!(
                "webhook url must be http(s), got '{}'",
                url
            )));
        }
        Ok(Self {
            id: Uuid::new_v4(),
            url,
            events,
            active: true,
            created_at: now,
            meta: RecordMeta::default(),
        })
    }

    pub fn wants(&self, event_type: EventType) -> bool {
        self.active && (self.events.is_empty() || self.events.contains(&event_type))
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exponential backoff with a capped attempt count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following the `attempts`-th failure.
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// `None` once `attempts` has used up the budget.
    pub fn after_failure(&self, attempts: u32) -> Option<Duration> {
        if attempts >= self.max_attempts {
            None
        } else {
            Some(self.next_delay(attempts))
        }
    }
}

/// What one delivery attempt produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Responded(u16),
    TransportError(String),
    TimedOut,
}

impl AttemptOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, AttemptOutcome::Responded(code) if (200..300).contains(code))
    }

    fn describe(&self) -> String {
        match self {
            AttemptOutcome::Responded(code) => format!("endpoint responded {}", code),
            AttemptOutcome::TransportError(message) => message.clone(),
            AttemptOutcome::TimedOut => "timed out".to_string(),
        }
    }
}

/// One event addressed to one subscriber.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct WebhookDelivery {
    pub id: Uuid,
    pub subscriber_id: Uuid,
    pub endpoint: Url,
    pub event_id: Uuid,
    pub event_type: EventType,
    pub resource: ResourceRef,
    pub payload: serde_json::Value,
    pub status: DeliveryStatus,
    pub retry_count: u32,
    pub response_code: Option<u16>,
    pub last_error: Option<String>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub manual_redeliveries: u32,
    /// Position of the event within the mutation that produced it.
    pub ordinal: u32,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub meta: RecordMeta,
}

impl_record!(WebhookDelivery, EntityKind::WebhookDelivery, |d| d
    .id
    .to_string());

impl WebhookDelivery {
    pub fn enqueue(
        subscriber: &WebhookSubscriber,
        event: &LedgerEvent,
        ordinal: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            subscriber_id: subscriber.id,
            endpoint: subscriber.url.clone(),
            event_id: event.event_id,
            event_type: event.event_type,
            resource: event.resource,
            payload: event.envelope(),
            status: DeliveryStatus::Pending,
            retry_count: 0,
            response_code: None,
            last_error: None,
            next_attempt_at: Some(now),
            delivered_at: None,
            failed_at: None,
            manual_redeliveries: 0,
            ordinal,
            created_at: now,
            meta: RecordMeta::default(),
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == DeliveryStatus::Pending && self.next_attempt_at.is_none_or(|at| at <= now)
    }

    pub fn request(&self) -> DeliveryRequest {
        DeliveryRequest {
            delivery_id: self.id,
            event_id: self.event_id,
            event_type: self.event_type.to_string(),
            url: self.endpoint.clone(),
            body: self.payload.clone(),
        }
    }

    /// Folds one attempt into the delivery. Every attempt counts against the budget.
    pub fn record_attempt(
        &mut self,
        outcome: &AttemptOutcome,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if self.status != DeliveryStatus::Pending {
            return Err(LedgerError::AlreadyFinalized);
        }
        self.retry_count += 1;
        if let AttemptOutcome::Responded(code) = outcome {
            self.response_code = Some(*code);
        }

        if outcome.is_success() {
            self.status = DeliveryStatus::Delivered;
            self.delivered_at = Some(now);
            self.next_attempt_at = None;
            self.last_error = None;
            return Ok(());
        }

        self.last_error = Some(outcome.describe());
        match policy.after_failure(self.retry_count) {
            Some(delay) => {
                let delay = chrono::Duration::from_std(delay)
                    .map_err(|e| LedgerError::InternalError(Box::new(e)))?;
                self.next_attempt_at = Some(now + delay);
            }
            None => {
                self.status = DeliveryStatus::Failed;
                self.failed_at = Some(now);
                self.next_attempt_at = None;
            }
        }
        Ok(())
    }

    /// Operator-initiated retry of a terminally failed delivery with a fresh budget.
    pub fn redeliver(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.status != DeliveryStatus::Failed {
            return Err(LedgerError::InvalidTransition {
                entity: "webhook delivery",
                from: self.status.to_string(),
                action: "redeliver",
            });
        }
        self.status = DeliveryStatus::Pending;
        self.retry_count = 0;
        self.manual_redeliveries += 1;
        self.next_attempt_at = Some(now);
        self.failed_at = None;
        Ok(())
    }
}
