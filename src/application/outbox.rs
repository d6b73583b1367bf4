use super::repository::Repository;
use crate::domain::event::{EventType, LedgerEvent};
use crate::domain::ports::WriteBatch;
use crate::domain::webhook::{WebhookDelivery, WebhookSubscriber};
use crate::error::Result;
use chrono::{DateTime, Utc};
use tracing::debug;
use url::Url;
use uuid::Uuid;

/// Turns ledger events into pending deliveries inside the mutation's own batch, so an
/// event is queued if and only if the change that produced it commits.
#[derive(Clone)]
pub struct Outbox {
    repo: Repository,
}

impl Outbox {
    pub fn new(repo: Repository) -> Self {
        Self { repo }
    }

    /// Stages one delivery per interested subscriber per event. Returns how many.
    pub async fn stage(
        &self,
        batch: &mut WriteBatch,
        events: &[LedgerEvent],
        now: DateTime<Utc>,
    ) -> Result<usize> {
        if events.is_empty() {
            return Ok(0);
        }
        let subscribers: Vec<WebhookSubscriber> = self.repo.scan("").await?;

        let mut staged = 0;
        for (ordinal, event) in events.iter().enumerate() {
            for subscriber in subscribers.iter().filter(|s| s.wants(event.event_type)) {
                let mut delivery = WebhookDelivery::enqueue(subscriber, event, ordinal as u32, now);
                Repository::stage(batch, &mut delivery, now)?;
                staged += 1;
            }
            debug!(event_id = %event.event_id, event = %event.event_type, "event staged");
        }
        Ok(staged)
    }

    pub async fn subscribe(
        &self,
        url: Url,
        events: Vec<EventType>,
        now: DateTime<Utc>,
    ) -> Result<WebhookSubscriber> {
        let mut subscriber = WebhookSubscriber::new(url, events, now)?;
        let mut batch = WriteBatch::new();
        Repository::stage(&mut batch, &mut subscriber, now)?;
        self.repo.commit(batch).await?;
        Ok(subscriber)
    }

    /// Stops new deliveries to the subscriber. Already queued deliveries still run.
    pub async fn deactivate(&self, subscriber_id: Uuid, now: DateTime<Utc>) -> Result<WebhookSubscriber> {
        let mut subscriber: WebhookSubscriber =
            self.repo.require(&subscriber_id.to_string()).await?;
        subscriber.active = false;
        let mut batch = WriteBatch::new();
        Repository::stage(&mut batch, &mut subscriber, now)?;
        self.repo.commit(batch).await?;
        Ok(subscriber)
    }

    pub async fn subscribers(&self) -> Result<Vec<WebhookSubscriber>> {
        self.repo.scan("").await
    }
}
