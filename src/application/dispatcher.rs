use super::context::LedgerContext;
use super::locks::EntityLocks;
use super::repository::Repository;
use crate::domain::event::ResourceRef;
use crate::domain::ports::{DeliveryRequest, WebhookTransportRef, WriteBatch};
use crate::domain::record::EntityKind;
use crate::domain::webhook::{AttemptOutcome, DeliveryStatus, RetryPolicy, WebhookDelivery};
use crate::error::{LedgerError, Result};
use std::collections::BTreeMap;
use std::future::Future;
use std::ops::AddAssign;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherSettings {
    pub retry: RetryPolicy,
    /// Upper bound on a single HTTP attempt.
    pub timeout: Duration,
    /// Concurrent delivery streams.
    pub workers: usize,
    pub poll_interval: Duration,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            timeout: Duration::from_secs(10),
            workers: 8,
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Counts from one dispatch pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSummary {
    pub attempted: usize,
    pub delivered: usize,
    pub retrying: usize,
    pub failed: usize,
}

impl AddAssign for DispatchSummary {
    fn add_assign(&mut self, rhs: Self) {
        self.attempted += rhs.attempted;
        self.delivered += rhs.delivered;
        self.retrying += rhs.retrying;
        self.failed += rhs.failed;
    }
}

type StreamKey = (Uuid, ResourceRef);

/// Delivers pending webhooks with bounded concurrency.
///
/// Deliveries are grouped into streams by `(subscriber, resource)`. Streams run in
/// parallel up to `workers`; inside a stream deliveries go out one at a time in
/// creation order, and a stream stops at its first delivery that is not yet due or
/// that just failed. No ledger lock is held while a request is in flight.
#[derive(Clone)]
pub struct WebhookDispatcher {
    ctx: LedgerContext,
    transport: WebhookTransportRef,
    settings: DispatcherSettings,
    streams: EntityLocks,
}

impl WebhookDispatcher {
    pub fn new(
        ctx: LedgerContext,
        transport: WebhookTransportRef,
        settings: DispatcherSettings,
    ) -> Self {
        Self {
            ctx,
            transport,
            settings,
            streams: EntityLocks::new(),
        }
    }

    /// Runs one pass over every due stream and waits for it to finish.
    pub async fn run_once(&self) -> Result<DispatchSummary> {
        let now = self.ctx.clock.now();
        let pending: Vec<WebhookDelivery> = self
            .ctx
            .repo
            .scan::<WebhookDelivery>("")
            .await?
            .into_iter()
            .filter(|d| d.status == DeliveryStatus::Pending)
            .collect();

        let mut streams: BTreeMap<StreamKey, Vec<WebhookDelivery>> = BTreeMap::new();
        for delivery in pending {
            streams
                .entry((delivery.subscriber_id, delivery.resource))
                .or_default()
                .push(delivery);
        }

        let semaphore = Arc::new(Semaphore::new(self.settings.workers.max(1)));
        let mut tasks = JoinSet::new();
        for (key, mut deliveries) in streams {
            deliveries.sort_by_key(|d| (d.created_at, d.ordinal, d.id));
            if !deliveries[0].is_due(now) {
                continue;
            }
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| LedgerError::InternalError(Box::new(e)))?;
            let this = self.clone();
            tasks.spawn(async move {
                let _permit = permit;
                this.drain(key, deliveries).await
            });
        }

        let mut summary = DispatchSummary::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(stream)) => summary += stream,
                Ok(Err(e)) => error!(error = %e, "delivery stream aborted"),
                Err(e) => error!(error = %e, "delivery task panicked"),
            }
        }
        if summary.attempted > 0 {
            info!(
                attempted = summary.attempted,
                delivered = summary.delivered,
                retrying = summary.retrying,
                failed = summary.failed,
                "dispatch pass finished"
            );
        }
        Ok(summary)
    }

    /// Polls until `shutdown` resolves.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            if let Err(e) = self.run_once().await {
                error!(error = %e, "dispatch pass failed");
            }
            tokio::select! {
                _ = &mut shutdown => {
                    info!("dispatcher stopping");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }
    }

    async fn drain(&self, key: StreamKey, deliveries: Vec<WebhookDelivery>) -> Result<DispatchSummary> {
        let stream_id = format!("{}:{:?}:{}", key.0, key.1.resource_type, key.1.id);
        let _stream = self.streams.lock(EntityKind::WebhookDelivery, stream_id).await;
        let mut summary = DispatchSummary::default();

        for queued in deliveries {
            let Some(current) = self
                .ctx
                .repo
                .load::<WebhookDelivery>(&queued.id.to_string())
                .await?
            else {
                continue;
            };
            if current.status != DeliveryStatus::Pending {
                continue;
            }
            if !current.is_due(self.ctx.clock.now()) {
                break;
            }

            let outcome = self.attempt(&current.request()).await;
            summary.attempted += 1;

            let Some(recorded) = self.record(&current, &outcome).await? else {
                break;
            };
            match recorded.status {
                DeliveryStatus::Delivered => summary.delivered += 1,
                DeliveryStatus::Pending => {
                    summary.retrying += 1;
                    break;
                }
                DeliveryStatus::Failed => {
                    summary.failed += 1;
                    break;
                }
            }
        }
        Ok(summary)
    }

    async fn attempt(&self, request: &DeliveryRequest) -> AttemptOutcome {
        debug!(delivery_id = %request.delivery_id, url = %request.url, "sending webhook");
        match tokio::time::timeout(self.settings.timeout, self.transport.send(request)).await {
            Ok(Ok(code)) => AttemptOutcome::Responded(code),
            Ok(Err(e)) => AttemptOutcome::TransportError(e.to_string()),
            Err(_) => AttemptOutcome::TimedOut,
        }
    }

    /// Folds the outcome into the stored delivery. Returns `None` if someone else
    /// recorded an attempt for it in the meantime.
    async fn record(
        &self,
        sent: &WebhookDelivery,
        outcome: &AttemptOutcome,
    ) -> Result<Option<WebhookDelivery>> {
        let _guard = self
            .ctx
            .locks
            .lock(EntityKind::WebhookDelivery, sent.id)
            .await;
        let now = self.ctx.clock.now();
        let mut delivery: WebhookDelivery = self.ctx.repo.require(&sent.id.to_string()).await?;
        if delivery.meta.version != sent.meta.version {
            warn!(delivery_id = %delivery.id, "delivery changed during attempt, outcome discarded");
            return Ok(None);
        }
        delivery.record_attempt(outcome, &self.settings.retry, now)?;

        let mut batch = WriteBatch::new();
        Repository::stage(&mut batch, &mut delivery, now)?;
        self.ctx.repo.commit(batch).await?;

        match delivery.status {
            DeliveryStatus::Delivered => info!(
                delivery_id = %delivery.id,
                event = %delivery.event_type,
                attempts = delivery.retry_count,
                response_code = ?delivery.response_code,
                "webhook delivered"
            ),
            DeliveryStatus::Pending => warn!(
                delivery_id = %delivery.id,
                event = %delivery.event_type,
                attempts = delivery.retry_count,
                error = delivery.last_error.as_deref().unwrap_or_default(),
                next_attempt_at = ?delivery.next_attempt_at,
                "webhook attempt failed, will retry"
            ),
            DeliveryStatus::Failed => error!(
                delivery_id = %delivery.id,
                subscriber_id = %delivery.subscriber_id,
                event_id = %delivery.event_id,
                event = %delivery.event_type,
                attempts = delivery.retry_count,
                error = delivery.last_error.as_deref().unwrap_or_default(),
                "webhook delivery failed permanently"
            ),
        }
        Ok(Some(delivery))
    }

    /// Requeues a terminally failed delivery with a fresh attempt budget.
    pub async fn redeliver(&self, delivery_id: Uuid) -> Result<WebhookDelivery> {
        let _guard = self
            .ctx
            .locks
            .lock(EntityKind::WebhookDelivery, delivery_id)
            .await;
        let now = self.ctx.clock.now();
        let mut delivery: WebhookDelivery =
            self.ctx.repo.require(&delivery_id.to_string()).await?;
        delivery.redeliver(now)?;

        let mut batch = WriteBatch::new();
        Repository::stage(&mut batch, &mut delivery, now)?;
        self.ctx.repo.commit(batch).await?;
        info!(delivery_id = %delivery.id, manual_redeliveries = delivery.manual_redeliveries, "webhook requeued by operator");
        Ok(delivery)
    }

    pub async fn deliveries(&self) -> Result<Vec<WebhookDelivery>> {
        self.ctx.repo.scan("").await
    }

    /// Deliveries that exhausted their budget, oldest first.
    pub async fn failed_deliveries(&self) -> Result<Vec<WebhookDelivery>> {
        let mut failed: Vec<WebhookDelivery> = self.deliveries().await?;
        failed.retain(|d| d.status == DeliveryStatus::Failed);
        failed.sort_by_key(|d| (d.failed_at, d.id));
        Ok(failed)
    }
}
