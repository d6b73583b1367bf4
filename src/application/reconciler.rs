use super::context::LedgerContext;
use super::locks::LockKey;
use super::repository::Repository;
use crate::domain::event::{EventType, LedgerEvent, ResourceRef, ResourceType};
use crate::domain::payment::{Payment, PaymentStatus};
use crate::domain::ports::WriteBatch;
use crate::domain::record::{EntityKind, Record};
use crate::domain::settlement::{
    FeedLine, MatchCandidate, MatchFlag, MatchPolicy, Settlement, SettlementLine,
    SettlementPeriod, SettlementStatus, line_prefix, match_line, provider_prefix, settlement_key,
};
use crate::error::{LedgerError, Result};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::HashSet;
use tracing::{info, warn};
use uuid::Uuid;

/// Outcome of one reconciliation run.
#[derive(Debug, Clone)]
pub struct ReconcileReport {
    pub settlement: Settlement,
    pub lines: Vec<SettlementLine>,
    /// Feed references ignored because the settlement already has a line for them.
    pub duplicates: Vec<String>,
    pub completed: bool,
}

/// Matches a provider's settlement feed against captured payments.
///
/// Every mutation holds the provider's lock. Neighbouring periods share candidates
/// through the capture window, so at most one matching pass per provider is in flight
/// and a payment can only ever be bound to one line.
#[derive(Clone)]
pub struct SettlementReconciler {
    ctx: LedgerContext,
    policy: MatchPolicy,
}

impl SettlementReconciler {
    pub fn new(ctx: LedgerContext, policy: MatchPolicy) -> Self {
        Self { ctx, policy }
    }

    /// Reconciles `feed` into the settlement for `provider_id` and `period`.
    ///
    /// A first run creates the settlement. A later run on a `processing` settlement
    /// re-matches its unreviewed unmatched lines and appends lines for new references.
    /// A `completed` settlement is rejected with `AlreadyFinalized`.
    pub async fn reconcile(
        &self,
        provider_id: u64,
        period: SettlementPeriod,
        feed: Vec<FeedLine>,
    ) -> Result<ReconcileReport> {
        let key = settlement_key(provider_id, period);
        let _guard = self.lock_provider(provider_id).await;
        let now = self.ctx.clock.now();

        let mut settlement = match self.ctx.repo.load::<Settlement>(&key).await? {
            Some(existing) => existing,
            None => Settlement::new(provider_id, period, now),
        };
        settlement.begin()?;

        let mut lines: Vec<SettlementLine> =
            self.ctx.repo.scan(&line_prefix(settlement.id)).await?;
        let payments = self.open_payments(provider_id).await?;
        let mut bound = self.bound_payments().await?;

        let mut batch = WriteBatch::new();
        let mut dirty: HashSet<u64> = HashSet::new();

        for line in lines.iter_mut().filter(|l| l.needs_review()) {
            let pool = candidates(&payments, &bound);
            let result = match_line(&line.as_feed(), period, &pool, &self.policy);
            if let Some(payment_id) = result.payment_id {
                bound.insert(payment_id);
                line.rebind(result);
                dirty.insert(line.sequence);
                info!(provider_tx_id = %line.provider_tx_id, %payment_id, "previously unmatched line now matched");
            }
        }

        let mut seen: HashSet<String> = lines.iter().map(|l| l.provider_tx_id.clone()).collect();
        let mut sequence = lines.iter().map(|l| l.sequence).max().unwrap_or(0);
        let mut duplicates = Vec::new();

        for feed_line in &feed {
            if !seen.insert(feed_line.provider_tx_id.clone()) {
                warn!(provider_tx_id = %feed_line.provider_tx_id, "duplicate feed reference skipped");
                duplicates.push(feed_line.provider_tx_id.clone());
                continue;
            }
            let pool = candidates(&payments, &bound);
            let result = match_line(feed_line, period, &pool, &self.policy);
            if let Some(payment_id) = result.payment_id {
                bound.insert(payment_id);
            }
            if result.flag == MatchFlag::Ambiguous {
                warn!(provider_tx_id = %feed_line.provider_tx_id, candidates = result.candidate_count, "ambiguous match flagged for audit");
            }

            sequence += 1;
            dirty.insert(sequence);
            lines.push(SettlementLine::new(settlement.id, sequence, feed_line, result, now));
        }

        let (completed, _settle_guard) = self
            .evaluate(&mut batch, &mut settlement, &mut lines, dirty, now)
            .await?;
        self.ctx.repo.commit(batch).await?;

        info!(
            settlement = %settlement.number,
            status = %settlement.status,
            lines = settlement.line_count,
            matched = settlement.matched_count,
            ambiguous = settlement.ambiguous_count,
            unmatched = settlement.unmatched_count,
            total_amount = %settlement.total_amount,
            "reconciliation finished"
        );

        Ok(ReconcileReport {
            settlement,
            lines,
            duplicates,
            completed,
        })
    }

    /// Marks an unmatched line as reviewed by an operator, completing the settlement
    /// when it was the last line awaiting review.
    pub async fn mark_reviewed(
        &self,
        provider_id: u64,
        period: SettlementPeriod,
        sequence: u64,
        operator: &str,
        note: Option<String>,
    ) -> Result<Settlement> {
        let key = settlement_key(provider_id, period);
        let _guard = self.lock_provider(provider_id).await;
        let now = self.ctx.clock.now();
        let mut settlement: Settlement = self.ctx.repo.require(&key).await?;
        if settlement.status == SettlementStatus::Completed {
            return Err(LedgerError::AlreadyFinalized);
        }
        let mut lines: Vec<SettlementLine> =
            self.ctx.repo.scan(&line_prefix(settlement.id)).await?;
        let line = lines
            .iter_mut()
            .find(|l| l.sequence == sequence)
            .ok_or_else(|| LedgerError::not_found("settlement_line", sequence))?;
        line.mark_reviewed(operator, note, now)?;
        info!(settlement = %settlement.number, sequence, operator, "settlement line reviewed");

        let mut batch = WriteBatch::new();
        let (_, _settle_guard) = self
            .evaluate(&mut batch, &mut settlement, &mut lines, HashSet::from([sequence]), now)
            .await?;
        self.ctx.repo.commit(batch).await?;
        Ok(settlement)
    }

    pub async fn fail(
        &self,
        provider_id: u64,
        period: SettlementPeriod,
        reason: String,
    ) -> Result<Settlement> {
        let key = settlement_key(provider_id, period);
        let _guard = self.lock_provider(provider_id).await;
        let now = self.ctx.clock.now();
        let mut settlement: Settlement = self.ctx.repo.require(&key).await?;
        settlement.fail(reason)?;

        let mut batch = WriteBatch::new();
        Repository::stage(&mut batch, &mut settlement, now)?;
        self.ctx.repo.commit(batch).await?;
        warn!(settlement = %settlement.number, reason = settlement.failure_reason.as_deref().unwrap_or_default(), "settlement failed");
        Ok(settlement)
    }

    pub async fn get(&self, provider_id: u64, period: SettlementPeriod) -> Result<Option<Settlement>> {
        self.ctx.repo.load(&settlement_key(provider_id, period)).await
    }

    pub async fn for_provider(&self, provider_id: u64) -> Result<Vec<Settlement>> {
        self.ctx.repo.scan(&provider_prefix(provider_id)).await
    }

    pub async fn lines(&self, provider_id: u64, period: SettlementPeriod) -> Result<Vec<SettlementLine>> {
        match self.get(provider_id, period).await? {
            Some(settlement) => self.ctx.repo.scan(&line_prefix(settlement.id)).await,
            None => Ok(Vec::new()),
        }
    }

    /// Every line across all settlements still waiting for manual review.
    pub async fn unmatched_report(&self) -> Result<Vec<SettlementLine>> {
        let mut lines: Vec<SettlementLine> = self.ctx.repo.scan("").await?;
        lines.retain(|l| l.needs_review());
        Ok(lines)
    }

    async fn lock_provider(&self, provider_id: u64) -> super::locks::EntityGuard {
        self.ctx
            .locks
            .lock(EntityKind::Settlement, provider_prefix(provider_id))
            .await
    }

    /// Stages the changed lines, recomputes the summary, and on completion binds every
    /// matched payment to the settlement and emits `settlement.completed`, all into
    /// `batch`.
    ///
    /// Before completing, each matched payment is re-read under its lock. A line whose
    /// payment can no longer be bound (voided, or settled elsewhere) is unmatched
    /// again, which keeps the settlement `processing` until it is reviewed or rematched.
    /// The returned guard holds the matched payments' locks until the caller commits.
    async fn evaluate(
        &self,
        batch: &mut WriteBatch,
        settlement: &mut Settlement,
        lines: &mut [SettlementLine],
        mut dirty: HashSet<u64>,
        now: DateTime<Utc>,
    ) -> Result<(bool, Option<super::locks::EntityGuard>)> {
        let mut guard = None;
        let mut bindings: Vec<Payment> = Vec::new();

        if settlement.status == SettlementStatus::Processing
            && lines.iter().all(|l| !l.needs_review())
        {
            let keys: Vec<LockKey> = lines
                .iter()
                .filter_map(|l| l.matched_payment_id)
                .map(|id| (Payment::KIND, id.to_string()))
                .collect();
            guard = Some(self.ctx.locks.lock_many(keys).await);

            for line in lines.iter_mut() {
                let Some(payment_id) = line.matched_payment_id else {
                    continue;
                };
                let refusal = match self.ctx.repo.load::<Payment>(&payment_id.to_string()).await? {
                    Some(mut payment) => match payment.mark_settled(settlement.id) {
                        Ok(true) => {
                            bindings.push(payment);
                            None
                        }
                        Ok(false) => None,
                        Err(e) => Some(e.to_string()),
                    },
                    None => Some("payment not found".to_string()),
                };
                if let Some(reason) = refusal {
                    warn!(provider_tx_id = %line.provider_tx_id, %payment_id, reason = %reason, "matched payment cannot be settled, line needs review");
                    line.unbind();
                    dirty.insert(line.sequence);
                }
            }
        }

        for line in lines.iter_mut().filter(|l| dirty.contains(&l.sequence)) {
            Repository::stage(batch, line, now)?;
        }

        let completed = settlement.evaluate(lines, now)?;
        if completed {
            for payment in bindings.iter_mut() {
                Repository::stage(batch, payment, now)?;
            }

            let event = LedgerEvent::new(
                EventType::SettlementCompleted,
                ResourceRef::new(ResourceType::Settlement, settlement.id),
                now,
                json!({
                    "provider_id": settlement.provider_id,
                    "period": settlement.period,
                    "number": settlement.number,
                    "line_count": settlement.line_count,
                    "matched_count": settlement.matched_count,
                    "ambiguous_count": settlement.ambiguous_count,
                    "reviewed_count": settlement.reviewed_count,
                    "total_amount": settlement.total_amount,
                    "total_fee": settlement.total_fee,
                }),
            );
            self.ctx.outbox.stage(batch, &[event], now).await?;
            info!(settlement = %settlement.number, "settlement completed");
        }

        Repository::stage(batch, settlement, now)?;
        Ok((completed, guard))
    }

    async fn open_payments(&self, provider_id: u64) -> Result<Vec<Payment>> {
        let payments: Vec<Payment> = self.ctx.repo.scan("").await?;
        Ok(payments
            .into_iter()
            .filter(|p| p.provider_id == provider_id)
            .filter(|p| p.status == PaymentStatus::Captured && p.settled_in.is_none())
            .collect())
    }

    async fn bound_payments(&self) -> Result<HashSet<Uuid>> {
        let lines: Vec<SettlementLine> = self.ctx.repo.scan("").await?;
        Ok(lines.iter().filter_map(|l| l.matched_payment_id).collect())
    }
}

fn candidates(payments: &[Payment], bound: &HashSet<Uuid>) -> Vec<MatchCandidate> {
    payments
        .iter()
        .filter(|p| !bound.contains(&p.id))
        .filter_map(|p| {
            Some(MatchCandidate {
                payment_id: p.id,
                provider_tx_id: p.provider_tx_id.clone(),
                amount_net: p.amount_net,
                captured_at: p.captured_at?,
            })
        })
        .collect()
}
