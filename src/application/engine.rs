use super::chargebacks::ChargebackService;
use super::context::LedgerContext;
use super::dispatcher::{DispatcherSettings, WebhookDispatcher};
use super::gift_cards::GiftCardService;
use super::outbox::Outbox;
use super::payments::PaymentService;
use super::reconciler::SettlementReconciler;
use super::refunds::RefundService;
use crate::config::LedgerConfig;
use crate::domain::gift_card::{GiftCard, GiftCardAudit, GiftCardTransaction, transaction_prefix};
use crate::domain::payment::{Payment, PaymentAudit, PaymentEntry, entry_prefix};
use crate::domain::ports::{ClockRef, LedgerStoreRef, WebhookTransportRef};
use crate::error::Result;
use crate::infrastructure::clock::SystemClock;
use crate::infrastructure::in_memory::InMemoryLedgerStore;
use std::sync::Arc;
use tracing::{info, warn};

/// The main entry point of the ledger.
///
/// `LedgerEngine` wires every service to one store, one lock registry and one clock,
/// so operations issued through any of them serialize per entity.
#[derive(Clone)]
pub struct LedgerEngine {
    ctx: LedgerContext,
    payments: PaymentService,
    refunds: RefundService,
    gift_cards: GiftCardService,
    chargebacks: ChargebackService,
    reconciler: SettlementReconciler,
    dispatcher_settings: DispatcherSettings,
}

impl LedgerEngine {
    /// Creates a new `LedgerEngine`.
    ///
    /// # Arguments
    ///
    /// * `store` - Backend holding every ledger record.
    /// * `clock` - Source of time for every rule that depends on it.
    /// * `config` - Reconciliation and webhook policy.
    pub fn new(store: LedgerStoreRef, clock: ClockRef, config: &LedgerConfig) -> Self {
        let ctx = LedgerContext::new(store, clock);
        Self {
            payments: PaymentService::new(ctx.clone()),
            refunds: RefundService::new(ctx.clone()),
            gift_cards: GiftCardService::new(ctx.clone()),
            chargebacks: ChargebackService::new(ctx.clone()),
            reconciler: SettlementReconciler::new(
                ctx.clone(),
                config.reconciliation.match_policy(),
            ),
            dispatcher_settings: config.webhook.dispatcher_settings(),
            ctx,
        }
    }

    /// An engine over a fresh in-memory store and the system clock.
    pub fn in_memory(config: &LedgerConfig) -> Self {
        Self::new(
            Arc::new(InMemoryLedgerStore::new()),
            Arc::new(SystemClock),
            config,
        )
    }

    /// Opens the store named by the configuration: RocksDB when a path is set,
    /// otherwise memory.
    pub fn from_config(config: &LedgerConfig) -> Result<Self> {
        match &config.storage.db_path {
            #[cfg(feature = "storage-rocksdb")]
            Some(path) => {
                let store = crate::infrastructure::rocksdb::RocksDBStore::open(path)?;
                info!(path = %path.display(), "opened RocksDB ledger store");
                Ok(Self::new(Arc::new(store), Arc::new(SystemClock), config))
            }
            #[cfg(not(feature = "storage-rocksdb"))]
            Some(path) => Err(crate::error::LedgerError::Config(format!(
                "LEDGER_DB_PATH is set to {} but this build lacks the storage-rocksdb feature",
                path.display()
            ))),
            None => Ok(Self::in_memory(config)),
        }
    }

    pub fn payments(&self) -> &PaymentService {
        &self.payments
    }

    pub fn refunds(&self) -> &RefundService {
        &self.refunds
    }

    pub fn gift_cards(&self) -> &GiftCardService {
        &self.gift_cards
    }

    pub fn chargebacks(&self) -> &ChargebackService {
        &self.chargebacks
    }

    pub fn reconciler(&self) -> &SettlementReconciler {
        &self.reconciler
    }

    pub fn webhooks(&self) -> &Outbox {
        &self.ctx.outbox
    }

    pub fn dispatcher(&self, transport: WebhookTransportRef) -> WebhookDispatcher {
        WebhookDispatcher::new(self.ctx.clone(), transport, self.dispatcher_settings)
    }

    /// Replays every gift card and payment ledger against its cached totals.
    pub async fn audit(&self) -> Result<AuditReport> {
        let repo = &self.ctx.repo;

        let mut gift_cards = Vec::new();
        for card in repo.scan::<GiftCard>("").await? {
            let transactions: Vec<GiftCardTransaction> =
                repo.scan(&transaction_prefix(card.id)).await?;
            gift_cards.push(GiftCardAudit::replay(&card, &transactions));
        }

        let mut payments = Vec::new();
        for payment in repo.scan::<Payment>("").await? {
            let entries: Vec<PaymentEntry> = repo.scan(&entry_prefix(payment.id)).await?;
            payments.push(PaymentAudit::replay(&payment, &entries));
        }

        let report = AuditReport {
            gift_cards,
            payments,
        };
        if report.is_consistent() {
            info!(
                gift_cards = report.gift_cards.len(),
                payments = report.payments.len(),
                "ledger audit clean"
            );
        } else {
            warn!(mismatches = report.mismatch_count(), "ledger audit found mismatches");
        }
        Ok(report)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditReport {
    pub gift_cards: Vec<GiftCardAudit>,
    pub payments: Vec<PaymentAudit>,
}

impl AuditReport {
    pub fn mismatch_count(&self) -> usize {
        self.gift_cards.iter().filter(|a| !a.consistent).count()
            + self.payments.iter().filter(|a| !a.consistent).count()
    }

    pub fn is_consistent(&self) -> bool {
        self.mismatch_count() == 0
    }
}
