use super::money::{Amount, Money};
use super::record::{EntityKind, RecordMeta, impl_record};
use super::refund::OperatorId;
use crate::error::{LedgerError, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Alphabet for card codes; drops 0/O and 1/I so codes survive being read aloud.
pub const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
pub const CODE_LENGTH: usize = 16;

pub fn generate_code<R: Rng>(rng: &mut R) -> String {
    (0..CODE_LENGTH)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Hash)]
#[serde(rename_all = "lowercase")]
pub enum GiftCardStatus {
    Active,
    Inactive,
    Expired,
    Redeemed,
}

impl GiftCardStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GiftCardStatus::Active => "active",
            GiftCardStatus::Inactive => "inactive",
            GiftCardStatus::Expired => "expired",
            GiftCardStatus::Redeemed => "redeemed",
        }
    }
}

impl fmt::Display for GiftCardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Hash)]
#[serde(rename_all = "lowercase")]
pub enum GiftCardTransactionType {
    Spend,
    Topup,
    Adjustment,
    Reversal,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransactionSource {
    #[default]
    Api,
    Ui,
    Pos,
}

/// A request to move value on a card.
///
/// `amount` is a magnitude for spend, topup and reversal; for adjustments its sign is
/// the direction of the correction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRequest {
    pub transaction_type: GiftCardTransactionType,
    pub amount: Money,
    pub order_id: Option<u64>,
    #[serde(default)]
    pub source: TransactionSource,
    pub operator: Option<OperatorId>,
    pub notes: Option<String>,
}

impl TransactionRequest {
    pub fn new(transaction_type: GiftCardTransactionType, amount: Money) -> Self {
        Self {
            transaction_type,
            amount,
            order_id: None,
            source: TransactionSource::Api,
            operator: None,
            notes: None,
        }
    }

    pub fn spend(amount: Money) -> Self {
        Self::new(GiftCardTransactionType::Spend, amount)
    }

    pub fn topup(amount: Money) -> Self {
        Self::new(GiftCardTransactionType::Topup, amount)
    }

    pub fn reversal(amount: Money) -> Self {
        Self::new(GiftCardTransactionType::Reversal, amount)
    }

    pub fn adjustment(amount: Money, operator: impl Into<OperatorId>) -> Self {
        Self {
            operator: Some(operator.into()),
            ..Self::new(GiftCardTransactionType::Adjustment, amount)
        }
    }

    pub fn with_order(mut self, order_id: u64) -> Self {
        self.order_id = Some(order_id);
        self
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct GiftCard {
    pub id: Uuid,
    pub code: String,
    pub initial_balance: Money,
    /// Cache of `initial_balance + Σ transaction amounts`.
    pub balance: Money,
    /// Highest balance the card may hold: `initial_balance + Σ topups and reversals`.
    pub ceiling: Money,
    pub status: GiftCardStatus,
    pub expires_at: Option<DateTime<Utc>>,
    pub issued_to_customer_id: Option<u64>,
    pub transaction_count: u64,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub meta: RecordMeta,
}

impl_record!(GiftCard, EntityKind::GiftCard, |c| c.id.to_string());

impl GiftCard {
    pub fn issue(
        code: String,
        initial_balance: Amount,
        expires_at: Option<DateTime<Utc>>,
        issued_to_customer_id: Option<u64>,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        if let Some(expiry) = expires_at
            && expiry <= now
        {
            return Err(LedgerError::ValidationError(
                "cannot issue a gift card that is already expired".to_string(),
            ));
        }
        Ok(Self {
            id: Uuid::new_v4(),
            code,
            initial_balance: initial_balance.money(),
            balance: initial_balance.money(),
            ceiling: initial_balance.money(),
            status: GiftCardStatus::Active,
            expires_at,
            issued_to_customer_id,
            transaction_count: 0,
            created_at: now,
            meta: RecordMeta::default(),
        })
    }

    pub fn is_past_expiry(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expiry| expiry <= now)
    }

    /// Validates and applies one transaction, returning the ledger entry to append.
    ///
    /// On error the card is left untouched.
    pub fn apply(
        &mut self,
        request: &TransactionRequest,
        now: DateTime<Utc>,
    ) -> Result<GiftCardTransaction> {
        use GiftCardTransactionType::*;

        if request.amount == Money::ZERO {
            return Err(LedgerError::ValidationError(
                "transaction amount must not be zero".to_string(),
            ));
        }
        if request.transaction_type != Adjustment && request.amount.is_negative() {
            return Err(LedgerError::ValidationError(format!(
                "{:?} amount must be positive",
                request.transaction_type
            )));
        }

        let expired = self.status == GiftCardStatus::Expired || self.is_past_expiry(now);
        let (signed, ceiling) = match request.transaction_type {
            Spend => {
                if expired {
                    return Err(self.not_usable("expired"));
                }
                if self.status != GiftCardStatus::Active {
                    return Err(self.not_usable(self.status.as_str()));
                }
                if request.amount > self.balance {
                    return Err(LedgerError::InsufficientBalance {
                        requested: request.amount,
                        available: self.balance,
                    });
                }
                (-request.amount, self.ceiling)
            }
            Topup => {
                if expired {
                    return Err(self.not_usable("expired"));
                }
                if !matches!(
                    self.status,
                    GiftCardStatus::Active | GiftCardStatus::Redeemed
                ) {
                    return Err(self.not_usable(self.status.as_str()));
                }
                (request.amount, self.ceiling.checked_add(request.amount)?)
            }
            Reversal => (request.amount, self.ceiling.checked_add(request.amount)?),
            Adjustment => {
                if request
                    .operator
                    .as_deref()
                    .is_none_or(|op| op.trim().is_empty())
                {
                    return Err(LedgerError::MissingOperator);
                }
                let after = self.balance.checked_add(request.amount)?;
                if after.is_negative() {
                    return Err(LedgerError::InsufficientBalance {
                        requested: request.amount.abs(),
                        available: self.balance,
                    });
                }
                if after > self.ceiling {
                    return Err(LedgerError::ValidationError(format!(
                        "adjustment would raise balance to {} above ceiling {}",
                        after, self.ceiling
                    )));
                }
                (request.amount, self.ceiling)
            }
        };

        let balance_before = self.balance;
        let balance_after = balance_before.checked_add(signed)?;
        let sequence = self.transaction_count + 1;

        self.balance = balance_after;
        self.ceiling = ceiling;
        self.transaction_count = sequence;
        self.normalize_status();

        Ok(GiftCardTransaction {
            id: Uuid::new_v4(),
            gift_card_id: self.id,
            sequence,
            transaction_type: request.transaction_type,
            amount: signed,
            balance_before,
            balance_after,
            order_id: request.order_id,
            source: request.source,
            operator: request.operator.clone(),
            notes: request.notes.clone(),
            created_at: now,
            meta: RecordMeta::default(),
        })
    }

    pub fn activate(&mut self, now: DateTime<Utc>) -> Result<()> {
        match self.status {
            GiftCardStatus::Inactive if !self.is_past_expiry(now) => {
                self.status = GiftCardStatus::Active;
                self.normalize_status();
                Ok(())
            }
            _ => Err(self.invalid("activate")),
        }
    }

    pub fn deactivate(&mut self) -> Result<()> {
        match self.status {
            GiftCardStatus::Active | GiftCardStatus::Redeemed => {
                self.status = GiftCardStatus::Inactive;
                Ok(())
            }
            _ => Err(self.invalid("deactivate")),
        }
    }

    /// Moves a card whose expiry has passed to `expired`. Returns whether anything changed.
    pub fn expire(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != GiftCardStatus::Expired && self.is_past_expiry(now) {
            self.status = GiftCardStatus::Expired;
            true
        } else {
            false
        }
    }

    fn normalize_status(&mut self) {
        match self.status {
            GiftCardStatus::Active if self.balance == Money::ZERO => {
                self.status = GiftCardStatus::Redeemed
            }
            GiftCardStatus::Redeemed if self.balance.is_positive() => {
                self.status = GiftCardStatus::Active
            }
            _ => {}
        }
    }

    fn not_usable(&self, status: &str) -> LedgerError {
        LedgerError::CardNotUsable {
            status: status.to_string(),
        }
    }

    fn invalid(&self, action: &'static str) -> LedgerError {
        LedgerError::InvalidTransition {
            entity: "gift_card",
            from: self.status.to_string(),
            action,
        }
    }
}

/// Unique-code index entry; written once with the card so two cards can never share a code.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct GiftCardCode {
    pub code: String,
    pub gift_card_id: Uuid,
    #[serde(flatten)]
    pub meta: RecordMeta,
}

impl_record!(GiftCardCode, EntityKind::GiftCardCode, |c| c.code.clone());

/// Append-only ledger entry. Never rewritten; corrections are new entries.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct GiftCardTransaction {
    pub id: Uuid,
    pub gift_card_id: Uuid,
    pub sequence: u64,
    pub transaction_type: GiftCardTransactionType,
    /// Signed effect on the balance.
    pub amount: Money,
    pub balance_before: Money,
    pub balance_after: Money,
    pub order_id: Option<u64>,
    pub source: TransactionSource,
    pub operator: Option<OperatorId>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub meta: RecordMeta,
}

impl_record!(
    GiftCardTransaction,
    EntityKind::GiftCardTransaction,
    |t| transaction_key(t.gift_card_id, t.sequence)
);

pub fn transaction_key(card_id: Uuid, sequence: u64) -> String {
    format!("{}/{:012}", card_id, sequence)
}

pub fn transaction_prefix(card_id: Uuid) -> String {
    format!("{}/", card_id)
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct GiftCardAudit {
    pub gift_card_id: Uuid,
    pub stored_balance: Money,
    pub replayed_balance: Money,
    pub transactions: u64,
    /// Sequence of the first entry whose `balance_after` disagrees with the replay.
    pub first_divergence: Option<u64>,
    pub consistent: bool,
}

impl GiftCardAudit {
    /// Replays `transactions` (in sequence order) from the card's initial balance.
    pub fn replay(card: &GiftCard, transactions: &[GiftCardTransaction]) -> Self {
        let mut balance = card.initial_balance;
        let mut first_divergence = None;
        let mut expected_sequence = 1;

        for tx in transactions.iter().filter(|t| t.gift_card_id == card.id) {
            balance += tx.amount;
            if first_divergence.is_none()
                && (tx.balance_after != balance || tx.sequence != expected_sequence)
            {
                first_divergence = Some(tx.sequence);
            }
            expected_sequence += 1;
        }
        let count = expected_sequence - 1;

        Self {
            gift_card_id: card.id,
            stored_balance: card.balance,
            replayed_balance: balance,
            transactions: count,
            first_divergence,
            consistent: first_divergence.is_none()
                && balance == card.balance
                && count == card.transaction_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn card(initial: i64) -> GiftCard {
        GiftCard::issue(
            "TESTCODE23456789".to_string(),
            Amount::new(initial).unwrap(),
            None,
            None,
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn test_generate_code_uses_alphabet() {
        let mut rng = rand::thread_rng();
        let code = generate_code(&mut rng);
        assert_eq!(code.len(), CODE_LENGTH);
        assert!(code.bytes().all(|b| CODE_ALPHABET.contains(&b)));
    }

    #[test]
    fn test_spend_and_overspend() {
        let mut card = card(20000);
        let tx = card
            .apply(&TransactionRequest::spend(Money::new(15000)), Utc::now())
            .unwrap();
        assert_eq!(tx.amount, Money::new(-15000));
        assert_eq!(tx.balance_after, Money::new(5000));
        assert_eq!(card.balance, Money::new(5000));

        let err = card
            .apply(&TransactionRequest::spend(Money::new(6000)), Utc::now())
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientBalance { .. }));
        assert_eq!(card.balance, Money::new(5000));
        assert_eq!(card.transaction_count, 1);
    }

    #[test]
    fn test_spend_to_zero_redeems_and_topup_reactivates() {
        let mut card = card(1000);
        card.apply(&TransactionRequest::spend(Money::new(1000)), Utc::now())
            .unwrap();
        assert_eq!(card.status, GiftCardStatus::Redeemed);

        assert!(matches!(
            card.apply(&TransactionRequest::spend(Money::new(1)), Utc::now()),
            Err(LedgerError::CardNotUsable { .. })
        ));

        card.apply(&TransactionRequest::topup(Money::new(500)), Utc::now())
            .unwrap();
        assert_eq!(card.status, GiftCardStatus::Active);
        assert_eq!(card.ceiling, Money::new(1500));
    }

    #[test]
    fn test_adjustment_requires_operator_and_respects_bounds() {
        let mut card = card(1000);
        let mut request = TransactionRequest::new(GiftCardTransactionType::Adjustment, Money::new(-100));
        assert!(matches!(
            card.apply(&request, Utc::now()),
            Err(LedgerError::MissingOperator)
        ));

        request.operator = Some("carol".to_string());
        let tx = card.apply(&request, Utc::now()).unwrap();
        assert_eq!(tx.balance_after, Money::new(900));

        // Cannot push above the ceiling without a topup or reversal.
        let up = TransactionRequest::adjustment(Money::new(200), "carol");
        assert!(matches!(
            card.apply(&up, Utc::now()),
            Err(LedgerError::ValidationError(_))
        ));

        let down = TransactionRequest::adjustment(Money::new(-901), "carol");
        assert!(matches!(
            card.apply(&down, Utc::now()),
            Err(LedgerError::InsufficientBalance { .. })
        ));
    }

    #[test]
    fn test_expired_card_rejects_spend_but_accepts_reversal() {
        let now = Utc::now();
        let mut card = GiftCard::issue(
            "EXPIRESOONABCDEF".to_string(),
            Amount::new(1000).unwrap(),
            Some(now + Duration::days(1)),
            None,
            now,
        )
        .unwrap();
        let later = now + Duration::days(2);
        assert!(matches!(
            card.apply(&TransactionRequest::spend(Money::new(10)), later),
            Err(LedgerError::CardNotUsable { .. })
        ));
        card.apply(&TransactionRequest::reversal(Money::new(10)), later)
            .unwrap();
        assert!(card.expire(later));
        assert_eq!(card.status, GiftCardStatus::Expired);
    }

    #[test]
    fn test_issue_rejects_past_expiry() {
        let now = Utc::now();
        let result = GiftCard::issue(
            "X".repeat(16),
            Amount::new(10).unwrap(),
            Some(now - Duration::seconds(1)),
            None,
            now,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_inactive_card_cycle() {
        let mut card = card(100);
        card.deactivate().unwrap();
        assert!(matches!(
            card.apply(&TransactionRequest::spend(Money::new(10)), Utc::now()),
            Err(LedgerError::CardNotUsable { .. })
        ));
        card.activate(Utc::now()).unwrap();
        assert_eq!(card.status, GiftCardStatus::Active);
        assert!(card.activate(Utc::now()).is_err());
    }

    #[test]
    fn test_replay_reproduces_balance() {
        let mut card = card(20000);
        let now = Utc::now();
        let txs = vec![
            card.apply(&TransactionRequest::spend(Money::new(15000)), now)
                .unwrap(),
            card.apply(&TransactionRequest::topup(Money::new(3000)), now)
                .unwrap(),
            card.apply(&TransactionRequest::adjustment(Money::new(-500), "ops"), now)
                .unwrap(),
            card.apply(&TransactionRequest::reversal(Money::new(15000)), now)
                .unwrap(),
        ];
        let audit = GiftCardAudit::replay(&card, &txs);
        assert!(audit.consistent);
        assert_eq!(audit.replayed_balance, Money::new(22500));
        assert_eq!(audit.transactions, 4);

        let mut tampered = txs.clone();
        tampered[1].balance_after = Money::new(1);
        let audit = GiftCardAudit::replay(&card, &tampered);
        assert!(!audit.consistent);
        assert_eq!(audit.first_divergence, Some(2));
    }
}
