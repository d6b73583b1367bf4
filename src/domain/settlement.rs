use super::money::Money;
use super::record::{EntityKind, RecordMeta, impl_record};
use super::refund::OperatorId;
use crate::error::{LedgerError, Result};
use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A calendar month of provider activity, written `YYYY-MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SettlementPeriod {
    year: i32,
    month: u32,
}

impl SettlementPeriod {
    pub fn new(year: i32, month: u32) -> Result<Self> {
        if !(1..=12).contains(&month) {
            return Err(LedgerError::ValidationError(format!(
                "invalid month {} in settlement period",
                month
            )));
        }
        Ok(Self { year, month })
    }

    pub fn start(&self) -> DateTime<Utc> {
        month_start(self.year, self.month)
    }

    /// Exclusive end of the period.
    pub fn end(&self) -> DateTime<Utc> {
        if self.month == 12 {
            month_start(self.year + 1, 1)
        } else {
            month_start(self.year, self.month + 1)
        }
    }

    pub fn compact(&self) -> String {
        format!("{:04}{:02}", self.year, self.month)
    }
}

fn month_start(year: i32, month: u32) -> DateTime<Utc> {
    // Month is validated on construction, so day 1 always exists.
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .unwrap_or_default()
}

impl std::str::FromStr for SettlementPeriod {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || {
            LedgerError::ValidationError(format!("settlement period '{}' is not YYYY-MM", s))
        };
        let (year, month) = s.trim().split_once('-').ok_or_else(invalid)?;
        if year.len() != 4 || month.len() != 2 {
            return Err(invalid());
        }
        let year = year.parse().map_err(|_| invalid())?;
        let month = month.parse().map_err(|_| invalid())?;
        Self::new(year, month)
    }
}

impl TryFrom<String> for SettlementPeriod {
    type Error = LedgerError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<SettlementPeriod> for String {
    fn from(period: SettlementPeriod) -> Self {
        period.to_string()
    }
}

impl fmt::Display for SettlementPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl From<NaiveDate> for SettlementPeriod {
    fn from(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SettlementStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl SettlementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementStatus::Pending => "pending",
            SettlementStatus::Processing => "processing",
            SettlementStatus::Completed => "completed",
            SettlementStatus::Failed => "failed",
        }
    }

    pub fn can_transition_to(&self, next: SettlementStatus) -> bool {
        use SettlementStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Failed)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Failed, Processing)
        )
    }
}

impl fmt::Display for SettlementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One reconciliation run for one provider over one period.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct Settlement {
    pub id: Uuid,
    pub provider_id: u64,
    pub period: SettlementPeriod,
    pub number: String,
    pub status: SettlementStatus,
    pub line_count: u64,
    pub matched_count: u64,
    pub ambiguous_count: u64,
    pub unmatched_count: u64,
    pub reviewed_count: u64,
    pub total_amount: Money,
    pub total_fee: Money,
    pub failure_reason: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub meta: RecordMeta,
}

impl_record!(Settlement, EntityKind::Settlement, |s| settlement_key(
    s.provider_id,
    s.period
));

pub fn settlement_key(provider_id: u64, period: SettlementPeriod) -> String {
    format!("{}{}", provider_prefix(provider_id), period)
}

pub fn provider_prefix(provider_id: u64) -> String {
    format!("{:020}:", provider_id)
}

impl Settlement {
    pub fn new(provider_id: u64, period: SettlementPeriod, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            provider_id,
            period,
            number: format!("STL-{}-{}", period.compact(), provider_id),
            status: SettlementStatus::Pending,
            line_count: 0,
            matched_count: 0,
            ambiguous_count: 0,
            unmatched_count: 0,
            reviewed_count: 0,
            total_amount: Money::ZERO,
            total_fee: Money::ZERO,
            failure_reason: None,
            processed_at: None,
            created_at: now,
            meta: RecordMeta::default(),
        }
    }

    /// Moves a pending or failed settlement into `processing` for a matching run.
    pub fn begin(&mut self) -> Result<()> {
        match self.status {
            SettlementStatus::Completed => Err(LedgerError::AlreadyFinalized),
            SettlementStatus::Processing => Ok(()),
            _ => {
                self.status = SettlementStatus::Processing;
                self.failure_reason = None;
                Ok(())
            }
        }
    }

    /// Recomputes the summary from the full line set and completes the settlement when
    /// no line is left awaiting review. Returns true if this call completed it.
    pub fn evaluate(&mut self, lines: &[SettlementLine], now: DateTime<Utc>) -> Result<bool> {
        if self.status == SettlementStatus::Completed {
            return Err(LedgerError::AlreadyFinalized);
        }
        let lines: Vec<&SettlementLine> =
            lines.iter().filter(|l| l.settlement_id == self.id).collect();
        self.line_count = lines.len() as u64;
        self.matched_count = count(&lines, |l| l.flag == MatchFlag::Matched);
        self.ambiguous_count = count(&lines, |l| l.flag == MatchFlag::Ambiguous);
        self.unmatched_count = count(&lines, |l| l.flag == MatchFlag::Unmatched);
        self.reviewed_count = count(&lines, |l| l.reviewed_by.is_some());
        self.total_amount = lines.iter().map(|l| l.amount).sum();
        self.total_fee = lines.iter().map(|l| l.fee).sum();

        if self.status == SettlementStatus::Processing && lines.iter().all(|l| !l.needs_review())
        {
            self.status = SettlementStatus::Completed;
            self.processed_at = Some(now);
            return Ok(true);
        }
        Ok(false)
    }

    pub fn fail(&mut self, reason: String) -> Result<()> {
        if !self.status.can_transition_to(SettlementStatus::Failed) {
            return Err(LedgerError::InvalidTransition {
                entity: "settlement",
                from: self.status.to_string(),
                action: "fail",
            });
        }
        self.status = SettlementStatus::Failed;
        self.failure_reason = Some(reason);
        Ok(())
    }
}

fn count(lines: &[&SettlementLine], pred: impl Fn(&SettlementLine) -> bool) -> u64 {
    lines.iter().filter(|l| pred(l)).count() as u64
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MatchFlag {
    Matched,
    /// Several payments fit; the closest was bound and the line is flagged for audit.
    Ambiguous,
    /// No payment fits; needs manual review.
    Unmatched,
}

impl MatchFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchFlag::Matched => "matched",
            MatchFlag::Ambiguous => "ambiguous_match",
            MatchFlag::Unmatched => "unmatched",
        }
    }
}

impl fmt::Display for MatchFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One record of a provider's settlement feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedLine {
    pub provider_tx_id: String,
    pub amount: Money,
    pub fee: Money,
    pub date: Option<NaiveDate>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct SettlementLine {
    pub id: Uuid,
    pub settlement_id: Uuid,
    pub sequence: u64,
    pub provider_tx_id: String,
    pub amount: Money,
    pub fee: Money,
    pub date: Option<NaiveDate>,
    pub matched_payment_id: Option<Uuid>,
    pub flag: MatchFlag,
    pub candidate_count: u32,
    pub reviewed_by: Option<OperatorId>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub review_note: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub meta: RecordMeta,
}

impl_record!(SettlementLine, EntityKind::SettlementLine, |l| line_key(
    l.settlement_id,
    l.sequence
));

pub fn line_key(settlement_id: Uuid, sequence: u64) -> String {
    format!("{}/{:08}", settlement_id, sequence)
}

pub fn line_prefix(settlement_id: Uuid) -> String {
    format!("{}/", settlement_id)
}

impl SettlementLine {
    pub fn new(
        settlement_id: Uuid,
        sequence: u64,
        feed: &FeedLine,
        result: MatchResult,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            settlement_id,
            sequence,
            provider_tx_id: feed.provider_tx_id.clone(),
            amount: feed.amount,
            fee: feed.fee,
            date: feed.date,
            matched_payment_id: result.payment_id,
            flag: result.flag,
            candidate_count: result.candidate_count,
            reviewed_by: None,
            reviewed_at: None,
            review_note: None,
            created_at: now,
            meta: RecordMeta::default(),
        }
    }

    pub fn needs_review(&self) -> bool {
        self.matched_payment_id.is_none() && self.reviewed_by.is_none()
    }

    pub fn as_feed(&self) -> FeedLine {
        FeedLine {
            provider_tx_id: self.provider_tx_id.clone(),
            amount: self.amount,
            fee: self.fee,
            date: self.date,
        }
    }

    pub fn rebind(&mut self, result: MatchResult) {
        self.matched_payment_id = result.payment_id;
        self.flag = result.flag;
        self.candidate_count = result.candidate_count;
    }

    /// Drops a match whose payment can no longer be settled; the line needs review again.
    pub fn unbind(&mut self) {
        self.matched_payment_id = None;
        self.flag = MatchFlag::Unmatched;
        self.candidate_count = 0;
    }

    pub fn mark_reviewed(
        &mut self,
        operator: &str,
        note: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if operator.trim().is_empty() {
            return Err(LedgerError::MissingOperator);
        }
        self.reviewed_by = Some(operator.to_string());
        self.reviewed_at = Some(now);
        self.review_note = note;
        Ok(())
    }
}

/// A payment as the matcher sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchCandidate {
    pub payment_id: Uuid,
    pub provider_tx_id: Option<String>,
    pub amount_net: Money,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchPolicy {
    /// Slack around the period boundaries for capture timestamps.
    pub window: Duration,
    /// Largest accepted |amount_net - line amount|, in minor units.
    pub tolerance: Money,
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self {
            window: Duration::days(3),
            tolerance: Money::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchResult {
    pub payment_id: Option<Uuid>,
    pub flag: MatchFlag,
    pub candidate_count: u32,
}

/// Picks the payment a feed line settles.
///
/// A payment carrying the line's provider reference wins outright. Otherwise every
/// candidate captured inside the widened period with an `amount_net` within tolerance
/// is considered: one means matched, none means unmatched, several means the closest
/// amount (then earliest capture, then id) is bound and the line flagged ambiguous.
pub fn match_line(
    line: &FeedLine,
    period: SettlementPeriod,
    candidates: &[MatchCandidate],
    policy: &MatchPolicy,
) -> MatchResult {
    let by_reference: Vec<&MatchCandidate> = candidates
        .iter()
        .filter(|c| c.provider_tx_id.as_deref() == Some(line.provider_tx_id.as_str()))
        .collect();
    if by_reference.len() == 1 {
        return MatchResult {
            payment_id: Some(by_reference[0].payment_id),
            flag: MatchFlag::Matched,
            candidate_count: 1,
        };
    }

    let from = period.start() - policy.window;
    let until = period.end() + policy.window;
    let mut fits: Vec<&MatchCandidate> = candidates
        .iter()
        .filter(|c| c.captured_at >= from && c.captured_at < until)
        .filter(|c| (c.amount_net - line.amount).abs() <= policy.tolerance)
        .collect();

    match fits.len() {
        0 => MatchResult {
            payment_id: None,
            flag: MatchFlag::Unmatched,
            candidate_count: 0,
        },
        1 => MatchResult {
            payment_id: Some(fits[0].payment_id),
            flag: MatchFlag::Matched,
            candidate_count: 1,
        },
        n => {
            fits.sort_by_key(|c| {
                (
                    (c.amount_net - line.amount).abs(),
                    c.captured_at,
                    c.payment_id,
                )
            });
            MatchResult {
                payment_id: Some(fits[0].payment_id),
                flag: MatchFlag::Ambiguous,
                candidate_count: n as u32,
            }
        }
    }
}
