use crate::domain::money::Money;
use crate::domain::settlement::FeedLine;
use crate::error::{LedgerError, Result};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::io::Read;

/// One raw row of a provider settlement file.
#[derive(Debug, Deserialize)]
struct FeedRow {
    provider_tx_id: String,
    amount: Decimal,
    #[serde(default)]
    fee: Option<Decimal>,
    #[serde(default)]
    date: Option<NaiveDate>,
}

impl FeedRow {
    fn into_line(self, scale: u32) -> Result<FeedLine> {
        if self.provider_tx_id.is_empty() {
            return Err(LedgerError::ValidationError(
                "provider_tx_id is empty".to_string(),
            ));
        }
        Ok(FeedLine {
            provider_tx_id: self.provider_tx_id,
            amount: Money::from_decimal(self.amount, scale)?,
            fee: match self.fee {
                Some(fee) => Money::from_decimal(fee, scale)?,
                None => Money::ZERO,
            },
            date: self.date,
        })
    }
}

/// Reads a provider settlement feed with columns `provider_tx_id, amount, fee[, date]`.
///
/// Amounts are decimals in the currency's major unit and are converted to minor units
/// with `scale` decimal places (0 for zero-decimal currencies). Whitespace is trimmed
/// and rows may omit trailing optional columns.
pub struct SettlementFeedReader<R: Read> {
    reader: csv::Reader<R>,
    scale: u32,
}

impl<R: Read> SettlementFeedReader<R> {
    pub fn new(source: R, scale: u32) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader, scale }
    }

    /// Lazily yields one result per data row.
    pub fn lines(self) -> impl Iterator<Item = Result<FeedLine>> {
        let scale = self.scale;
        self.reader
            .into_deserialize::<FeedRow>()
            .map(move |row| row.map_err(LedgerError::from)?.into_line(scale))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_valid_stream() {
        let data = "provider_tx_id, amount, fee, date\nTX-1, 97000, 3000, 2026-09-10\nTX-2, 500, ,";
        let lines: Vec<Result<FeedLine>> = SettlementFeedReader::new(data.as_bytes(), 0)
            .lines()
            .collect();

        assert_eq!(lines.len(), 2);
        let first = lines[0].as_ref().unwrap();
        assert_eq!(first.amount, Money::new(97000));
        assert_eq!(first.fee, Money::new(3000));
        assert_eq!(first.date, NaiveDate::from_ymd_opt(2026, 9, 10));
        let second = lines[1].as_ref().unwrap();
        assert_eq!(second.fee, Money::ZERO);
        assert_eq!(second.date, None);
    }

    #[test]
    fn test_reader_scales_decimals() {
        let data = "provider_tx_id,amount,fee\nTX-1,12.34,0.5";
        let lines: Vec<FeedLine> = SettlementFeedReader::new(data.as_bytes(), 2)
            .lines()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(lines[0].amount, Money::new(1234));
        assert_eq!(lines[0].fee, Money::new(50));
    }

    #[test]
    fn test_reader_malformed_rows() {
        let data = "provider_tx_id,amount,fee\nTX-1,abc,0\n,10,0\nTX-3,1.5,0";
        let lines: Vec<Result<FeedLine>> = SettlementFeedReader::new(data.as_bytes(), 0)
            .lines()
            .collect();
        assert!(lines[0].is_err());
        assert!(lines[1].is_err());
        assert!(lines[2].is_err());
    }
}
