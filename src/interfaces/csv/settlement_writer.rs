use crate::domain::money::Money;
use crate::domain::settlement::SettlementLine;
use crate::error::Result;
use serde::Serialize;
use std::io::Write;
use uuid::Uuid;

#[derive(Serialize)]
struct LineRow<'a> {
    provider_tx_id: &'a str,
    amount: Money,
    fee: Money,
    matched_payment_id: Option<Uuid>,
    #[serde(rename = "match")]
    flag: &'static str,
}

/// Writes settlement lines as CSV: `provider_tx_id, amount, fee, matched_payment_id, match`.
///
/// Amounts are written in minor units.
pub struct SettlementWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> SettlementWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    pub fn write_lines(&mut self, lines: &[SettlementLine]) -> Result<()> {
        for line in lines {
            let flag = if line.reviewed_by.is_some() && line.matched_payment_id.is_none() {
                "reviewed"
            } else {
                line.flag.as_str()
            };
            self.writer.serialize(LineRow {
                provider_tx_id: &line.provider_tx_id,
                amount: line.amount,
                fee: line.fee,
                matched_payment_id: line.matched_payment_id,
                flag,
            })?;
        }
        self.writer.flush()?;
        Ok(())
    }
}
