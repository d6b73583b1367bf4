use crate::domain::money::Money;
use crate::domain::payment::NewPayment;
use crate::error::{LedgerError, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::io::Read;

#[derive(Debug, Deserialize)]
struct PaymentRow {
    order_id: u64,
    customer_id: u64,
    provider_id: u64,
    #[serde(default)]
    provider_tx_id: Option<String>,
    currency: String,
    amount_gross: Decimal,
    fee: Decimal,
    captured_at: DateTime<Utc>,
}

/// A captured payment as exported by the order subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedPayment {
    pub payment: NewPayment,
    pub captured_at: DateTime<Utc>,
}

/// Reads captured payments with columns
/// `order_id, customer_id, provider_id, provider_tx_id, currency, amount_gross, fee, captured_at`.
pub struct PaymentReader<R: Read> {
    reader: csv::Reader<R>,
    scale: u32,
}

impl<R: Read> PaymentReader<R> {
    pub fn new(source: R, scale: u32) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader, scale }
    }

    pub fn payments(self) -> impl Iterator<Item = Result<CapturedPayment>> {
        let scale = self.scale;
        self.reader.into_deserialize::<PaymentRow>().map(move |row| {
            let row = row.map_err(LedgerError::from)?;
            Ok(CapturedPayment {
                payment: NewPayment {
                    order_id: row.order_id,
                    customer_id: row.customer_id,
                    provider_id: row.provider_id,
                    provider_tx_id: row.provider_tx_id.filter(|id| !id.is_empty()),
                    currency: row.currency,
                    amount_gross: Money::from_decimal(row.amount_gross, scale)?,
                    fee: Money::from_decimal(row.fee, scale)?,
                },
                captured_at: row.captured_at,
            })
        })
    }
}
