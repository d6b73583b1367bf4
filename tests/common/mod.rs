#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use payledger::application::engine::LedgerEngine;
use payledger::config::LedgerConfig;
use payledger::domain::money::Money;
use payledger::domain::payment::{NewPayment, Payment};
use payledger::domain::ports::{DeliveryRequest, WebhookTransport};
use payledger::error::{LedgerError, Result};
use payledger::infrastructure::clock::ManualClock;
use payledger::infrastructure::in_memory::InMemoryLedgerStore;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 9, 10, 12, 0, 0).unwrap()
}

pub fn engine_with(config: &LedgerConfig) -> (LedgerEngine, ManualClock) {
    let clock = ManualClock::new(start());
    let engine = LedgerEngine::new(
        Arc::new(InMemoryLedgerStore::new()),
        Arc::new(clock.clone()),
        config,
    );
    (engine, clock)
}

pub fn engine() -> (LedgerEngine, ManualClock) {
    engine_with(&LedgerConfig::default())
}

pub fn new_payment(order_id: u64, gross: i64, fee: i64) -> NewPayment {
    NewPayment {
        order_id,
        customer_id: 7,
        provider_id: 1,
        provider_tx_id: None,
        currency: "CLP".to_string(),
        amount_gross: Money::new(gross),
        fee: Money::new(fee),
    }
}

pub async fn captured(engine: &LedgerEngine, order_id: u64, gross: i64, fee: i64) -> Payment {
    let payment = engine
        .payments()
        .authorize(new_payment(order_id, gross, fee))
        .await
        .unwrap();
    engine.payments().capture(payment.id, None).await.unwrap()
}

/// What the fake endpoint does with one request.
#[derive(Debug, Clone)]
pub enum Reply {
    Status(u16),
    Refuse,
    Hang(Duration),
}

/// Scripted webhook endpoint. Once the script runs out it answers `fallback`.
pub struct FakeTransport {
    script: Mutex<VecDeque<Reply>>,
    fallback: Reply,
    sent: Mutex<Vec<DeliveryRequest>>,
}

impl FakeTransport {
    pub fn always(reply: Reply) -> Arc<Self> {
        Self::scripted(Vec::new(), reply)
    }

    pub fn scripted(script: Vec<Reply>, fallback: Reply) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback,
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn sent(&self) -> Vec<DeliveryRequest> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl WebhookTransport for FakeTransport {
    async fn send(&self, request: &DeliveryRequest) -> Result<u16> {
        self.sent.lock().unwrap().push(request.clone());
        let reply = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        match reply {
            Reply::Status(code) => Ok(code),
            Reply::Refuse => Err(LedgerError::DeliveryFailure("connection refused".to_string())),
            Reply::Hang(duration) => {
                tokio::time::sleep(duration).await;
                Ok(200)
            }
        }
    }
}

pub fn write_file(path: &Path, contents: &str) {
    std::fs::write(path, contents).unwrap();
}
