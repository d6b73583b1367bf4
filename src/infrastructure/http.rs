use crate::domain::ports::{DeliveryRequest, WebhookTransport};
use crate::error::{LedgerError, Result};
use async_trait::async_trait;
use reqwest::{Client, header};
use std::time::Duration;

pub const EVENT_ID_HEADER: &str = "x-ledger-event-id";
pub const EVENT_TYPE_HEADER: &str = "x-ledger-event";
pub const DELIVERY_ID_HEADER: &str = "x-ledger-delivery-id";

/// POSTs webhook envelopes as JSON over HTTP(S).
///
/// Any response is returned as its status code; only connection-level problems are
/// errors. The dispatcher applies its own timeout on top of the client's.
#[derive(Clone)]
pub struct HttpWebhookTransport {
    client: Client,
}

impl HttpWebhookTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("payledger/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| LedgerError::InternalError(Box::new(e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WebhookTransport for HttpWebhookTransport {
    async fn send(&self, request: &DeliveryRequest) -> Result<u16> {
        let response = self
            .client
            .post(request.url.clone())
            .header(header::CONTENT_TYPE, "application/json")
            .header(EVENT_ID_HEADER, request.event_id.to_string())
            .header(EVENT_TYPE_HEADER, request.event_type.as_str())
            .header(DELIVERY_ID_HEADER, request.delivery_id.to_string())
            .json(&request.body)
            .send()
            .await
            .map_err(|e| LedgerError::DeliveryFailure(e.to_string()))?;
        Ok(response.status().as_u16())
    }
}
