pub mod chargeback;
pub mod event;
pub mod gift_card;
pub mod money;
pub mod payment;
pub mod ports;
pub mod record;
pub mod refund;
pub mod settlement;
pub mod webhook;
