//! Application layer: services that run each ledger operation as one
//! read-guard-write cycle under per-entity locks, plus the webhook outbox and
//! dispatcher.

pub mod chargebacks;
pub mod context;
pub mod dispatcher;
pub mod engine;
pub mod gift_cards;
pub mod locks;
pub mod outbox;
pub mod payments;
pub mod reconciler;
pub mod refunds;
pub mod repository;
