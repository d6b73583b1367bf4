pub mod config_loader;
pub mod config_model;

pub use config_model::{LedgerConfig, ReconciliationConfig, StorageConfig, WebhookConfig};
