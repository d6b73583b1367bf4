use crate::application::dispatcher::DispatcherSettings;
use crate::domain::money::Money;
use crate::domain::settlement::MatchPolicy;
use crate::domain::webhook::RetryPolicy;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerConfig {
    pub webhook: WebhookConfig,
    pub reconciliation: ReconciliationConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookConfig {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub timeout_ms: u64,
    pub workers: usize,
    pub poll_interval_ms: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base_ms: 1_000,
            backoff_max_ms: 300_000,
            timeout_ms: 10_000,
            workers: 8,
            poll_interval_ms: 1_000,
        }
    }
}

impl WebhookConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.backoff_base_ms),
            max_delay: Duration::from_millis(self.backoff_max_ms),
        }
    }

    pub fn dispatcher_settings(&self) -> DispatcherSettings {
        DispatcherSettings {
            retry: self.retry_policy(),
            timeout: Duration::from_millis(self.timeout_ms),
            workers: self.workers,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationConfig {
    pub window_days: u32,
    /// Accepted |amount_net - line amount|, in minor units.
    pub amount_tolerance: i64,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            window_days: 3,
            amount_tolerance: 0,
        }
    }
}

impl ReconciliationConfig {
    pub fn match_policy(&self) -> MatchPolicy {
        MatchPolicy {
            window: chrono::Duration::days(i64::from(self.window_days)),
            tolerance: Money::new(self.amount_tolerance),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageConfig {
    /// RocksDB directory; `None` keeps everything in memory.
    pub db_path: Option<PathBuf>,
}
