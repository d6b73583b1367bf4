use super::config_model::{LedgerConfig, ReconciliationConfig, StorageConfig, WebhookConfig};
use crate::error::{LedgerError, Result};
use std::path::PathBuf;
use std::str::FromStr;

/// Loads configuration from the process environment, after reading `.env` if present.
pub fn load() -> Result<LedgerConfig> {
    dotenvy::dotenv().ok();
    from_lookup(|key| std::env::var(key).ok())
}

/// Builds configuration from an arbitrary key lookup; unset keys take their defaults.
pub fn from_lookup<F>(lookup: F) -> Result<LedgerConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let defaults = LedgerConfig::default();

    let webhook = WebhookConfig {
        max_attempts: parse(&lookup, "LEDGER_WEBHOOK_MAX_ATTEMPTS", defaults.webhook.max_attempts)?,
        backoff_base_ms: parse(&lookup, "LEDGER_WEBHOOK_BACKOFF_BASE_MS", defaults.webhook.backoff_base_ms)?,
        backoff_max_ms: parse(&lookup, "LEDGER_WEBHOOK_BACKOFF_MAX_MS", defaults.webhook.backoff_max_ms)?,
        timeout_ms: parse(&lookup, "LEDGER_WEBHOOK_TIMEOUT_MS", defaults.webhook.timeout_ms)?,
        workers: parse(&lookup, "LEDGER_WEBHOOK_WORKERS", defaults.webhook.workers)?,
        poll_interval_ms: parse(&lookup, "LEDGER_WEBHOOK_POLL_INTERVAL_MS", defaults.webhook.poll_interval_ms)?,
    };
    if webhook.max_attempts == 0 {
        return Err(invalid("LEDGER_WEBHOOK_MAX_ATTEMPTS", "must be at least 1"));
    }
    if webhook.workers == 0 {
        return Err(invalid("LEDGER_WEBHOOK_WORKERS", "must be at least 1"));
    }
    if webhook.backoff_max_ms < webhook.backoff_base_ms {
        return Err(invalid(
            "LEDGER_WEBHOOK_BACKOFF_MAX_MS",
            "must not be below LEDGER_WEBHOOK_BACKOFF_BASE_MS",
        ));
    }

    let reconciliation = ReconciliationConfig {
        window_days: parse(&lookup, "LEDGER_SETTLEMENT_WINDOW_DAYS", defaults.reconciliation.window_days)?,
        amount_tolerance: parse(
            &lookup,
            "LEDGER_SETTLEMENT_AMOUNT_TOLERANCE",
            defaults.reconciliation.amount_tolerance,
        )?,
    };
    if reconciliation.amount_tolerance < 0 {
        return Err(invalid("LEDGER_SETTLEMENT_AMOUNT_TOLERANCE", "must not be negative"));
    }

    let storage = StorageConfig {
        db_path: lookup("LEDGER_DB_PATH")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from),
    };

    Ok(LedgerConfig {
        webhook,
        reconciliation,
        storage,
    })
}

fn parse<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| invalid(key, &e.to_string())),
        _ => Ok(default),
    }
}

fn invalid(key: &str, reason: &str) -> LedgerError {
    LedgerError::Config(format!("{} {}", key, reason))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, LedgerConfig::default());
        assert_eq!(config.webhook.max_attempts, 5);
        assert_eq!(config.reconciliation.window_days, 3);
        assert!(config.storage.db_path.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = from_lookup(lookup(&[
            ("LEDGER_WEBHOOK_MAX_ATTEMPTS", "3"),
            ("LEDGER_SETTLEMENT_AMOUNT_TOLERANCE", "25"),
            ("LEDGER_DB_PATH", "/var/lib/ledger"),
        ]))
        .unwrap();
        assert_eq!(config.webhook.retry_policy().max_attempts, 3);
        assert_eq!(config.reconciliation.amount_tolerance, 25);
        assert_eq!(config.storage.db_path, Some(PathBuf::from("/var/lib/ledger")));
    }

    #[test]
    fn test_invalid_value_names_variable() {
        let err = from_lookup(lookup(&[("LEDGER_WEBHOOK_WORKERS", "many")])).unwrap_err();
        assert!(err.to_string().contains("LEDGER_WEBHOOK_WORKERS"));

        let err = from_lookup(lookup(&[("LEDGER_WEBHOOK_MAX_ATTEMPTS", "0")])).unwrap_err();
        assert!(matches!(err, LedgerError::Config(_)));
    }
}
