#![cfg(feature = "storage-rocksdb")]

mod common;

use assert_cmd::cargo_bin;
use common::write_file;
use std::process::Command;
use tempfile::tempdir;

fn ledger(db_path: &std::path::Path) -> Command {
    let mut cmd = Command::new(cargo_bin!("payledger"));
    cmd.env_remove("LEDGER_DB_PATH").arg("--db-path").arg(db_path);
    cmd
}

#[test]
fn test_rocksdb_settlement_survives_restart() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("ledger_db");
    let feed = dir.path().join("feed.csv");
    let empty_feed = dir.path().join("empty.csv");
    let payments = dir.path().join("payments.csv");
    write_file(&feed, "provider_tx_id,amount,fee\nTX-1,97000,3000\n");
    write_file(&empty_feed, "provider_tx_id,amount,fee\n");
    write_file(
        &payments,
        "order_id,customer_id,provider_id,provider_tx_id,currency,amount_gross,fee,captured_at\n\
         10,3,1,,CLP,100000,3000,2026-09-10T12:00:00Z\n",
    );

    // 1. The feed arrives before the payment is known.
    let output = ledger(&db_path)
        .args(["reconcile", "--provider", "1", "--period", "2026-09"])
        .arg(&feed)
        .output()
        .expect("Failed to execute command");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("TX-1,97000,3000,,unmatched"));

    // 2. A later run imports the payment and re-matches the stored line.
    let output = ledger(&db_path)
        .args(["reconcile", "--provider", "1", "--period", "2026-09", "--payments"])
        .arg(&payments)
        .arg(&empty_feed)
        .output()
        .expect("Failed to execute command");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains(",matched"));
    assert!(!stdout.contains("unmatched"));

    // 3. The ledger replays cleanly from disk.
    let status = ledger(&db_path).arg("audit").status().unwrap();
    assert!(status.success());

    // 4. A completed settlement is final.
    let output = ledger(&db_path)
        .args(["reconcile", "--provider", "1", "--period", "2026-09"])
        .arg(&feed)
        .output()
        .expect("Failed to execute command");
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("already finalized"));
}
