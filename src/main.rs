use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};
use payledger::application::engine::LedgerEngine;
use payledger::config::config_loader;
use payledger::domain::ports::WebhookTransportRef;
use payledger::domain::settlement::{FeedLine, SettlementPeriod};
use payledger::infrastructure::http::HttpWebhookTransport;
use payledger::interfaces::csv::payment_reader::PaymentReader;
use payledger::interfaces::csv::settlement_feed_reader::SettlementFeedReader;
use payledger::interfaces::csv::settlement_writer::SettlementWriter;
use payledger::observability::init_tracing;
use std::collections::HashSet;
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Reconciles a provider settlement feed and prints its lines as CSV.
    Reconcile {
        #[arg(long)]
        provider: u64,
        /// Settlement month, YYYY-MM.
        #[arg(long)]
        period: SettlementPeriod,
        /// Captured payments to import before matching.
        #[arg(long)]
        payments: Option<PathBuf>,
        /// Decimal places of the currency's minor unit.
        #[arg(long, default_value_t = 0, value_parser = clap::value_parser!(u32).range(0..=18))]
        scale: u32,
        /// Settlement feed CSV file.
        feed: PathBuf,
    },
    /// Replays gift card and payment ledgers; exits non-zero on any mismatch.
    Audit,
    /// Delivers pending webhooks.
    Dispatch {
        /// Run a single pass instead of polling until interrupted.
        #[arg(long)]
        once: bool,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing().into_diagnostic()?;

    let mut config = config_loader::load().into_diagnostic()?;
    if cli.db_path.is_some() {
        config.storage.db_path = cli.db_path;
    }
    let engine = LedgerEngine::from_config(&config).into_diagnostic()?;

    match cli.command {
        Command::Reconcile {
            provider,
            period,
            payments,
            scale,
            feed,
        } => {
            if let Some(path) = payments {
                import_payments(&engine, path, scale).await?;
            }

            let file = File::open(feed).into_diagnostic()?;
            let mut lines: Vec<FeedLine> = Vec::new();
            for (row, line) in SettlementFeedReader::new(file, scale).lines().enumerate() {
                match line {
                    Ok(line) => lines.push(line),
                    Err(e) => warn!(row = row + 1, error = %e, "skipping unreadable feed row"),
                }
            }

            let report = engine
                .reconciler()
                .reconcile(provider, period, lines)
                .await
                .into_diagnostic()?;

            let stdout = io::stdout();
            let mut writer = SettlementWriter::new(stdout.lock());
            writer.write_lines(&report.lines).into_diagnostic()?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Audit => {
            let report = engine.audit().await.into_diagnostic()?;
            for audit in report.payments.iter().filter(|a| !a.consistent) {
                error!(payment_id = %audit.payment_id, "payment ledger does not replay to its cached totals");
            }
            for audit in report.gift_cards.iter().filter(|a| !a.consistent) {
                error!(gift_card_id = %audit.gift_card_id, "gift card log does not replay to its cached balance");
            }
            if report.is_consistent() {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::FAILURE)
            }
        }
        Command::Dispatch { once } => {
            let transport: WebhookTransportRef = Arc::new(
                HttpWebhookTransport::new(config.webhook.dispatcher_settings().timeout)
                    .into_diagnostic()?,
            );
            let dispatcher = engine.dispatcher(transport);
            if once {
                dispatcher.run_once().await.into_diagnostic()?;
            } else {
                dispatcher
                    .run_until(async {
                        if let Err(e) = tokio::signal::ctrl_c().await {
                            error!(error = %e, "failed to listen for shutdown signal");
                        }
                    })
                    .await
                    .into_diagnostic()?;
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Imports captured payments, skipping orders the store already holds for the same provider.
async fn import_payments(engine: &LedgerEngine, path: PathBuf, scale: u32) -> Result<()> {
    let mut known: HashSet<(u64, u64)> = engine
        .payments()
        .list()
        .await
        .into_diagnostic()?
        .into_iter()
        .map(|p| (p.provider_id, p.order_id))
        .collect();

    let file = File::open(path).into_diagnostic()?;
    let mut imported = 0usize;
    for (row, record) in PaymentReader::new(file, scale).payments().enumerate() {
        let captured = match record {
            Ok(captured) => captured,
            Err(e) => {
                warn!(row = row + 1, error = %e, "skipping unreadable payment row");
                continue;
            }
        };
        if !known.insert((captured.payment.provider_id, captured.payment.order_id)) {
            continue;
        }
        match engine
            .payments()
            .record_captured(captured.payment, captured.captured_at)
            .await
        {
            Ok(_) => imported += 1,
            Err(e) => warn!(row = row + 1, error = %e, "skipping rejected payment row"),
        }
    }
    info!(imported, "captured payments imported");
    Ok(())
}
