mod common;

use chrono::{TimeZone, Utc};
use common::{captured, engine, new_payment};
use payledger::domain::gift_card::TransactionRequest;
use payledger::domain::money::{Amount, Money};
use payledger::domain::settlement::{FeedLine, SettlementPeriod, SettlementStatus};
use payledger::error::LedgerError;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_spends_never_overdraw() {
    let (engine, _) = engine();
    let card = engine
        .gift_cards()
        .issue(Amount::new(1000).unwrap(), None, None)
        .await
        .unwrap();

    let mut handles = Vec::new();
    for order_id in 0..20u64 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .gift_cards()
                .apply(card.id, TransactionRequest::spend(Money::new(100)).with_order(order_id))
                .await
        }));
    }

    let mut accepted = 0;
    let mut rejected = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => accepted += 1,
            // Once the card is emptied it is redeemed and refuses further spends outright.
            Err(LedgerError::InsufficientBalance { .. } | LedgerError::CardNotUsable { .. }) => {
                rejected += 1
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(accepted, 10);
    assert_eq!(rejected, 10);

    let stored = engine.gift_cards().get(card.id).await.unwrap().unwrap();
    assert_eq!(stored.balance, Money::ZERO);
    let log = engine.gift_cards().transactions(card.id).await.unwrap();
    assert_eq!(log.len(), 10);
    let sequences: Vec<u64> = log.iter().map(|t| t.sequence).collect();
    assert_eq!(sequences, (1..=10).collect::<Vec<u64>>());
    assert!(engine.gift_cards().audit(card.id).await.unwrap().consistent);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_approvals_respect_remainder() {
    let (engine, _) = engine();
    let payment = captured(&engine, 1, 1000, 0).await;

    let mut refund_ids = Vec::new();
    for requester in ["alice", "carol"] {
        let refund = engine
            .refunds()
            .request(payment.id, Amount::new(600).unwrap(), None, requester.to_string())
            .await
            .unwrap();
        engine.refunds().submit(refund.id).await.unwrap();
        refund_ids.push(refund.id);
    }

    let handles: Vec<_> = refund_ids
        .into_iter()
        .map(|id| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.refunds().approve(id, "bob").await })
        })
        .collect();

    let mut approved = 0;
    let mut over = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => approved += 1,
            Err(LedgerError::OverRefund { .. }) => over += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!((approved, over), (1, 1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_process_debits_once() {
    let (engine, _) = engine();
    let payment = captured(&engine, 1, 1000, 0).await;
    let refund = engine
        .refunds()
        .request(payment.id, Amount::new(400).unwrap(), None, "alice".to_string())
        .await
        .unwrap();
    engine.refunds().submit(refund.id).await.unwrap();
    engine.refunds().approve(refund.id, "bob").await.unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.refunds().process(refund.id).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let stored = engine.payments().get(payment.id).await.unwrap().unwrap();
    assert_eq!(stored.refunded_total, Money::new(400));
    assert_eq!(engine.payments().entries(payment.id).await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_neighbouring_periods_never_share_a_payment() {
    let feed = |id: &str| {
        vec![FeedLine {
            provider_tx_id: id.to_string(),
            amount: Money::new(500),
            fee: Money::ZERO,
            date: None,
        }]
    };
    let august: SettlementPeriod = "2026-08".parse().unwrap();
    let september: SettlementPeriod = "2026-09".parse().unwrap();

    for round in 0..25u64 {
        let (engine, _) = engine();
        // Inside the capture window of both periods.
        let payment = engine
            .payments()
            .record_captured(
                new_payment(round, 500, 0),
                Utc.with_ymd_and_hms(2026, 9, 1, 12, 0, 0).unwrap(),
            )
            .await
            .unwrap();

        let first = {
            let engine = engine.clone();
            let feed = feed("A");
            tokio::spawn(async move { engine.reconciler().reconcile(1, august, feed).await })
        };
        let second = {
            let engine = engine.clone();
            let feed = feed("B");
            tokio::spawn(async move { engine.reconciler().reconcile(1, september, feed).await })
        };
        let reports = [first.await.unwrap().unwrap(), second.await.unwrap().unwrap()];

        let bound: Vec<_> = reports
            .iter()
            .flat_map(|r| r.lines.iter())
            .filter(|l| l.matched_payment_id == Some(payment.id))
            .collect();
        assert_eq!(bound.len(), 1, "round {round}");

        let completed: Vec<_> = reports.iter().filter(|r| r.completed).collect();
        assert_eq!(completed.len(), 1, "round {round}");
        assert_eq!(completed[0].settlement.status, SettlementStatus::Completed);

        let stored = engine.payments().get(payment.id).await.unwrap().unwrap();
        assert_eq!(stored.settled_in, Some(completed[0].settlement.id));
        assert_eq!(engine.reconciler().unmatched_report().await.unwrap().len(), 1);
    }
}
