//! PostgreSQL store tests for billing-engine.
//!
//! Each test runs in its own schema and returns early when `TEST_DATABASE_URL` is not set.

mod common;

use billing_engine::error::BillingError;
use billing_engine::models::{DunningStatus, PaymentMethod, RecordPayment};
use billing_engine::services::UnitOfWork;
use chrono::Duration;
use common::{date, start_instant, TestApp};
use rust_decimal_macros::dec;
use uuid::Uuid;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_invoice_numbers_are_gapless() {
    let Some(app) = TestApp::postgres().await else {
        return;
    };

    let mut handles = Vec::new();
    for _ in 0..50 {
        let store = app.store.clone();
        handles.push(tokio::spawn(async move {
            store.allocate_invoice_sequence(2026).await
        }));
    }
    let mut values = Vec::new();
    for handle in handles {
        let row = handle.await.unwrap().expect("Allocation failed");
        assert_eq!(row.year, 2026);
        values.push(row.last_value);
    }
    values.sort_unstable();
    assert_eq!(values, (1..=50).collect::<Vec<i64>>());

    let next_year = app.store.allocate_invoice_sequence(2027).await.unwrap();
    assert_eq!(next_year.last_value, 1);
    let earlier = app.store.allocate_invoice_sequence(2026).await;
    assert!(matches!(earlier, Err(BillingError::Conflict(_))));
}

#[tokio::test]
async fn duplicate_billing_period_is_rejected() {
    let Some(app) = TestApp::postgres().await else {
        return;
    };
    let subscription = app.active_subscription().await;
    let (start, end) = (date(2026, 3, 1), date(2026, 3, 31));

    let first = app
        .orchestrator
        .generate_invoice_from_subscription(subscription.subscription_id, start, end)
        .await
        .unwrap();
    let second = app
        .orchestrator
        .generate_invoice_from_subscription(subscription.subscription_id, start, end)
        .await;
    assert!(matches!(second, Err(BillingError::Validation(_))));

    // The unique index holds even when the lookup is bypassed.
    let mut duplicate = first.clone();
    duplicate.invoice_id = Uuid::new_v4();
    duplicate.invoice_number = "INV-2026-99999".to_string();
    duplicate.version = 0;
    let committed = app
        .store
        .commit(UnitOfWork::new().invoice(&mut duplicate))
        .await;
    assert!(matches!(committed, Err(BillingError::Conflict(_))));
    assert!(app
        .store
        .get_invoice(duplicate.invoice_id)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn second_open_sequence_conflicts() {
    let Some(app) = TestApp::postgres().await else {
        return;
    };
    let subscription = app.active_subscription().await;
    let invoice = app.issued_invoice(&subscription).await;
    let sequence = app
        .orchestrator
        .report_payment_failure(invoice.invoice_id, None)
        .await
        .unwrap();

    let again = app
        .orchestrator
        .report_payment_failure(invoice.invoice_id, None)
        .await;
    assert!(matches!(again, Err(BillingError::Conflict(_))));

    let mut duplicate = sequence.clone();
    duplicate.dunning_id = Uuid::new_v4();
    duplicate.version = 0;
    let committed = app
        .store
        .commit(UnitOfWork::new().dunning(&mut duplicate))
        .await;
    assert!(matches!(committed, Err(BillingError::Conflict(_))));
}

#[tokio::test]
async fn stale_commit_is_rejected_and_rolled_back() {
    let Some(app) = TestApp::postgres().await else {
        return;
    };
    let subscription = app.active_subscription().await;
    let invoice = app.issued_invoice(&subscription).await;
    let mut stale = app.store.get_invoice(invoice.invoice_id).await.unwrap().unwrap();

    app.orchestrator
        .record_payment(
            invoice.invoice_id,
            RecordPayment {
                amount: dec!(1150),
                method: PaymentMethod::Online,
                reference: Some("PAY-1".to_string()),
            },
        )
        .await
        .unwrap();

    let mut current_subscription = app
        .store
        .get_subscription(subscription.subscription_id)
        .await
        .unwrap()
        .unwrap();
    let before = current_subscription.clone();
    current_subscription.auto_renew = !current_subscription.auto_renew;
    stale.notes = Some("overwritten".to_string());
    let committed = app
        .store
        .commit(
            UnitOfWork::new()
                .subscription(&mut current_subscription)
                .invoice(&mut stale),
        )
        .await;
    assert!(matches!(committed, Err(BillingError::Conflict(_))));

    let stored = app.orchestrator.get_invoice(invoice.invoice_id).await.unwrap();
    assert_eq!(stored.payments.len(), 1);
    assert_eq!(stored.notes, None);
    let stored_subscription = app
        .orchestrator
        .get_subscription(subscription.subscription_id)
        .await
        .unwrap();
    assert_eq!(stored_subscription, before);
}

#[tokio::test]
async fn aggregates_survive_the_round_trip() {
    let Some(app) = TestApp::postgres().await else {
        return;
    };
    let subscription = app.active_subscription().await;
    let invoice = app.issued_invoice(&subscription).await;
    app.orchestrator
        .record_payment(
            invoice.invoice_id,
            RecordPayment {
                amount: dec!(150),
                method: PaymentMethod::Cheque,
                reference: Some("CHQ-88".to_string()),
            },
        )
        .await
        .unwrap();
    let sequence = app
        .orchestrator
        .report_payment_failure(invoice.invoice_id, Some("card_declined".to_string()))
        .await
        .unwrap();

    for day in [1, 30] {
        app.clock.set(start_instant() + Duration::days(day));
        app.orchestrator
            .process_scheduled_dunning_actions()
            .await
            .unwrap();
    }

    let stored_invoice = app.orchestrator.get_invoice(invoice.invoice_id).await.unwrap();
    assert_eq!(stored_invoice.paid_amount, dec!(150));
    assert_eq!(stored_invoice.payments[0].method, PaymentMethod::Cheque);
    assert_eq!(stored_invoice.payments[0].reference.as_deref(), Some("CHQ-88"));
    assert_eq!(stored_invoice.line_items, invoice.line_items);

    let stored = app.orchestrator.get_dunning(sequence.dunning_id).await.unwrap();
    assert_eq!(stored.status, DunningStatus::Deactivated);
    assert_eq!(stored.retry_attempts.len(), 2);
    let skipped: Vec<i64> = stored
        .steps
        .iter()
        .filter(|s| s.is_skipped())
        .map(|s| s.day_offset)
        .collect();
    assert_eq!(skipped, vec![3, 7, 14, 21]);
    assert_eq!(app.notifier.sent_days(), vec![1, 30]);
}
