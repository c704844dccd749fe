//! Invoice lifecycle integration tests for billing-engine.

mod common;

use billing_engine::error::BillingError;
use billing_engine::models::{
    CreateLineItem, InvoiceStatus, LineItemCategory, ListInvoicesFilter, PaymentMethod,
    RecordPayment,
};
use common::{date, TestApp};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use uuid::Uuid;

fn payment(amount: Decimal) -> RecordPayment {
    RecordPayment {
        amount,
        method: PaymentMethod::BankTransfer,
        reference: Some("TRX-1".to_string()),
    }
}

#[tokio::test]
async fn create_issue_and_pay_in_full() {
    let app = TestApp::new();
    let org = Uuid::new_v4();

    let invoice = app
        .orchestrator
        .create_invoice(app.invoice_input(org, None, dec!(1000)))
        .await
        .unwrap();
    assert_eq!(invoice.status, InvoiceStatus::Draft);
    assert_eq!(invoice.invoice_number, "INV-2026-00001");
    assert_eq!(invoice.subtotal, dec!(1000));
    assert_eq!(invoice.tax_amount, dec!(150));
    assert_eq!(invoice.total, dec!(1150));

    let issued = app
        .orchestrator
        .issue_invoice(invoice.invoice_id, date(2026, 3, 10), 30)
        .await
        .unwrap();
    assert_eq!(issued.status, InvoiceStatus::Issued);
    assert_eq!(issued.due_date, Some(date(2026, 4, 9)));

    let paid = app
        .orchestrator
        .record_payment(invoice.invoice_id, payment(dec!(1150)))
        .await
        .unwrap();
    assert_eq!(paid.status, InvoiceStatus::Paid);
    assert_eq!(paid.paid_amount, dec!(1150));
    assert_eq!(paid.paid_date, Some(date(2026, 3, 10)));
    assert_eq!(paid.payments.len(), 1);
}

#[tokio::test]
async fn partial_payments_then_overpayment_is_rejected() {
    let app = TestApp::new();
    let subscription = app.active_subscription().await;
    let invoice = app.issued_invoice(&subscription).await;

    let partial = app
        .orchestrator
        .record_payment(invoice.invoice_id, payment(dec!(500)))
        .await
        .unwrap();
    assert_eq!(partial.status, InvoiceStatus::PartiallyPaid);
    assert_eq!(partial.paid_amount, dec!(500));
    assert_eq!(partial.remaining_balance(), dec!(650));

    let paid = app
        .orchestrator
        .record_payment(invoice.invoice_id, payment(dec!(650)))
        .await
        .unwrap();
    assert_eq!(paid.status, InvoiceStatus::Paid);
    assert_eq!(paid.paid_amount, dec!(1150));

    let third = app
        .orchestrator
        .record_payment(invoice.invoice_id, payment(dec!(1)))
        .await;
    assert!(third.is_err());

    let stored = app.orchestrator.get_invoice(invoice.invoice_id).await.unwrap();
    assert_eq!(stored.paid_amount, dec!(1150));
    assert_eq!(stored.payments.len(), 2);
}

#[tokio::test]
async fn overpayment_on_open_invoice_is_a_validation_error() {
    let app = TestApp::new();
    let subscription = app.active_subscription().await;
    let invoice = app.issued_invoice(&subscription).await;

    let result = app
        .orchestrator
        .record_payment(invoice.invoice_id, payment(dec!(1150.01)))
        .await;
    assert!(matches!(result, Err(BillingError::Validation(_))));

    let stored = app.orchestrator.get_invoice(invoice.invoice_id).await.unwrap();
    assert_eq!(stored.status, InvoiceStatus::Issued);
    assert_eq!(stored.paid_amount, Decimal::ZERO);
}

#[tokio::test]
async fn illegal_transitions_leave_invoice_untouched() {
    let app = TestApp::new();
    let org = Uuid::new_v4();
    let draft = app
        .orchestrator
        .create_invoice(app.invoice_input(org, None, dec!(1000)))
        .await
        .unwrap();

    let pay_draft = app
        .orchestrator
        .record_payment(draft.invoice_id, payment(dec!(100)))
        .await;
    assert!(matches!(
        pay_draft,
        Err(BillingError::InvalidStateTransition { .. })
    ));
    assert_eq!(
        app.orchestrator.get_invoice(draft.invoice_id).await.unwrap(),
        draft
    );

    app.orchestrator
        .issue_invoice(draft.invoice_id, date(2026, 3, 10), 30)
        .await
        .unwrap();
    app.orchestrator
        .record_payment(draft.invoice_id, payment(dec!(1150)))
        .await
        .unwrap();
    let paid = app.orchestrator.get_invoice(draft.invoice_id).await.unwrap();

    let cancel_paid = app.orchestrator.cancel_invoice(draft.invoice_id).await;
    assert!(matches!(
        cancel_paid,
        Err(BillingError::InvalidStateTransition { .. })
    ));
    let reissue = app
        .orchestrator
        .issue_invoice(draft.invoice_id, date(2026, 3, 11), 30)
        .await;
    assert!(matches!(reissue, Err(BillingError::InvalidStateTransition { .. })));
    assert_eq!(
        app.orchestrator.get_invoice(draft.invoice_id).await.unwrap(),
        paid
    );
}

#[tokio::test]
async fn invoice_with_payment_cannot_be_cancelled() {
    let app = TestApp::new();
    let subscription = app.active_subscription().await;
    let invoice = app.issued_invoice(&subscription).await;
    app.orchestrator
        .record_payment(invoice.invoice_id, payment(dec!(100)))
        .await
        .unwrap();

    let result = app.orchestrator.cancel_invoice(invoice.invoice_id).await;
    assert!(matches!(result, Err(BillingError::InvalidStateTransition { .. })));
}

#[tokio::test]
async fn empty_line_items_are_rejected() {
    let app = TestApp::new();
    let mut input = app.invoice_input(Uuid::new_v4(), None, dec!(1000));
    input.line_items.clear();

    let result = app.orchestrator.create_invoice(input).await;
    assert!(matches!(result, Err(BillingError::Validation(_))));
}

#[tokio::test]
async fn draft_editing_keeps_totals_consistent() {
    let app = TestApp::new();
    let invoice = app
        .orchestrator
        .create_invoice(app.invoice_input(Uuid::new_v4(), None, dec!(1000)))
        .await
        .unwrap();

    let edited = app
        .orchestrator
        .add_invoice_line_item(
            invoice.invoice_id,
            CreateLineItem {
                description: "Onboarding".to_string(),
                quantity: dec!(2),
                unit_price: dec!(125.50),
                category: LineItemCategory::Setup,
            },
        )
        .await
        .unwrap();
    assert_eq!(edited.line_items.len(), 2);
    assert_eq!(edited.subtotal, dec!(1251));
    assert_eq!(edited.tax_amount, dec!(187.65));
    assert_eq!(edited.total, edited.subtotal + edited.tax_amount);

    let first = edited.line_items[0].line_item_id;
    let trimmed = app
        .orchestrator
        .remove_invoice_line_item(invoice.invoice_id, first)
        .await
        .unwrap();
    assert_eq!(trimmed.line_items.len(), 1);
    assert_eq!(trimmed.subtotal, dec!(251));
    assert_eq!(trimmed.total, dec!(288.65));

    let last = trimmed.line_items[0].line_item_id;
    let result = app
        .orchestrator
        .remove_invoice_line_item(invoice.invoice_id, last)
        .await;
    assert!(matches!(result, Err(BillingError::Validation(_))));
}

#[tokio::test]
async fn only_drafts_can_be_deleted() {
    let app = TestApp::new();
    let org = Uuid::new_v4();
    let draft = app
        .orchestrator
        .create_invoice(app.invoice_input(org, None, dec!(10)))
        .await
        .unwrap();
    let issued = app
        .orchestrator
        .create_invoice(app.invoice_input(org, None, dec!(20)))
        .await
        .unwrap();
    app.orchestrator
        .issue_invoice(issued.invoice_id, date(2026, 3, 10), 14)
        .await
        .unwrap();

    app.orchestrator.delete_invoice(draft.invoice_id).await.unwrap();
    assert!(matches!(
        app.orchestrator.get_invoice(draft.invoice_id).await,
        Err(BillingError::NotFound { .. })
    ));

    let result = app.orchestrator.delete_invoice(issued.invoice_id).await;
    assert!(matches!(result, Err(BillingError::InvalidStateTransition { .. })));
}

#[tokio::test]
async fn invoices_are_found_by_number_and_filter() {
    let app = TestApp::new();
    let subscription = app.active_subscription().await;
    let issued = app.issued_invoice(&subscription).await;
    let other_org = app
        .orchestrator
        .create_invoice(app.invoice_input(Uuid::new_v4(), None, dec!(5)))
        .await
        .unwrap();

    let found = app
        .orchestrator
        .get_invoice_by_number(&issued.invoice_number)
        .await
        .unwrap();
    assert_eq!(found.invoice_id, issued.invoice_id);
    assert!(matches!(
        app.orchestrator.get_invoice_by_number("INV-1999-00001").await,
        Err(BillingError::NotFound { .. })
    ));

    let listed = app
        .orchestrator
        .list_invoices(&ListInvoicesFilter {
            organization_id: Some(subscription.organization_id),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].invoice_id, issued.invoice_id);

    let drafts = app
        .orchestrator
        .list_invoices(&ListInvoicesFilter::with_status(InvoiceStatus::Draft))
        .await
        .unwrap();
    assert_eq!(drafts.len(), 1);
    assert_eq!(drafts[0].invoice_id, other_org.invoice_id);
}

#[tokio::test]
async fn overdue_sweep_marks_only_past_due_invoices_once() {
    let app = TestApp::new();
    let subscription = app.active_subscription().await;
    let invoice = app.issued_invoice(&subscription).await;

    let early = app.orchestrator.mark_overdue_invoices().await.unwrap();
    assert_eq!(early.succeeded, 0);

    // Due date is day 30; overdue from day 31.
    app.clock.advance_days(30);
    let on_due_date = app.orchestrator.mark_overdue_invoices().await.unwrap();
    assert_eq!(on_due_date.succeeded, 0);

    app.clock.advance_days(1);
    let report = app.orchestrator.mark_overdue_invoices().await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert!(report.failures.is_empty());

    let stored = app.orchestrator.get_invoice(invoice.invoice_id).await.unwrap();
    assert_eq!(stored.status, InvoiceStatus::Overdue);

    let rerun = app.orchestrator.mark_overdue_invoices().await.unwrap();
    assert_eq!(rerun.processed, 0);

    let paid = app
        .orchestrator
        .record_payment(invoice.invoice_id, payment(dec!(1150)))
        .await
        .unwrap();
    assert_eq!(paid.status, InvoiceStatus::Paid);
}

#[tokio::test]
async fn totals_invariant_holds_through_lifecycle() {
    let app = TestApp::new();
    let subscription = app.active_subscription().await;
    let invoice = app.issued_invoice(&subscription).await;

    for amount in [dec!(100), dec!(200.25), dec!(849.75)] {
        let current = app
            .orchestrator
            .record_payment(invoice.invoice_id, payment(amount))
            .await
            .unwrap();
        assert_eq!(current.total, current.subtotal + current.tax_amount);
        assert_eq!(current.tax_amount, current.subtotal * current.tax_rate / dec!(100));
        assert!(current.paid_amount <= current.total);
    }

    let stored = app.orchestrator.get_invoice(invoice.invoice_id).await.unwrap();
    assert_eq!(stored.status, InvoiceStatus::Paid);
}
