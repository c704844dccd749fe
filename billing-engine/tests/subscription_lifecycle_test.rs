//! Subscription lifecycle integration tests for billing-engine.

mod common;

use billing_engine::error::BillingError;
use billing_engine::models::{ListSubscriptionsFilter, SubscriptionStatus};
use common::{date, TestApp};
use rust_decimal_macros::dec;
use uuid::Uuid;

#[tokio::test]
async fn second_open_subscription_for_organization_conflicts() {
    let app = TestApp::new();
    let plan = app.create_plan(dec!(1000)).await;
    let org = Uuid::new_v4();

    let first = app
        .orchestrator
        .create_subscription(app.subscription_input(org, &plan))
        .await
        .unwrap();
    assert_eq!(first.status, SubscriptionStatus::Active);
    assert_eq!(first.start_date, date(2026, 3, 10));
    assert_eq!(first.end_date, date(2027, 3, 10));
    assert_eq!(first.agreed_price, dec!(1000));

    let second = app
        .orchestrator
        .create_trial_subscription(app.subscription_input(org, &plan), None)
        .await;
    assert!(matches!(second, Err(BillingError::Conflict(_))));

    app.orchestrator
        .cancel_subscription(first.subscription_id, Some("switching vendor".to_string()))
        .await
        .unwrap();
    let replacement = app
        .orchestrator
        .create_subscription(app.subscription_input(org, &plan))
        .await
        .unwrap();
    let open = app
        .orchestrator
        .get_open_subscription_for_organization(org)
        .await
        .unwrap();
    assert_eq!(open.map(|s| s.subscription_id), Some(replacement.subscription_id));
}

#[tokio::test]
async fn trial_converts_to_active_term() {
    let app = TestApp::new();
    let plan = app.create_plan(dec!(500)).await;
    let trial = app
        .orchestrator
        .create_trial_subscription(app.subscription_input(Uuid::new_v4(), &plan), None)
        .await
        .unwrap();
    assert_eq!(trial.status, SubscriptionStatus::Trial);
    assert_eq!(trial.trial_end_date, Some(date(2026, 3, 24)));

    app.clock.advance_days(5);
    let active = app
        .orchestrator
        .activate_subscription(trial.subscription_id)
        .await
        .unwrap();
    assert_eq!(active.status, SubscriptionStatus::Active);
    assert_eq!(active.start_date, date(2026, 3, 15));
    assert_eq!(active.end_date, date(2027, 3, 15));
}

#[tokio::test]
async fn suspend_and_reactivate() {
    let app = TestApp::new();
    let subscription = app.active_subscription().await;

    let suspended = app
        .orchestrator
        .suspend_subscription(subscription.subscription_id)
        .await
        .unwrap();
    assert_eq!(suspended.status, SubscriptionStatus::Suspended);
    assert!(suspended.suspended_at.is_some());

    let change = app
        .orchestrator
        .change_subscription_plan(subscription.subscription_id, subscription.plan_id, None, None)
        .await;
    assert!(matches!(change, Err(BillingError::InvalidStateTransition { .. })));

    let active = app
        .orchestrator
        .activate_subscription(subscription.subscription_id)
        .await
        .unwrap();
    assert_eq!(active.status, SubscriptionStatus::Active);
    assert!(active.suspended_at.is_none());
    assert_eq!(active.end_date, subscription.end_date);
}

#[tokio::test]
async fn cancelled_subscription_cannot_be_renewed() {
    let app = TestApp::new();
    let subscription = app.active_subscription().await;

    let cancelled = app
        .orchestrator
        .cancel_subscription(subscription.subscription_id, None)
        .await
        .unwrap();
    assert_eq!(cancelled.status, SubscriptionStatus::Cancelled);
    assert!(cancelled.cancelled_at.is_some());

    let renew = app
        .orchestrator
        .renew_subscription(subscription.subscription_id, date(2028, 3, 10), None)
        .await;
    assert!(matches!(renew, Err(BillingError::InvalidStateTransition { .. })));

    let again = app
        .orchestrator
        .cancel_subscription(subscription.subscription_id, None)
        .await;
    assert!(matches!(again, Err(BillingError::InvalidStateTransition { .. })));

    let stored = app
        .orchestrator
        .get_subscription(subscription.subscription_id)
        .await
        .unwrap();
    assert_eq!(stored, cancelled);
}

#[tokio::test]
async fn renew_extends_term_and_reprices() {
    let app = TestApp::new();
    let subscription = app.active_subscription().await;

    let renewed = app
        .orchestrator
        .renew_subscription(subscription.subscription_id, date(2028, 3, 10), Some(dec!(1100)))
        .await
        .unwrap();
    assert_eq!(renewed.end_date, date(2028, 3, 10));
    assert_eq!(renewed.agreed_price, dec!(1100));

    let backwards = app
        .orchestrator
        .renew_subscription(subscription.subscription_id, date(2027, 1, 1), None)
        .await;
    assert!(matches!(backwards, Err(BillingError::Validation(_))));
}

#[tokio::test]
async fn change_plan_rebases_price_and_term() {
    let app = TestApp::new();
    let subscription = app.active_subscription().await;
    let premium = app.create_plan(dec!(2500)).await;

    app.clock.advance_days(20);
    let changed = app
        .orchestrator
        .change_subscription_plan(subscription.subscription_id, premium.plan_id, None, Some(24))
        .await
        .unwrap();
    assert_eq!(changed.plan_id, premium.plan_id);
    assert_eq!(changed.agreed_price, dec!(2500));
    assert_eq!(changed.contract_months, 24);
    assert_eq!(changed.start_date, date(2026, 3, 30));
    assert_eq!(changed.end_date, date(2028, 3, 30));
}

#[tokio::test]
async fn discount_is_bounded_and_applied_to_effective_price() {
    let app = TestApp::new();
    let subscription = app.active_subscription().await;

    let out_of_range = app
        .orchestrator
        .apply_subscription_discount(subscription.subscription_id, dec!(101))
        .await;
    assert!(matches!(out_of_range, Err(BillingError::Validation(_))));

    let discounted = app
        .orchestrator
        .apply_subscription_discount(subscription.subscription_id, dec!(12.5))
        .await
        .unwrap();
    assert_eq!(discounted.discount_percentage, Some(dec!(12.5)));
    assert_eq!(discounted.effective_price(), dec!(875));
}

#[tokio::test]
async fn inactive_plan_cannot_be_sold() {
    let app = TestApp::new();
    let plan = app.create_plan(dec!(300)).await;
    app.orchestrator.deactivate_plan(plan.plan_id).await.unwrap();

    let result = app
        .orchestrator
        .create_subscription(app.subscription_input(Uuid::new_v4(), &plan))
        .await;
    assert!(matches!(result, Err(BillingError::Validation(_))));

    let active_plans = app.orchestrator.list_plans(false).await.unwrap();
    assert!(active_plans.iter().all(|p| p.plan_id != plan.plan_id));
    assert_eq!(app.orchestrator.list_plans(true).await.unwrap().len(), 1);
}

#[tokio::test]
async fn unknown_references_are_not_found() {
    let app = TestApp::new();
    let plan = app.create_plan(dec!(300)).await;
    let mut input = app.subscription_input(Uuid::new_v4(), &plan);
    input.plan_id = Uuid::new_v4();

    assert!(matches!(
        app.orchestrator.create_subscription(input).await,
        Err(BillingError::NotFound { .. })
    ));
    assert!(matches!(
        app.orchestrator.suspend_subscription(Uuid::new_v4()).await,
        Err(BillingError::NotFound { .. })
    ));
}

#[tokio::test]
async fn expired_trials_sweep_runs_after_trial_end() {
    let app = TestApp::new();
    let plan = app.create_plan(dec!(500)).await;
    let trial = app
        .orchestrator
        .create_trial_subscription(app.subscription_input(Uuid::new_v4(), &plan), Some(7))
        .await
        .unwrap();

    let ending = app.orchestrator.trials_ending_within(7).await.unwrap();
    assert_eq!(ending.len(), 1);

    app.clock.advance_days(7);
    let report = app.orchestrator.process_expired_trials().await.unwrap();
    assert_eq!(report.succeeded, 0);
    assert_eq!(report.skipped, 1);

    app.clock.advance_days(1);
    let report = app.orchestrator.process_expired_trials().await.unwrap();
    assert_eq!(report.succeeded, 1);

    let stored = app
        .orchestrator
        .get_subscription(trial.subscription_id)
        .await
        .unwrap();
    assert_eq!(stored.status, SubscriptionStatus::Expired);

    let rerun = app.orchestrator.process_expired_trials().await.unwrap();
    assert_eq!(rerun.processed, 0);
}

#[tokio::test]
async fn expired_terms_renew_or_expire_by_auto_renew() {
    let app = TestApp::new();
    let plan = app.create_plan(dec!(100)).await;

    let mut renewing = app.subscription_input(Uuid::new_v4(), &plan);
    renewing.contract_months = 1;
    renewing.auto_renew = true;
    let renewing = app.orchestrator.create_subscription(renewing).await.unwrap();

    let mut lapsing = app.subscription_input(Uuid::new_v4(), &plan);
    lapsing.contract_months = 1;
    let lapsing = app.orchestrator.create_subscription(lapsing).await.unwrap();

    let expiring = app.orchestrator.subscriptions_expiring_within(31).await.unwrap();
    assert_eq!(expiring.len(), 2);

    app.clock.advance_days(32);
    let report = app.orchestrator.process_expired_subscriptions().await.unwrap();
    assert_eq!(report.succeeded, 2);
    assert!(report.failures.is_empty());

    let renewed = app
        .orchestrator
        .get_subscription(renewing.subscription_id)
        .await
        .unwrap();
    assert_eq!(renewed.status, SubscriptionStatus::Active);
    assert_eq!(renewed.end_date, date(2026, 5, 10));

    let expired = app
        .orchestrator
        .get_subscription(lapsing.subscription_id)
        .await
        .unwrap();
    assert_eq!(expired.status, SubscriptionStatus::Expired);

    let active = app
        .orchestrator
        .list_subscriptions(&ListSubscriptionsFilter::with_status(SubscriptionStatus::Active))
        .await
        .unwrap();
    assert_eq!(active.len(), 1);
}

#[tokio::test]
async fn lapsed_auto_renewal_catches_up_once() {
    let app = TestApp::new();
    let plan = app.create_plan(dec!(100)).await;
    let mut input = app.subscription_input(Uuid::new_v4(), &plan);
    input.contract_months = 1;
    input.auto_renew = true;
    let subscription = app.orchestrator.create_subscription(input).await.unwrap();

    app.clock.advance_days(100);
    let first = app.orchestrator.process_expired_subscriptions().await.unwrap();
    assert_eq!(first.succeeded, 1);
    let renewed = app
        .orchestrator
        .get_subscription(subscription.subscription_id)
        .await
        .unwrap();
    assert_eq!(renewed.status, SubscriptionStatus::Active);
    assert!(renewed.end_date >= app.today());
    assert_eq!(renewed.end_date, date(2026, 7, 10));

    let rerun = app.orchestrator.process_expired_subscriptions().await.unwrap();
    assert_eq!(rerun.succeeded, 0);
    assert_eq!(rerun.skipped, 1);
    assert_eq!(
        app.orchestrator
            .get_subscription(subscription.subscription_id)
            .await
            .unwrap(),
        renewed
    );
}
